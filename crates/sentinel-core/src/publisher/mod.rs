//! Publishing change events to the durable log.
//!
//! Every event for a given source key lands on the same partition, so the
//! log preserves per-key order end to end.

mod partitioner;

pub use partitioner::partition_for;

use crate::event::{ChangeEvent, PartitionOffset};
use crate::health::{HealthCheck, COMPONENT_KAFKA};
use crate::kafka::LogAppender;
use crate::metrics::{ErrorType, PipelineMetrics};
use crate::retry::RetryPolicy;
use crate::{Error, PublishError, Result};
use std::sync::Arc;
use tracing::{debug, warn};

/// Default local size limit, matching Kafka's default `message.max.bytes`.
const DEFAULT_MAX_MESSAGE_BYTES: usize = 1_000_000;

/// Serializes change events and appends them to their key's partition.
pub struct Publisher {
    appender: Arc<dyn LogAppender>,
    max_message_bytes: usize,
    retry: RetryPolicy,
    metrics: Arc<PipelineMetrics>,
    health: Arc<HealthCheck>,
}

impl Publisher {
    /// Create a publisher over `appender`.
    pub fn new(appender: Arc<dyn LogAppender>) -> Self {
        Self {
            appender,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            retry: RetryPolicy::default(),
            metrics: Arc::new(PipelineMetrics::new()),
            health: Arc::new(HealthCheck::new()),
        }
    }

    /// Reject serialized events larger than `bytes` before sending.
    pub fn with_max_message_bytes(mut self, bytes: usize) -> Self {
        self.max_message_bytes = bytes;
        self
    }

    /// Backoff used by [`publish_with_retry`](Self::publish_with_retry).
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Share pipeline metrics.
    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Share the health registry.
    pub fn with_health(mut self, health: Arc<HealthCheck>) -> Self {
        self.health = health;
        self
    }

    /// Number of partitions events are spread over.
    pub fn partition_count(&self) -> i32 {
        self.appender.partition_count()
    }

    /// Append one event and wait for the log to confirm it.
    ///
    /// Fails with a transient publish error (retryable) or `Rejected` when the
    /// event can never be appended.
    pub async fn publish(&self, event: &ChangeEvent) -> Result<PartitionOffset> {
        let payload = event.to_bytes().map_err(|e| match e {
            Error::Serialization(msg) => Error::Publish(PublishError::Rejected(msg)),
            other => other,
        })?;
        if payload.len() > self.max_message_bytes {
            return Err(PublishError::Rejected(format!(
                "serialized event is {} bytes, limit is {}",
                payload.len(),
                self.max_message_bytes
            ))
            .into());
        }

        let key = event.source_key().canonical();
        let partition = partition_for(event.source_key(), self.appender.partition_count());
        let offset = self
            .appender
            .append(partition, key.as_bytes(), &payload)
            .await?;

        debug!(
            key = %key,
            position = %event.source_position(),
            partition = partition,
            offset = offset,
            "Event published"
        );
        self.metrics.record_published();
        Ok(PartitionOffset::new(partition, offset))
    }

    /// Publish, retrying transient failures without bound.
    ///
    /// Skipping an event would break per-key order, so only a rejection ends
    /// the loop early. The `kafka` component is degraded while retrying.
    pub async fn publish_with_retry(&self, event: &ChangeEvent) -> Result<PartitionOffset> {
        let mut retry = 0u32;
        loop {
            match self.publish(event).await {
                Ok(offset) => {
                    if retry > 0 {
                        self.health.mark_healthy(COMPONENT_KAFKA);
                    }
                    return Ok(offset);
                }
                Err(e) if e.is_retryable() => {
                    let delay = self.retry.calculate_delay(retry);
                    warn!(
                        key = %event.source_key(),
                        attempt = retry + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Publish failed, retrying with backoff"
                    );
                    self.metrics.record_error(ErrorType::Kafka);
                    self.metrics.record_publish_retry();
                    self.health
                        .mark_degraded(COMPONENT_KAFKA, &format!("Publish retrying: {}", e));
                    tokio::time::sleep(delay).await;
                    retry = retry.saturating_add(1);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ColumnValue, Operation, SourceKey, SourcePosition};
    use crate::health::ComponentStatus;
    use crate::kafka::MemoryLog;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn event(id: i64, position: u64) -> ChangeEvent {
        let key = SourceKey::single("public.users", "id", ColumnValue::Int(id));
        let mut payload = BTreeMap::new();
        payload.insert("id".to_string(), ColumnValue::Int(id));
        payload.insert("name".to_string(), ColumnValue::Text(format!("user-{}", id)));
        ChangeEvent::new(
            key,
            Operation::Insert,
            payload,
            SourcePosition(position),
            chrono::Utc::now(),
            1,
        )
    }

    #[tokio::test]
    async fn test_publish_routes_by_key() {
        let log = MemoryLog::new(4);
        let publisher = Publisher::new(Arc::new(log.clone()));

        let first = publisher.publish(&event(7, 1)).await.unwrap();
        let second = publisher.publish(&event(7, 2)).await.unwrap();
        assert_eq!(first.partition, second.partition);
        assert_eq!(second.offset, first.offset + 1);

        let stored = log.records(first.partition);
        let decoded = ChangeEvent::from_bytes(&stored[1].payload).unwrap();
        assert_eq!(decoded.source_position(), SourcePosition(2));
        assert_eq!(stored[1].key.as_deref(), Some("public.users/id=7".as_bytes()));
    }

    #[tokio::test]
    async fn test_oversized_event_is_rejected() {
        let publisher = Publisher::new(Arc::new(MemoryLog::new(1))).with_max_message_bytes(16);
        let err = publisher.publish(&event(1, 1)).await.unwrap_err();
        assert!(matches!(err, Error::Publish(PublishError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_publish_with_retry_rides_out_transient_failures() {
        let log = MemoryLog::new(1);
        log.fail_next_appends(3);
        let metrics = Arc::new(PipelineMetrics::new());
        let health = Arc::new(HealthCheck::new());
        health.register_component(COMPONENT_KAFKA);

        let publisher = Publisher::new(Arc::new(log.clone()))
            .with_retry_policy(
                RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(2), 1)
                    .without_jitter(),
            )
            .with_metrics(Arc::clone(&metrics))
            .with_health(Arc::clone(&health));

        let offset = publisher.publish_with_retry(&event(1, 1)).await.unwrap();
        assert_eq!(offset, PartitionOffset::new(0, 0));
        assert_eq!(metrics.publish_retries_total(), 3);
        assert_eq!(
            health.get_component_status(COMPONENT_KAFKA),
            Some(ComponentStatus::Healthy)
        );
    }

    #[tokio::test]
    async fn test_publish_with_retry_stops_on_rejection() {
        let log = MemoryLog::new(1).with_max_message_bytes(8);
        let publisher = Publisher::new(Arc::new(log));
        let err = publisher.publish_with_retry(&event(1, 1)).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
