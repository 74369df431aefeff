//! Kafka appender built on rdkafka's `FutureProducer`.
//!
//! Configured for durable, ordered appends: `acks=all`, idempotence on,
//! and a single in-flight request window per partition enforced by the
//! idempotent producer.

use super::{base_client_config, LogAppender};
use crate::config::KafkaConfig;
use crate::{Error, PublishError, Result};
use async_trait::async_trait;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use std::time::Duration;
use tracing::{debug, info};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Appends serialized events to a Kafka topic.
#[derive(Clone)]
pub struct KafkaAppender {
    producer: FutureProducer,
    topic: String,
    partitions: i32,
    timeout: Duration,
}

impl KafkaAppender {
    /// Create the producer and read the topic's partition count.
    pub async fn connect(config: &KafkaConfig) -> Result<Self> {
        let producer: FutureProducer = base_client_config(config)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("compression.type", config.compression.as_str())
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            .set("message.max.bytes", config.max_message_bytes.to_string())
            .create()
            .map_err(|e| PublishError::Transient(format!("producer creation failed: {}", e)))?;

        // librdkafka fetches metadata synchronously.
        let metadata_producer = producer.clone();
        let topic = config.topic.clone();
        let partitions = tokio::task::spawn_blocking(move || {
            metadata_producer
                .client()
                .fetch_metadata(Some(&topic), METADATA_TIMEOUT)
                .map(|metadata| {
                    metadata
                        .topics()
                        .iter()
                        .find(|t| t.name() == topic)
                        .map(|t| t.partitions().len() as i32)
                        .unwrap_or(0)
                })
        })
        .await
        .map_err(|e| PublishError::Transient(format!("metadata task failed: {}", e)))?
        .map_err(|e| PublishError::Transient(format!("metadata fetch failed: {}", e)))?;

        if partitions == 0 {
            return Err(Error::Config(format!(
                "topic {} does not exist or has no partitions",
                config.topic
            )));
        }

        info!(
            topic = %config.topic,
            partitions = partitions,
            servers = %config.bootstrap_servers.join(","),
            compression = config.compression.as_str(),
            "Kafka producer connected"
        );

        Ok(Self {
            producer,
            topic: config.topic.clone(),
            partitions,
            timeout: Duration::from_millis(config.message_timeout_ms),
        })
    }

    /// Topic this appender writes to.
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Split delivery failures into retryable and content-scoped.
fn classify(err: KafkaError) -> Error {
    let rejected = matches!(
        err.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::MessageSizeTooLarge
                | RDKafkaErrorCode::InvalidMessageSize
                | RDKafkaErrorCode::InvalidMessage
                | RDKafkaErrorCode::InvalidRecord
        )
    );
    if rejected {
        PublishError::Rejected(err.to_string()).into()
    } else {
        PublishError::Transient(err.to_string()).into()
    }
}

#[async_trait]
impl LogAppender for KafkaAppender {
    fn partition_count(&self) -> i32 {
        self.partitions
    }

    async fn append(&self, partition: i32, key: &[u8], payload: &[u8]) -> Result<i64> {
        let record = FutureRecord::to(&self.topic)
            .partition(partition)
            .key(key)
            .payload(payload);

        match self.producer.send(record, self.timeout).await {
            Ok((partition, offset)) => {
                debug!(partition = partition, offset = offset, "Kafka append confirmed");
                Ok(offset)
            }
            Err((e, _)) => Err(classify(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_size_errors_as_rejected() {
        let err = classify(KafkaError::MessageProduction(
            RDKafkaErrorCode::MessageSizeTooLarge,
        ));
        assert!(matches!(err, Error::Publish(PublishError::Rejected(_))));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_classify_broker_errors_as_transient() {
        let err = classify(KafkaError::MessageProduction(
            RDKafkaErrorCode::BrokerTransportFailure,
        ));
        assert!(err.is_retryable());

        let err = classify(KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut));
        assert!(err.is_retryable());
    }
}
