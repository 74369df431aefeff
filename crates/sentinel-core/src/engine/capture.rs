//! Capture -> publish loop.

use super::PipelineContext;
use crate::capture::{CaptureAdapter, CaptureItem, ChangeSource, PgLogicalSource};
use crate::config::Config;
use crate::deadletter::{DeadLetterRecord, FailureStage};
use crate::event::SourcePosition;
use crate::health::{COMPONENT_CAPTURE, COMPONENT_KAFKA, COMPONENT_SOURCE};
use crate::heartbeat::{HeartbeatMonitor, HeartbeatTracker};
use crate::kafka::KafkaAppender;
use crate::metrics::ErrorType;
use crate::publisher::Publisher;
use crate::retry::RetryPolicy;
use crate::{CaptureError, Error, PublishError, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Counters from one capture run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptureReport {
    pub published: u64,
    pub dead_lettered: u64,
    pub heartbeats: u64,
    /// Position last acknowledged to the source
    pub confirmed_position: SourcePosition,
}

/// Reads the source, publishes every event, and releases the source only
/// up to what the log has confirmed.
pub struct CapturePipeline<S: ChangeSource> {
    adapter: CaptureAdapter<S>,
    publisher: Arc<Publisher>,
    heartbeats: Arc<HeartbeatTracker>,
    context: PipelineContext,
    poll_interval: Duration,
    ack_interval: Duration,
    backoff: RetryPolicy,
    shutdown_tx: broadcast::Sender<()>,
    report: CaptureReport,
}

impl CapturePipeline<PgLogicalSource> {
    /// Connect to PostgreSQL and Kafka. Also returns the heartbeat monitor
    /// feeding this pipeline.
    pub async fn from_config(config: &Config, context: PipelineContext) -> Result<(Self, HeartbeatMonitor)> {
        let health = &context.health;
        health.register_component(COMPONENT_SOURCE);
        health.register_component(COMPONENT_KAFKA);
        health.register_component(COMPONENT_CAPTURE);

        let source = match PgLogicalSource::connect(config.postgres.clone()).await {
            Ok(source) => {
                health.mark_healthy(COMPONENT_SOURCE);
                source
            }
            Err(e) => {
                health.mark_unhealthy(COMPONENT_SOURCE, &e.to_string());
                return Err(e);
            }
        };
        let emitter = Arc::new(source.heartbeat_emitter());

        let appender = match KafkaAppender::connect(&config.kafka).await {
            Ok(appender) => {
                health.mark_healthy(COMPONENT_KAFKA);
                appender
            }
            Err(e) => {
                health.mark_unhealthy(COMPONENT_KAFKA, &e.to_string());
                return Err(e);
            }
        };
        let publisher = Arc::new(
            Publisher::new(Arc::new(appender))
                .with_max_message_bytes(config.kafka.max_message_bytes)
                .with_retry_policy(RetryPolicy::from(&config.retry))
                .with_metrics(Arc::clone(&context.metrics))
                .with_health(Arc::clone(&context.health)),
        );

        let heartbeats = Arc::new(HeartbeatTracker::new(
            Arc::clone(&context.health),
            Arc::clone(&context.metrics),
        ));
        let monitor = HeartbeatMonitor::new(
            emitter,
            Arc::clone(&heartbeats),
            Arc::clone(&context.metrics),
            &config.capture,
        );

        Ok((Self::new(source, config, publisher, heartbeats, context), monitor))
    }
}

impl<S: ChangeSource> CapturePipeline<S> {
    pub fn new(
        source: S,
        config: &Config,
        publisher: Arc<Publisher>,
        heartbeats: Arc<HeartbeatTracker>,
        context: PipelineContext,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            adapter: CaptureAdapter::new(source, &config.capture, config.postgres.poll_batch_size),
            publisher,
            heartbeats,
            context,
            poll_interval: Duration::from_millis(config.postgres.poll_interval_ms),
            ack_interval: Duration::from_millis(config.capture.ack_interval_ms),
            backoff: RetryPolicy::from(&config.retry),
            shutdown_tx,
            report: CaptureReport::default(),
        }
    }

    /// Sender that stops [`run`](Self::run).
    pub fn shutdown_signal(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Counters so far.
    pub fn report(&self) -> &CaptureReport {
        &self.report
    }

    /// Capture until shutdown, or until the source fails permanently.
    ///
    /// `resume` restarts strictly after that position; `None` continues from
    /// the source's acknowledged position.
    pub async fn run(&mut self, resume: Option<SourcePosition>) -> Result<CaptureReport> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        if let Err(e) = self.adapter.start(resume).await {
            self.report_fatal(&e);
            return Err(e);
        }
        self.context.health.mark_healthy(COMPONENT_SOURCE);
        self.context.health.pipeline_started();
        info!("Capture pipeline started");

        let mut last_ack = Instant::now();
        let mut failures = 0u32;

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }

                result = self.step() => match result {
                    Ok(_) => {
                        if failures > 0 {
                            self.context.health.mark_healthy(COMPONENT_SOURCE);
                            failures = 0;
                        }
                    }
                    Err(e) if e.is_retryable() => {
                        let delay = self.backoff.calculate_delay(failures);
                        failures = failures.saturating_add(1);
                        self.context.metrics.record_error(ErrorType::Source);
                        self.context
                            .health
                            .mark_degraded(COMPONENT_SOURCE, &format!("Capture retrying: {}", e));
                        warn!(error = %e, delay_ms = delay.as_millis() as u64, "Capture failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) => {
                        self.report_fatal(&e);
                        self.context.health.pipeline_stopped();
                        return Err(e);
                    }
                }
            }

            if last_ack.elapsed() >= self.ack_interval {
                self.acknowledge().await;
                last_ack = Instant::now();
            }
        }

        self.acknowledge().await;
        self.context.health.pipeline_stopped();
        info!(
            published = self.report.published,
            dead_lettered = self.report.dead_lettered,
            confirmed = %self.report.confirmed_position,
            "Capture pipeline stopped"
        );
        Ok(self.report.clone())
    }

    /// Handle one captured item. Returns `false` when the source was idle.
    pub async fn step(&mut self) -> Result<bool> {
        let Some(item) = self.adapter.next().await? else {
            tokio::time::sleep(self.poll_interval).await;
            return Ok(false);
        };

        match item {
            CaptureItem::Event(event) => {
                self.context.metrics.record_captured();
                let position = event.source_position();
                match self.publisher.publish_with_retry(&event).await {
                    Ok(_) => self.report.published += 1,
                    Err(e @ Error::Publish(PublishError::Rejected(_))) => {
                        let record =
                            DeadLetterRecord::for_event(FailureStage::Publish, event, e.class(), 1, e.to_string());
                        self.context.dead_letters.write(record).await?;
                        self.context.metrics.record_dead_letter();
                        self.report.dead_lettered += 1;
                    }
                    Err(e) => return Err(e),
                }
                self.adapter.confirm(position)?;
            }
            CaptureItem::Heartbeat(position) => {
                // Items are published in order, so reaching a heartbeat means
                // everything before it is in the log.
                self.adapter.confirm(position)?;
                self.heartbeats.observe(position);
                self.report.heartbeats += 1;
            }
            CaptureItem::Rejected { position, raw, error } => {
                let record = DeadLetterRecord::undecodable(FailureStage::Capture, raw.into_bytes(), error)
                    .with_source_position(position);
                self.context.dead_letters.write(record).await?;
                self.context.metrics.record_dead_letter();
                self.report.dead_lettered += 1;
                self.adapter.confirm(position)?;
            }
        }

        self.context
            .metrics
            .set_capture_in_flight(self.adapter.in_flight() as u64);
        Ok(true)
    }

    /// Release the source up to everything the log confirmed.
    async fn acknowledge(&mut self) {
        match self.adapter.acknowledge_confirmed().await {
            Ok(Some(position)) => {
                let confirmed = self.adapter.confirmed_position();
                self.report.confirmed_position = confirmed;
                self.context
                    .metrics
                    .set_source_confirmed_position(confirmed.as_u64());
                debug!(durable = %position, confirmed = %confirmed, "Source acknowledged");
            }
            Ok(None) => {}
            Err(e) => {
                self.context.metrics.record_error(ErrorType::Source);
                warn!(error = %e, "Failed to acknowledge source, will retry");
            }
        }
    }

    fn report_fatal(&self, err: &Error) {
        self.context.metrics.record_error(ErrorType::of(err));
        if matches!(err, Error::Capture(CaptureError::SourceUnavailable { .. })) {
            error!(error = %err, "Source can no longer serve the resume position, a full resync is required");
        } else {
            error!(error = %err, "Capture failed");
        }
        self.context
            .health
            .mark_unhealthy(COMPONENT_SOURCE, &err.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{MemorySource, MemorySourceHandle};
    use crate::deadletter::DeadLetterStore;
    use crate::kafka::MemoryLog;
    use serde_json::json;
    use tempfile::TempDir;

    fn insert(id: i64) -> serde_json::Value {
        json!({
            "action": "I",
            "schema": "public",
            "table": "users",
            "timestamp": "2024-01-01 00:00:00+00",
            "columns": [
                {"name": "id", "type": "integer", "value": id},
                {"name": "name", "type": "text", "value": format!("u{}", id)}
            ],
            "pk": [{"name": "id", "type": "integer"}]
        })
    }

    fn pipeline(
        log: &MemoryLog,
        dir: &TempDir,
    ) -> (CapturePipeline<MemorySource>, MemorySourceHandle, Arc<HeartbeatTracker>, tokio::task::JoinHandle<()>) {
        let (source, handle) = MemorySource::new();
        let (context, dlq) = PipelineContext::start(&dir.path().join("dlq.jsonl"));
        let publisher = Arc::new(Publisher::new(Arc::new(log.clone())).with_max_message_bytes(600));
        let heartbeats = Arc::new(HeartbeatTracker::new(
            Arc::clone(&context.health),
            Arc::clone(&context.metrics),
        ));
        let mut config = Config::default();
        config.postgres.poll_interval_ms = 5;
        config.capture.ack_interval_ms = 0;
        let pipeline = CapturePipeline::new(source, &config, publisher, Arc::clone(&heartbeats), context);
        (pipeline, handle, heartbeats, dlq)
    }

    #[tokio::test]
    async fn test_events_published_and_source_acknowledged() {
        let log = MemoryLog::new(2);
        let dir = TempDir::new().unwrap();
        let (mut pipeline, handle, heartbeats, _dlq) = pipeline(&log, &dir);

        handle.push_json(json!({"action": "B"}));
        handle.push_json(insert(1));
        handle.push_json(insert(2));
        handle.push_json(json!({"action": "C"}));
        let hb = handle.push_json(json!({
            "action": "M", "transactional": false,
            "prefix": "sentinelsync.heartbeat", "content": "1"
        }));

        let shutdown = pipeline.shutdown_signal();
        let task = tokio::spawn(async move { pipeline.run(None).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.send(()).unwrap();
        let report = task.await.unwrap().unwrap();

        assert_eq!(report.published, 2);
        assert_eq!(report.heartbeats, 1);
        assert_eq!(log.records(0).len() + log.records(1).len(), 2);
        assert_eq!(handle.confirmed_position(), hb);
        assert!(heartbeats.last_position() >= hb);
    }

    #[tokio::test]
    async fn test_rejected_publish_is_dead_lettered_and_released() {
        let log = MemoryLog::new(1);
        let dir = TempDir::new().unwrap();
        let (mut pipeline, handle, _heartbeats, dlq) = pipeline(&log, &dir);

        let mut big = insert(1);
        big["columns"][1]["value"] = json!("x".repeat(1000));
        handle.push("not json at all");
        handle.push_json(big);
        handle.push_json(insert(2));

        pipeline.adapter.start(None).await.unwrap();
        while pipeline.step().await.unwrap() {}
        pipeline.acknowledge().await;
        assert_eq!(pipeline.report().published, 1);
        assert_eq!(pipeline.report().dead_lettered, 2);
        assert_eq!(handle.retained(), 0);

        drop(pipeline);
        dlq.await.unwrap();
        let records = DeadLetterStore::new(dir.path().join("dlq.jsonl")).list().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].stage, FailureStage::Capture);
        assert_eq!(records[0].error_class, "Undecodable");
        assert_eq!(records[1].stage, FailureStage::Publish);
        assert_eq!(records[1].error_class, "PublishRejected");
    }

    #[tokio::test]
    async fn test_expired_resume_position_fails() {
        let log = MemoryLog::new(1);
        let dir = TempDir::new().unwrap();
        let (mut pipeline, handle, _heartbeats, _dlq) = pipeline(&log, &dir);
        handle.make_unavailable();

        let err = pipeline.run(Some(SourcePosition(1))).await.unwrap_err();
        assert!(matches!(err, Error::Capture(CaptureError::SourceUnavailable { .. })));
    }
}
