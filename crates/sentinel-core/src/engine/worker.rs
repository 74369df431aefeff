//! One worker per log partition.

use super::PipelineContext;
use crate::checkpoint::CommitKind;
use crate::consumer::{Delivery, PartitionConsumer, PartitionState};
use crate::deadletter::{DeadLetterRecord, FailureStage};
use crate::health::{partition_component, COMPONENT_CHECKPOINT};
use crate::metrics::ErrorType;
use crate::retry::{RetryCoordinator, RetryOutcome, RetryPolicy};
use crate::sink::ApplyOutcome;
use crate::{Error, Result};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const PROGRESS_EVERY: u64 = 100;

/// What a worker did before it stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerReport {
    pub partition: i32,
    pub applied: u64,
    pub already_applied: u64,
    pub dead_lettered: u64,
    pub committed_offset: Option<i64>,
    pub final_state: PartitionState,
}

enum InFlight {
    Finished(Result<()>),
    /// Shutdown arrived mid-apply; `None` if the grace period ran out
    Interrupted(Option<Result<()>>),
}

/// Consumes one partition: apply, dead-letter when needed, then commit.
pub struct PartitionWorker {
    consumer: PartitionConsumer,
    coordinator: RetryCoordinator,
    context: PipelineContext,
    component: String,
    poll_backoff: RetryPolicy,
    grace: Duration,
    report: WorkerReport,
}

impl PartitionWorker {
    pub fn new(
        consumer: PartitionConsumer,
        coordinator: RetryCoordinator,
        context: PipelineContext,
        grace: Duration,
    ) -> Self {
        let partition = consumer.partition();
        context.health.register_component(&partition_component(partition));
        Self {
            component: partition_component(partition),
            report: WorkerReport {
                partition,
                applied: 0,
                already_applied: 0,
                dead_lettered: 0,
                committed_offset: consumer.committed_offset(),
                final_state: consumer.state(),
            },
            consumer,
            coordinator,
            context,
            poll_backoff: RetryPolicy::default(),
            grace,
        }
    }

    pub fn partition(&self) -> i32 {
        self.report.partition
    }

    /// Apply one delivery and commit its offset.
    ///
    /// Nothing is committed unless the sink confirmed the event or the
    /// dead-letter store holds it.
    pub async fn handle(&mut self, delivery: Delivery) -> Result<()> {
        let (at, source_position, kind) = match delivery {
            Delivery::Event { at, event } => {
                let position = event.source_position();
                let kind = match self.coordinator.apply(&event).await {
                    RetryOutcome::Applied {
                        outcome: ApplyOutcome::Applied,
                        ..
                    } => {
                        self.report.applied += 1;
                        CommitKind::Applied
                    }
                    RetryOutcome::Applied {
                        outcome: ApplyOutcome::AlreadyApplied,
                        ..
                    } => {
                        self.report.already_applied += 1;
                        CommitKind::AlreadyApplied
                    }
                    RetryOutcome::DeadLetter {
                        error_class,
                        attempts,
                        last_error,
                    } => {
                        let record =
                            DeadLetterRecord::for_event(FailureStage::Apply, event, error_class, attempts, last_error)
                                .with_offset(at);
                        self.dead_letter(record).await?;
                        CommitKind::DeadLettered
                    }
                };
                (at, Some(position), kind)
            }
            Delivery::Poison { at, raw, error } => {
                let record = DeadLetterRecord::undecodable(FailureStage::Apply, raw, error).with_offset(at);
                self.dead_letter(record).await?;
                (at, None, CommitKind::DeadLettered)
            }
        };

        if let Err(e) = self.consumer.commit(at.offset, source_position, kind) {
            self.context.metrics.record_error(ErrorType::Checkpoint);
            self.context
                .health
                .mark_unhealthy(COMPONENT_CHECKPOINT, &format!("Commit failed: {}", e));
            return Err(e);
        }
        self.report.committed_offset = self.consumer.committed_offset();
        debug!(partition = at.partition, offset = at.offset, kind = ?kind, "Delivery handled");
        Ok(())
    }

    async fn dead_letter(&mut self, record: DeadLetterRecord) -> Result<()> {
        self.context.dead_letters.write(record).await?;
        self.context.metrics.record_dead_letter();
        self.report.dead_lettered += 1;
        Ok(())
    }

    async fn update_progress(&mut self) {
        match self.consumer.lag().await {
            Ok(lag) => self.context.metrics.set_partition_progress(
                self.report.partition,
                self.consumer.committed_offset().unwrap_or(-1),
                lag,
            ),
            Err(e) => debug!(partition = self.report.partition, error = %e, "Lag unavailable"),
        }
    }

    /// Consume until shutdown or an unrecoverable partition error.
    ///
    /// On shutdown the in-flight delivery gets `grace` to finish and commit;
    /// if it does not, its offset stays uncommitted and is redelivered next
    /// time.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<WorkerReport> {
        if let Err(e) = self.consumer.assign().await {
            self.fail(&e);
            return Err(e);
        }
        self.context.health.mark_healthy(&self.component);

        let mut poll_failures = 0u32;
        let mut since_progress = 0u64;

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                next = self.consumer.next() => next,
            };

            let delivery = match next {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    self.update_progress().await;
                    continue;
                }
                Err(e) if e.is_retryable() => {
                    let delay = self.poll_backoff.calculate_delay(poll_failures);
                    poll_failures = poll_failures.saturating_add(1);
                    self.context.metrics.record_error(ErrorType::Kafka);
                    self.context
                        .health
                        .mark_degraded(&self.component, &format!("Poll retrying: {}", e));
                    warn!(partition = self.report.partition, error = %e, "Poll failed, retrying");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(e) => {
                    self.fail(&e);
                    return Err(e);
                }
            };
            if poll_failures > 0 {
                poll_failures = 0;
                self.context.health.mark_healthy(&self.component);
            }

            let at = delivery.at();
            let grace = self.grace;
            let in_flight = {
                let handled = self.handle(delivery);
                tokio::pin!(handled);
                tokio::select! {
                    result = &mut handled => InFlight::Finished(result),
                    _ = shutdown.recv() => {
                        info!(partition = at.partition, offset = at.offset, "Shutdown requested, finishing in-flight event");
                        InFlight::Interrupted(tokio::time::timeout(grace, &mut handled).await.ok())
                    }
                }
            };

            match in_flight {
                InFlight::Finished(Ok(())) => {
                    since_progress += 1;
                    if since_progress >= PROGRESS_EVERY {
                        since_progress = 0;
                        self.update_progress().await;
                    }
                }
                InFlight::Interrupted(Some(Ok(()))) => break,
                InFlight::Interrupted(None) => {
                    warn!(
                        partition = at.partition,
                        offset = at.offset,
                        "In-flight event did not finish within the grace period, offset left uncommitted"
                    );
                    break;
                }
                InFlight::Finished(Err(e)) | InFlight::Interrupted(Some(Err(e))) => {
                    self.fail(&e);
                    return Err(e);
                }
            }
        }

        self.update_progress().await;
        self.consumer.close()?;
        self.report.final_state = self.consumer.state();
        self.report.committed_offset = self.consumer.committed_offset();
        info!(
            partition = self.report.partition,
            applied = self.report.applied,
            already_applied = self.report.already_applied,
            dead_lettered = self.report.dead_lettered,
            committed = ?self.report.committed_offset,
            "Partition worker stopped"
        );
        Ok(self.report)
    }

    fn fail(&mut self, err: &Error) {
        self.context.metrics.record_error(ErrorType::of(err));
        self.context
            .health
            .mark_unhealthy(&self.component, &err.to_string());
        if self.consumer.state() != PartitionState::Failed {
            self.consumer.fail(&err.to_string());
        }
        self.report.final_state = self.consumer.state();
        error!(partition = self.report.partition, error = %err, "Partition worker stopped on error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointLog;
    use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
    use crate::config::{CheckpointConfig, OffsetReset};
    use crate::deadletter::DeadLetterStore;
    use crate::event::{ChangeEvent, ColumnValue, Operation, SourceKey, SourcePosition};
    use crate::kafka::MemoryLog;
    use crate::sink::{IdempotentSinkWriter, MemoryStore, RowKey, RowMutation, StoredRow, WideColumnStore, WriteOutcome};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    /// Holds every write until released.
    #[derive(Clone, Default)]
    struct GatedStore {
        inner: MemoryStore,
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl WideColumnStore for GatedStore {
        async fn write_if_newer(&self, mutation: &RowMutation) -> Result<WriteOutcome> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.write_if_newer(mutation).await
        }

        async fn read(&self, table: &str, key: &RowKey) -> Result<Option<StoredRow>> {
            self.inner.read(table, key).await
        }

        async fn probe(&self) -> Result<()> {
            self.inner.probe().await
        }
    }

    fn event_bytes(id: i64, position: u64, with_payload: bool) -> Vec<u8> {
        let mut payload = BTreeMap::new();
        if with_payload {
            payload.insert("id".to_string(), ColumnValue::Int(id));
        }
        ChangeEvent::new(
            SourceKey::single("public.t", "id", ColumnValue::Int(id)),
            Operation::Insert,
            payload,
            SourcePosition(position),
            chrono::Utc::now(),
            1,
        )
        .to_bytes()
        .unwrap()
    }

    fn worker(log: &MemoryLog, store: &MemoryStore, dir: &TempDir, context: PipelineContext) -> PartitionWorker {
        worker_with(log, Arc::new(store.clone()), dir, context, Duration::from_secs(1))
    }

    fn worker_with(
        log: &MemoryLog,
        store: Arc<dyn WideColumnStore>,
        dir: &TempDir,
        context: PipelineContext,
        grace: Duration,
    ) -> PartitionWorker {
        let config = CheckpointConfig {
            dir: dir.path().join("checkpoints"),
            snapshot_interval_entries: 1000,
            snapshot_interval_seconds: 3600,
            max_log_files: 5,
        };
        let consumer = PartitionConsumer::new(
            Box::new(log.reader(0)),
            CheckpointLog::open(&config, 0).unwrap(),
            OffsetReset::Earliest,
            Duration::from_millis(5),
        );
        let coordinator = RetryCoordinator::new(
            IdempotentSinkWriter::new(store),
            RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(2), 2).without_jitter(),
            Arc::new(CircuitBreaker::new(CircuitBreakerConfig::new("sink"))),
            Arc::clone(&context.metrics),
            Arc::clone(&context.health),
        );
        PartitionWorker::new(consumer, coordinator, context, grace)
    }

    #[tokio::test]
    async fn test_poison_and_rejected_events_do_not_block_partition() {
        let log = MemoryLog::new(1);
        log.append_raw(0, b"k", &event_bytes(1, 1, true));
        log.append_raw(0, b"k", b"{broken");
        log.append_raw(0, b"k", &event_bytes(2, 2, false));
        log.append_raw(0, b"k", &event_bytes(3, 3, true));

        let dir = TempDir::new().unwrap();
        let store = MemoryStore::new();
        let dlq_path = dir.path().join("dlq.jsonl");
        let (context, dlq) = PipelineContext::start(&dlq_path);
        let worker = worker(&log, &store, &dir, context);

        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(worker.run(rx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(()).unwrap();
        let report = task.await.unwrap().unwrap();

        assert_eq!(report.applied, 2);
        assert_eq!(report.dead_lettered, 2);
        assert_eq!(report.committed_offset, Some(3));
        assert_eq!(report.final_state, PartitionState::Closed);

        dlq.await.unwrap();
        let records = DeadLetterStore::new(&dlq_path).list().unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.stage == FailureStage::Apply));
        assert_eq!(records[1].error_class, "SinkRejected");
    }

    #[tokio::test]
    async fn test_shutdown_past_grace_leaves_offset_uncommitted() {
        let log = MemoryLog::new(1);
        log.append_raw(0, b"k", &event_bytes(1, 1, true));

        let dir = TempDir::new().unwrap();
        let store = GatedStore::default();
        let (context, _dlq) = PipelineContext::start(&dir.path().join("dlq.jsonl"));
        let worker = worker_with(
            &log,
            Arc::new(store.clone()),
            &dir,
            context,
            Duration::from_millis(50),
        );

        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(worker.run(rx));
        store.entered.notified().await;
        tx.send(()).unwrap();
        let report = task.await.unwrap().unwrap();

        assert_eq!(report.applied, 0);
        assert_eq!(report.committed_offset, None);
        assert_eq!(report.final_state, PartitionState::Closed);
        assert_eq!(store.inner.applied_writes(), 0);

        // The event is redelivered from the start on the next run.
        let checkpoint = CheckpointLog::open(
            &CheckpointConfig {
                dir: dir.path().join("checkpoints"),
                snapshot_interval_entries: 1000,
                snapshot_interval_seconds: 3600,
                max_log_files: 5,
            },
            0,
        )
        .unwrap();
        assert_eq!(checkpoint.committed_offset(), None);
    }

    #[tokio::test]
    async fn test_shutdown_within_grace_commits_in_flight_event() {
        let log = MemoryLog::new(1);
        log.append_raw(0, b"k", &event_bytes(1, 1, true));

        let dir = TempDir::new().unwrap();
        let store = GatedStore::default();
        let (context, _dlq) = PipelineContext::start(&dir.path().join("dlq.jsonl"));
        let worker = worker_with(&log, Arc::new(store.clone()), &dir, context, Duration::from_secs(5));

        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(worker.run(rx));
        store.entered.notified().await;
        tx.send(()).unwrap();
        let release = Arc::clone(&store.release);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            release.notify_one();
        });
        let report = task.await.unwrap().unwrap();

        assert_eq!(report.applied, 1);
        assert_eq!(report.committed_offset, Some(0));
        assert_eq!(report.final_state, PartitionState::Closed);
        assert_eq!(store.inner.applied_writes(), 1);
    }
}
