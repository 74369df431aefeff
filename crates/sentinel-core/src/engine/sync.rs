//! Log -> sink: one worker task per partition.

use super::{PartitionWorker, PipelineContext, WorkerReport};
use crate::checkpoint::CheckpointLog;
use crate::circuit_breaker::CircuitBreaker;
use crate::config::{Config, SinkKind};
use crate::consumer::PartitionConsumer;
use crate::health::{partition_component, COMPONENT_KAFKA, COMPONENT_SINK};
use crate::kafka::{KafkaReaderFactory, ReaderFactory};
use crate::retry::{RetryCoordinator, RetryPolicy};
use crate::sink::{IdempotentSinkWriter, MemoryStore, StoreFactory};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Outcome of a sync run across all partitions.
#[derive(Debug, Default)]
pub struct SyncReport {
    /// Workers that stopped cleanly
    pub workers: Vec<WorkerReport>,
    /// Partitions that failed, with the reason
    pub failed: Vec<(i32, String)>,
}

impl SyncReport {
    pub fn applied(&self) -> u64 {
        self.workers.iter().map(|w| w.applied).sum()
    }

    pub fn dead_lettered(&self) -> u64 {
        self.workers.iter().map(|w| w.dead_lettered).sum()
    }
}

/// Store factory for the configured sink.
pub fn store_factory(config: &Config) -> Result<Arc<dyn StoreFactory>> {
    match config.sink.kind {
        SinkKind::Memory => {
            warn!("Using the in-memory sink, applied rows are not persisted");
            Ok(Arc::new(MemoryStore::new()))
        }
        #[cfg(feature = "cassandra")]
        SinkKind::Cassandra => Ok(Arc::new(crate::sink::CassandraStoreFactory::new(
            config.cassandra.clone(),
        ))),
        #[cfg(not(feature = "cassandra"))]
        SinkKind::Cassandra => Err(Error::Config(
            "sink.kind = \"cassandra\" requires the `cassandra` feature".into(),
        )),
    }
}

/// Runs a [`PartitionWorker`] for every assigned partition.
///
/// Partitions are independent: one that fails to open or fails while
/// running is reported and the others keep going. Each worker opens its own
/// log reader and sink connection; only the circuit breaker is shared.
pub struct SyncEngine {
    config: Config,
    readers: Arc<dyn ReaderFactory>,
    stores: Arc<dyn StoreFactory>,
    breaker: Arc<CircuitBreaker>,
    context: PipelineContext,
    shutdown_tx: broadcast::Sender<()>,
}

impl SyncEngine {
    pub fn new(
        config: Config,
        readers: Arc<dyn ReaderFactory>,
        stores: Arc<dyn StoreFactory>,
        context: PipelineContext,
    ) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(
            config.circuit_breaker.to_breaker_config("sink"),
        ));
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            readers,
            stores,
            breaker,
            context,
            shutdown_tx,
        }
    }

    /// Engine over Kafka and the configured sink. Connections are opened
    /// per worker by [`run`](Self::run).
    pub fn from_config(config: Config, context: PipelineContext) -> Result<Self> {
        let health = &context.health;
        health.register_component(COMPONENT_KAFKA);
        health.register_component(COMPONENT_SINK);

        let stores = store_factory(&config).map_err(|e| {
            health.mark_unhealthy(COMPONENT_SINK, &e.to_string());
            e
        })?;
        let readers = Arc::new(KafkaReaderFactory::new(config.kafka.clone()));
        Ok(Self::new(config, readers, stores, context))
    }

    /// Sender that stops [`run`](Self::run).
    pub fn shutdown_signal(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Shared sink circuit breaker.
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    async fn assigned_partitions(&self) -> Result<Vec<i32>> {
        let available = self.readers.partition_ids().await?;
        if self.config.sync.partitions.is_empty() {
            return Ok(available);
        }
        let mut assigned = Vec::new();
        for &p in &self.config.sync.partitions {
            if available.contains(&p) {
                assigned.push(p);
            } else {
                warn!(partition = p, "Configured partition does not exist, skipping");
            }
        }
        Ok(assigned)
    }

    async fn build_worker(&self, partition: i32) -> Result<PartitionWorker> {
        let reader = self.readers.open_reader(partition).await?;
        let store = match self.stores.connect().await {
            Ok(store) => {
                self.context.health.mark_healthy(COMPONENT_SINK);
                store
            }
            Err(e) => {
                self.context.health.mark_unhealthy(COMPONENT_SINK, &e.to_string());
                return Err(e);
            }
        };
        let checkpoint = CheckpointLog::open(&self.config.checkpoint, partition)?;
        let consumer = PartitionConsumer::new(
            reader,
            checkpoint,
            self.config.kafka.auto_offset_reset,
            Duration::from_millis(self.config.kafka.poll_timeout_ms),
        );
        let coordinator = RetryCoordinator::new(
            IdempotentSinkWriter::new(store),
            RetryPolicy::from(&self.config.retry),
            Arc::clone(&self.breaker),
            Arc::clone(&self.context.metrics),
            Arc::clone(&self.context.health),
        );
        Ok(PartitionWorker::new(
            consumer,
            coordinator,
            self.context.clone(),
            self.config.sync.shutdown_grace(),
        ))
    }

    /// Run every partition until shutdown.
    ///
    /// Fails only if no partition could be started at all.
    pub async fn run(&self) -> Result<SyncReport> {
        let partitions = match self.assigned_partitions().await {
            Ok(p) => {
                self.context.health.mark_healthy(COMPONENT_KAFKA);
                p
            }
            Err(e) => {
                self.context.health.mark_unhealthy(COMPONENT_KAFKA, &e.to_string());
                return Err(e);
            }
        };
        if partitions.is_empty() {
            return Err(Error::Config("no partitions to consume".into()));
        }

        let mut report = SyncReport::default();
        let mut tasks = JoinSet::new();
        for partition in partitions {
            match self.build_worker(partition).await {
                Ok(worker) => {
                    let shutdown = self.shutdown_tx.subscribe();
                    tasks.spawn(async move { (partition, worker.run(shutdown).await) });
                }
                Err(e) => {
                    error!(partition, error = %e, "Failed to open partition");
                    self.context
                        .health
                        .mark_unhealthy(&partition_component(partition), &e.to_string());
                    report.failed.push((partition, e.to_string()));
                }
            }
        }
        if tasks.is_empty() {
            return Err(Error::Config("no partition could be opened".into()));
        }
        self.context.health.pipeline_started();
        info!(workers = tasks.len(), "Sync engine running");

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(worker))) => report.workers.push(worker),
                Ok((partition, Err(e))) => report.failed.push((partition, e.to_string())),
                Err(e) => error!(error = %e, "Partition worker task panicked"),
            }
        }
        self.context.health.pipeline_stopped();

        report.workers.sort_by_key(|w| w.partition);
        report.failed.sort();
        info!(
            applied = report.applied(),
            dead_lettered = report.dead_lettered(),
            failed = report.failed.len(),
            "Sync engine stopped"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ChangeEvent, ColumnValue, Operation, SourceKey, SourcePosition};
    use crate::kafka::MemoryLog;
    use crate::sink::{CellValue, RowKey, WideColumnStore};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn upsert(id: i64, name: &str, position: u64) -> Vec<u8> {
        let mut payload = BTreeMap::new();
        payload.insert("id".to_string(), ColumnValue::Int(id));
        payload.insert("name".to_string(), ColumnValue::Text(name.to_string()));
        ChangeEvent::new(
            SourceKey::single("public.users", "id", ColumnValue::Int(id)),
            Operation::Update,
            payload,
            SourcePosition(position),
            chrono::Utc::now(),
            1,
        )
        .to_bytes()
        .unwrap()
    }

    fn config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.checkpoint.dir = dir.path().join("checkpoints");
        config.dead_letter.path = dir.path().join("dlq.jsonl");
        config.kafka.poll_timeout_ms = 5;
        config.sync.shutdown_grace_seconds = 1;
        config
    }

    #[tokio::test]
    async fn test_all_partitions_applied() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let log = MemoryLog::new(2);
        log.append_raw(0, b"1", &upsert(1, "a", 10));
        log.append_raw(1, b"2", &upsert(2, "b", 11));
        log.append_raw(0, b"1", &upsert(1, "c", 12));

        let store = MemoryStore::new();
        let (context, _dlq) = PipelineContext::start(&config.dead_letter.path);
        let engine = SyncEngine::new(config, Arc::new(log), Arc::new(store.clone()), context);
        let shutdown = engine.shutdown_signal();

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            shutdown.send(()).ok();
        });
        let report = engine.run().await.unwrap();
        stopper.await.unwrap();

        assert_eq!(report.workers.len(), 2);
        assert!(report.failed.is_empty());
        assert_eq!(report.applied(), 3);
        assert_eq!(report.workers[0].committed_offset, Some(1));

        let key = RowKey(vec![("id".to_string(), CellValue::BigInt(1))]);
        let row = store.read("public_users", &key).await.unwrap().unwrap();
        assert_eq!(row.cells.get("name"), Some(&CellValue::Text("c".into())));
    }

    #[tokio::test]
    async fn test_missing_partition_is_skipped() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.sync.partitions = vec![0, 7];
        let log = MemoryLog::new(1);

        let (context, _dlq) = PipelineContext::start(&config.dead_letter.path);
        let engine = SyncEngine::new(config, Arc::new(log), Arc::new(MemoryStore::new()), context);
        let shutdown = engine.shutdown_signal();
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown.send(()).ok();
        });
        let report = engine.run().await.unwrap();
        stopper.await.unwrap();

        assert_eq!(report.workers.len(), 1);
        assert_eq!(report.workers[0].partition, 0);
    }

    #[tokio::test]
    async fn test_memory_store_from_config() {
        let mut config = Config::default();
        config.sink.kind = SinkKind::Memory;
        let store = store_factory(&config).unwrap().connect().await.unwrap();
        assert!(store.probe().await.is_ok());
    }

    #[cfg(not(feature = "cassandra"))]
    #[test]
    fn test_cassandra_sink_needs_feature() {
        let config = Config::default();
        assert!(matches!(store_factory(&config), Err(Error::Config(_))));
    }

    /// Counts connections handed out over a shared memory store.
    struct CountingStores {
        store: MemoryStore,
        connects: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl StoreFactory for CountingStores {
        async fn connect(&self) -> Result<Arc<dyn WideColumnStore>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.store.connect().await
        }
    }

    #[tokio::test]
    async fn test_each_worker_connects_its_own_store() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let log = MemoryLog::new(3);
        let stores = Arc::new(CountingStores {
            store: MemoryStore::new(),
            connects: AtomicUsize::new(0),
        });

        let (context, _dlq) = PipelineContext::start(&config.dead_letter.path);
        let engine = SyncEngine::new(config, Arc::new(log), Arc::clone(&stores) as Arc<dyn StoreFactory>, context);
        let shutdown = engine.shutdown_signal();
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown.send(()).ok();
        });
        let report = engine.run().await.unwrap();
        stopper.await.unwrap();

        assert_eq!(report.workers.len(), 3);
        assert_eq!(stores.connects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_open_breaker_pauses_every_partition_without_dead_letters() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.retry.max_attempts = 2;
        config.retry.base_delay_ms = 1;
        config.retry.max_delay_ms = 2;
        config.retry.jitter = false;
        config.circuit_breaker.failure_threshold = 2;
        config.circuit_breaker.reset_timeout_ms = 20;
        config.circuit_breaker.success_threshold = 1;

        let log = MemoryLog::new(2);
        log.append_raw(0, b"1", &upsert(1, "a", 10));
        log.append_raw(1, b"2", &upsert(2, "b", 11));

        let store = MemoryStore::new();
        store.set_available(false);
        let (context, _dlq) = PipelineContext::start(&config.dead_letter.path);
        let metrics = Arc::clone(&context.metrics);
        let health = Arc::clone(&context.health);
        let engine = SyncEngine::new(config, Arc::new(log), Arc::new(store.clone()), context);
        let breaker = Arc::clone(engine.breaker());
        let shutdown = engine.shutdown_signal();
        let task = tokio::spawn(async move { engine.run().await });

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(breaker.state(), crate::circuit_breaker::CircuitState::Open);
        assert_eq!(metrics.events_applied_total(), 0);
        assert_eq!(metrics.dead_letters_total(), 0);
        assert!(matches!(
            health.get_component_status(COMPONENT_SINK),
            Some(crate::health::ComponentStatus::Degraded(_))
        ));

        store.set_available(true);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while metrics.events_applied_total() < 2 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.send(()).unwrap();
        let report = task.await.unwrap().unwrap();

        assert_eq!(report.applied(), 2);
        assert_eq!(report.dead_lettered(), 0);
        assert!(report.workers.iter().all(|w| w.committed_offset == Some(0)));
        assert_eq!(breaker.state(), crate::circuit_breaker::CircuitState::Closed);
    }
}
