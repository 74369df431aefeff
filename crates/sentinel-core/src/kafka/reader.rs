//! Per-partition Kafka readers.
//!
//! Each partition worker gets its own `StreamConsumer` with a manual
//! assignment: no group rebalancing and no broker-side offset commits, since
//! progress lives in the worker's checkpoint log. `auto.offset.reset=error`
//! makes an out-of-range resume offset surface as an error instead of
//! silently jumping.

use super::{base_client_config, LogRecord, PartitionReader, ReaderFactory, StartOffset};
use crate::config::KafkaConfig;
use crate::{ConsumerError, Error, Result};
use async_trait::async_trait;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

fn create_consumer(config: &KafkaConfig) -> Result<StreamConsumer> {
    base_client_config(config)
        .set("group.id", &config.consumer_group)
        .set("enable.auto.commit", "false")
        .set("enable.auto.offset.store", "false")
        .set("auto.offset.reset", "error")
        .set("session.timeout.ms", config.session_timeout_ms.to_string())
        .create()
        .map_err(|e| {
            ConsumerError::Assignment(format!(
                "consumer creation failed for {}: {}",
                config.bootstrap_servers.join(","),
                e
            ))
            .into()
        })
}

/// Map a consume error for `partition`.
fn classify(partition: i32, err: KafkaError) -> Error {
    match err.rdkafka_error_code() {
        Some(RDKafkaErrorCode::AutoOffsetReset) | Some(RDKafkaErrorCode::OffsetOutOfRange) => {
            ConsumerError::PartitionFailed {
                partition,
                reason: format!("offset out of retained range: {}", err),
            }
            .into()
        }
        _ => ConsumerError::Poll(err.to_string()).into(),
    }
}

/// Reads one partition of the topic.
pub struct KafkaPartitionReader {
    consumer: Arc<StreamConsumer>,
    topic: String,
    partition: i32,
}

impl KafkaPartitionReader {
    /// Create a reader for `partition`. Nothing is read until [`seek`].
    ///
    /// [`seek`]: PartitionReader::seek
    pub fn new(config: &KafkaConfig, partition: i32) -> Result<Self> {
        Ok(Self {
            consumer: Arc::new(create_consumer(config)?),
            topic: config.topic.clone(),
            partition,
        })
    }
}

#[async_trait]
impl PartitionReader for KafkaPartitionReader {
    fn partition(&self) -> i32 {
        self.partition
    }

    async fn seek(&mut self, start: StartOffset) -> Result<()> {
        let offset = match start {
            StartOffset::Earliest => Offset::Beginning,
            StartOffset::Latest => Offset::End,
            StartOffset::At(offset) => Offset::Offset(offset),
        };

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&self.topic, self.partition, offset)
            .map_err(|e| ConsumerError::Assignment(e.to_string()))?;
        self.consumer
            .assign(&tpl)
            .map_err(|e| ConsumerError::Assignment(e.to_string()))?;

        info!(
            topic = %self.topic,
            partition = self.partition,
            start = ?start,
            "Partition assigned"
        );
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<LogRecord>> {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Ok(Ok(msg)) => Ok(Some(LogRecord {
                offset: msg.offset(),
                key: msg.key().map(|k| k.to_vec()),
                payload: msg.payload().map(|p| p.to_vec()).unwrap_or_default(),
            })),
            Ok(Err(e)) => Err(classify(self.partition, e)),
            Err(_) => Ok(None),
        }
    }

    async fn high_watermark(&mut self) -> Result<i64> {
        let consumer = Arc::clone(&self.consumer);
        let topic = self.topic.clone();
        let partition = self.partition;

        let (low, high) = tokio::task::spawn_blocking(move || {
            consumer.fetch_watermarks(&topic, partition, METADATA_TIMEOUT)
        })
        .await
        .map_err(|e| ConsumerError::Poll(format!("watermark task failed: {}", e)))?
        .map_err(|e| ConsumerError::Poll(e.to_string()))?;

        debug!(partition = partition, low = low, high = high, "Fetched watermarks");
        Ok(high)
    }
}

/// Opens [`KafkaPartitionReader`]s for the configured topic.
#[derive(Clone)]
pub struct KafkaReaderFactory {
    config: KafkaConfig,
}

impl KafkaReaderFactory {
    /// Create a factory for `config.topic`.
    pub fn new(config: KafkaConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ReaderFactory for KafkaReaderFactory {
    async fn partition_ids(&self) -> Result<Vec<i32>> {
        let consumer = create_consumer(&self.config)?;
        let topic = self.config.topic.clone();

        let ids = tokio::task::spawn_blocking(move || {
            consumer
                .fetch_metadata(Some(&topic), METADATA_TIMEOUT)
                .map(|metadata| {
                    metadata
                        .topics()
                        .iter()
                        .filter(|t| t.name() == topic)
                        .flat_map(|t| t.partitions().iter().map(|p| p.id()))
                        .collect::<Vec<_>>()
                })
        })
        .await
        .map_err(|e| ConsumerError::Assignment(format!("metadata task failed: {}", e)))?
        .map_err(|e| ConsumerError::Assignment(e.to_string()))?;

        if ids.is_empty() {
            return Err(Error::Config(format!(
                "topic {} does not exist or has no partitions",
                self.config.topic
            )));
        }
        Ok(ids)
    }

    async fn open_reader(&self, partition: i32) -> Result<Box<dyn PartitionReader>> {
        Ok(Box::new(KafkaPartitionReader::new(&self.config, partition)?))
    }
}
