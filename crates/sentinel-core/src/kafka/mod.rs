//! Durable log boundary.
//!
//! The pipeline only needs two things from the log: ordered, confirmed
//! appends to a chosen partition, and independent per-partition readers that
//! can resume from any retained offset. Both are traits so the engines run
//! against Kafka in production and against [`MemoryLog`] in tests.

mod memory;
mod producer;
mod reader;

pub use memory::{MemoryLog, MemoryPartitionReader};
pub use producer::KafkaAppender;
pub use reader::{KafkaPartitionReader, KafkaReaderFactory};

use crate::config::KafkaConfig;
use crate::Result;
use async_trait::async_trait;
use rdkafka::ClientConfig;
use std::time::Duration;

/// One record read back from a partition.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// Offset within the partition
    pub offset: i64,
    /// Message key
    pub key: Option<Vec<u8>>,
    /// Message payload (empty for null payloads)
    pub payload: Vec<u8>,
}

/// Where a partition reader starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOffset {
    /// First retained offset
    Earliest,
    /// Only records appended from now on
    Latest,
    /// The given offset is the next one to read
    At(i64),
}

/// Append side of the log.
#[async_trait]
pub trait LogAppender: Send + Sync {
    /// Number of partitions of the topic.
    fn partition_count(&self) -> i32;

    /// Append and wait for the log to confirm durability. Returns the offset.
    async fn append(&self, partition: i32, key: &[u8], payload: &[u8]) -> Result<i64>;
}

/// Read side of one partition.
#[async_trait]
pub trait PartitionReader: Send {
    /// Partition this reader is bound to.
    fn partition(&self) -> i32;

    /// Position the reader.
    async fn seek(&mut self, start: StartOffset) -> Result<()>;

    /// Next record, or `None` if nothing arrived within `timeout`.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<LogRecord>>;

    /// Offset the next appended record will get.
    async fn high_watermark(&mut self) -> Result<i64>;
}

/// Opens independent readers, one per partition worker.
#[async_trait]
pub trait ReaderFactory: Send + Sync {
    /// Partition ids of the topic.
    async fn partition_ids(&self) -> Result<Vec<i32>>;

    /// Open a reader bound to `partition`.
    async fn open_reader(&self, partition: i32) -> Result<Box<dyn PartitionReader>>;
}

/// Client settings shared by the producer and the partition readers.
pub(crate) fn base_client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config.set("bootstrap.servers", config.bootstrap_servers.join(","));

    if let Some(ref protocol) = config.security.protocol {
        client_config.set("security.protocol", protocol);
    }
    if let Some(ref mechanism) = config.security.sasl_mechanism {
        client_config.set("sasl.mechanism", mechanism);
    }
    if let Some(ref username) = config.security.sasl_username {
        client_config.set("sasl.username", username);
    }
    if let Some(ref password) = config.security.sasl_password {
        client_config.set("sasl.password", password);
    }
    if let Some(ref path) = config.security.ssl_ca_location {
        client_config.set("ssl.ca.location", path.to_string_lossy().as_ref());
    }
    if let Some(ref path) = config.security.ssl_cert_location {
        client_config.set("ssl.certificate.location", path.to_string_lossy().as_ref());
    }
    if let Some(ref path) = config.security.ssl_key_location {
        client_config.set("ssl.key.location", path.to_string_lossy().as_ref());
    }

    client_config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_client_config_security() {
        let mut config = KafkaConfig::default();
        config.bootstrap_servers = vec!["b1:9092".into(), "b2:9092".into()];
        config.security.protocol = Some("SASL_SSL".into());
        config.security.sasl_mechanism = Some("PLAIN".into());

        let client = base_client_config(&config);
        assert_eq!(client.get("bootstrap.servers"), Some("b1:9092,b2:9092"));
        assert_eq!(client.get("security.protocol"), Some("SASL_SSL"));
        assert_eq!(client.get("sasl.mechanism"), Some("PLAIN"));
        assert_eq!(client.get("sasl.username"), None);
    }
}
