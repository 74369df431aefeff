//! Sentinel Core - change-data-capture from PostgreSQL into a wide-column store
//!
//! This library moves row-level changes from a PostgreSQL logical replication
//! slot, through a partitioned Kafka topic, into a Cassandra-compatible store:
//!
//! - Ordered capture with acknowledgement gated on durable publish
//! - Per-key ordering through key-hashed partitioning
//! - Crash-safe, per-partition checkpointed consumption
//! - Idempotent conditional writes, so replays never corrupt sink state
//! - Bounded retries, circuit breaking and a durable dead-letter store

pub mod capture;
pub mod checkpoint;
pub mod circuit_breaker;
pub mod config;
pub mod consumer;
pub mod deadletter;
pub mod engine;
pub mod error;
pub mod event;
pub mod health;
pub mod heartbeat;
pub mod kafka;
pub mod metrics;
pub mod publisher;
pub mod retry;
pub mod sink;

// Re-export commonly used types
pub use config::Config;
pub use error::{
    CaptureError, CheckpointError, ConsumerError, DeadLetterError, PublishError, SinkError,
};
pub use error::{Error, Result};
pub use event::{ChangeEvent, ColumnValue, IdempotencyKey, Operation, PartitionOffset, SourceKey, SourcePosition};
