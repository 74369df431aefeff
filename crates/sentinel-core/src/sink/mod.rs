//! Idempotent application of change events to a wide-column store.
//!
//! Every row carries the source position and idempotency key of the change
//! that produced it. Writes are conditional on the stored position being
//! older, so replays and stale redeliveries are absorbed by the store itself
//! instead of a separate read-then-write round trip.

#[cfg(feature = "cassandra")]
mod cassandra;
mod mapping;
mod memory;
mod writer;

#[cfg(feature = "cassandra")]
pub use cassandra::{CassandraStore, CassandraStoreFactory};
pub use mapping::{
    map_event, sink_table_name, COL_DELETED, COL_IDEMPOTENCY_KEY, COL_SCHEMA_VERSION,
    COL_SOURCE_POSITION, COL_SOURCE_TS,
};
pub use memory::MemoryStore;
pub use writer::{ApplyOutcome, IdempotentSinkWriter};

use crate::event::{escape_key_part, IdempotencyKey, SourcePosition};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A value as stored in a sink cell.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Boolean(bool),
    BigInt(i64),
    Double(f64),
    Text(String),
    Blob(Vec<u8>),
    Timestamp(DateTime<Utc>),
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Null => f.write_str("null"),
            CellValue::Boolean(b) => write!(f, "{}", b),
            CellValue::BigInt(i) => write!(f, "{}", i),
            CellValue::Double(d) => write!(f, "{}", d),
            CellValue::Text(s) => f.write_str(s),
            CellValue::Blob(b) => {
                f.write_str("0x")?;
                b.iter().try_for_each(|byte| write!(f, "{:02x}", byte))
            }
            CellValue::Timestamp(ts) => f.write_str(&ts.to_rfc3339()),
        }
    }
}

/// Partition key cells of a sink row, in key order.
#[derive(Debug, Clone, PartialEq)]
pub struct RowKey(pub Vec<(String, CellValue)>);

impl RowKey {
    /// Stable text form, used to address rows in memory. Distinct keys
    /// always give distinct forms.
    pub fn canonical(&self) -> String {
        self.0
            .iter()
            .map(|(name, value)| {
                format!(
                    "{}={}",
                    escape_key_part(name),
                    escape_key_part(&value.to_string())
                )
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// One conditional row write produced from a change event.
#[derive(Debug, Clone, PartialEq)]
pub struct RowMutation {
    /// Sink table
    pub table: String,
    /// Partition key
    pub key: RowKey,
    /// Data cells (full row image; empty for tombstones)
    pub cells: BTreeMap<String, CellValue>,
    /// Source position of the change
    pub position: SourcePosition,
    /// Idempotency key of the change
    pub idempotency_key: IdempotencyKey,
    /// Tombstone marker
    pub deleted: bool,
    /// Commit time at the source
    pub source_ts: DateTime<Utc>,
    /// Schema version used for the mapping
    pub schema_version: u32,
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The row now reflects the mutation
    Applied,
    /// The row already holds an equal or newer position
    Stale { stored_position: SourcePosition },
}

/// A row as read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub cells: BTreeMap<String, CellValue>,
    pub position: SourcePosition,
    pub idempotency_key: IdempotencyKey,
    pub deleted: bool,
    pub source_ts: DateTime<Utc>,
    pub schema_version: u32,
}

/// Wide-column store boundary.
#[async_trait]
pub trait WideColumnStore: Send + Sync {
    /// Write the row only if the stored position is older than
    /// `mutation.position`. The check and the write are one atomic operation.
    ///
    /// Errors are `SinkError::Unavailable` (retryable) or
    /// `SinkError::Rejected` (fatal for this event).
    async fn write_if_newer(&self, mutation: &RowMutation) -> Result<WriteOutcome>;

    /// Read a row, tombstones included.
    async fn read(&self, table: &str, key: &RowKey) -> Result<Option<StoredRow>>;

    /// Cheap health check used by the circuit breaker.
    async fn probe(&self) -> Result<()>;
}

/// Opens independent store connections, one per partition worker.
#[async_trait]
pub trait StoreFactory: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn WideColumnStore>>;
}
