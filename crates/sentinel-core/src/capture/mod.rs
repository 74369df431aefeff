//! Change capture from the source database.
//!
//! - [`ChangeSource`]: the source boundary (PostgreSQL logical decoding, or
//!   an in-memory stream for tests)
//! - [`Wal2JsonDecoder`]: wal2json v2 records to row changes
//! - [`CaptureAdapter`]: ordered, restartable event sequence with
//!   durability-gated acknowledgement

mod adapter;
mod postgres;
mod source;
mod wal2json;

pub use adapter::{AckTracker, CaptureAdapter, CaptureItem};
pub use postgres::{PgHeartbeatEmitter, PgLogicalSource};
pub use source::{ChangeSource, HeartbeatEmitter, MemorySource, MemorySourceHandle, SourceRecord};
pub use wal2json::{Decoded, RowChange, Wal2JsonDecoder};
