//! Per-partition checkpoint log for crash-safe consumption.
//!
//! Each partition worker owns one log directory. Committed offsets are
//! appended as JSON lines and fsynced before the commit returns; periodic
//! checkpoint entries summarize the log so older files can be rotated away.

mod entries;
mod log;
mod recovery;

pub use entries::{CheckpointEntry, CommitKind};
pub use log::CheckpointLog;
pub use recovery::{RecoveryState, RecoverySummary};
