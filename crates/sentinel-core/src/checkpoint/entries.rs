//! Checkpoint log entry types.

use crate::event::SourcePosition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How the event at a committed offset was disposed of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitKind {
    /// Written to the sink
    Applied,
    /// Sink already held an equal or newer position
    AlreadyApplied,
    /// Routed to the dead-letter store
    DeadLettered,
}

/// A checkpoint log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CheckpointEntry {
    /// The event at `offset` is done; resume after it.
    OffsetCommitted {
        /// Partition number
        partition: i32,
        /// Committed offset
        offset: i64,
        /// Source position of the event, when it could be decoded
        source_position: Option<SourcePosition>,
        /// Disposition of the event
        kind: CommitKind,
        /// Timestamp
        timestamp: DateTime<Utc>,
    },

    /// The partition hit an unrecoverable error.
    PartitionFailed {
        /// Partition number
        partition: i32,
        /// Offset the consumer tried to read, if known
        offset: Option<i64>,
        /// Failure description
        reason: String,
        /// Timestamp
        timestamp: DateTime<Utc>,
    },

    /// Snapshot of the log state, written as the first entry of a new file.
    Checkpoint {
        /// Checkpoint identifier
        checkpoint_id: String,
        /// Partition number
        partition: i32,
        /// Last committed offset at checkpoint time
        committed_offset: Option<i64>,
        /// Entries written since the previous checkpoint
        entries_since_last: u64,
        /// Timestamp
        timestamp: DateTime<Utc>,
    },
}

impl CheckpointEntry {
    /// Get the timestamp of this entry.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            CheckpointEntry::OffsetCommitted { timestamp, .. } => *timestamp,
            CheckpointEntry::PartitionFailed { timestamp, .. } => *timestamp,
            CheckpointEntry::Checkpoint { timestamp, .. } => *timestamp,
        }
    }

    /// Partition this entry belongs to.
    pub fn partition(&self) -> i32 {
        match self {
            CheckpointEntry::OffsetCommitted { partition, .. } => *partition,
            CheckpointEntry::PartitionFailed { partition, .. } => *partition,
            CheckpointEntry::Checkpoint { partition, .. } => *partition,
        }
    }

    /// Offset committed by this entry, if any.
    pub fn committed_offset(&self) -> Option<i64> {
        match self {
            CheckpointEntry::OffsetCommitted { offset, .. } => Some(*offset),
            CheckpointEntry::Checkpoint {
                committed_offset, ..
            } => *committed_offset,
            CheckpointEntry::PartitionFailed { .. } => None,
        }
    }

    /// Whether this is a checkpoint entry.
    pub fn is_checkpoint(&self) -> bool {
        matches!(self, CheckpointEntry::Checkpoint { .. })
    }
}
