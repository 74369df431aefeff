//! Crash recovery from a partition's checkpoint log.

use super::entries::{CheckpointEntry, CommitKind};
use super::log::CheckpointLog;
use crate::Result;
use std::path::Path;
use tracing::{info, warn};

/// State recovered from a checkpoint log.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RecoveryState {
    /// Highest committed offset
    pub committed_offset: Option<i64>,

    /// Failure recorded after the last commit, if any
    pub last_failure: Option<String>,

    /// Commits by disposition, since the oldest retained file
    pub applied: u64,
    pub already_applied: u64,
    pub dead_lettered: u64,

    /// Most recent checkpoint id
    pub last_checkpoint_id: Option<String>,

    /// Total entries processed
    pub entries_processed: u64,
}

/// Summary of recovery state for logging and status output.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoverySummary {
    pub entries_processed: u64,
    pub committed_offset: Option<i64>,
    pub dead_lettered: u64,
    pub failed: bool,
}

impl RecoveryState {
    /// Recover state from an open checkpoint log.
    pub fn recover_from(log: &CheckpointLog) -> Result<Self> {
        let state = Self::from_entries(log.read_all_entries()?);
        state.log_outcome(log.partition());
        Ok(state)
    }

    /// Recover state from a partition directory without opening it.
    pub fn recover_dir(dir: &Path) -> Result<Self> {
        Ok(Self::from_entries(CheckpointLog::read_entries_in(dir)?))
    }

    fn from_entries(entries: Vec<CheckpointEntry>) -> Self {
        let mut state = RecoveryState::default();

        for entry in entries {
            state.entries_processed += 1;

            match entry {
                CheckpointEntry::OffsetCommitted { offset, kind, .. } => {
                    state.committed_offset = Some(state.committed_offset.map_or(offset, |o| o.max(offset)));
                    state.last_failure = None;
                    match kind {
                        CommitKind::Applied => state.applied += 1,
                        CommitKind::AlreadyApplied => state.already_applied += 1,
                        CommitKind::DeadLettered => state.dead_lettered += 1,
                    }
                }
                CheckpointEntry::PartitionFailed { reason, .. } => {
                    state.last_failure = Some(reason);
                }
                CheckpointEntry::Checkpoint {
                    checkpoint_id,
                    committed_offset,
                    ..
                } => {
                    if let Some(offset) = committed_offset {
                        state.committed_offset =
                            Some(state.committed_offset.map_or(offset, |o| o.max(offset)));
                    }
                    state.last_checkpoint_id = Some(checkpoint_id);
                }
            }
        }

        state
    }

    fn log_outcome(&self, partition: i32) {
        if let Some(reason) = &self.last_failure {
            warn!(
                partition = partition,
                reason = %reason,
                "Partition failed in a previous run"
            );
        }
        info!(
            partition = partition,
            entries = self.entries_processed,
            committed_offset = ?self.committed_offset,
            dead_lettered = self.dead_lettered,
            "Checkpoint recovery complete"
        );
    }

    /// Next offset to consume (last committed + 1), if anything was committed.
    pub fn starting_offset(&self) -> Option<i64> {
        self.committed_offset.map(|o| o + 1)
    }

    /// Whether the event at `offset` was already committed.
    pub fn is_already_processed(&self, offset: i64) -> bool {
        self.committed_offset.map_or(false, |c| offset <= c)
    }

    /// Summary for reporting.
    pub fn summary(&self) -> RecoverySummary {
        RecoverySummary {
            entries_processed: self.entries_processed,
            committed_offset: self.committed_offset,
            dead_lettered: self.dead_lettered,
            failed: self.last_failure.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CheckpointConfig;
    use chrono::Utc;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> CheckpointConfig {
        CheckpointConfig {
            dir: dir.path().to_path_buf(),
            snapshot_interval_entries: 4,
            snapshot_interval_seconds: 3600,
            max_log_files: 2,
        }
    }

    #[test]
    fn test_recover_empty() {
        let temp_dir = TempDir::new().unwrap();
        let log = CheckpointLog::open(&config(&temp_dir), 0).unwrap();
        let state = RecoveryState::recover_from(&log).unwrap();
        assert_eq!(state.committed_offset, None);
        assert_eq!(state.starting_offset(), None);
        assert!(!state.is_already_processed(0));
    }

    #[test]
    fn test_recover_counts_dispositions() {
        let temp_dir = TempDir::new().unwrap();
        let mut log = CheckpointLog::open(&config(&temp_dir), 1).unwrap();
        log.commit(0, None, CommitKind::Applied).unwrap();
        log.commit(1, None, CommitKind::DeadLettered).unwrap();
        log.commit(2, None, CommitKind::AlreadyApplied).unwrap();

        let state = RecoveryState::recover_from(&log).unwrap();
        assert_eq!(state.committed_offset, Some(2));
        assert_eq!(state.starting_offset(), Some(3));
        assert_eq!((state.applied, state.dead_lettered, state.already_applied), (1, 1, 1));
        assert!(state.is_already_processed(2));
        assert!(!state.is_already_processed(3));
    }

    #[test]
    fn test_recover_after_rotation() {
        let temp_dir = TempDir::new().unwrap();
        let cfg = config(&temp_dir);
        {
            let mut log = CheckpointLog::open(&cfg, 0).unwrap();
            for offset in 0..25 {
                log.commit(offset, None, CommitKind::Applied).unwrap();
            }
        }

        let state = RecoveryState::recover_dir(&cfg.partition_dir(0)).unwrap();
        assert_eq!(state.committed_offset, Some(24));
        assert!(state.last_checkpoint_id.is_some());
    }

    #[test]
    fn test_failure_cleared_by_later_commit() {
        let temp_dir = TempDir::new().unwrap();
        let mut log = CheckpointLog::open(&config(&temp_dir), 0).unwrap();
        log.commit(3, None, CommitKind::Applied).unwrap();
        log.record_failure(Some(4), "offset out of range").unwrap();

        let state = RecoveryState::recover_from(&log).unwrap();
        assert_eq!(state.last_failure.as_deref(), Some("offset out of range"));
        assert!(state.summary().failed);

        log.append(CheckpointEntry::OffsetCommitted {
            partition: 0,
            offset: 10,
            source_position: None,
            kind: CommitKind::Applied,
            timestamp: Utc::now(),
        })
        .unwrap();
        let state = RecoveryState::recover_from(&log).unwrap();
        assert_eq!(state.last_failure, None);
        assert_eq!(state.summary().committed_offset, Some(10));
    }
}
