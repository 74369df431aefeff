//! Partition consumer state machine.
//!
//! `Unassigned -> CatchingUp -> Live -> (Closed | Failed)`
//!
//! The consumer owns the partition's checkpoint log. Assignment resumes from
//! the last committed offset, or from the start policy when nothing was
//! committed yet. An offset is only written to the log through [`commit`],
//! which the worker calls after the sink confirmed the event.
//!
//! [`commit`]: PartitionConsumer::commit

use crate::checkpoint::{CheckpointLog, CommitKind, RecoveryState};
use crate::config::OffsetReset;
use crate::event::{ChangeEvent, PartitionOffset, SourcePosition};
use crate::kafka::{PartitionReader, StartOffset};
use crate::{ConsumerError, Error, Result};
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Lifecycle state of one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    Unassigned,
    /// Replaying records that existed when the partition was assigned
    CatchingUp,
    /// Reading records as they are appended
    Live,
    Closed,
    /// Unrecoverable; reported, not retried
    Failed,
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PartitionState::Unassigned => "unassigned",
            PartitionState::CatchingUp => "catching_up",
            PartitionState::Live => "live",
            PartitionState::Closed => "closed",
            PartitionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One record handed to the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// A decoded change event
    Event { at: PartitionOffset, event: ChangeEvent },
    /// A record whose payload is not a change event
    Poison {
        at: PartitionOffset,
        raw: Vec<u8>,
        error: String,
    },
}

impl Delivery {
    /// Log position of the record.
    pub fn at(&self) -> PartitionOffset {
        match self {
            Delivery::Event { at, .. } | Delivery::Poison { at, .. } => *at,
        }
    }
}

/// Ordered, restartable consumer of one log partition.
pub struct PartitionConsumer {
    partition: i32,
    reader: Box<dyn PartitionReader>,
    checkpoint: CheckpointLog,
    start_policy: OffsetReset,
    poll_timeout: Duration,
    state: PartitionState,
    /// High watermark observed at assignment
    catch_up_target: i64,
    last_delivered: Option<i64>,
    committed: Option<i64>,
}

impl PartitionConsumer {
    /// Create a consumer over a reader and the partition's checkpoint log.
    pub fn new(
        reader: Box<dyn PartitionReader>,
        checkpoint: CheckpointLog,
        start_policy: OffsetReset,
        poll_timeout: Duration,
    ) -> Self {
        let partition = reader.partition();
        let committed = checkpoint.committed_offset();
        Self {
            partition,
            reader,
            checkpoint,
            start_policy,
            poll_timeout,
            state: PartitionState::Unassigned,
            catch_up_target: 0,
            last_delivered: None,
            committed,
        }
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn state(&self) -> PartitionState {
        self.state
    }

    /// Highest persisted offset.
    pub fn committed_offset(&self) -> Option<i64> {
        self.committed
    }

    /// Highest delivered offset.
    pub fn last_delivered(&self) -> Option<i64> {
        self.last_delivered
    }

    fn invalid_state(&self) -> Error {
        ConsumerError::InvalidState {
            partition: self.partition,
            state: self.state.to_string(),
        }
        .into()
    }

    /// Assign the partition and position the reader.
    ///
    /// Resumes after the last committed offset, or applies the start policy
    /// when the checkpoint log is empty.
    pub async fn assign(&mut self) -> Result<()> {
        if self.state != PartitionState::Unassigned {
            return Err(self.invalid_state());
        }

        let recovery = RecoveryState::recover_from(&self.checkpoint)?;
        if let Some(reason) = &recovery.last_failure {
            warn!(
                partition = self.partition,
                reason = %reason,
                "Partition previously failed, retrying assignment"
            );
        }
        self.committed = recovery.committed_offset;

        let start = match recovery.starting_offset() {
            Some(next) => StartOffset::At(next),
            None => match self.start_policy {
                OffsetReset::Earliest => StartOffset::Earliest,
                OffsetReset::Latest => StartOffset::Latest,
            },
        };

        if let Err(e) = self.reader.seek(start).await {
            return Err(self.fail_with(e));
        }
        let high_watermark = match self.reader.high_watermark().await {
            Ok(hw) => hw,
            Err(e) => return Err(self.fail_with(e)),
        };
        self.catch_up_target = high_watermark;
        self.last_delivered = recovery.committed_offset;

        let caught_up = match start {
            StartOffset::Latest => true,
            StartOffset::At(next) => next >= high_watermark,
            StartOffset::Earliest => high_watermark == 0,
        };
        self.state = if caught_up {
            PartitionState::Live
        } else {
            PartitionState::CatchingUp
        };

        info!(
            partition = self.partition,
            start = ?start,
            high_watermark,
            state = %self.state,
            "Partition assigned"
        );
        Ok(())
    }

    /// Next record, or `None` when nothing arrived within the poll timeout.
    ///
    /// Offsets are delivered strictly increasing. An out-of-range read moves
    /// the partition to `Failed` and returns `PartitionFailed`.
    pub async fn next(&mut self) -> Result<Option<Delivery>> {
        if !matches!(self.state, PartitionState::CatchingUp | PartitionState::Live) {
            return Err(self.invalid_state());
        }

        let record = match self.reader.poll(self.poll_timeout).await {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(None),
            Err(e @ Error::Consumer(ConsumerError::PartitionFailed { .. })) => {
                return Err(self.fail_with(e));
            }
            Err(e) => return Err(e),
        };

        if let Some(last) = self.last_delivered {
            if record.offset <= last {
                debug!(
                    partition = self.partition,
                    offset = record.offset,
                    last_delivered = last,
                    "Skipping already delivered record"
                );
                return Ok(None);
            }
        }
        self.last_delivered = Some(record.offset);

        if self.state == PartitionState::CatchingUp && record.offset + 1 >= self.catch_up_target {
            self.state = PartitionState::Live;
            info!(
                partition = self.partition,
                offset = record.offset,
                "Partition caught up"
            );
        }

        let at = PartitionOffset::new(self.partition, record.offset);
        Ok(Some(match ChangeEvent::from_bytes(&record.payload) {
            Ok(event) => Delivery::Event { at, event },
            Err(e) => {
                warn!(partition = self.partition, offset = record.offset, error = %e, "Undecodable record");
                Delivery::Poison {
                    at,
                    raw: record.payload,
                    error: e.to_string(),
                }
            }
        }))
    }

    /// Persist that the record at `offset` is done.
    ///
    /// Returns `false` for a duplicate commit. Committing an offset that was
    /// never delivered, or one below the committed offset, is an error.
    pub fn commit(
        &mut self,
        offset: i64,
        source_position: Option<SourcePosition>,
        kind: CommitKind,
    ) -> Result<bool> {
        if matches!(self.state, PartitionState::Unassigned | PartitionState::Failed) {
            return Err(self.invalid_state());
        }
        let invalid = |reason: &str| -> Error {
            ConsumerError::InvalidCommit {
                partition: self.partition,
                offset,
                reason: reason.to_string(),
            }
            .into()
        };

        if let Some(committed) = self.committed {
            if offset == committed {
                return Ok(false);
            }
            if offset < committed {
                return Err(invalid("regresses below committed offset"));
            }
        }
        if self.last_delivered.map_or(true, |last| offset > last) {
            return Err(invalid("never delivered"));
        }

        self.checkpoint.commit(offset, source_position, kind)?;
        self.committed = Some(offset);
        debug!(partition = self.partition, offset, kind = ?kind, "Offset committed");
        Ok(true)
    }

    /// Records between the committed offset and the current end of the log.
    pub async fn lag(&mut self) -> Result<i64> {
        let high_watermark = self.reader.high_watermark().await?;
        let next = self.committed.map_or(0, |c| c + 1);
        Ok((high_watermark - next).max(0))
    }

    /// Move to `Failed` and record the reason durably.
    pub fn fail(&mut self, reason: &str) {
        self.state = PartitionState::Failed;
        error!(partition = self.partition, reason = %reason, "Partition failed");
        if let Err(e) = self.checkpoint.record_failure(self.last_delivered, reason) {
            error!(partition = self.partition, error = %e, "Failed to record partition failure");
        }
    }

    fn fail_with(&mut self, err: Error) -> Error {
        if matches!(err, Error::Consumer(ConsumerError::PartitionFailed { .. })) {
            self.fail(&err.to_string());
        }
        err
    }

    /// Stop consuming and checkpoint what was committed.
    pub fn close(&mut self) -> Result<()> {
        if self.state == PartitionState::Closed {
            return Ok(());
        }
        if self.state != PartitionState::Failed {
            self.state = PartitionState::Closed;
        }
        self.checkpoint.force_checkpoint()?;
        self.checkpoint.sync()?;
        info!(
            partition = self.partition,
            committed = ?self.committed,
            state = %self.state,
            "Partition consumer closed"
        );
        Ok(())
    }
}
