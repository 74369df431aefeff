//! Idempotent application of change events.

use super::{map_event, WideColumnStore, WriteOutcome};
use crate::event::ChangeEvent;
use crate::Result;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Result of applying one change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The row now reflects the event
    Applied,
    /// An equal or newer change for the key is already stored
    AlreadyApplied,
}

impl fmt::Display for ApplyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyOutcome::Applied => f.write_str("applied"),
            ApplyOutcome::AlreadyApplied => f.write_str("already_applied"),
        }
    }
}

/// Applies change events to a wide-column store with conditional writes.
///
/// Replaying any prefix of a partition, in any number of repetitions, leaves
/// the store in the same state as applying it once.
#[derive(Clone)]
pub struct IdempotentSinkWriter {
    store: Arc<dyn WideColumnStore>,
}

impl IdempotentSinkWriter {
    /// Create a writer over a store.
    pub fn new(store: Arc<dyn WideColumnStore>) -> Self {
        Self { store }
    }

    /// Apply one event.
    ///
    /// Errors are `SinkError::Unavailable` (retryable) or
    /// `SinkError::Rejected` (fatal for this event).
    pub async fn apply(&self, event: &ChangeEvent) -> Result<ApplyOutcome> {
        let mutation = map_event(event)?;

        match self.store.write_if_newer(&mutation).await? {
            WriteOutcome::Applied => {
                trace!(
                    table = %mutation.table,
                    key = %mutation.key.canonical(),
                    position = %mutation.position,
                    deleted = mutation.deleted,
                    "Row written"
                );
                Ok(ApplyOutcome::Applied)
            }
            WriteOutcome::Stale { stored_position } => {
                debug!(
                    table = %mutation.table,
                    key = %mutation.key.canonical(),
                    position = %mutation.position,
                    stored = %stored_position,
                    "Change already applied"
                );
                Ok(ApplyOutcome::AlreadyApplied)
            }
        }
    }

    /// Check that the store is reachable.
    pub async fn probe(&self) -> Result<()> {
        self.store.probe().await
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn WideColumnStore> {
        &self.store
    }
}
