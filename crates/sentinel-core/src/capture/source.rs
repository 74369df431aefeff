//! Source boundary: a restartable logical change stream.

use crate::event::SourcePosition;
use crate::{CaptureError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

/// One source-native record (a wal2json v2 JSON object) at its position.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    /// Position reported by the source for this record
    pub position: SourcePosition,
    /// Raw record text
    pub data: String,
}

/// A logical change stream that can be resumed and acknowledged.
#[async_trait]
pub trait ChangeSource: Send {
    /// Open the stream. `Some(p)` resumes strictly after `p` and fails with
    /// `SourceUnavailable` when `p` is no longer retained; `None` resumes
    /// from the last acknowledged position.
    async fn open(&mut self, after: Option<SourcePosition>) -> Result<()>;

    /// Fetch up to `max` records after the ones already returned.
    async fn poll(&mut self, max: usize) -> Result<Vec<SourceRecord>>;

    /// Release everything up to and including `position`.
    async fn acknowledge(&mut self, position: SourcePosition) -> Result<()>;

    /// Last acknowledged position.
    fn confirmed_position(&self) -> SourcePosition;
}

/// Writes heartbeat messages into the source stream.
#[async_trait]
pub trait HeartbeatEmitter: Send + Sync {
    /// Emit one heartbeat and return its position.
    async fn emit(&self, prefix: &str, content: &str) -> Result<SourcePosition>;
}

#[derive(Default)]
struct MemorySourceState {
    records: Vec<SourceRecord>,
    confirmed: SourcePosition,
    next_lsn: u64,
    unavailable: bool,
}

/// In-process change source for tests and local runs.
///
/// Records pushed through a [`MemorySourceHandle`] are retained until
/// acknowledged, like a replication slot.
pub struct MemorySource {
    state: Arc<Mutex<MemorySourceState>>,
    cursor: Option<SourcePosition>,
}

/// Cloneable producer side of a [`MemorySource`].
#[derive(Clone)]
pub struct MemorySourceHandle {
    state: Arc<Mutex<MemorySourceState>>,
}

impl MemorySource {
    /// Create an empty source and its handle.
    pub fn new() -> (Self, MemorySourceHandle) {
        let state = Arc::new(Mutex::new(MemorySourceState {
            next_lsn: 0x100,
            ..Default::default()
        }));
        (
            Self {
                state: Arc::clone(&state),
                cursor: None,
            },
            MemorySourceHandle { state },
        )
    }
}

impl MemorySourceHandle {
    /// Append a raw record at the next position.
    pub fn push(&self, data: impl Into<String>) -> SourcePosition {
        let mut state = self.state.lock();
        let position = SourcePosition(state.next_lsn);
        state.next_lsn += 0x10;
        state.records.push(SourceRecord {
            position,
            data: data.into(),
        });
        position
    }

    /// Append a JSON record at the next position.
    pub fn push_json(&self, value: serde_json::Value) -> SourcePosition {
        self.push(value.to_string())
    }

    /// Simulate the slot being dropped or its WAL removed.
    pub fn make_unavailable(&self) {
        self.state.lock().unavailable = true;
    }

    /// Last acknowledged position.
    pub fn confirmed_position(&self) -> SourcePosition {
        self.state.lock().confirmed
    }

    /// Number of records still retained.
    pub fn retained(&self) -> usize {
        self.state.lock().records.len()
    }
}

#[async_trait]
impl HeartbeatEmitter for MemorySourceHandle {
    async fn emit(&self, prefix: &str, content: &str) -> Result<SourcePosition> {
        Ok(self.push_json(serde_json::json!({
            "action": "M",
            "transactional": false,
            "prefix": prefix,
            "content": content,
        })))
    }
}

#[async_trait]
impl ChangeSource for MemorySource {
    async fn open(&mut self, after: Option<SourcePosition>) -> Result<()> {
        let state = self.state.lock();
        if state.unavailable {
            return Err(CaptureError::SourceUnavailable {
                position: after.unwrap_or(state.confirmed).to_string(),
                reason: "replication slot is gone".into(),
            }
            .into());
        }

        let after = after.unwrap_or(state.confirmed);
        if after < state.confirmed {
            return Err(CaptureError::SourceUnavailable {
                position: after.to_string(),
                reason: format!("source retains changes only after {}", state.confirmed),
            }
            .into());
        }
        self.cursor = Some(after);
        Ok(())
    }

    async fn poll(&mut self, max: usize) -> Result<Vec<SourceRecord>> {
        let cursor = self.cursor.ok_or(CaptureError::NotStarted)?;
        let state = self.state.lock();
        let batch: Vec<SourceRecord> = state
            .records
            .iter()
            .filter(|r| r.position > cursor)
            .take(max)
            .cloned()
            .collect();
        if let Some(last) = batch.last() {
            self.cursor = Some(last.position);
        }
        Ok(batch)
    }

    async fn acknowledge(&mut self, position: SourcePosition) -> Result<()> {
        let mut state = self.state.lock();
        if position > state.confirmed {
            state.confirmed = position;
            state.records.retain(|r| r.position > position);
        }
        Ok(())
    }

    fn confirmed_position(&self) -> SourcePosition {
        self.state.lock().confirmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_source_retains_until_acknowledged() {
        let (mut source, handle) = MemorySource::new();
        let p1 = handle.push("{}");
        let p2 = handle.push("{}");
        assert!(p2 > p1);

        source.open(None).await.unwrap();
        let batch = source.poll(10).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert!(source.poll(10).await.unwrap().is_empty());

        source.acknowledge(p1).await.unwrap();
        assert_eq!(handle.retained(), 1);
        assert_eq!(source.confirmed_position(), p1);

        // Reopening replays everything after the acknowledged position.
        source.open(None).await.unwrap();
        let replay = source.poll(10).await.unwrap();
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].position, p2);
    }

    #[tokio::test]
    async fn test_resume_before_confirmed_is_unavailable() {
        let (mut source, handle) = MemorySource::new();
        let p1 = handle.push("{}");
        handle.push("{}");
        source.open(None).await.unwrap();
        source.acknowledge(p1).await.unwrap();

        let err = source.open(Some(SourcePosition::ZERO)).await.unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Capture(CaptureError::SourceUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_poll_before_open_fails() {
        let (mut source, _handle) = MemorySource::new();
        assert!(source.poll(1).await.is_err());
    }

    #[tokio::test]
    async fn test_heartbeat_emitter_appends_message() {
        let (mut source, handle) = MemorySource::new();
        let position = handle.emit("hb", "1").await.unwrap();
        source.open(None).await.unwrap();
        let batch = source.poll(1).await.unwrap();
        assert_eq!(batch[0].position, position);
        assert!(batch[0].data.contains("\"action\":\"M\""));
    }
}
