//! Dead-letter record types.

use crate::event::{ChangeEvent, PartitionOffset, SourcePosition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Pipeline stage where delivery gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    /// Source record could not become an event
    Capture,
    /// Event could not be appended to the log
    Publish,
    /// Event could not be applied to the sink
    Apply,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureStage::Capture => f.write_str("capture"),
            FailureStage::Publish => f.write_str("publish"),
            FailureStage::Apply => f.write_str("apply"),
        }
    }
}

/// What was being delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeadLetterPayload {
    Event { event: ChangeEvent },
    /// Bytes that never decoded into an event
    Undecodable { raw: Vec<u8> },
}

/// An event, or raw bytes, that could not be delivered, with its failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: Uuid,
    pub stage: FailureStage,
    pub payload: DeadLetterPayload,
    pub error_class: String,
    pub attempts: u32,
    pub last_error: String,
    /// Log position of the failed record, when it came from the log
    pub offset: Option<PartitionOffset>,
    /// Source position, when known
    pub source_position: Option<SourcePosition>,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    /// Record for an event that failed at `stage`.
    pub fn for_event(
        stage: FailureStage,
        event: ChangeEvent,
        error_class: impl Into<String>,
        attempts: u32,
        last_error: impl Into<String>,
    ) -> Self {
        let source_position = Some(event.source_position());
        Self {
            id: Uuid::new_v4(),
            stage,
            payload: DeadLetterPayload::Event { event },
            error_class: error_class.into(),
            attempts,
            last_error: last_error.into(),
            offset: None,
            source_position,
            failed_at: Utc::now(),
        }
    }

    /// Record for bytes that could not be decoded.
    pub fn undecodable(stage: FailureStage, raw: Vec<u8>, last_error: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            stage,
            payload: DeadLetterPayload::Undecodable { raw },
            error_class: "Undecodable".to_string(),
            attempts: 1,
            last_error: last_error.into(),
            offset: None,
            source_position: None,
            failed_at: Utc::now(),
        }
    }

    pub fn with_offset(mut self, offset: PartitionOffset) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_source_position(mut self, position: SourcePosition) -> Self {
        self.source_position = Some(position);
        self
    }

    /// The event, unless the payload never decoded.
    pub fn event(&self) -> Option<&ChangeEvent> {
        match &self.payload {
            DeadLetterPayload::Event { event } => Some(event),
            DeadLetterPayload::Undecodable { .. } => None,
        }
    }
}

/// One line of the dead-letter file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DeadLetterEntry {
    Record(DeadLetterRecord),
    /// The record's event was published again
    Requeued {
        id: Uuid,
        republished_at: PartitionOffset,
        timestamp: DateTime<Utc>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ColumnValue, Operation, SourceKey};
    use std::collections::BTreeMap;

    #[test]
    fn test_entry_serialization_is_tagged() {
        let event = ChangeEvent::new(
            SourceKey::single("public.t", "id", ColumnValue::Int(1)),
            Operation::Delete,
            BTreeMap::new(),
            SourcePosition(9),
            Utc::now(),
            1,
        );
        let record = DeadLetterRecord::for_event(FailureStage::Apply, event, "SinkRejected", 1, "bad")
            .with_offset(PartitionOffset::new(2, 40));
        let json = serde_json::to_string(&DeadLetterEntry::Record(record.clone())).unwrap();
        assert!(json.contains("\"type\":\"Record\""));
        assert!(json.contains("\"stage\":\"apply\""));
        assert!(json.contains("\"kind\":\"event\""));

        let parsed: DeadLetterEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, DeadLetterEntry::Record(record));
    }

    #[test]
    fn test_undecodable_has_no_event() {
        let record = DeadLetterRecord::undecodable(FailureStage::Apply, b"\xff".to_vec(), "eof");
        assert!(record.event().is_none());
        assert_eq!(record.error_class, "Undecodable");
    }
}
