//! Error types for the sentinel core library.
//!
//! Uses hierarchical domain-specific errors following the thiserror pattern.
//! Each domain enum separates retryable infrastructure failures from fatal,
//! content-scoped rejections.

use thiserror::Error;

/// Result type alias for sentinel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for sentinel.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Capture (source) error
    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    /// Publish (log append) error
    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    /// Consumer (log read) error
    #[error("Consumer error: {0}")]
    Consumer(#[from] ConsumerError),

    /// Sink (wide-column store) error
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    /// Checkpoint log error
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Dead-letter store error
    #[error("Dead-letter error: {0}")]
    DeadLetter(#[from] DeadLetterError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Shutdown requested
    #[error("Shutdown requested")]
    Shutdown,
}

impl Error {
    /// Whether the failure is transient and may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Publish(e) => e.is_retryable(),
            Error::Sink(e) => e.is_retryable(),
            Error::Consumer(ConsumerError::Poll(_)) => true,
            Error::Capture(CaptureError::Connection(_)) => true,
            _ => false,
        }
    }

    /// Error class recorded on dead-letter records.
    pub fn class(&self) -> &'static str {
        match self {
            Error::Publish(PublishError::Transient(_)) => "TransientPublishError",
            Error::Publish(PublishError::Rejected(_)) => "PublishRejected",
            Error::Sink(e) => e.class(),
            Error::Capture(CaptureError::SourceUnavailable { .. }) => "SourceUnavailable",
            Error::Capture(CaptureError::Decode(_)) => "Undecodable",
            Error::Consumer(ConsumerError::PartitionFailed { .. }) => "PartitionFailed",
            Error::Serialization(_) => "Undecodable",
            _ => "Other",
        }
    }
}

/// Source capture errors.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// The source can no longer serve the requested resume position.
    ///
    /// Fatal: requires a full resync by an operator.
    #[error("Source unavailable: cannot resume after {position}: {reason}")]
    SourceUnavailable { position: String, reason: String },

    /// Transient connection failure talking to the source
    #[error("Source connection failed: {0}")]
    Connection(String),

    /// Source-native record could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Acknowledgement requested for a position not yet durable downstream
    #[error("Acknowledge ahead of durability: requested {requested}, confirmed {confirmed}")]
    AckAheadOfDurable { requested: String, confirmed: String },

    /// Adapter used before `start`
    #[error("Capture adapter not started")]
    NotStarted,
}

/// Log publish errors.
#[derive(Error, Debug)]
pub enum PublishError {
    /// Retryable: broker or network unavailability
    #[error("Transient publish error: {0}")]
    Transient(String),

    /// Fatal: the event can never be appended (too large, unserializable)
    #[error("Publish rejected: {0}")]
    Rejected(String),
}

impl PublishError {
    /// Whether the publish may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PublishError::Transient(_))
    }
}

/// Partition consumer errors.
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// Unrecoverable partition error (e.g. offset out of retained range)
    #[error("Partition {partition} failed: {reason}")]
    PartitionFailed { partition: i32, reason: String },

    /// Transient poll error
    #[error("Poll error: {0}")]
    Poll(String),

    /// Partition assignment error
    #[error("Partition assignment error: {0}")]
    Assignment(String),

    /// Commit of an offset that was never delivered or regresses
    #[error("Invalid commit on partition {partition}: offset {offset} ({reason})")]
    InvalidCommit {
        partition: i32,
        offset: i64,
        reason: String,
    },

    /// Operation not valid in the current partition state
    #[error("Partition {partition} is {state}")]
    InvalidState { partition: i32, state: String },
}

/// Sink write errors.
#[derive(Error, Debug)]
pub enum SinkError {
    /// Retryable: the store is unreachable or timed out
    #[error("Sink unavailable: {0}")]
    Unavailable(String),

    /// Fatal for this event: malformed payload or schema mismatch
    #[error("Sink rejected: {0}")]
    Rejected(String),
}

impl SinkError {
    /// Whether the write may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SinkError::Unavailable(_))
    }

    /// Label used for dead-letter error classes and metrics.
    pub fn class(&self) -> &'static str {
        match self {
            SinkError::Unavailable(_) => "SinkUnavailable",
            SinkError::Rejected(_) => "SinkRejected",
        }
    }
}

/// Checkpoint log errors.
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// Log corrupted
    #[error("Checkpoint log corrupted at line {position}: {message}")]
    Corrupted { position: u64, message: String },

    /// Recovery failed
    #[error("Recovery failed: {0}")]
    RecoveryFailed(String),

    /// Entry write failed
    #[error("Checkpoint write failed: {0}")]
    WriteFailed(String),
}

/// Dead-letter store errors.
#[derive(Error, Debug)]
pub enum DeadLetterError {
    /// Append failed
    #[error("Dead-letter write failed: {0}")]
    WriteFailed(String),

    /// Writer task is gone
    #[error("Dead-letter writer closed")]
    WriterClosed,

    /// Record lookup failed
    #[error("Dead-letter record not found: {0}")]
    NotFound(String),

    /// Record cannot be requeued (already requeued, or no decodable event)
    #[error("Dead-letter record {id} cannot be requeued: {reason}")]
    NotRequeueable { id: String, reason: String },

    /// Store file damaged before its final line
    #[error("Dead-letter store corrupted at line {line}: {message}")]
    Corrupted { line: u64, message: String },
}

// Conversion implementations for external error types

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Config("invalid value".into());
        assert_eq!(err.to_string(), "Configuration error: invalid value");

        let err = Error::Consumer(ConsumerError::PartitionFailed {
            partition: 3,
            reason: "offset out of range".into(),
        });
        assert_eq!(
            err.to_string(),
            "Consumer error: Partition 3 failed: offset out of range"
        );
    }

    #[test]
    fn test_retry_classification() {
        assert!(Error::Publish(PublishError::Transient("broker down".into())).is_retryable());
        assert!(!Error::Publish(PublishError::Rejected("too large".into())).is_retryable());
        assert!(Error::Sink(SinkError::Unavailable("timeout".into())).is_retryable());
        assert!(!Error::Sink(SinkError::Rejected("bad payload".into())).is_retryable());
        assert!(!Error::Capture(CaptureError::SourceUnavailable {
            position: "0/16B3748".into(),
            reason: "slot advanced".into(),
        })
        .is_retryable());
        assert!(!Error::Consumer(ConsumerError::PartitionFailed {
            partition: 0,
            reason: "gone".into(),
        })
        .is_retryable());
    }

    #[test]
    fn test_sink_error_class() {
        assert_eq!(SinkError::Unavailable("x".into()).class(), "SinkUnavailable");
        assert_eq!(SinkError::Rejected("x".into()).class(), "SinkRejected");
        assert_eq!(
            Error::Publish(PublishError::Rejected("big".into())).class(),
            "PublishRejected"
        );
        assert_eq!(Error::Serialization("bad".into()).class(), "Undecodable");
    }

    #[test]
    fn test_from_serde_json() {
        let err: Error = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
