//! Durable store for events that could not be delivered.
//!
//! Records are appended to one JSONL file. Workers never touch the file
//! directly: they hand records to a single [`DeadLetterWriter`] task, which
//! appends and fsyncs each one before replying.

mod record;
mod store;
mod writer;

pub use record::{DeadLetterEntry, DeadLetterPayload, DeadLetterRecord, FailureStage};
pub use store::DeadLetterStore;
pub use writer::{requeue, DeadLetterWriter};
