//! Change event model shared by every pipeline stage.
//!
//! A [`ChangeEvent`] is created once by the capture adapter and never
//! mutated afterwards. It is serialized by the publisher, decoded by the
//! partition consumer and applied by the sink writer.

mod model;

pub use model::{
    ChangeEvent, ColumnValue, IdempotencyKey, KeyColumn, Operation, PartitionOffset, SourceKey,
    SourcePosition,
};
pub(crate) use model::escape_key_part;
