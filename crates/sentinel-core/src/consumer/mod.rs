//! Checkpointed per-partition consumption of the change log.

mod partition;

pub use partition::{Delivery, PartitionConsumer, PartitionState};
