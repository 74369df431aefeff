//! Pipeline metrics with Prometheus text export.

mod prometheus;

pub use prometheus::{ApplyDurationHistogram, ErrorType, PipelineMetrics};
