//! Pipeline orchestration.
//!
//! - [`CapturePipeline`]: source -> capture adapter -> publisher
//! - [`SyncEngine`]: one [`PartitionWorker`] per log partition, each
//!   consumer -> retry coordinator -> sink writer -> checkpoint

mod capture;
mod sync;
mod worker;

pub use capture::{CapturePipeline, CaptureReport};
pub use sync::{store_factory, SyncEngine, SyncReport};
pub use worker::{PartitionWorker, WorkerReport};

use crate::deadletter::{DeadLetterStore, DeadLetterWriter};
use crate::health::HealthCheck;
use crate::metrics::PipelineMetrics;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Sinks shared by every worker: metrics, health and the dead-letter writer.
#[derive(Clone)]
pub struct PipelineContext {
    pub metrics: Arc<PipelineMetrics>,
    pub health: Arc<HealthCheck>,
    pub dead_letters: DeadLetterWriter,
}

impl PipelineContext {
    /// Fresh metrics and health, with a dead-letter writer on `dead_letter_path`.
    ///
    /// The returned handle completes once every clone of the context is dropped.
    pub fn start(dead_letter_path: &Path) -> (Self, JoinHandle<()>) {
        let (dead_letters, handle) = DeadLetterWriter::spawn(DeadLetterStore::new(dead_letter_path));
        (
            Self {
                metrics: Arc::new(PipelineMetrics::new()),
                health: Arc::new(HealthCheck::new()),
                dead_letters,
            },
            handle,
        )
    }
}
