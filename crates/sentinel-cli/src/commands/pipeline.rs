//! `run`, `capture` and `sync`: the long-running pipeline commands.

use super::spawn_signal_handler;
use crate::server::{start_server, ServerState};
use anyhow::{bail, Context, Result};
use sentinel_core::engine::{CapturePipeline, PipelineContext, SyncEngine, SyncReport};
use sentinel_core::{Config, SourcePosition};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Process-wide pieces shared by every pipeline command.
struct Runtime {
    context: PipelineContext,
    dead_letter_writer: JoinHandle<()>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Runtime {
    fn start(config: &Config) -> Result<Self> {
        config.validate()?;

        let (context, dead_letter_writer) = PipelineContext::start(&config.dead_letter.path);
        let (shutdown_tx, _) = broadcast::channel(4);

        let server_state = Arc::new(ServerState {
            health: Arc::clone(&context.health),
            metrics: Arc::clone(&context.metrics),
        });
        tokio::spawn(start_server(
            server_state,
            config.monitoring.health_port,
            config.monitoring.metrics_port,
            shutdown_tx.subscribe(),
        ));
        spawn_signal_handler(shutdown_tx.clone());

        Ok(Self {
            context,
            dead_letter_writer,
            shutdown_tx,
        })
    }

    /// Forward the process shutdown to a component's own signal.
    fn forward_shutdown(&self, target: broadcast::Sender<()>) {
        let mut rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let _ = rx.recv().await;
            let _ = target.send(());
        });
    }

    /// Drop the context and wait for pending dead-letter writes.
    async fn finish(self) {
        let _ = self.shutdown_tx.send(());
        drop(self.context);
        if let Err(e) = self.dead_letter_writer.await {
            error!(error = %e, "Dead-letter writer task failed");
        }
    }
}

/// Await a pipeline task; on failure stop everything else.
async fn supervise<T>(
    name: &str,
    task: JoinHandle<sentinel_core::Result<T>>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<T> {
    let result = task.await.with_context(|| format!("{} task panicked", name))?;
    if let Err(e) = &result {
        error!(task = name, error = %e, "Pipeline task failed, shutting down");
        let _ = shutdown_tx.send(());
    }
    Ok(result?)
}

async fn start_capture(
    config: &Config,
    runtime: &Runtime,
    resume: Option<SourcePosition>,
) -> Result<JoinHandle<sentinel_core::Result<sentinel_core::engine::CaptureReport>>> {
    let (mut pipeline, monitor) = CapturePipeline::from_config(config, runtime.context.clone()).await?;
    runtime.forward_shutdown(pipeline.shutdown_signal());
    tokio::spawn(monitor.run(runtime.shutdown_tx.subscribe()));

    info!(
        slot = %config.postgres.replication_slot,
        topic = %config.kafka.topic,
        resume = ?resume.map(|p| p.to_string()),
        "Starting capture"
    );
    Ok(tokio::spawn(async move { pipeline.run(resume).await }))
}

async fn start_sync(
    config: &Config,
    runtime: &Runtime,
) -> Result<JoinHandle<sentinel_core::Result<SyncReport>>> {
    let engine = SyncEngine::from_config(config.clone(), runtime.context.clone())?;
    runtime.forward_shutdown(engine.shutdown_signal());

    info!(
        topic = %config.kafka.topic,
        sink = ?config.sink.kind,
        "Starting sync"
    );
    Ok(tokio::spawn(async move { engine.run().await }))
}

fn check_sync_report(report: &SyncReport) -> Result<()> {
    for (partition, reason) in &report.failed {
        error!(partition, reason = %reason, "Partition failed");
    }
    if !report.failed.is_empty() {
        bail!("{} partition(s) failed", report.failed.len());
    }
    Ok(())
}

/// Capture only.
pub async fn capture(config: Config, resume: Option<SourcePosition>) -> Result<()> {
    let runtime = Runtime::start(&config)?;
    let task = start_capture(&config, &runtime, resume).await?;
    let result = supervise("capture", task, runtime.shutdown_tx.clone()).await;
    runtime.finish().await;

    let report = result?;
    info!(
        published = report.published,
        dead_lettered = report.dead_lettered,
        confirmed = %report.confirmed_position,
        "Capture stopped"
    );
    Ok(())
}

/// Sync only.
pub async fn sync(config: Config) -> Result<()> {
    let runtime = Runtime::start(&config)?;
    let task = start_sync(&config, &runtime).await?;
    let result = supervise("sync", task, runtime.shutdown_tx.clone()).await;
    runtime.finish().await;

    check_sync_report(&result?)
}

/// Capture and sync in one process.
pub async fn run(config: Config, resume: Option<SourcePosition>) -> Result<()> {
    let runtime = Runtime::start(&config)?;
    let capture_task = start_capture(&config, &runtime, resume).await?;
    let sync_task = match start_sync(&config, &runtime).await {
        Ok(task) => task,
        Err(e) => {
            let _ = runtime.shutdown_tx.send(());
            let _ = capture_task.await;
            runtime.finish().await;
            return Err(e);
        }
    };

    let (capture_result, sync_result) = tokio::join!(
        supervise("capture", capture_task, runtime.shutdown_tx.clone()),
        supervise("sync", sync_task, runtime.shutdown_tx.clone()),
    );
    runtime.finish().await;

    let capture_report = capture_result?;
    let sync_report = sync_result?;
    info!(
        published = capture_report.published,
        applied = sync_report.applied(),
        dead_lettered = capture_report.dead_lettered + sync_report.dead_lettered(),
        "Pipeline stopped"
    );
    check_sync_report(&sync_report)
}
