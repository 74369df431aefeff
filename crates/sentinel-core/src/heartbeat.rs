//! Capture liveness from heartbeats written into the source.
//!
//! The monitor periodically writes a logical message into the source stream.
//! The capture pipeline reports each heartbeat it reaches after everything
//! before it was published. If none arrives within the stall timeout, the
//! `capture` component goes unhealthy, independent of table traffic.

use crate::capture::HeartbeatEmitter;
use crate::config::CaptureConfig;
use crate::event::SourcePosition;
use crate::health::{HealthCheck, COMPONENT_CAPTURE};
use crate::metrics::PipelineMetrics;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Shared record of heartbeats that made it through capture and publish.
pub struct HeartbeatTracker {
    last_observed: Mutex<Instant>,
    last_position: AtomicU64,
    stalled: AtomicBool,
    health: Arc<HealthCheck>,
    metrics: Arc<PipelineMetrics>,
}

impl HeartbeatTracker {
    pub fn new(health: Arc<HealthCheck>, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            last_observed: Mutex::new(Instant::now()),
            last_position: AtomicU64::new(0),
            stalled: AtomicBool::new(false),
            health,
            metrics,
        }
    }

    /// A heartbeat at `position` was reached with every earlier event published.
    pub fn observe(&self, position: SourcePosition) {
        *self.last_observed.lock() = Instant::now();
        self.last_position.fetch_max(position.as_u64(), Ordering::Relaxed);
        self.metrics.record_heartbeat_observed();
        if self.stalled.swap(false, Ordering::Relaxed) {
            info!(position = %position, "Heartbeats resumed, capture is live");
        }
        self.health.mark_healthy(COMPONENT_CAPTURE);
        debug!(position = %position, "Heartbeat observed");
    }

    /// Position of the newest observed heartbeat.
    pub fn last_position(&self) -> SourcePosition {
        SourcePosition(self.last_position.load(Ordering::Relaxed))
    }

    /// Time since the last observed heartbeat (or since creation).
    pub fn since_last(&self) -> Duration {
        self.last_observed.lock().elapsed()
    }

    /// Compare the silence so far against `stall_timeout` and update health.
    /// Returns whether capture is live.
    pub fn check(&self, stall_timeout: Duration) -> bool {
        let silence = self.since_last();
        if silence <= stall_timeout {
            return true;
        }
        if !self.stalled.swap(true, Ordering::Relaxed) {
            error!(
                silence_secs = silence.as_secs(),
                stall_timeout_secs = stall_timeout.as_secs(),
                "No heartbeat passed capture and publish, capture is stalled"
            );
        }
        self.health.mark_unhealthy(
            COMPONENT_CAPTURE,
            &format!("no heartbeat for {}s", silence.as_secs()),
        );
        false
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::Relaxed)
    }
}

/// Emits heartbeats on a fixed interval and checks for stalls.
pub struct HeartbeatMonitor {
    emitter: Arc<dyn HeartbeatEmitter>,
    tracker: Arc<HeartbeatTracker>,
    metrics: Arc<PipelineMetrics>,
    prefix: String,
    interval: Duration,
    stall_timeout: Duration,
    sequence: u64,
}

impl HeartbeatMonitor {
    pub fn new(
        emitter: Arc<dyn HeartbeatEmitter>,
        tracker: Arc<HeartbeatTracker>,
        metrics: Arc<PipelineMetrics>,
        config: &CaptureConfig,
    ) -> Self {
        Self {
            emitter,
            tracker,
            metrics,
            prefix: config.heartbeat_prefix.clone(),
            interval: Duration::from_secs(config.heartbeat_interval_seconds.max(1)),
            stall_timeout: Duration::from_secs(config.stall_timeout_seconds),
            sequence: 0,
        }
    }

    /// Override the timing (tests and short-lived runs).
    pub fn with_timing(mut self, interval: Duration, stall_timeout: Duration) -> Self {
        self.interval = interval;
        self.stall_timeout = stall_timeout;
        self
    }

    /// One cycle: emit a heartbeat, then check for a stall.
    pub async fn tick(&mut self) -> bool {
        self.sequence += 1;
        let content = format!("{}:{}", chrono::Utc::now().timestamp_millis(), self.sequence);
        match self.emitter.emit(&self.prefix, &content).await {
            Ok(position) => {
                self.metrics.record_heartbeat_emitted();
                debug!(position = %position, sequence = self.sequence, "Heartbeat emitted");
            }
            Err(e) => warn!(error = %e, "Failed to emit heartbeat"),
        }
        self.tracker.check(self.stall_timeout)
    }

    /// Run until shutdown is signalled.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.interval.as_secs_f64(),
            stall_timeout_secs = self.stall_timeout.as_secs_f64(),
            "Heartbeat monitor started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Heartbeat monitor stopping");
                    return;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::MemorySource;
    use crate::health::ComponentStatus;

    fn tracker() -> (Arc<HeartbeatTracker>, Arc<HealthCheck>, Arc<PipelineMetrics>) {
        let health = Arc::new(HealthCheck::new());
        health.register_component(COMPONENT_CAPTURE);
        let metrics = Arc::new(PipelineMetrics::new());
        (
            Arc::new(HeartbeatTracker::new(Arc::clone(&health), Arc::clone(&metrics))),
            health,
            metrics,
        )
    }

    #[test]
    fn test_stall_and_recovery() {
        let (tracker, health, metrics) = tracker();
        assert!(tracker.check(Duration::from_secs(60)));

        assert!(!tracker.check(Duration::ZERO));
        assert!(tracker.is_stalled());
        assert!(matches!(
            health.get_component_status(COMPONENT_CAPTURE),
            Some(ComponentStatus::Unhealthy(_))
        ));

        tracker.observe(SourcePosition(0x200));
        assert!(!tracker.is_stalled());
        assert_eq!(health.get_component_status(COMPONENT_CAPTURE), Some(ComponentStatus::Healthy));
        assert_eq!(tracker.last_position(), SourcePosition(0x200));
        assert_eq!(metrics.heartbeats_observed_total(), 1);
    }

    #[tokio::test]
    async fn test_tick_emits_into_source() {
        let (tracker, _health, metrics) = tracker();
        let (_source, handle) = MemorySource::new();
        let mut monitor = HeartbeatMonitor::new(
            Arc::new(handle.clone()),
            tracker,
            Arc::clone(&metrics),
            &CaptureConfig::default(),
        );

        assert!(monitor.tick().await);
        assert_eq!(handle.retained(), 1);
        assert_eq!(metrics.heartbeats_emitted_total(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (tracker, _health, metrics) = tracker();
        let (_source, handle) = MemorySource::new();
        let monitor = HeartbeatMonitor::new(Arc::new(handle.clone()), tracker, metrics, &CaptureConfig::default())
            .with_timing(Duration::from_millis(5), Duration::from_secs(60));

        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(monitor.run(rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(()).unwrap();
        task.await.unwrap();
        assert!(handle.retained() >= 2);
    }
}
