//! Component health registry.
//!
//! Every pipeline stage reports into a shared [`HealthCheck`]: the source
//! connection, the log, the sink, checkpoint storage, capture liveness (driven
//! by the heartbeat monitor) and one `partition-<n>` entry per sync worker.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Component name for the source database connection.
pub const COMPONENT_SOURCE: &str = "source";
/// Component name for the durable log.
pub const COMPONENT_KAFKA: &str = "kafka";
/// Component name for the wide-column sink.
pub const COMPONENT_SINK: &str = "sink";
/// Component name for checkpoint storage.
pub const COMPONENT_CHECKPOINT: &str = "checkpoint";
/// Component name for capture liveness.
pub const COMPONENT_CAPTURE: &str = "capture";

/// Component name for a partition worker.
pub fn partition_component(partition: i32) -> String {
    format!("partition-{}", partition)
}

/// Health status of a component.
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentStatus {
    /// Component is healthy
    Healthy,
    /// Component is degraded but operational
    Degraded(String),
    /// Component is unhealthy
    Unhealthy(String),
    /// Component has not reported yet
    Unknown,
}

/// Overall system health status.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HealthStatus {
    /// All components healthy
    Healthy,
    /// Some components degraded
    Degraded,
    /// At least one component unhealthy
    Unhealthy,
}

impl HealthStatus {
    /// Lowercase label used in HTTP responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

/// Shared component health registry.
pub struct HealthCheck {
    components: RwLock<HashMap<String, ComponentStatus>>,
    running: AtomicBool,
}

impl HealthCheck {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            components: RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Register a component to track.
    pub fn register_component(&self, name: &str) {
        self.components
            .write()
            .entry(name.to_string())
            .or_insert(ComponentStatus::Unknown);
    }

    /// Mark a component as healthy.
    pub fn mark_healthy(&self, name: &str) {
        self.set(name, ComponentStatus::Healthy);
    }

    /// Mark a component as degraded.
    pub fn mark_degraded(&self, name: &str, reason: &str) {
        self.set(name, ComponentStatus::Degraded(reason.to_string()));
    }

    /// Mark a component as unhealthy.
    pub fn mark_unhealthy(&self, name: &str, reason: &str) {
        self.set(name, ComponentStatus::Unhealthy(reason.to_string()));
    }

    fn set(&self, name: &str, status: ComponentStatus) {
        self.components.write().insert(name.to_string(), status);
    }

    /// Status of one component.
    pub fn get_component_status(&self, name: &str) -> Option<ComponentStatus> {
        self.components.read().get(name).cloned()
    }

    /// All component statuses.
    pub fn get_all_statuses(&self) -> HashMap<String, ComponentStatus> {
        self.components.read().clone()
    }

    /// Aggregate status: any unhealthy wins, then any degraded.
    pub fn overall_status(&self) -> HealthStatus {
        let components = self.components.read();

        let mut has_degraded = false;
        for status in components.values() {
            match status {
                ComponentStatus::Unhealthy(_) => return HealthStatus::Unhealthy,
                ComponentStatus::Degraded(_) => has_degraded = true,
                _ => {}
            }
        }

        if has_degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Healthy or degraded.
    pub fn is_operational(&self) -> bool {
        self.overall_status() != HealthStatus::Unhealthy
    }

    /// Operational and the pipeline loop is running.
    pub fn is_ready(&self) -> bool {
        self.is_running() && self.is_operational()
    }

    /// Mark the pipeline as started.
    pub fn pipeline_started(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    /// Mark the pipeline as stopped.
    pub fn pipeline_stopped(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether the pipeline loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_check_lifecycle() {
        let health = HealthCheck::new();
        health.register_component(COMPONENT_KAFKA);
        health.register_component(COMPONENT_SINK);

        assert_eq!(
            health.get_component_status(COMPONENT_KAFKA),
            Some(ComponentStatus::Unknown)
        );

        health.mark_healthy(COMPONENT_KAFKA);
        health.mark_healthy(COMPONENT_SINK);
        assert_eq!(health.overall_status(), HealthStatus::Healthy);

        health.mark_degraded(COMPONENT_KAFKA, "publish retrying");
        assert_eq!(health.overall_status(), HealthStatus::Degraded);
        assert!(health.is_operational());

        health.mark_unhealthy(COMPONENT_SINK, "circuit open");
        assert_eq!(health.overall_status(), HealthStatus::Unhealthy);
        assert!(!health.is_operational());
    }

    #[test]
    fn test_register_does_not_reset_status() {
        let health = HealthCheck::new();
        health.mark_healthy(COMPONENT_SOURCE);
        health.register_component(COMPONENT_SOURCE);
        assert_eq!(
            health.get_component_status(COMPONENT_SOURCE),
            Some(ComponentStatus::Healthy)
        );
    }

    #[test]
    fn test_readiness_requires_running_pipeline() {
        let health = HealthCheck::default();
        assert!(health.is_operational());
        assert!(!health.is_ready());

        health.pipeline_started();
        assert!(health.is_ready());

        health.mark_unhealthy(&partition_component(3), "offset out of range");
        assert!(!health.is_ready());

        health.pipeline_stopped();
        assert!(!health.is_running());
    }

    #[test]
    fn test_partition_component_name() {
        assert_eq!(partition_component(7), "partition-7");
    }

    #[test]
    fn test_recovery_after_unhealthy() {
        let health = HealthCheck::new();
        health.mark_unhealthy(COMPONENT_CAPTURE, "no heartbeat");
        assert_eq!(health.overall_status(), HealthStatus::Unhealthy);
        health.mark_healthy(COMPONENT_CAPTURE);
        assert_eq!(health.overall_status(), HealthStatus::Healthy);
        assert_eq!(health.overall_status().as_str(), "healthy");
    }
}
