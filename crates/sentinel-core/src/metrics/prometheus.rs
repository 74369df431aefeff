//! Prometheus metrics export.

use dashmap::DashMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Histogram bucket boundaries in milliseconds for sink apply duration.
const APPLY_DURATION_BUCKETS_MS: [u64; 8] = [1, 5, 10, 25, 50, 100, 250, 1000];

const PREFIX: &str = "sentinel";

/// Error types for labeled metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorType {
    /// Source database errors (connection, decode)
    Source,
    /// Kafka errors (append, poll)
    Kafka,
    /// Sink errors (unavailable, rejected)
    Sink,
    /// Checkpoint log errors
    Checkpoint,
    /// Dead-letter store errors
    DeadLetter,
    /// Unknown/other errors
    Other,
}

impl ErrorType {
    const ALL: [ErrorType; 6] = [
        ErrorType::Source,
        ErrorType::Kafka,
        ErrorType::Sink,
        ErrorType::Checkpoint,
        ErrorType::DeadLetter,
        ErrorType::Other,
    ];

    /// Get the label value for Prometheus export.
    pub fn as_label(&self) -> &'static str {
        match self {
            ErrorType::Source => "source",
            ErrorType::Kafka => "kafka",
            ErrorType::Sink => "sink",
            ErrorType::Checkpoint => "checkpoint",
            ErrorType::DeadLetter => "dead_letter",
            ErrorType::Other => "other",
        }
    }

    /// Classify a pipeline error.
    pub fn of(err: &crate::Error) -> Self {
        match err {
            crate::Error::Capture(_) => ErrorType::Source,
            crate::Error::Publish(_) | crate::Error::Consumer(_) => ErrorType::Kafka,
            crate::Error::Sink(_) => ErrorType::Sink,
            crate::Error::Checkpoint(_) => ErrorType::Checkpoint,
            crate::Error::DeadLetter(_) => ErrorType::DeadLetter,
            _ => ErrorType::Other,
        }
    }

    fn index(&self) -> usize {
        match self {
            ErrorType::Source => 0,
            ErrorType::Kafka => 1,
            ErrorType::Sink => 2,
            ErrorType::Checkpoint => 3,
            ErrorType::DeadLetter => 4,
            ErrorType::Other => 5,
        }
    }
}

#[derive(Default)]
struct PartitionGauges {
    committed_offset: AtomicI64,
    lag: AtomicI64,
}

/// Counters, gauges and histograms shared by every pipeline stage.
///
/// Everything is atomic, so one instance is shared by all partition
/// workers without locking.
pub struct PipelineMetrics {
    // === COUNTERS ===
    events_captured_total: AtomicU64,
    events_published_total: AtomicU64,
    events_applied_total: AtomicU64,
    events_already_applied_total: AtomicU64,
    dead_letters_total: AtomicU64,
    retries_total: AtomicU64,
    publish_retries_total: AtomicU64,
    breaker_opened_total: AtomicU64,
    heartbeats_emitted_total: AtomicU64,
    heartbeats_observed_total: AtomicU64,
    errors_total: AtomicU64,
    errors_by_type: [AtomicU64; 6],

    // === GAUGES ===
    /// 0 closed, 1 open, 2 half-open
    breaker_state: AtomicU64,
    capture_in_flight: AtomicU64,
    source_confirmed_position: AtomicU64,
    partitions: DashMap<i32, PartitionGauges>,

    // === HISTOGRAM: apply_duration_seconds ===
    apply_duration_sum_us: AtomicU64,
    apply_duration_count: AtomicU64,
    /// Buckets: [1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 1s, +Inf]
    apply_duration_buckets: [AtomicU64; 9],
}

impl PipelineMetrics {
    /// Create new metrics.
    pub fn new() -> Self {
        Self {
            events_captured_total: AtomicU64::new(0),
            events_published_total: AtomicU64::new(0),
            events_applied_total: AtomicU64::new(0),
            events_already_applied_total: AtomicU64::new(0),
            dead_letters_total: AtomicU64::new(0),
            retries_total: AtomicU64::new(0),
            publish_retries_total: AtomicU64::new(0),
            breaker_opened_total: AtomicU64::new(0),
            heartbeats_emitted_total: AtomicU64::new(0),
            heartbeats_observed_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            errors_by_type: Default::default(),
            breaker_state: AtomicU64::new(0),
            capture_in_flight: AtomicU64::new(0),
            source_confirmed_position: AtomicU64::new(0),
            partitions: DashMap::new(),
            apply_duration_sum_us: AtomicU64::new(0),
            apply_duration_count: AtomicU64::new(0),
            apply_duration_buckets: Default::default(),
        }
    }

    // === COUNTER RECORDING ===

    /// Record a change event read from the source.
    pub fn record_captured(&self) {
        self.events_captured_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a durable append to the log.
    pub fn record_published(&self) {
        self.events_published_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a publish attempt that will be retried.
    pub fn record_publish_retry(&self) {
        self.publish_retries_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a sink apply with its duration.
    pub fn record_applied(&self, duration: Duration) {
        self.events_applied_total.fetch_add(1, Ordering::Relaxed);
        self.observe_apply_duration(duration);
    }

    /// Record an apply absorbed by the idempotency check.
    pub fn record_already_applied(&self, duration: Duration) {
        self.events_already_applied_total
            .fetch_add(1, Ordering::Relaxed);
        self.observe_apply_duration(duration);
    }

    /// Record a dead-letter record written.
    pub fn record_dead_letter(&self) {
        self.dead_letters_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a sink retry.
    pub fn record_retry(&self) {
        self.retries_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the circuit breaker opening.
    pub fn record_breaker_opened(&self) {
        self.breaker_opened_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a heartbeat written into the source.
    pub fn record_heartbeat_emitted(&self) {
        self.heartbeats_emitted_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a heartbeat that made it through capture and publish.
    pub fn record_heartbeat_observed(&self) {
        self.heartbeats_observed_total
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record an error with a type label.
    pub fn record_error(&self, error_type: ErrorType) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
        self.errors_by_type[error_type.index()].fetch_add(1, Ordering::Relaxed);
    }

    fn observe_apply_duration(&self, duration: Duration) {
        let micros = duration.as_micros() as u64;
        self.apply_duration_sum_us
            .fetch_add(micros, Ordering::Relaxed);
        self.apply_duration_count.fetch_add(1, Ordering::Relaxed);

        // Buckets are cumulative (le)
        for (i, &bucket_ms) in APPLY_DURATION_BUCKETS_MS.iter().enumerate() {
            if micros <= bucket_ms * 1000 {
                self.apply_duration_buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.apply_duration_buckets[8].fetch_add(1, Ordering::Relaxed);
    }

    // === GAUGE UPDATES ===

    /// Update the circuit breaker state gauge.
    pub fn set_breaker_state(&self, state: crate::circuit_breaker::CircuitState) {
        self.breaker_state
            .store(state.as_gauge(), Ordering::Relaxed);
    }

    /// Update the number of captured items awaiting publish confirmation.
    pub fn set_capture_in_flight(&self, count: u64) {
        self.capture_in_flight.store(count, Ordering::Relaxed);
    }

    /// Update the source position last acknowledged to the source.
    pub fn set_source_confirmed_position(&self, position: u64) {
        self.source_confirmed_position
            .store(position, Ordering::Relaxed);
    }

    /// Update a partition's committed offset and lag.
    ///
    /// Lag is the high watermark minus the next offset to consume.
    pub fn set_partition_progress(&self, partition: i32, committed_offset: i64, lag: i64) {
        let entry = self.partitions.entry(partition).or_default();
        entry
            .committed_offset
            .store(committed_offset, Ordering::Relaxed);
        entry.lag.store(lag.max(0), Ordering::Relaxed);
    }

    // === GETTERS ===

    /// Total events captured.
    pub fn events_captured_total(&self) -> u64 {
        self.events_captured_total.load(Ordering::Relaxed)
    }

    /// Total events durably published.
    pub fn events_published_total(&self) -> u64 {
        self.events_published_total.load(Ordering::Relaxed)
    }

    /// Total events applied to the sink.
    pub fn events_applied_total(&self) -> u64 {
        self.events_applied_total.load(Ordering::Relaxed)
    }

    /// Total applies absorbed as already applied.
    pub fn events_already_applied_total(&self) -> u64 {
        self.events_already_applied_total.load(Ordering::Relaxed)
    }

    /// Total dead-letter records written.
    pub fn dead_letters_total(&self) -> u64 {
        self.dead_letters_total.load(Ordering::Relaxed)
    }

    /// Total sink retries.
    pub fn retries_total(&self) -> u64 {
        self.retries_total.load(Ordering::Relaxed)
    }

    /// Total publish retries.
    pub fn publish_retries_total(&self) -> u64 {
        self.publish_retries_total.load(Ordering::Relaxed)
    }

    /// Total breaker openings.
    pub fn breaker_opened_total(&self) -> u64 {
        self.breaker_opened_total.load(Ordering::Relaxed)
    }

    /// Total heartbeats emitted.
    pub fn heartbeats_emitted_total(&self) -> u64 {
        self.heartbeats_emitted_total.load(Ordering::Relaxed)
    }

    /// Total heartbeats observed after publish.
    pub fn heartbeats_observed_total(&self) -> u64 {
        self.heartbeats_observed_total.load(Ordering::Relaxed)
    }

    /// Total errors.
    pub fn errors_total(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }

    /// Error count by type.
    pub fn errors_by_type(&self, error_type: ErrorType) -> u64 {
        self.errors_by_type[error_type.index()].load(Ordering::Relaxed)
    }

    /// Committed offset and lag of `partition`.
    pub fn partition_progress(&self, partition: i32) -> Option<(i64, i64)> {
        self.partitions.get(&partition).map(|g| {
            (
                g.committed_offset.load(Ordering::Relaxed),
                g.lag.load(Ordering::Relaxed),
            )
        })
    }

    /// Apply duration histogram data for export.
    pub fn apply_duration_histogram(&self) -> ApplyDurationHistogram {
        let mut buckets = [(0.0, 0); 8];
        for (i, &bucket_ms) in APPLY_DURATION_BUCKETS_MS.iter().enumerate() {
            buckets[i] = (
                bucket_ms as f64 / 1000.0,
                self.apply_duration_buckets[i].load(Ordering::Relaxed),
            );
        }
        ApplyDurationHistogram {
            sum_seconds: self.apply_duration_sum_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            count: self.apply_duration_count.load(Ordering::Relaxed),
            buckets,
            inf_bucket: self.apply_duration_buckets[8].load(Ordering::Relaxed),
        }
    }

    /// Export all metrics in Prometheus text format.
    ///
    /// # Example
    /// ```
    /// use sentinel_core::metrics::PipelineMetrics;
    ///
    /// let metrics = PipelineMetrics::new();
    /// metrics.record_published();
    /// let text = metrics.export_prometheus_text();
    /// assert!(text.contains("sentinel_events_published_total 1"));
    /// ```
    pub fn export_prometheus_text(&self) -> String {
        let mut output = String::with_capacity(4096);

        // === COUNTERS ===
        let counters: [(&str, &str, u64); 10] = [
            ("events_captured_total", "Change events read from the source", self.events_captured_total()),
            ("events_published_total", "Change events durably appended to the log", self.events_published_total()),
            ("events_applied_total", "Change events applied to the sink", self.events_applied_total()),
            ("events_already_applied_total", "Redelivered events absorbed by the idempotency check", self.events_already_applied_total()),
            ("dead_letters_total", "Dead-letter records written", self.dead_letters_total()),
            ("retries_total", "Sink apply retries", self.retries_total()),
            ("publish_retries_total", "Log append retries", self.publish_retries_total()),
            ("breaker_opened_total", "Times the sink circuit breaker opened", self.breaker_opened_total()),
            ("heartbeats_emitted_total", "Heartbeats written into the source", self.heartbeats_emitted_total()),
            ("heartbeats_observed_total", "Heartbeats observed after publish", self.heartbeats_observed_total()),
        ];
        for (name, help, value) in counters {
            write_metric(&mut output, name, help, "counter", value);
        }

        write_metric(&mut output, "errors_total", "Total errors encountered", "counter", self.errors_total());

        let _ = writeln!(output, "# HELP {}_errors Errors by type", PREFIX);
        let _ = writeln!(output, "# TYPE {}_errors counter", PREFIX);
        for error_type in ErrorType::ALL {
            let _ = writeln!(
                output,
                "{}_errors{{type=\"{}\"}} {}",
                PREFIX,
                error_type.as_label(),
                self.errors_by_type(error_type)
            );
        }
        output.push('\n');

        // === GAUGES ===
        write_metric(
            &mut output,
            "circuit_breaker_state",
            "Sink circuit breaker state (0 closed, 1 open, 2 half-open)",
            "gauge",
            self.breaker_state.load(Ordering::Relaxed),
        );
        write_metric(
            &mut output,
            "capture_in_flight",
            "Captured items awaiting publish confirmation",
            "gauge",
            self.capture_in_flight.load(Ordering::Relaxed),
        );
        write_metric(
            &mut output,
            "source_confirmed_position",
            "Source position last acknowledged to the replication slot",
            "gauge",
            self.source_confirmed_position.load(Ordering::Relaxed),
        );

        let mut partitions: Vec<(i32, i64, i64)> = self
            .partitions
            .iter()
            .map(|e| {
                (
                    *e.key(),
                    e.committed_offset.load(Ordering::Relaxed),
                    e.lag.load(Ordering::Relaxed),
                )
            })
            .collect();
        partitions.sort_unstable();

        let _ = writeln!(output, "# HELP {}_partition_committed_offset Last committed offset per partition", PREFIX);
        let _ = writeln!(output, "# TYPE {}_partition_committed_offset gauge", PREFIX);
        for (partition, committed, _) in &partitions {
            let _ = writeln!(
                output,
                "{}_partition_committed_offset{{partition=\"{}\"}} {}",
                PREFIX, partition, committed
            );
        }
        output.push('\n');

        let _ = writeln!(output, "# HELP {}_partition_lag Messages behind the high watermark per partition", PREFIX);
        let _ = writeln!(output, "# TYPE {}_partition_lag gauge", PREFIX);
        for (partition, _, lag) in &partitions {
            let _ = writeln!(output, "{}_partition_lag{{partition=\"{}\"}} {}", PREFIX, partition, lag);
        }
        output.push('\n');

        // === HISTOGRAM: apply_duration_seconds ===
        let hist = self.apply_duration_histogram();
        let _ = writeln!(output, "# HELP {}_apply_duration_seconds Duration of sink apply operations", PREFIX);
        let _ = writeln!(output, "# TYPE {}_apply_duration_seconds histogram", PREFIX);
        for (le, count) in &hist.buckets {
            let _ = writeln!(
                output,
                "{}_apply_duration_seconds_bucket{{le=\"{}\"}} {}",
                PREFIX, le, count
            );
        }
        let _ = writeln!(
            output,
            "{}_apply_duration_seconds_bucket{{le=\"+Inf\"}} {}",
            PREFIX, hist.inf_bucket
        );
        let _ = writeln!(output, "{}_apply_duration_seconds_sum {}", PREFIX, hist.sum_seconds);
        let _ = writeln!(output, "{}_apply_duration_seconds_count {}", PREFIX, hist.count);

        output
    }
}

fn write_metric(output: &mut String, name: &str, help: &str, kind: &str, value: u64) {
    let _ = writeln!(output, "# HELP {}_{} {}", PREFIX, name, help);
    let _ = writeln!(output, "# TYPE {}_{} {}", PREFIX, name, kind);
    let _ = writeln!(output, "{}_{} {}", PREFIX, name, value);
    output.push('\n');
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply duration histogram data for export.
#[derive(Debug, Clone)]
pub struct ApplyDurationHistogram {
    /// Sum of all observations in seconds
    pub sum_seconds: f64,
    /// Total count of observations
    pub count: u64,
    /// Bucket counts: (le_boundary_seconds, count)
    pub buckets: [(f64, u64); 8],
    /// +Inf bucket count
    pub inf_bucket: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::{Error, SinkError};

    #[test]
    fn test_counters() {
        let metrics = PipelineMetrics::new();

        metrics.record_captured();
        metrics.record_captured();
        metrics.record_published();
        assert_eq!(metrics.events_captured_total(), 2);
        assert_eq!(metrics.events_published_total(), 1);

        metrics.record_error(ErrorType::Sink);
        metrics.record_error(ErrorType::Sink);
        metrics.record_error(ErrorType::Kafka);
        assert_eq!(metrics.errors_total(), 3);
        assert_eq!(metrics.errors_by_type(ErrorType::Sink), 2);
        assert_eq!(metrics.errors_by_type(ErrorType::Kafka), 1);
        assert_eq!(metrics.errors_by_type(ErrorType::Source), 0);

        metrics.record_dead_letter();
        metrics.record_breaker_opened();
        assert_eq!(metrics.dead_letters_total(), 1);
        assert_eq!(metrics.breaker_opened_total(), 1);
    }

    #[test]
    fn test_error_type_classification() {
        let err = Error::Sink(SinkError::Unavailable("down".into()));
        assert_eq!(ErrorType::of(&err), ErrorType::Sink);
        assert_eq!(ErrorType::of(&Error::Config("x".into())), ErrorType::Other);
    }

    #[test]
    fn test_apply_histogram_buckets() {
        let metrics = PipelineMetrics::new();
        metrics.record_applied(Duration::from_micros(500)); // <= 1ms
        metrics.record_applied(Duration::from_millis(20)); // <= 25ms
        metrics.record_already_applied(Duration::from_secs(2)); // +Inf only

        let hist = metrics.apply_duration_histogram();
        assert_eq!(hist.count, 3);
        assert_eq!(hist.buckets[0].1, 1);
        assert_eq!(hist.buckets[2].1, 1);
        assert_eq!(hist.buckets[3].1, 2);
        assert_eq!(hist.buckets[7].1, 2);
        assert_eq!(hist.inf_bucket, 3);
        assert_eq!(metrics.events_applied_total(), 2);
        assert_eq!(metrics.events_already_applied_total(), 1);
    }

    #[test]
    fn test_partition_progress() {
        let metrics = PipelineMetrics::new();
        metrics.set_partition_progress(3, 41, 7);
        metrics.set_partition_progress(3, 45, -1);
        assert_eq!(metrics.partition_progress(3), Some((45, 0)));
        assert_eq!(metrics.partition_progress(4), None);
    }

    #[test]
    fn test_prometheus_text_export() {
        let metrics = PipelineMetrics::new();
        metrics.record_published();
        metrics.record_error(ErrorType::Kafka);
        metrics.set_breaker_state(CircuitState::Open);
        metrics.set_partition_progress(0, 10, 2);
        metrics.record_applied(Duration::from_millis(3));

        let output = metrics.export_prometheus_text();
        assert!(output.contains("# TYPE sentinel_events_published_total counter"));
        assert!(output.contains("sentinel_events_published_total 1"));
        assert!(output.contains("sentinel_errors{type=\"kafka\"} 1"));
        assert!(output.contains("sentinel_errors{type=\"sink\"} 0"));
        assert!(output.contains("sentinel_circuit_breaker_state 1"));
        assert!(output.contains("sentinel_partition_committed_offset{partition=\"0\"} 10"));
        assert!(output.contains("sentinel_partition_lag{partition=\"0\"} 2"));
        assert!(output.contains("sentinel_apply_duration_seconds_bucket{le=\"0.005\"} 1"));
        assert!(output.contains("sentinel_apply_duration_seconds_count 1"));
    }

    #[test]
    fn test_prometheus_text_format_validity() {
        let metrics = PipelineMetrics::new();
        metrics.set_partition_progress(1, 5, 0);
        let output = metrics.export_prometheus_text();

        for line in output.lines() {
            if line.starts_with("# HELP ") {
                assert!(line.contains("sentinel_"));
            } else if line.starts_with("# TYPE ") {
                assert!(
                    line.ends_with("counter") || line.ends_with("gauge") || line.ends_with("histogram")
                );
            } else if !line.is_empty() {
                assert!(line.starts_with("sentinel_"), "bad line {}", line);
            }
        }
    }
}
