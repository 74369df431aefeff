//! Per-event retry state machine.
//!
//! ```text
//! Ready{1} -> BackingOff{1, d} -> Ready{2} -> ... -> Succeeded
//!                                                 -> Exhausted
//!                                                 -> Rejected
//! ```
//!
//! Retryable failures back off and try again until the policy's attempt
//! budget is spent. Rejections end the event immediately. While the circuit
//! breaker is open no attempt is made or counted: the coordinator probes the
//! store every reset timeout and resumes once a probe succeeds. A failure in
//! half-open, right after a healthy probe, is counted against the event, so
//! an event the store keeps refusing still runs out of attempts.

use super::RetryPolicy;
use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::event::ChangeEvent;
use crate::health::{HealthCheck, COMPONENT_SINK};
use crate::metrics::{ErrorType, PipelineMetrics};
use crate::sink::{ApplyOutcome, IdempotentSinkWriter};
use crate::Error;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Where an event is in its retry lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptState {
    /// About to make attempt number `attempt` (1-based)
    Ready { attempt: u32 },
    /// Attempt `attempt` failed; waiting `delay` before the next one
    BackingOff { attempt: u32, delay: Duration },
    Succeeded { attempts: u32, outcome: ApplyOutcome },
    /// Retryable failures used up every attempt
    Exhausted { attempts: u32, last_error: String },
    /// Fatal failure for this event
    Rejected { attempts: u32, error: String },
}

impl AttemptState {
    /// Initial state for a new event.
    pub fn start() -> Self {
        AttemptState::Ready { attempt: 1 }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptState::Succeeded { .. } | AttemptState::Exhausted { .. } | AttemptState::Rejected { .. }
        )
    }

    /// Transition after the current attempt succeeded.
    pub fn on_success(&self, outcome: ApplyOutcome) -> Self {
        match self {
            AttemptState::Ready { attempt } => AttemptState::Succeeded {
                attempts: *attempt,
                outcome,
            },
            other => other.clone(),
        }
    }

    /// Transition after the current attempt failed with `err`.
    pub fn on_failure(&self, err: &Error, policy: &RetryPolicy) -> Self {
        let AttemptState::Ready { attempt } = *self else {
            return self.clone();
        };
        if !err.is_retryable() {
            return AttemptState::Rejected {
                attempts: attempt,
                error: err.to_string(),
            };
        }
        if policy.allows_attempt(attempt) {
            AttemptState::BackingOff {
                attempt,
                delay: policy.calculate_delay(attempt - 1),
            }
        } else {
            AttemptState::Exhausted {
                attempts: attempt,
                last_error: err.to_string(),
            }
        }
    }

    /// Transition once the backoff delay has elapsed.
    pub fn after_backoff(&self) -> Self {
        match self {
            AttemptState::BackingOff { attempt, .. } => AttemptState::Ready { attempt: attempt + 1 },
            other => other.clone(),
        }
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptState::Ready { attempt } => write!(f, "ready(attempt={})", attempt),
            AttemptState::BackingOff { attempt, delay } => {
                write!(f, "backing_off(attempt={}, delay={:?})", attempt, delay)
            }
            AttemptState::Succeeded { attempts, outcome } => {
                write!(f, "succeeded({}, attempts={})", outcome, attempts)
            }
            AttemptState::Exhausted { attempts, .. } => write!(f, "exhausted(attempts={})", attempts),
            AttemptState::Rejected { attempts, .. } => write!(f, "rejected(attempts={})", attempts),
        }
    }
}

/// Final result for one event.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    /// The sink confirmed the event
    Applied { outcome: ApplyOutcome, attempts: u32 },
    /// The event must go to the dead-letter store
    DeadLetter {
        error_class: String,
        attempts: u32,
        last_error: String,
    },
}

/// Applies events through the sink writer with bounded retries.
pub struct RetryCoordinator {
    writer: IdempotentSinkWriter,
    policy: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<PipelineMetrics>,
    health: Arc<HealthCheck>,
    current: Mutex<Option<AttemptState>>,
}

impl RetryCoordinator {
    pub fn new(
        writer: IdempotentSinkWriter,
        policy: RetryPolicy,
        breaker: Arc<CircuitBreaker>,
        metrics: Arc<PipelineMetrics>,
        health: Arc<HealthCheck>,
    ) -> Self {
        Self {
            writer,
            policy,
            breaker,
            metrics,
            health,
            current: Mutex::new(None),
        }
    }

    /// State of the event in flight, if any.
    pub fn current_state(&self) -> Option<AttemptState> {
        self.current.lock().clone()
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    fn set_state(&self, state: &AttemptState) {
        *self.current.lock() = Some(state.clone());
    }

    /// Apply one event, retrying transient failures.
    pub async fn apply(&self, event: &ChangeEvent) -> RetryOutcome {
        let mut state = AttemptState::start();
        let mut last_error_class = "Other";

        let outcome = loop {
            self.set_state(&state);
            match state.clone() {
                AttemptState::Ready { attempt } => {
                    self.wait_for_breaker().await;
                    // A probe just succeeded, so a failure now is charged to the event.
                    let after_probe = self.breaker.state() == CircuitState::HalfOpen;

                    let started = Instant::now();
                    match self.writer.apply(event).await {
                        Ok(outcome) => {
                            self.breaker.record_success();
                            self.metrics.set_breaker_state(self.breaker.state());
                            match outcome {
                                ApplyOutcome::Applied => self.metrics.record_applied(started.elapsed()),
                                ApplyOutcome::AlreadyApplied => {
                                    self.metrics.record_already_applied(started.elapsed())
                                }
                            }
                            state = state.on_success(outcome);
                        }
                        Err(e) => {
                            self.metrics.record_error(ErrorType::of(&e));
                            last_error_class = e.class();

                            if e.is_retryable() && self.record_unavailable() && !after_probe {
                                // Failures that open the breaker are charged to
                                // the outage, not the event.
                                debug!(
                                    key = %event.source_key(),
                                    attempt,
                                    "Circuit breaker opened, attempt not counted"
                                );
                                continue;
                            }
                            state = state.on_failure(&e, &self.policy);
                            debug!(
                                key = %event.source_key(),
                                position = %event.source_position(),
                                error = %e,
                                next = %state,
                                "Apply attempt failed"
                            );
                        }
                    }
                }
                AttemptState::BackingOff { attempt, delay } => {
                    self.metrics.record_retry();
                    debug!(
                        key = %event.source_key(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Backing off before retry"
                    );
                    tokio::time::sleep(delay).await;
                    state = state.after_backoff();
                }
                AttemptState::Succeeded { attempts, outcome } => {
                    break RetryOutcome::Applied { outcome, attempts };
                }
                AttemptState::Exhausted { attempts, last_error } => {
                    warn!(
                        key = %event.source_key(),
                        position = %event.source_position(),
                        attempts,
                        error = %last_error,
                        "Retries exhausted"
                    );
                    break RetryOutcome::DeadLetter {
                        error_class: last_error_class.to_string(),
                        attempts,
                        last_error,
                    };
                }
                AttemptState::Rejected { attempts, error } => {
                    warn!(
                        key = %event.source_key(),
                        position = %event.source_position(),
                        error = %error,
                        "Event rejected by sink"
                    );
                    break RetryOutcome::DeadLetter {
                        error_class: last_error_class.to_string(),
                        attempts,
                        last_error: error,
                    };
                }
            }
        };

        *self.current.lock() = None;
        outcome
    }

    /// Record a retryable failure. Returns whether the breaker is now open.
    fn record_unavailable(&self) -> bool {
        let opened_before = self.breaker.opened_total();
        self.breaker.record_failure();
        let state = self.breaker.state();
        self.metrics.set_breaker_state(state);
        if self.breaker.opened_total() > opened_before {
            self.metrics.record_breaker_opened();
        }
        state == CircuitState::Open
    }

    /// Block while the breaker is open, probing the store every reset timeout.
    async fn wait_for_breaker(&self) {
        if self.breaker.is_allowed() {
            return;
        }

        self.health
            .mark_degraded(COMPONENT_SINK, "circuit breaker open, consumption paused");
        loop {
            let wait = self.breaker.time_until_probe();
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
            if self.breaker.is_allowed() {
                break;
            }
            if !self.breaker.probe_due() {
                continue;
            }

            match self.writer.probe().await {
                Ok(()) => {
                    self.breaker.record_probe(true);
                    self.metrics.set_breaker_state(self.breaker.state());
                    info!(breaker = %self.breaker.name(), "Sink probe succeeded, resuming");
                    break;
                }
                Err(e) => {
                    self.breaker.record_probe(false);
                    debug!(breaker = %self.breaker.name(), error = %e, "Sink probe failed");
                }
            }
        }
        self.health.mark_healthy(COMPONENT_SINK);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::config::{BreakerConfig, RetryConfig};
    use crate::event::{ColumnValue, Operation, SourceKey, SourcePosition};
    use crate::sink::MemoryStore;
    use crate::SinkError;
    use std::collections::BTreeMap;

    fn policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(4), attempts).without_jitter()
    }

    fn event(id: i64, position: u64) -> ChangeEvent {
        let mut payload = BTreeMap::new();
        payload.insert("id".to_string(), ColumnValue::Int(id));
        ChangeEvent::new(
            SourceKey::single("public.t", "id", ColumnValue::Int(id)),
            Operation::Insert,
            payload,
            SourcePosition(position),
            chrono::Utc::now(),
            1,
        )
    }

    fn coordinator(store: &MemoryStore, attempts: u32, threshold: u32) -> (RetryCoordinator, Arc<PipelineMetrics>) {
        let metrics = Arc::new(PipelineMetrics::new());
        let breaker = Arc::new(CircuitBreaker::new(
            CircuitBreakerConfig::new("sink")
                .with_failure_threshold(threshold)
                .with_reset_timeout(Duration::from_millis(20))
                .with_success_threshold(1),
        ));
        let coordinator = RetryCoordinator::new(
            IdempotentSinkWriter::new(Arc::new(store.clone())),
            policy(attempts),
            breaker,
            Arc::clone(&metrics),
            Arc::new(HealthCheck::new()),
        );
        (coordinator, metrics)
    }

    #[test]
    fn test_state_transitions() {
        let policy = policy(2);
        let transient = Error::Sink(SinkError::Unavailable("down".into()));
        let fatal = Error::Sink(SinkError::Rejected("bad".into()));

        let s = AttemptState::start();
        let s = s.on_failure(&transient, &policy);
        assert_eq!(
            s,
            AttemptState::BackingOff {
                attempt: 1,
                delay: Duration::from_millis(1)
            }
        );
        let s = s.after_backoff();
        assert_eq!(s, AttemptState::Ready { attempt: 2 });
        let s = s.on_failure(&transient, &policy);
        assert!(matches!(s, AttemptState::Exhausted { attempts: 2, .. }));
        assert!(s.is_terminal());

        let r = AttemptState::start().on_failure(&fatal, &policy);
        assert!(matches!(r, AttemptState::Rejected { attempts: 1, .. }));

        let ok = AttemptState::Ready { attempt: 3 }.on_success(ApplyOutcome::Applied);
        assert_eq!(
            ok,
            AttemptState::Succeeded {
                attempts: 3,
                outcome: ApplyOutcome::Applied
            }
        );
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let store = MemoryStore::new();
        let (coordinator, metrics) = coordinator(&store, 5, 100);
        store.fail_next_writes(2);

        let outcome = coordinator.apply(&event(1, 1)).await;
        assert_eq!(
            outcome,
            RetryOutcome::Applied {
                outcome: ApplyOutcome::Applied,
                attempts: 3
            }
        );
        assert_eq!(metrics.retries_total(), 2);
        assert!(coordinator.current_state().is_none());
    }

    #[tokio::test]
    async fn test_exhaustion_dead_letters() {
        let store = MemoryStore::new();
        let (coordinator, _metrics) = coordinator(&store, 3, 100);
        store.fail_next_writes(10);

        match coordinator.apply(&event(1, 1)).await {
            RetryOutcome::DeadLetter {
                error_class,
                attempts,
                ..
            } => {
                assert_eq!(error_class, "SinkUnavailable");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected dead letter, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let store = MemoryStore::new();
        let (coordinator, metrics) = coordinator(&store, 5, 100);
        let bad = ChangeEvent::new(
            SourceKey::single("public.t", "id", ColumnValue::Int(1)),
            Operation::Insert,
            BTreeMap::new(),
            SourcePosition(1),
            chrono::Utc::now(),
            1,
        );

        match coordinator.apply(&bad).await {
            RetryOutcome::DeadLetter {
                error_class,
                attempts,
                ..
            } => {
                assert_eq!(error_class, "SinkRejected");
                assert_eq!(attempts, 1);
            }
            other => panic!("expected dead letter, got {:?}", other),
        }
        assert_eq!(metrics.retries_total(), 0);
    }

    #[tokio::test]
    async fn test_open_breaker_pauses_until_probe_succeeds() {
        let store = MemoryStore::new();
        let (coordinator, metrics) = coordinator(&store, 2, 2);
        store.set_available(false);

        let restore = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            restore.set_available(true);
        });

        // Two attempts would exhaust the event, but the outage opens the
        // breaker first, so the event waits and then applies.
        let outcome = coordinator.apply(&event(1, 1)).await;
        assert!(matches!(outcome, RetryOutcome::Applied { .. }));
        assert!(metrics.breaker_opened_total() >= 1);
        assert_eq!(coordinator.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_failing_after_healthy_probe_exhausts_with_defaults() {
        let store = MemoryStore::new();
        let metrics = Arc::new(PipelineMetrics::new());
        let retry = RetryConfig::default();
        let breaker = Arc::new(CircuitBreaker::new(
            BreakerConfig::default().to_breaker_config("sink"),
        ));
        let coordinator = RetryCoordinator::new(
            IdempotentSinkWriter::new(Arc::new(store.clone())),
            RetryPolicy::from(&retry),
            Arc::clone(&breaker),
            Arc::clone(&metrics),
            Arc::new(HealthCheck::new()),
        );
        // Probes stay healthy; only this event's writes fail.
        store.fail_next_writes(1_000_000);

        let outcome = tokio::time::timeout(Duration::from_secs(600), coordinator.apply(&event(1, 1)))
            .await
            .expect("event must not retry forever");

        match outcome {
            RetryOutcome::DeadLetter {
                error_class,
                attempts,
                ..
            } => {
                assert_eq!(error_class, "SinkUnavailable");
                assert_eq!(attempts, retry.max_attempts);
            }
            other => panic!("expected dead letter, got {:?}", other),
        }
        assert_eq!(metrics.breaker_opened_total(), 2);
        assert!(coordinator.current_state().is_none());
    }
}
