//! Bounded retries around sink application.
//!
//! - [`RetryPolicy`]: capped exponential backoff with jitter
//! - [`RetryCoordinator`]: per-event attempt state machine, gated by a
//!   circuit breaker shared by every partition worker

mod coordinator;
mod policy;

pub use coordinator::{AttemptState, RetryCoordinator, RetryOutcome};
pub use policy::RetryPolicy;
