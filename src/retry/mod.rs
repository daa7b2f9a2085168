//! Retry policies and the retry engine
//!
//! A [`RetryPolicy`] decides how many attempts a call gets and how long to wait
//! between them. The [`RetryEngine`] runs a call under a policy, asking the
//! circuit breaker before each attempt and reporting every outcome to it.
//!
//! Only network, timeout and throttling errors are retried. Throttled calls
//! wait `throttle_multiplier` times longer, and never less than the provider's
//! retry-after hint.

pub mod engine;
pub mod policy;

pub use engine::{RetryEngine, RetryOutcome, RetryStats};
pub use policy::{BackoffStrategy, RetryConfig, RetryPolicy};
