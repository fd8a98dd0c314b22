//! The two retry layers.
//!
//! - `RetryExecutor` (outer): retries whole operations on any transient cluster failure
//! - `StatementRetryPolicy` (inner): consulted by `Session` for replica-level timeouts

mod executor;
mod policy;

pub use executor::{Backoff, JitteredBackoff, RetryExecutor};
pub use policy::{DefaultRetryPolicy, NeverRetryPolicy, RetryDecision, StatementRetryPolicy};
