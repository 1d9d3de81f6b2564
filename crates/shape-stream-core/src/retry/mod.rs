//! Failure classification and retry
//!
//! Provides exponential backoff with jitter for transient failures and the
//! recovery hook consulted on terminal ones.

mod backoff;
mod policy;

pub use backoff::{Backoff, IsRetryable, RetryConfig};
pub use policy::{ErrorHandler, Recovery, RetryDecision, RetryPolicy};
