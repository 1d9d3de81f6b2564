//! Retry decisions for the stream driver

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::backoff::{Backoff, IsRetryable, RetryConfig};
use crate::error::StreamError;
use crate::protocol::ShapeParams;

/// What the driver should do after a failed request
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Issue the next request immediately (cancellation, not a failure)
    Reissue,
    /// Reset the cursor and issue immediately
    Refetch,
    /// Wait, then issue again
    Backoff(Duration),
    /// Hand the error to the recovery hook
    Terminal(StreamError),
}

/// Replacement parameters returned by a recovery hook
///
/// Both maps are merged over the current ones; an empty `Recovery` restarts
/// with the parameters unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Recovery {
    pub params: ShapeParams,
    pub headers: BTreeMap<String, String>,
}

/// Caller-supplied recovery hook for terminal errors
///
/// Return `Some` to restart the stream in place, `None` to stop it and
/// surface the error to subscribers.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn on_error(&self, error: &StreamError) -> Option<Recovery>;
}

#[async_trait]
impl<F> ErrorHandler for F
where
    F: Fn(&StreamError) -> Option<Recovery> + Send + Sync,
{
    async fn on_error(&self, error: &StreamError) -> Option<Recovery> {
        (self)(error)
    }
}

/// Classifies failures and tracks consecutive retryable ones
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    backoff: Backoff,
    max_retries: Option<u32>,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: Backoff::new(config),
        }
    }

    /// Decide how to continue after `error`
    ///
    /// `Cancelled(Stopped)` is the driver's exit signal and is expected to be
    /// handled before reaching the policy; any cancellation seen here re-issues.
    pub fn decide(&mut self, error: StreamError) -> RetryDecision {
        match error {
            StreamError::Cancelled(_) => RetryDecision::Reissue,
            StreamError::MustRefetch { .. } => {
                self.backoff.reset();
                RetryDecision::Refetch
            }
            error if error.is_retryable() => {
                if let Some(max) = self.max_retries {
                    if self.backoff.attempts() >= max {
                        let attempts = self.backoff.attempts();
                        self.backoff.reset();
                        return RetryDecision::Terminal(StreamError::RetriesExhausted {
                            attempts,
                            last: Box::new(error),
                        });
                    }
                }
                RetryDecision::Backoff(self.backoff.next_delay(error.retry_after()))
            }
            error => RetryDecision::Terminal(error),
        }
    }

    /// A request succeeded; the next failure starts a fresh backoff
    pub fn record_success(&mut self) {
        self.backoff.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelReason;

    fn policy(max_retries: Option<u32>) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter: false,
            max_retries,
        })
    }

    fn server(status: u16) -> StreamError {
        StreamError::Server {
            status,
            body: String::new(),
            retry_after: None,
        }
    }

    #[test]
    fn test_cancellation_reissues_without_backoff() {
        let mut policy = policy(None);
        assert_eq!(
            policy.decide(StreamError::Cancelled(CancelReason::SystemWake)),
            RetryDecision::Reissue
        );
        assert_eq!(
            policy.decide(StreamError::Cancelled(CancelReason::Paused)),
            RetryDecision::Reissue
        );
        // Cancellation does not consume the backoff budget
        assert_eq!(
            policy.decide(server(500)),
            RetryDecision::Backoff(Duration::from_millis(100))
        );
    }

    #[test]
    fn test_transient_failures_back_off() {
        let mut policy = policy(None);
        assert_eq!(
            policy.decide(StreamError::Network("refused".into())),
            RetryDecision::Backoff(Duration::from_millis(100))
        );
        assert_eq!(
            policy.decide(server(503)),
            RetryDecision::Backoff(Duration::from_millis(200))
        );
        policy.record_success();
        assert_eq!(
            policy.decide(server(429)),
            RetryDecision::Backoff(Duration::from_millis(100))
        );
    }

    #[test]
    fn test_client_errors_are_terminal() {
        let mut policy = policy(None);
        let err = StreamError::Client {
            status: 400,
            body: "Bad Request".into(),
        };
        assert_eq!(policy.decide(err.clone()), RetryDecision::Terminal(err));
    }

    #[test]
    fn test_must_refetch() {
        let mut policy = policy(None);
        assert_eq!(
            policy.decide(StreamError::MustRefetch { handle: None }),
            RetryDecision::Refetch
        );
    }

    #[test]
    fn test_retry_budget() {
        let mut policy = policy(Some(2));
        assert!(matches!(policy.decide(server(500)), RetryDecision::Backoff(_)));
        assert!(matches!(policy.decide(server(500)), RetryDecision::Backoff(_)));
        match policy.decide(server(502)) {
            RetryDecision::Terminal(StreamError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 2);
                assert_eq!(*last, server(502));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_closure_error_handler() {
        let handler = |err: &StreamError| {
            (err.status() == Some(400)).then(|| Recovery {
                params: [("table".to_string(), "bar".to_string())].into(),
                ..Recovery::default()
            })
        };
        let recovered = handler
            .on_error(&StreamError::Client {
                status: 400,
                body: String::new(),
            })
            .await
            .unwrap();
        assert_eq!(recovered.params["table"], "bar");
        assert!(handler.on_error(&server(500)).await.is_none());
    }
}
