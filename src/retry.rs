//! Retry with exponential backoff for provider calls.
//!
//! Every provider call is wrapped with a timeout and retried on transient
//! errors (throttling, 5xx, timeouts). Permanent errors are returned
//! immediately. Each attempt runs on its own task: when the run is cancelled
//! the in-flight call is left to finish and its result is dropped.

use crate::cancel::CancelSignal;
use crate::error::ProviderError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Bounded retry policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt (doubles each attempt)
    pub base_delay: Duration,
    /// Upper bound for a single backoff delay
    pub max_delay: Duration,
    /// Timeout applied to every individual attempt
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            call_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `attempt + 1` (attempt counts from 1), with
    /// jitter in the upper half of the exponential window.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let capped = exp.min(self.max_delay);
        let millis = capped.as_millis() as u64;
        if millis < 2 {
            return capped;
        }
        let jittered = rand::thread_rng().gen_range(millis / 2..=millis);
        Duration::from_millis(jittered)
    }
}

/// Why a retried call gave up
#[derive(Debug, Clone, Error)]
pub enum RetryError {
    #[error("gave up after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: ProviderError },

    #[error("{error}")]
    Permanent { attempts: u32, error: ProviderError },

    #[error("cancelled")]
    Cancelled,
}

impl RetryError {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } | Self::Permanent { attempts, .. } => *attempts,
            Self::Cancelled => 0,
        }
    }

    /// The provider error that ended the retry loop, if any
    pub fn provider_error(&self) -> Option<&ProviderError> {
        match self {
            Self::Exhausted { last, .. } => Some(last),
            Self::Permanent { error, .. } => Some(error),
            Self::Cancelled => None,
        }
    }
}

/// Run `call` with timeout, retry and cancellation.
///
/// `call` is invoked once per attempt and must produce an owned future.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancelSignal,
    operation: &str,
    mut call: F,
) -> Result<T, RetryError>
where
    T: Send + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>> + Send + 'static,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        let timeout = policy.call_timeout;
        let task = tokio::spawn(tokio::time::timeout(timeout, call()));

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("{}: cancelled with a call in flight, result will be discarded", operation);
                return Err(RetryError::Cancelled);
            }
            joined = task => match joined {
                Ok(Ok(result)) => result,
                Ok(Err(_elapsed)) => Err(ProviderError::Timeout(timeout)),
                Err(join_error) => Err(ProviderError::Permanent(format!(
                    "provider call aborted: {}",
                    join_error
                ))),
            },
        };

        let error = match outcome {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!("{}: succeeded on attempt {}", operation, attempt);
                }
                return Ok(value);
            },
            Err(error) => error,
        };

        if !error.is_transient() {
            return Err(RetryError::Permanent {
                attempts: attempt,
                error,
            });
        }
        if attempt >= max_attempts {
            tracing::warn!(
                attempt,
                max_attempts,
                "{}: retries exhausted: {}",
                operation,
                error
            );
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: error,
            });
        }

        let delay = policy.backoff(attempt);
        tracing::warn!(
            attempt,
            max_attempts,
            "{} failed, retrying in {delay:?}: {error}",
            operation
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(delay) => {},
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            call_timeout: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = with_retry(&fast_policy(5), &CancelSignal::new(), "list", move || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(ProviderError::Transient("Throttling".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), _> =
            with_retry(&fast_policy(4), &CancelSignal::new(), "list", move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(ProviderError::Transient("503".into()))
                }
            })
            .await;

        match result {
            Err(RetryError::Exhausted { attempts, .. }) => assert_eq!(attempts, 4),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_permanent_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), _> =
            with_retry(&fast_policy(4), &CancelSignal::new(), "mutate", move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(ProviderError::Permanent("AccessDenied".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Permanent { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_transient() {
        let policy = RetryPolicy {
            call_timeout: Duration::from_millis(5),
            ..fast_policy(2)
        };
        let result: Result<(), _> = with_retry(&policy, &CancelSignal::new(), "slow", || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        match result {
            Err(RetryError::Exhausted { last, attempts }) => {
                assert_eq!(attempts, 2);
                assert!(matches!(last, ProviderError::Timeout(_)));
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancellation_abandons_in_flight_call() {
        let cancel = CancelSignal::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let result: Result<(), _> = with_retry(&fast_policy(3), &cancel, "slow", || async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
    }

    #[test]
    fn test_backoff_is_bounded() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            ..RetryPolicy::default()
        };
        for attempt in 1..10 {
            assert!(policy.backoff(attempt) <= Duration::from_millis(300));
        }
        assert!(policy.backoff(1) >= Duration::from_millis(50));
    }
}
