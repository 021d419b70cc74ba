//! Waiter - Bounded polling over the provider's eventual-consistency window
//!
//! The retry policy (how many attempts, how long between them) is a plain value,
//! and the actual sleeping goes through a [`Sleeper`], so both can be tested
//! without wall-clock delays.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::provider::{BoxFuture, ProviderError, ProviderResult};

/// Delay schedule between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay after every attempt
    Constant { delay_ms: u64 },
    /// `initial_ms` after the first attempt, growing by `step_ms` each time
    Linear { initial_ms: u64, step_ms: u64 },
}

/// Bounded retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn constant(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Constant {
                delay_ms: delay.as_millis() as u64,
            },
        }
    }

    pub fn linear(max_attempts: u32, initial: Duration, step: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Linear {
                initial_ms: initial.as_millis() as u64,
                step_ms: step.as_millis() as u64,
            },
        }
    }

    /// IAM role / instance profile propagation (about two minutes in total)
    pub fn iam_propagation() -> Self {
        Self::linear(15, Duration::from_secs(2), Duration::from_secs(1))
    }

    /// Short retry for throttled provider calls
    pub fn throttle() -> Self {
        Self::linear(4, Duration::from_secs(1), Duration::from_secs(1))
    }

    /// NAT gateway provisioning, which usually takes a few minutes
    pub fn nat_gateway() -> Self {
        Self::constant(40, Duration::from_secs(15))
    }

    /// Instance shutdown and dependency release during teardown
    pub fn teardown() -> Self {
        Self::constant(60, Duration::from_secs(5))
    }

    /// Delay to sleep after the given (1-based) attempt failed
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let attempt = u64::from(attempt.max(1));
        let ms = match self.backoff {
            Backoff::Constant { delay_ms } => delay_ms,
            Backoff::Linear {
                initial_ms,
                step_ms,
            } => initial_ms.saturating_add(step_ms.saturating_mul(attempt - 1)),
        };
        Duration::from_millis(ms)
    }

    /// Upper bound on the time spent sleeping; no sleep follows the last attempt
    pub fn max_total_wait(&self) -> Duration {
        (1..self.max_attempts).map(|n| self.delay_after(n)).sum()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::iam_propagation()
    }
}

/// Outcome of a single readiness probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe<T> {
    Ready(T),
    /// Not yet; the string says why
    Pending(String),
}

/// Source of delays between attempts
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration) -> BoxFuture<'_, ()>;
}

/// Real timer backed by tokio
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> BoxFuture<'_, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("Timed out after {attempts} attempts waiting for {resource}: {last_error}")]
    TimedOut {
        resource: String,
        attempts: u32,
        last_error: String,
    },

    /// The probe hit an error that polling cannot fix
    #[error("Waiting for {resource} failed: {cause}")]
    Failed {
        resource: String,
        #[source]
        cause: ProviderError,
    },
}

/// Polls probes under a [`RetryPolicy`]
///
/// Holds no per-wait state, so waiting again after a timeout starts clean.
#[derive(Clone)]
pub struct Waiter {
    sleeper: Arc<dyn Sleeper>,
}

impl Waiter {
    pub fn new(sleeper: Arc<dyn Sleeper>) -> Self {
        Self { sleeper }
    }

    /// Waiter using the tokio timer
    pub fn tokio() -> Self {
        Self::new(Arc::new(TokioSleeper))
    }

    /// Poll `probe` until it reports ready or the policy is exhausted
    ///
    /// The probe receives the 1-based attempt number. Provider errors that are
    /// transient (not ready, not found, throttled) count as pending; any other
    /// error ends the wait immediately.
    pub async fn wait_until<T, F, Fut>(
        &self,
        resource: &str,
        policy: &RetryPolicy,
        mut probe: F,
    ) -> Result<T, WaitError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = ProviderResult<Probe<T>>>,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut last_error = String::from("not attempted");

        for attempt in 1..=max_attempts {
            match probe(attempt).await {
                Ok(Probe::Ready(value)) => {
                    debug!("{} ready after {} attempt(s)", resource, attempt);
                    return Ok(value);
                }
                Ok(Probe::Pending(reason)) => last_error = reason,
                Err(e) if e.is_transient() => last_error = e.to_string(),
                Err(e) => {
                    return Err(WaitError::Failed {
                        resource: resource.to_string(),
                        cause: e,
                    });
                }
            }

            if attempt < max_attempts {
                let delay = policy.delay_after(attempt);
                debug!(
                    "{} not ready (attempt {}/{}): {}; retrying in {:?}",
                    resource, attempt, max_attempts, last_error, delay
                );
                self.sleeper.sleep(delay).await;
            }
        }

        Err(WaitError::TimedOut {
            resource: resource.to_string(),
            attempts: max_attempts,
            last_error,
        })
    }

    /// Run `op`, retrying only while it fails with a throttling error
    pub async fn retry_throttled<T, F, Fut>(&self, policy: &RetryPolicy, mut op: F) -> ProviderResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Err(e) if e.is_throttled() && attempt < max_attempts => {
                    let delay = policy.delay_after(attempt);
                    debug!("Throttled ({}); retrying in {:?}", e, delay);
                    self.sleeper.sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

impl Default for Waiter {
    fn default() -> Self {
        Self::tokio()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderErrorKind;
    use crate::testing::RecordingSleeper;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn linear_backoff_grows_by_step() {
        let policy = RetryPolicy::linear(4, Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(policy.delay_after(1), Duration::from_secs(2));
        assert_eq!(policy.delay_after(2), Duration::from_secs(3));
        assert_eq!(policy.delay_after(3), Duration::from_secs(4));
        assert_eq!(policy.max_total_wait(), Duration::from_secs(9));
    }

    #[test]
    fn constant_backoff_total_excludes_last_attempt() {
        let policy = RetryPolicy::constant(5, Duration::from_millis(500));
        assert_eq!(policy.max_total_wait(), Duration::from_secs(2));
    }

    #[test]
    fn iam_propagation_is_bounded() {
        let policy = RetryPolicy::iam_propagation();
        assert_eq!(policy.max_attempts, 15);
        assert_eq!(policy.max_total_wait(), Duration::from_secs(119));
    }

    #[test]
    fn policy_from_json() {
        let policy: RetryPolicy = serde_json::from_str(
            r#"{"max_attempts": 3, "backoff": {"type": "constant", "delay_ms": 250}}"#,
        )
        .unwrap();
        assert_eq!(policy, RetryPolicy::constant(3, Duration::from_millis(250)));
    }

    #[tokio::test]
    async fn never_ready_times_out_after_max_attempts() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let waiter = Waiter::new(sleeper.clone());
        let policy = RetryPolicy::constant(5, Duration::from_secs(3));
        let polls = AtomicU32::new(0);

        let result: Result<(), _> = waiter
            .wait_until("profile", &policy, |_| {
                polls.fetch_add(1, Ordering::SeqCst);
                async { Ok(Probe::Pending("still propagating".to_string())) }
            })
            .await;

        match result {
            Err(WaitError::TimedOut {
                attempts,
                last_error,
                ..
            }) => {
                assert_eq!(attempts, 5);
                assert_eq!(last_error, "still propagating");
            }
            other => panic!("Expected TimedOut, got {:?}", other),
        }
        assert_eq!(polls.load(Ordering::SeqCst), 5);
        assert_eq!(sleeper.delays(), vec![Duration::from_secs(3); 4]);
    }

    #[tokio::test]
    async fn ready_on_third_attempt() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let waiter = Waiter::new(sleeper.clone());
        let policy = RetryPolicy::linear(10, Duration::from_secs(1), Duration::from_secs(1));

        let value = waiter
            .wait_until("profile", &policy, |attempt| async move {
                if attempt < 3 {
                    Err(ProviderError::new("not yet").with_kind(ProviderErrorKind::NotReady))
                } else {
                    Ok(Probe::Ready(attempt))
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 3);
        assert_eq!(
            sleeper.delays(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
    }

    #[tokio::test]
    async fn hard_error_stops_waiting() {
        let waiter = Waiter::new(Arc::new(RecordingSleeper::default()));
        let policy = RetryPolicy::constant(5, Duration::from_secs(1));
        let polls = AtomicU32::new(0);

        let result: Result<(), _> = waiter
            .wait_until("profile", &policy, |_| {
                polls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::new("access denied")) }
            })
            .await;

        assert!(matches!(result, Err(WaitError::Failed { .. })));
        assert_eq!(polls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn waiting_again_after_timeout_starts_fresh() {
        let waiter = Waiter::new(Arc::new(RecordingSleeper::default()));
        let policy = RetryPolicy::constant(2, Duration::from_secs(1));
        let polls = AtomicU32::new(0);

        let probe = |_: u32| {
            let n = polls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n >= 3 {
                    Ok(Probe::Ready(n))
                } else {
                    Ok(Probe::Pending("no".to_string()))
                }
            }
        };

        assert!(waiter.wait_until("profile", &policy, probe).await.is_err());
        assert_eq!(waiter.wait_until("profile", &policy, probe).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn throttled_calls_are_retried_a_bounded_number_of_times() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let waiter = Waiter::new(sleeper.clone());
        let calls = AtomicU32::new(0);

        let result: ProviderResult<()> = waiter
            .retry_throttled(&RetryPolicy::throttle(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(ProviderError::new("Rate exceeded").with_kind(ProviderErrorKind::Throttled))
                }
            })
            .await;

        assert!(result.unwrap_err().is_throttled());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(sleeper.delays().len(), 3);
    }

    #[tokio::test]
    async fn non_throttled_errors_are_not_retried() {
        let waiter = Waiter::new(Arc::new(RecordingSleeper::default()));
        let calls = AtomicU32::new(0);

        let result: ProviderResult<()> = waiter
            .retry_throttled(&RetryPolicy::throttle(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::new("quota").with_kind(ProviderErrorKind::Conflict)) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
