//! # Retrying deletions with exponential backoff
//!
//! [`BackoffPolicy`] computes the pause after a failed attempt: `initial × factor^n`,
//! clamped to `max_delay`, then scaled by a uniform jitter in `[1 - jitter, 1 + jitter]`
//! and clamped again. The base is derived only from the attempt number, so jitter
//! never compounds.
//!
//! [`BackoffExecutor`] runs an API operation under that policy. Errors are
//! sorted by [`classify`]:
//! - **not found**: the resource is already gone, which counts as success;
//! - **timeouts and throttling** (408, 429, 504, `Timeout`, `ServerTimeout`,
//!   `TooManyRequests`, transport failures): retried;
//! - **everything else**: fatal, returned after the first attempt.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Retry backoff policy
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial: Duration,
    /// Multiplicative growth factor.
    pub factor: f64,
    /// Relative jitter; `0.1` means ±10%.
    pub jitter: f64,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial: Duration::from_millis(100),
            factor: 2.0,
            jitter: 0.1,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt + 1` (0-indexed), without jitter.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let max_secs = self.max_delay.as_secs_f64();
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial.as_secs_f64() * self.factor.powi(exp);

        if !secs.is_finite() || secs < 0.0 || secs > max_secs {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Jittered delay using the thread-local RNG.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    /// Jittered delay with a caller-supplied RNG.
    pub fn delay_with<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        let spread = self.jitter.clamp(0.0, 1.0);
        if spread == 0.0 {
            return base;
        }
        let scale = 1.0 + rng.gen_range(-spread..=spread);
        base.mul_f64(scale).min(self.max_delay)
    }
}

/// How an API error affects a deletion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    AlreadyGone,
    Retryable,
    Fatal,
}

const RETRYABLE_CODES: [u16; 3] = [408, 429, 504];
const RETRYABLE_REASONS: [&str; 3] = ["Timeout", "ServerTimeout", "TooManyRequests"];

#[must_use]
pub fn classify(err: &kube::Error) -> ErrorClass {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => ErrorClass::AlreadyGone,
        kube::Error::Api(resp)
            if RETRYABLE_CODES.contains(&resp.code)
                || RETRYABLE_REASONS.contains(&resp.reason.as_str()) =>
        {
            ErrorClass::Retryable
        }
        kube::Error::HyperError(_) | kube::Error::Service(_) | kube::Error::ReadEvents(_) => {
            ErrorClass::Retryable
        }
        _ => ErrorClass::Fatal,
    }
}

/// Successful result of a retried deletion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted { attempts: u32 },
    AlreadyGone { attempts: u32 },
}

impl DeleteOutcome {
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            DeleteOutcome::Deleted { attempts } | DeleteOutcome::AlreadyGone { attempts } => *attempts,
        }
    }
}

#[derive(Debug, Error)]
pub enum DeleteError {
    #[error("delete failed permanently after {attempts} attempt(s): {source}")]
    Fatal {
        attempts: u32,
        #[source]
        source: kube::Error,
    },

    #[error("delete still failing after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: kube::Error,
    },

    #[error("delete cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },
}

impl DeleteError {
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            DeleteError::Fatal { attempts, .. }
            | DeleteError::RetriesExhausted { attempts, .. }
            | DeleteError::Cancelled { attempts } => *attempts,
        }
    }
}

/// Runs an API operation under a [`BackoffPolicy`]
#[derive(Debug, Clone, Default)]
pub struct BackoffExecutor {
    policy: BackoffPolicy,
}

impl BackoffExecutor {
    #[must_use]
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Calls `op` until it succeeds, reports not-found, fails fatally, runs
    /// out of attempts, or `cancel` fires during a pause.
    pub async fn execute<F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<DeleteOutcome, DeleteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), kube::Error>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempts = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(DeleteError::Cancelled { attempts });
            }
            attempts += 1;

            let err = match op().await {
                Ok(()) => return Ok(DeleteOutcome::Deleted { attempts }),
                Err(err) => err,
            };

            match classify(&err) {
                ErrorClass::AlreadyGone => return Ok(DeleteOutcome::AlreadyGone { attempts }),
                ErrorClass::Fatal => return Err(DeleteError::Fatal { attempts, source: err }),
                ErrorClass::Retryable if attempts >= max_attempts => {
                    warn!(attempts, error = %err, "Giving up on retryable error");
                    return Err(DeleteError::RetriesExhausted { attempts, source: err });
                }
                ErrorClass::Retryable => {
                    let delay = self.policy.delay(attempts - 1);
                    debug!(attempts, delay_ms = delay.as_millis(), error = %err, "Retrying after backoff");
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return Err(DeleteError::Cancelled { attempts }),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} ({code})"),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn base_delays_double_and_cap() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.base_delay(0), Duration::from_millis(100));
        assert_eq!(policy.base_delay(1), Duration::from_millis(200));
        assert_eq!(policy.base_delay(3), Duration::from_millis(800));
        assert_eq!(policy.base_delay(20), Duration::from_secs(30));
        assert_eq!(policy.base_delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let policy = BackoffPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 0..6 {
            let base = policy.base_delay(attempt).as_secs_f64();
            for _ in 0..100 {
                let d = policy.delay_with(attempt, &mut rng).as_secs_f64();
                assert!(d >= base * 0.9 - 1e-9 && d <= base * 1.1 + 1e-9, "{d} vs {base}");
            }
        }
        let capped = policy.delay_with(30, &mut rng);
        assert!(capped <= Duration::from_secs(30));
    }

    #[test]
    fn classifies_api_errors() {
        assert_eq!(classify(&api_error(404, "NotFound")), ErrorClass::AlreadyGone);
        assert_eq!(classify(&api_error(429, "TooManyRequests")), ErrorClass::Retryable);
        assert_eq!(classify(&api_error(504, "Timeout")), ErrorClass::Retryable);
        assert_eq!(classify(&api_error(500, "ServerTimeout")), ErrorClass::Retryable);
        assert_eq!(classify(&api_error(408, "")), ErrorClass::Retryable);
        assert_eq!(classify(&api_error(403, "Forbidden")), ErrorClass::Fatal);
        assert_eq!(classify(&api_error(409, "Conflict")), ErrorClass::Fatal);
        assert_eq!(classify(&api_error(500, "InternalError")), ErrorClass::Fatal);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_errors_exhaust_after_exactly_five_attempts() {
        let executor = BackoffExecutor::default();
        let calls = AtomicU32::new(0);
        let result = executor
            .execute(&CancellationToken::new(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(api_error(429, "TooManyRequests")) }
            })
            .await;

        assert!(matches!(result, Err(DeleteError::RetriesExhausted { attempts: 5, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_is_success_without_retry() {
        let executor = BackoffExecutor::default();
        let calls = AtomicU32::new(0);
        let result = executor
            .execute(&CancellationToken::new(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(api_error(404, "NotFound")) }
            })
            .await;

        assert_eq!(result.unwrap(), DeleteOutcome::AlreadyGone { attempts: 1 });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_stops_immediately() {
        let executor = BackoffExecutor::default();
        let calls = AtomicU32::new(0);
        let result = executor
            .execute(&CancellationToken::new(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(api_error(403, "Forbidden")) }
            })
            .await;

        assert!(matches!(result, Err(DeleteError::Fatal { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
        let executor = BackoffExecutor::default();
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let result = executor
            .execute(&CancellationToken::new(), || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(api_error(504, "Timeout"))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), DeleteOutcome::Deleted { attempts: 3 });
        // 100ms + 200ms, each within ±10%
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(270) && waited <= Duration::from_millis(340));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let executor = BackoffExecutor::new(BackoffPolicy {
            initial: Duration::from_secs(10),
            ..BackoffPolicy::default()
        });
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let result = executor
            .execute(&cancel, || async { Err(api_error(429, "TooManyRequests")) })
            .await;
        assert!(matches!(result, Err(DeleteError::Cancelled { attempts: 1 })));
    }
}
