//! # Deletion rate limiting
//!
//! One token bucket per policy. The bucket holds at most `rate` tokens (burst
//! equals one second of throughput) and refills continuously, so over any
//! window of `W` seconds no more than `rate * W + rate` deletions get through.
//!
//! Time comes from `tokio::time`, which lets tests drive the limiter with a
//! paused clock.

use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Rate limiting errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("Rate limiter wait cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for rate limiting operations
pub type RateLimitResult<T> = Result<T, RateLimitError>;

#[derive(Debug)]
struct Bucket {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(rate: f64) -> Self {
        let capacity = rate.max(1.0);
        Self {
            rate,
            capacity,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Takes one token, or returns how long until one is available.
    fn take(&mut self, now: Instant) -> Option<Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            None
        } else {
            let missing = 1.0 - self.tokens;
            Some(Duration::from_secs_f64(missing / self.rate))
        }
    }
}

/// Token bucket limiter shared by all deletions of one policy
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a limiter admitting `rate` deletions per second.
    pub fn new(rate: f64) -> RateLimitResult<Self> {
        validate_rate(rate)?;
        Ok(Self {
            bucket: Mutex::new(Bucket::new(rate)),
        })
    }

    /// Waits for a token. Returns [`RateLimitError::Cancelled`] without
    /// consuming a token if `cancel` fires first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> RateLimitResult<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(RateLimitError::Cancelled);
            }

            let wait = {
                let mut bucket = self.bucket.lock().await;
                match bucket.take(Instant::now()) {
                    None => return Ok(()),
                    Some(wait) => wait,
                }
            };

            trace!(wait_ms = wait.as_millis(), "Waiting for deletion token");
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(RateLimitError::Cancelled),
                () = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Takes a token if one is available right now.
    pub async fn try_acquire(&self) -> bool {
        self.bucket.lock().await.take(Instant::now()).is_none()
    }

    /// Changes the rate in place. Tokens accrued so far are kept, clamped to the new capacity.
    pub async fn reconfigure(&self, rate: f64) -> RateLimitResult<()> {
        validate_rate(rate)?;
        let mut bucket = self.bucket.lock().await;
        if (bucket.rate - rate).abs() < f64::EPSILON {
            return Ok(());
        }
        bucket.refill(Instant::now());
        bucket.rate = rate;
        bucket.capacity = rate.max(1.0);
        bucket.tokens = bucket.tokens.min(bucket.capacity);
        debug!(rate, "Reconfigured deletion rate limiter");
        Ok(())
    }

    pub async fn rate(&self) -> f64 {
        self.bucket.lock().await.rate
    }
}

fn validate_rate(rate: f64) -> RateLimitResult<()> {
    if rate.is_finite() && rate > 0.0 {
        Ok(())
    } else {
        Err(RateLimitError::ConfigurationError(format!(
            "deletion rate must be a positive number, got {rate}"
        )))
    }
}

/// Per-policy rate, falling back to `default` when unset or non-positive.
#[must_use]
pub fn effective_rate(configured: Option<i32>, default: u32) -> f64 {
    match configured {
        Some(rate) if rate > 0 => f64::from(rate),
        _ => f64::from(default.max(1)),
    }
}
