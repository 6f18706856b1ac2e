//! Outbound rate limiting for provider calls
//!
//! Token bucket shared (via `Clone`) by every engine talking to the same
//! provider. Each `connect` and `fetch` takes one token.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("rate limiter wait cancelled")]
    Cancelled,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Clone)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    /// `None` = unlimited
    bucket: Option<Arc<Mutex<Bucket>>>,
}

impl RateLimiter {
    /// Bucket starting full with `capacity` tokens, refilled at `refill_per_sec`
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            capacity,
            refill_per_sec: refill_per_sec.max(f64::MIN_POSITIVE),
            bucket: Some(Arc::new(Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }))),
        }
    }

    /// A limiter that never waits (tests, local sources)
    pub fn unlimited() -> Self {
        Self {
            capacity: f64::INFINITY,
            refill_per_sec: f64::INFINITY,
            bucket: None,
        }
    }

    /// Take one token, suspending until one is available or `cancel` fires
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), RateLimitError> {
        let Some(bucket) = &self.bucket else {
            return if cancel.is_cancelled() {
                Err(RateLimitError::Cancelled)
            } else {
                Ok(())
            };
        };

        loop {
            if cancel.is_cancelled() {
                return Err(RateLimitError::Cancelled);
            }

            let wait = {
                let mut bucket = bucket.lock().await;
                self.refill(&mut bucket);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return Ok(());
                }
                Duration::try_from_secs_f64((1.0 - bucket.tokens) / self.refill_per_sec)
                    .unwrap_or(Duration::MAX)
            };

            tracing::trace!(wait_ms = wait.as_millis() as u64, "Rate limit reached, waiting");
            tokio::select! {
                _ = cancel.cancelled() => return Err(RateLimitError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Whole tokens currently available
    pub async fn available(&self) -> u32 {
        match &self.bucket {
            None => u32::MAX,
            Some(bucket) => {
                let mut bucket = bucket.lock().await;
                self.refill(&mut bucket);
                bucket.tokens.floor() as u32
            }
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;
    }
}
