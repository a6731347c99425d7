//! Per-channel token bucket.
//!
//! Sits in front of each provider adapter. When the bucket is empty a send waits
//! for a token instead of failing, which turns provider rate caps into
//! backpressure. The wait is bounded by the caller's channel timeout.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use herald_common::config::RateLimitConfig;

/// Lowest refill rate accepted, so a zero or negative setting cannot stall a channel forever.
const MIN_REFILL_PER_SEC: f64 = 0.001;

#[derive(Debug, Clone, PartialEq, Error)]
#[error("no send slot available within {0:?}")]
pub struct RateLimitExceeded(pub Duration);

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket with fractional refill.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(per_second: f64, burst: u32) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            capacity,
            refill_per_sec: per_second.max(MIN_REFILL_PER_SEC),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.per_second, config.burst)
    }

    /// Take one token, waiting up to `max_wait` for the bucket to refill.
    pub async fn acquire(&self, max_wait: Duration) -> Result<(), RateLimitExceeded> {
        let deadline = Instant::now() + max_wait;

        loop {
            let wait = {
                let mut state = self.state.lock().await;
                self.refill(&mut state);

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return Ok(());
                }

                Duration::from_secs_f64((1.0 - state.tokens) / self.refill_per_sec)
            };

            if Instant::now() + wait > deadline {
                return Err(RateLimitExceeded(max_wait));
            }

            tokio::time::sleep(wait).await;
        }
    }

    /// Tokens currently available (for monitoring and tests).
    pub async fn available(&self) -> f64 {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        state.tokens
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_block() {
        let bucket = TokenBucket::new(1.0, 3);

        for _ in 0..3 {
            bucket.acquire(Duration::ZERO).await.unwrap();
        }

        // Bucket empty and no time allowed to wait
        assert!(bucket.acquire(Duration::ZERO).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_refill() {
        let bucket = TokenBucket::new(2.0, 1);
        bucket.acquire(Duration::ZERO).await.unwrap();

        let started = Instant::now();
        bucket.acquire(Duration::from_secs(1)).await.unwrap();
        let waited = started.elapsed();

        assert!(waited >= Duration::from_millis(500), "waited {:?}", waited);
        assert!(waited < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_past_deadline() {
        let bucket = TokenBucket::new(0.1, 1);
        bucket.acquire(Duration::ZERO).await.unwrap();

        // Next token is 10s away
        let err = bucket.acquire(Duration::from_secs(2)).await.unwrap_err();
        assert_eq!(err, RateLimitExceeded(Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_is_capped() {
        let bucket = TokenBucket::new(100.0, 5);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(bucket.available().await, 5.0);
    }
}
