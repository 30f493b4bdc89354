//! Token-bucket rate limiting for oracle dispatch.

use std::time::Duration;

use tokio::{sync::Mutex, time::Instant};

/// A token bucket sized to a per-minute request limit.
///
/// Capacity equals `rate_limit_per_minute`; the bucket refills at
/// capacity/60 tokens per second. Each dispatch consumes one token and
/// waits when none is available. Shared across concurrent batch dispatch
/// through the internal mutex.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Creates a bucket allowing `per_minute` dispatches per minute,
    /// starting full.
    #[must_use]
    pub fn new(per_minute: u32) -> Self {
        let capacity = f64::from(per_minute.max(1));
        Self {
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Takes one token, sleeping until the refill makes one available.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.capacity / 60.0).min(self.capacity);
                state.last_refill = now;
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                // Seconds until one full token exists.
                (1.0 - state.tokens) * 60.0 / self.capacity
            };
            tokio::time::sleep(Duration::from_secs_f64(wait.max(0.01))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn waits_when_bucket_is_drained() {
        let limiter = RateLimiter::new(60);
        for _ in 0..60 {
            limiter.acquire().await;
        }
        let before = Instant::now();
        limiter.acquire().await;
        // 60/min refills one token per second.
        assert!(
            before.elapsed() >= Duration::from_millis(900),
            "61st acquire should wait for a refill"
        );
    }
}
