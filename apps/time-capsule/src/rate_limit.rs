use tokio::sync::Mutex;
use tokio::time::Instant;

pub const DEFAULT_RATE_LIMIT_BURST: u32 = 20;
pub const DEFAULT_RATE_LIMIT_PER_SECOND: u32 = 20;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

/// Process-wide token bucket shared by every request.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_second: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(burst: u32, per_second: u32) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            capacity,
            refill_per_second: f64::from(per_second),
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Takes one token. On refusal returns how long until a token is available.
    pub async fn try_acquire(&self) -> Result<(), u64> {
        let mut bucket = self.bucket.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.refilled_at).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_second).min(self.capacity);
        bucket.refilled_at = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(());
        }
        if self.refill_per_second <= 0.0 {
            return Err(1_000);
        }
        let wait_ms = ((1.0 - bucket.tokens) / self.refill_per_second * 1_000.0).ceil();
        Err(wait_ms.max(1.0) as u64)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_LIMIT_BURST, DEFAULT_RATE_LIMIT_PER_SECOND)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::RateLimiter;

    #[tokio::test(start_paused = true)]
    async fn burst_is_spent_then_refilled_over_time() {
        let limiter = RateLimiter::new(3, 2);
        for _ in 0..3 {
            assert!(limiter.try_acquire().await.is_ok());
        }
        let retry_after_ms = limiter.try_acquire().await.err().unwrap_or_default();
        assert_eq!(retry_after_ms, 500);

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(limiter.try_acquire().await.is_ok());
        assert!(limiter.try_acquire().await.is_err());

        tokio::time::advance(Duration::from_secs(10)).await;
        for _ in 0..3 {
            assert!(limiter.try_acquire().await.is_ok());
        }
        assert!(limiter.try_acquire().await.is_err());
    }
}
