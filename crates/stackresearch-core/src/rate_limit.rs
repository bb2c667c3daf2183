use tokio::sync::Mutex;
use tokio::time::{Duration, Instant, sleep};
use tracing::trace;

use crate::config::RateLimitConfig;

/// Token bucket shared by every model call of a session.
///
/// The bucket starts empty and refills continuously at `requests_per_second`,
/// holding at most `max_bucket_size` tokens. Waiters poll every `check_every`.
#[derive(Debug)]
pub struct RateLimiter {
    requests_per_second: f64,
    max_bucket_size: f64,
    check_every: Duration,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            requests_per_second: config.requests_per_second,
            max_bucket_size: config.max_bucket_size,
            check_every: Duration::from_millis(config.check_every_ms),
            bucket: Mutex::new(Bucket {
                tokens: 0.0,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token if available without waiting.
    pub async fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens =
            (bucket.tokens + elapsed * self.requests_per_second).min(self.max_bucket_size);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Wait until a token is available and take it.
    pub async fn acquire(&self) {
        while !self.try_acquire().await {
            trace!(wait_ms = self.check_every.as_millis() as u64, "rate limiter waiting");
            sleep(self.check_every).await;
        }
    }
}
