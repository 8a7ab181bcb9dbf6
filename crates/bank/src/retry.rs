use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Exponential backoff with jitter for transient failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`
    /// capped, plus up to 25% random jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.cap);
        let jitter_ms = rand::thread_rng().gen_range(0..=exp.as_millis() as u64 / 4);
        exp + Duration::from_millis(jitter_ms)
    }
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Per-key token bucket; the bank variant keys on profile id. Capacity is
/// one token so bursts degrade to a steady `rate_per_sec`.
pub struct RateLimiter {
    rate_per_sec: f64,
    buckets: Mutex<HashMap<i64, Bucket>>,
}

impl RateLimiter {
    pub fn new(rate_per_sec: f64) -> Self {
        Self {
            rate_per_sec: rate_per_sec.max(0.001),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Waits until a token is available for `key`, then consumes it.
    pub async fn acquire(&self, key: i64) {
        loop {
            let wait = {
                let mut buckets = self.buckets.lock().await;
                let now = Instant::now();
                let bucket = buckets.entry(key).or_insert(Bucket {
                    tokens: 1.0,
                    last_refill: now,
                });

                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(1.0);
                bucket.last_refill = now;

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64(
                        (1.0 - bucket.tokens) / self.rate_per_sec,
                    ))
                }
            };

            match wait {
                None => return,
                Some(wait) => tokio::time::sleep(wait).await,
            }
        }
    }
}
