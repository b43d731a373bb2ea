//! Global dispatch rate limiter.
//!
//! Token bucket shared by every campaign worker so the process never
//! exceeds the carrier's dial rate regardless of campaign count.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;

pub struct RateLimiter {
    per_second: u32,
    state: Mutex<Bucket>,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(per_second: u32) -> Self {
        Self {
            per_second,
            state: Mutex::new(Bucket {
                tokens: per_second as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Wait until a dispatch token is available.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.state.lock().await;
                let elapsed = bucket.last_refill.elapsed().as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.per_second as f64)
                    .min(self.per_second as f64);
                bucket.last_refill = Instant::now();

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64(
                        (1.0 - bucket.tokens) / self.per_second as f64,
                    ))
                }
            };
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_is_bounded_by_bucket_size() {
        let limiter = RateLimiter::new(10);
        let start = Instant::now();
        // The first 10 acquisitions drain the bucket without sleeping.
        for _ in 0..10 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));

        // The 11th has to wait for a refill.
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
