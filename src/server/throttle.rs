//! Per-peer token-bucket rate limiting (spec.md §2, "throttle a
//! misbehaving or oversubscribed peer").

use parking_lot::Mutex;
use std::time::Instant;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket refilled at `rate` tokens/second, capped at `burst`.
pub struct Throttle {
    rate: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl Throttle {
    pub fn new(rate: u32, burst: u32) -> Self {
        Throttle {
            rate: rate as f64,
            burst: burst as f64,
            bucket: Mutex::new(Bucket {
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Attempts to spend `cost` tokens. Returns `false` if the bucket
    /// doesn't have enough, in which case no tokens are spent.
    pub fn try_acquire(&self, cost: u32) -> bool {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.last_refill = now;

        let cost = cost as f64;
        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            true
        } else {
            false
        }
    }
}
