//! Per-user token-bucket admission control for message submissions.
//!
//! Buckets are keyed by `user_id` and outlive any individual connection, so
//! a reconnect cannot be used to bypass the limiter.

use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;

#[derive(Debug)]
struct RateBucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct AdmissionController {
    capacity: f64,
    refill_per_second: f64,
    buckets: DashMap<String, Mutex<RateBucket>>,
}

impl AdmissionController {
    pub fn new(capacity: f64, refill_per_second: f64) -> Self {
        Self {
            capacity,
            refill_per_second,
            buckets: DashMap::new(),
        }
    }

    /// Refill lazily, then consume one token if available.
    ///
    /// A first-seen user starts with a full bucket. If `now` is behind the
    /// bucket's last refill (backward clock adjustment), the token count is
    /// left unchanged and the refill point is advanced to `now`.
    pub fn try_admit(&self, user_id: &str, now: Instant) -> bool {
        let entry = self
            .buckets
            .entry(user_id.to_string())
            .or_insert_with(|| {
                Mutex::new(RateBucket {
                    tokens: self.capacity,
                    last_refill: now,
                })
            });
        let mut bucket = entry.lock();

        if let Some(elapsed) = now.checked_duration_since(bucket.last_refill) {
            bucket.tokens =
                (bucket.tokens + elapsed.as_secs_f64() * self.refill_per_second).min(self.capacity);
        }
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
