//! Token Bucket Rate Limiter
//!
//! Holds up to `rate` tokens and refills one every `per / rate`. A call takes
//! a token or is rejected with `RateLimited`; it never waits.
//!
//! ```text
//! RateLimiter::new(5, 1s)
//!
//!   t=0ms    [●●●●●]  5 calls pass
//!   t=0ms    [     ]  6th call -> RateLimited
//!   t=200ms  [●    ]  one token refilled
//! ```

use super::{handler_fn, Handler, Middleware};
use crate::error::ClientError;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
struct Bucket {
    tokens: u32,
    last_refill: Instant,
}

/// Shared token bucket.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: u32,
    interval: Duration,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Allow `rate` calls per `per`, starting with a full bucket.
    ///
    /// A `rate` of zero is treated as one.
    pub fn new(rate: u32, per: Duration) -> Self {
        let capacity = rate.max(1);
        Self {
            capacity,
            interval: per / capacity,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Bucket> {
        self.bucket
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        if bucket.tokens >= self.capacity || self.interval.is_zero() {
            bucket.tokens = self.capacity;
            bucket.last_refill = now;
            return;
        }

        let elapsed = now.duration_since(bucket.last_refill);
        let earned = (elapsed.as_nanos() / self.interval.as_nanos()) as u64;
        if earned == 0 {
            return;
        }

        let tokens = (bucket.tokens as u64 + earned).min(self.capacity as u64) as u32;
        if tokens == self.capacity {
            bucket.last_refill = now;
        } else {
            bucket.last_refill += self.interval * earned as u32;
        }
        bucket.tokens = tokens;
    }

    /// Take one token if available.
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.lock();
        self.refill(&mut bucket);
        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Tokens available right now.
    pub fn available(&self) -> u32 {
        let mut bucket = self.lock();
        self.refill(&mut bucket);
        bucket.tokens
    }

    /// Middleware rejecting calls once the bucket is empty.
    pub fn middleware(self: &Arc<Self>) -> Middleware {
        let limiter = self.clone();
        Arc::new(move |next: Handler| {
            let limiter = limiter.clone();
            handler_fn(move |msg| {
                let next = next.clone();
                let allowed = limiter.try_acquire();
                async move {
                    if !allowed {
                        debug!(
                            topic = %msg.topic,
                            partition = msg.partition,
                            offset = msg.offset,
                            "Rate limit exceeded"
                        );
                        return Err(ClientError::RateLimited);
                    }
                    next(msg).await
                }
            })
        })
    }
}
