use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::limiter::{Consumed, LimiterOptions, RateLimitExceeded, RateLimiter};

/// Points taken from one key during its current window.
#[derive(Debug)]
struct Bucket {
    consumed: u32,
    expires_at: Instant,
    blocked: bool,
}

impl Bucket {
    fn fresh(now: Instant, duration: Duration) -> Self {
        Self {
            consumed: 0,
            expires_at: now + duration,
            blocked: false,
        }
    }
}

/// In-process [`RateLimiter`] backed by a [`DashMap`].
///
/// A consume call holds the shard lock for its key while it updates the
/// bucket, which makes per-key consumption atomic without a global lock.
/// Expired buckets are reset lazily on the next consume and can be purged
/// with [`purge_expired`](Self::purge_expired) or a background sweeper.
pub struct MemoryRateLimiter {
    options: LimiterOptions,
    buckets: DashMap<String, Bucket>,
}

impl MemoryRateLimiter {
    pub fn new(options: LimiterOptions) -> Self {
        Self {
            options,
            buckets: DashMap::new(),
        }
    }

    pub fn options(&self) -> &LimiterOptions {
        &self.options
    }

    /// Number of keys currently tracked, expired or not.
    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }

    /// Drop every bucket whose window has ended. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| bucket.expires_at > now);
        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            debug!(removed, remaining = self.buckets.len(), "purged expired rate-limit buckets");
        }
        removed
    }

    /// Spawn a task that calls [`purge_expired`](Self::purge_expired) every
    /// `every`. The task exits on its own once the limiter is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(limiter) => {
                        limiter.purge_expired();
                    }
                    None => {
                        debug!("rate limiter dropped; sweeper exiting");
                        return;
                    }
                }
            }
        })
    }

    fn consume_now(&self, key: &str, now: Instant) -> Result<Consumed, RateLimitExceeded> {
        let options = &self.options;
        let mut bucket = self
            .buckets
            .entry(options.storage_key(key))
            .or_insert_with(|| Bucket::fresh(now, options.duration));

        if now >= bucket.expires_at {
            *bucket = Bucket::fresh(now, options.duration);
        }

        bucket.consumed = bucket.consumed.saturating_add(1);

        if bucket.consumed > options.points {
            if !options.block_duration.is_zero() && !bucket.blocked {
                bucket.blocked = true;
                bucket.expires_at = now + options.block_duration;
            }
            trace!(key, consumed = bucket.consumed, "rate limit exceeded");
            return Err(RateLimitExceeded {
                key: key.to_string(),
                consumed: bucket.consumed,
                limit: options.points,
                resets_in: bucket.expires_at.saturating_duration_since(now),
            });
        }

        Ok(Consumed {
            remaining_points: options.points - bucket.consumed,
            resets_in: bucket.expires_at.saturating_duration_since(now),
        })
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn consume(&self, key: &str) -> Result<Consumed, RateLimitExceeded> {
        self.consume_now(key, Instant::now())
    }
}
