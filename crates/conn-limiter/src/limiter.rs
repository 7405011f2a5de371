use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Key prefix used for connection-attempt limiting, so a store shared with
/// other limiters never mixes their buckets.
pub const CONNECTION_KEY_PREFIX: &str = "ws-connection-limit-ip";

/// Tuning for a [`RateLimiter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterOptions {
    /// Points available to a key per window.
    pub points: u32,
    /// Length of one window. The bucket refills fully when it elapses.
    pub duration: Duration,
    /// Extra time a key stays blocked once it overdraws its bucket.
    /// `Duration::ZERO` means the key is only blocked until the window ends.
    pub block_duration: Duration,
    /// Prepended to every key before it reaches the store.
    pub key_prefix: String,
}

impl Default for LimiterOptions {
    fn default() -> Self {
        Self {
            points: 10,
            duration: Duration::from_secs(1),
            block_duration: Duration::ZERO,
            key_prefix: CONNECTION_KEY_PREFIX.to_string(),
        }
    }
}

impl LimiterOptions {
    /// Set the points per window.
    #[must_use]
    pub fn with_points(mut self, points: u32) -> Self {
        self.points = points;
        self
    }

    /// Set the window length.
    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Set the block duration applied after an overdraw.
    #[must_use]
    pub fn with_block_duration(mut self, block_duration: Duration) -> Self {
        self.block_duration = block_duration;
        self
    }

    /// Build the storage key for a caller-supplied key.
    pub fn storage_key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }
}

/// A successful consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Consumed {
    /// Points still available to the key in the current window.
    pub remaining_points: u32,
    /// Time until the key's window resets.
    pub resets_in: Duration,
}

/// The key has no points left in the current window.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rate limit exceeded for '{key}' ({consumed} of {limit} points), resets in {resets_in:?}")]
pub struct RateLimitExceeded {
    pub key: String,
    pub consumed: u32,
    pub limit: u32,
    pub resets_in: Duration,
}

/// A per-key point bucket.
///
/// Implementations must make `consume` atomic per key: concurrent calls for
/// the same key are each counted exactly once, and calls for different keys
/// never interfere.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Take one point from `key`'s bucket.
    async fn consume(&self, key: &str) -> Result<Consumed, RateLimitExceeded>;
}
