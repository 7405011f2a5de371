//! # conn-limiter
//!
//! Per-key connection rate limiting for the gateway. Each key (normally a
//! client IP address) owns a bucket of points that refills completely at the
//! start of every window; consuming from an empty bucket fails until the
//! window rolls over.
//!
//! The admission layer only sees the [`RateLimiter`] trait, so the in-memory
//! store shipped here can be swapped for a shared one without touching the
//! callers.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use conn_limiter::{LimiterOptions, MemoryRateLimiter, RateLimiter};
//!
//! # async fn example() {
//! let limiter = MemoryRateLimiter::new(LimiterOptions::default()); // 10 per second
//!
//! match limiter.consume("203.0.113.7").await {
//!     Ok(consumed) => println!("{} points left", consumed.remaining_points),
//!     Err(exceeded) => println!("retry in {:?}", exceeded.resets_in),
//! }
//! # }
//! ```

mod limiter;
mod memory;

pub use limiter::{
    Consumed, LimiterOptions, RateLimitExceeded, RateLimiter, CONNECTION_KEY_PREFIX,
};
pub use memory::MemoryRateLimiter;
