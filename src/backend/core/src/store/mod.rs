//! Shared counter store.
//!
//! The admission gate never holds in-process locks around its counters; every
//! decision is made from the value an atomic store primitive returns. This
//! module defines that primitive set and two implementations:
//!
//! - **InMemoryStore**: single-process emulation used by tests and local runs
//! - **RedisStore**: the production store, shared by every process

mod memory;
mod redis;

pub use self::memory::InMemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// Remaining lifetime of a key, as reported by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key does not exist.
    Missing,
    /// The key exists without an expiry.
    Persistent,
    /// The key expires after this long.
    Expires(Duration),
}

impl KeyTtl {
    /// Whole seconds until expiry, rounded up. `None` unless the key expires.
    pub fn as_secs_ceil(&self) -> Option<u64> {
        match self {
            KeyTtl::Expires(d) => {
                let secs = d.as_secs();
                Some(if d.subsec_nanos() > 0 { secs + 1 } else { secs })
            }
            _ => None,
        }
    }
}

/// Atomic key-value primitives shared by all processes.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Atomically increment an integer key, creating it at 1.
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Set the key's expiry. Returns false if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    async fn ttl(&self, key: &str) -> Result<KeyTtl>;

    /// Delete a key. Returns true if it existed.
    async fn del(&self, key: &str) -> Result<bool>;

    /// Write `new` only if the current value equals `expected` (`None` meaning
    /// the key must be absent). Returns whether the write happened.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool>;

    /// Increment a window counter, arming its expiry on the first increment.
    ///
    /// The default issues INCR then EXPIRE as two calls; a crash between them
    /// leaves a counter without expiry. Implementations that can run both
    /// server-side override this.
    async fn incr_with_expiry(&self, key: &str, window: Duration) -> Result<i64> {
        let count = self.incr(key).await?;
        if count == 1 {
            self.expire(key, window).await?;
        }
        Ok(count)
    }

    /// Liveness check.
    async fn ping(&self) -> Result<()>;

    fn name(&self) -> &'static str;
}
