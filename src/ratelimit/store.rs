//! Shared counter store abstraction.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by a counter store.
///
/// Any of these makes a single admission check inconclusive; callers decide
/// whether that means allow or deny.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The Redis client reported a failure
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The store did not answer in time
    #[error("store did not respond within {0:?}")]
    Timeout(Duration),

    /// The store answered with something the engine cannot interpret
    #[error("malformed store response: {0}")]
    Malformed(String),

    /// The store is known to be unreachable
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Trait for shared counter stores.
///
/// Every gateway process talks to the same store. Mutual exclusion between
/// processes is delegated entirely to `incr` being atomic.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment `key` by one and return the new value.
    /// A missing key counts from zero.
    async fn incr(&self, key: &str) -> Result<u64, StoreError>;

    /// Arm an expiry on `key` unless it already has one.
    /// Returns `true` if an expiry was set by this call.
    async fn set_expiry_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Remaining time to live for `key`.
    /// `None` if the key is missing or has no expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    /// Check that the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;
}
