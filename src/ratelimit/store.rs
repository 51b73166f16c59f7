//! Counter store capability for abstracting networked and in-memory backends.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors surfaced by a counter store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store could not be reached or refused the operation
    #[error("Counter store unavailable: {0}")]
    Unavailable(String),

    /// A counter key holds a value that cannot be incremented
    #[error("Value stored at {0} is not an integer")]
    NotAnInteger(String),

    /// Redis client errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Result type alias for counter store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Trait for counter store implementations.
///
/// The rate decision engine coordinates exclusively through these
/// operations; correctness relies on `increment` being atomic per key,
/// never on process-local locking.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment the counter at `key` and return the new value.
    ///
    /// An absent or expired key is created at 1 with no expiry; an existing
    /// key keeps its current expiry.
    async fn increment(&self, key: &str) -> StoreResult<i64>;

    /// Set or overwrite the time-to-live of `key`. Missing keys are ignored.
    async fn set_expiry(&self, key: &str, ttl: Duration) -> StoreResult<()>;

    /// Read the value at `key`, if present and not expired.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Unconditionally write `value` at `key` with a time-to-live.
    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Write `value` at `key` with a time-to-live only if no live value exists.
    ///
    /// Returns `true` when this call created the key.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;
}

/// Convert a TTL to whole milliseconds, never rounding a non-zero TTL to zero.
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
    millis.max(1)
}
