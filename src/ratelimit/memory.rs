//! In-memory counter store.
//!
//! Mirrors the semantics of the Redis binding closely enough for the rate
//! decision engine to be tested without a network dependency. Expiry is
//! measured on tokio's clock, so tests can drive it with a paused runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

use super::store::{CounterStore, StoreError, StoreResult};

/// A stored value with an optional deadline.
#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(value: impl Into<String>, ttl: Option<Duration>) -> Self {
        Self {
            value: value.into(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

/// Counter store backed by a concurrent map.
///
/// Per-key atomicity comes from the map's shard locks, which are only held
/// for the duration of a single operation.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: DashMap<String, StoredValue>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with `StoreError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Remaining time-to-live of a live key, or `None` if it is absent or
    /// has no expiry.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entry = self.entries.get(key)?;
        if entry.is_expired(now) {
            return None;
        }
        entry.expires_at.map(|deadline| deadline - now)
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    /// Whether the store holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store marked unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CounterStore for InMemoryStore {
    async fn increment(&self, key: &str) -> StoreResult<i64> {
        self.check_available()?;
        let now = Instant::now();

        let mut slot = self
            .entries
            .entry(key.to_owned())
            .or_insert_with(|| StoredValue::new("0", None));
        if slot.is_expired(now) {
            *slot = StoredValue::new("0", None);
        }

        let current: i64 = slot
            .value
            .parse()
            .map_err(|_| StoreError::NotAnInteger(key.to_owned()))?;
        let next = current + 1;
        slot.value = next.to_string();
        Ok(next)
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        self.check_available()?;
        let now = Instant::now();

        if let Some(mut slot) = self.entries.get_mut(key) {
            if !slot.is_expired(now) {
                slot.expires_at = Some(now + ttl);
            }
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_available()?;
        let now = Instant::now();

        self.entries.remove_if(key, |_, v| v.is_expired(now));
        Ok(self.entries.get(key).map(|v| v.value.clone()))
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.check_available()?;
        self.entries
            .insert(key.to_owned(), StoredValue::new(value, Some(ttl)));
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.check_available()?;
        let now = Instant::now();

        match self.entries.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_expired(now) {
                    return Ok(false);
                }
                occupied.insert(StoredValue::new(value, Some(ttl)));
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue::new(value, Some(ttl)));
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_increment_creates_counter_at_one() {
        let store = InMemoryStore::new();

        assert_eq!(store.increment("ip:10.0.0.1").await.unwrap(), 1);
        assert_eq!(store.increment("ip:10.0.0.1").await.unwrap(), 2);
        assert_eq!(store.ttl("ip:10.0.0.1"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_increment_keeps_existing_expiry() {
        let store = InMemoryStore::new();

        store.increment("k").await.unwrap();
        store.set_expiry("k", Duration::from_secs(1)).await.unwrap();

        tokio::time::advance(Duration::from_millis(400)).await;
        store.increment("k").await.unwrap();

        assert_eq!(store.ttl("k"), Some(Duration::from_millis(600)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_counter_restarts() {
        let store = InMemoryStore::new();

        store.increment("k").await.unwrap();
        store.increment("k").await.unwrap();
        store.set_expiry("k", Duration::from_secs(1)).await.unwrap();

        tokio::time::advance(Duration::from_secs(1)).await;

        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.increment("k").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_set_expiry_on_missing_key_is_ignored() {
        let store = InMemoryStore::new();

        assert_ok!(store.set_expiry("missing", Duration::from_secs(1)).await);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_increment_rejects_non_integer() {
        let store = InMemoryStore::new();
        store
            .set_with_expiry("k", "flag", Duration::from_secs(5))
            .await
            .unwrap();

        let err = store.increment("k").await.unwrap_err();
        assert!(matches!(err, StoreError::NotAnInteger(key) if key == "k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_if_absent() {
        let store = InMemoryStore::new();
        let ttl = Duration::from_secs(2);

        assert!(store.set_if_absent("block:k", "1", ttl).await.unwrap());
        assert!(!store.set_if_absent("block:k", "1", ttl).await.unwrap());

        tokio::time::advance(ttl).await;
        assert!(store.set_if_absent("block:k", "1", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_operation() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);

        assert!(matches!(
            store.increment("k").await,
            Err(StoreError::Unavailable(_))
        ));
        assert_err!(store.get("k").await);
        assert_err!(store.set_expiry("k", Duration::from_secs(1)).await);
        assert_err!(store.set_if_absent("k", "1", Duration::from_secs(1)).await);

        store.set_unavailable(false);
        assert_eq!(store.increment("k").await.unwrap(), 1);
    }
}
