use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

use super::{KeyTtl, SharedStore};
use crate::clock::{offset, Clock, SystemClock};
use crate::error::{ErrorCode, Result, TollgateError};

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredValue {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// In-process store with the same atomicity as Redis for a single process.
///
/// Each operation runs under the DashMap shard lock for its key. Expiry is
/// lazy and driven by the injected [`Clock`].
#[derive(Debug)]
pub struct InMemoryStore {
    entries: DashMap<String, StoredValue>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    fn expiry(&self, ttl: Duration) -> DateTime<Utc> {
        offset(self.clock.now(), ttl)
    }

    /// Entry for `key`, treating expired values as vacant.
    fn live_entry(&self, key: &str) -> Entry<'_, String, StoredValue> {
        let now = self.clock.now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(occupied) if occupied.get().is_expired(now) => {
                occupied.remove();
                self.entries.entry(key.to_string())
            }
            entry => entry,
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_counter(key: &str, raw: &str) -> Result<i64> {
    raw.parse::<i64>().map_err(|_| {
        TollgateError::with_internal(
            ErrorCode::StoreError,
            "Value is not an integer",
            format!("key {} holds a non-integer value", key),
        )
    })
}

#[async_trait]
impl SharedStore for InMemoryStore {
    async fn incr(&self, key: &str) -> Result<i64> {
        match self.live_entry(key) {
            Entry::Occupied(mut occupied) => {
                let next = parse_counter(key, &occupied.get().value)? + 1;
                occupied.get_mut().value = next.to_string();
                Ok(next)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue {
                    value: "1".to_string(),
                    expires_at: None,
                });
                Ok(1)
            }
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let expires_at = self.expiry(ttl);
        match self.live_entry(key) {
            Entry::Occupied(mut occupied) => {
                occupied.get_mut().expires_at = Some(expires_at);
                Ok(true)
            }
            Entry::Vacant(_) => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.live_entry(key) {
            Entry::Occupied(occupied) => Ok(Some(occupied.get().value.clone())),
            Entry::Vacant(_) => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|t| self.expiry(t));
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let now = self.clock.now();
        match self.live_entry(key) {
            Entry::Occupied(occupied) => match occupied.get().expires_at {
                Some(at) => Ok(KeyTtl::Expires((at - now).to_std().unwrap_or_default())),
                None => Ok(KeyTtl::Persistent),
            },
            Entry::Vacant(_) => Ok(KeyTtl::Missing),
        }
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let now = self.clock.now();
        Ok(self
            .entries
            .remove(key)
            .map(|(_, v)| !v.is_expired(now))
            .unwrap_or(false))
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let expires_at = ttl.map(|t| self.expiry(t));
        let replacement = StoredValue {
            value: new.to_string(),
            expires_at,
        };

        match (self.live_entry(key), expected) {
            (Entry::Occupied(mut occupied), Some(expected)) if occupied.get().value == expected => {
                *occupied.get_mut() = replacement;
                Ok(true)
            }
            (Entry::Vacant(vacant), None) => {
                vacant.insert(replacement);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn incr_with_expiry(&self, key: &str, window: Duration) -> Result<i64> {
        let expires_at = self.expiry(window);
        match self.live_entry(key) {
            Entry::Occupied(mut occupied) => {
                let next = parse_counter(key, &occupied.get().value)? + 1;
                occupied.get_mut().value = next.to_string();
                Ok(next)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue {
                    value: "1".to_string(),
                    expires_at: Some(expires_at),
                });
                Ok(1)
            }
        }
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;

    fn store() -> (InMemoryStore, MockClock) {
        let clock = MockClock::new();
        (InMemoryStore::with_clock(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_incr_with_expiry_resets_after_window() {
        let (store, clock) = store();
        let window = Duration::from_secs(60);

        assert_eq!(store.incr_with_expiry("rate:1.2.3.4", window).await.unwrap(), 1);
        assert_eq!(store.incr_with_expiry("rate:1.2.3.4", window).await.unwrap(), 2);

        clock.advance(chrono::Duration::seconds(59));
        assert_eq!(store.incr_with_expiry("rate:1.2.3.4", window).await.unwrap(), 3);

        clock.advance(chrono::Duration::seconds(1));
        assert_eq!(store.incr_with_expiry("rate:1.2.3.4", window).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ttl_states() {
        let (store, clock) = store();

        assert_eq!(store.ttl("missing").await.unwrap(), KeyTtl::Missing);

        store.incr("counter").await.unwrap();
        assert_eq!(store.ttl("counter").await.unwrap(), KeyTtl::Persistent);

        store.expire("counter", Duration::from_secs(10)).await.unwrap();
        clock.advance(chrono::Duration::milliseconds(2500));
        let ttl = store.ttl("counter").await.unwrap();
        assert_eq!(ttl, KeyTtl::Expires(Duration::from_millis(7500)));
        assert_eq!(ttl.as_secs_ceil(), Some(8));
    }

    #[tokio::test]
    async fn test_expire_on_missing_key() {
        let (store, _) = store();
        assert!(!store.expire("nope", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_compare_and_set() {
        let (store, _) = store();

        assert!(store.compare_and_set("lease", None, "worker-a", None).await.unwrap());
        assert!(!store.compare_and_set("lease", None, "worker-b", None).await.unwrap());
        assert!(!store
            .compare_and_set("lease", Some("worker-b"), "worker-c", None)
            .await
            .unwrap());
        assert!(store
            .compare_and_set("lease", Some("worker-a"), "worker-c", None)
            .await
            .unwrap());
        assert_eq!(store.get("lease").await.unwrap().as_deref(), Some("worker-c"));
    }

    #[tokio::test]
    async fn test_incr_rejects_non_integer() {
        let (store, _) = store();
        store.set("name", "alice", None).await.unwrap();
        let err = store.incr("name").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::StoreError);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_exact() {
        let store = Arc::new(InMemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.incr_with_expiry("hits", Duration::from_secs(60)).await.unwrap()
            }));
        }

        let mut seen: Vec<i64> = Vec::new();
        for h in handles {
            seen.push(h.await.unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, (1..=50).collect::<Vec<_>>());
    }
}
