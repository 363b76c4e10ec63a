use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store cannot be reached. Mutating callers must fail fast on this.
    #[error("State store is unavailable: {0}")]
    Unavailable(String),
    #[error("Value at {0} is not an integer")]
    NotAnInteger(String),
    #[error("Value at {0} could not be decoded: {1}")]
    Decode(String, String),
    #[error("Value could not be encoded: {0}")]
    Encode(String),
}

/// A process-wide mapping of stable string keys to typed values with per-key
/// expiry. All room-transient state (DJ slot, playback record, vote session,
/// sync offsets) lives behind this trait so multiple backend instances can
/// share one backing store.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<Value>>;

    async fn put(&self, key: &str, value: Value, ttl: Option<Duration>) -> StoreResult<()>;

    async fn remove(&self, key: &str) -> StoreResult<()>;

    /// Atomically replaces the value at `key`, provided the current value
    /// matches `expected`. `None` means "absent" on both sides, so this
    /// doubles as insert-if-missing and delete-if-unchanged.
    ///
    /// Returns whether the swap took place.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<Value>,
        next: Option<Value>,
        ttl: Option<Duration>,
    ) -> StoreResult<bool>;

    /// Atomically adds `delta` to the integer at `key`, treating a missing
    /// key as zero. Returns the new value.
    async fn increment(&self, key: &str, delta: i64) -> StoreResult<i64>;
}

/// Typed convenience layer over [StateStore].
#[async_trait]
pub trait StateStoreExt: StateStore {
    async fn get_as<T>(&self, key: &str) -> StoreResult<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        let value = self.get(key).await?;

        value
            .map(|v| serde_json::from_value(v))
            .transpose()
            .map_err(|e| StoreError::Decode(key.to_string(), e.to_string()))
    }

    async fn put_as<T>(&self, key: &str, value: &T, ttl: Option<Duration>) -> StoreResult<()>
    where
        T: Serialize + Sync,
    {
        let encoded = serde_json::to_value(value).map_err(|e| StoreError::Encode(e.to_string()))?;
        self.put(key, encoded, ttl).await
    }
}

#[async_trait]
impl<S> StateStoreExt for S where S: StateStore + ?Sized {}

#[derive(Debug, Clone)]
struct StoredEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }
}

/// The in-process [StateStore] implementation. Entries are expired lazily on
/// access and eagerly by [MemoryStore::sweep].
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, StoredEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every expired entry.
    pub fn sweep(&self) {
        self.entries.retain(|_, entry| !entry.is_expired());
    }

    fn entry_from(value: Value, ttl: Option<Duration>) -> StoredEntry {
        StoredEntry {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        let value = self
            .entries
            .get(key)
            .filter(|e| !e.is_expired())
            .map(|e| e.value.clone());

        Ok(value)
    }

    async fn put(&self, key: &str, value: Value, ttl: Option<Duration>) -> StoreResult<()> {
        self.entries
            .insert(key.to_string(), Self::entry_from(value, ttl));

        Ok(())
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<Value>,
        next: Option<Value>,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        // The entry guard locks the shard, making the read-compare-write atomic.
        let entry = self.entries.entry(key.to_string());

        match entry {
            Entry::Occupied(mut occupied) => {
                let current = Some(&occupied.get().value).filter(|_| !occupied.get().is_expired());

                if current != expected.as_ref() {
                    return Ok(false);
                }

                match next {
                    Some(value) => {
                        occupied.insert(Self::entry_from(value, ttl));
                    }
                    None => {
                        occupied.remove();
                    }
                }

                Ok(true)
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return Ok(false);
                }

                if let Some(value) = next {
                    vacant.insert(Self::entry_from(value, ttl));
                }

                Ok(true)
            }
        }
    }

    async fn increment(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Self::entry_from(Value::from(0), None));

        if entry.is_expired() {
            *entry = Self::entry_from(Value::from(0), None);
        }

        let current = entry
            .value
            .as_i64()
            .ok_or_else(|| StoreError::NotAnInteger(key.to_string()))?;

        let next = current + delta;
        entry.value = Value::from(next);

        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Slot {
        user_id: i32,
    }

    #[tokio::test]
    async fn test_typed_roundtrip() {
        let store = MemoryStore::new();

        store
            .put_as("room:1:dj", &Slot { user_id: 4 }, None)
            .await
            .unwrap();

        let slot: Option<Slot> = store.get_as("room:1:dj").await.unwrap();
        assert_eq!(slot, Some(Slot { user_id: 4 }));
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = MemoryStore::new();

        store
            .put("gone", Value::from(1), Some(Duration::from_millis(10)))
            .await
            .unwrap();

        store.put("kept", Value::from(2), None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(store.get("gone").await.unwrap(), None, "expired key reads as absent");
        assert_eq!(store.get("kept").await.unwrap(), Some(Value::from(2)));

        store.sweep();
        assert_eq!(store.entries.len(), 1, "sweep drops expired entries");
    }

    #[tokio::test]
    async fn test_compare_and_swap_inserts_once() {
        let store = MemoryStore::new();

        let first = store
            .compare_and_swap("key", None, Some(Value::from("a")), None)
            .await
            .unwrap();

        let second = store
            .compare_and_swap("key", None, Some(Value::from("b")), None)
            .await
            .unwrap();

        assert!(first, "insert against an absent key succeeds");
        assert!(!second, "second insert loses the race");
        assert_eq!(store.get("key").await.unwrap(), Some(Value::from("a")));
    }

    #[tokio::test]
    async fn test_compare_and_swap_replace_and_delete() {
        let store = MemoryStore::new();
        store.put("key", Value::from("a"), None).await.unwrap();

        let mismatched = store
            .compare_and_swap("key", Some(Value::from("x")), Some(Value::from("b")), None)
            .await
            .unwrap();
        assert!(!mismatched, "stale expectation is refused");

        let replaced = store
            .compare_and_swap("key", Some(Value::from("a")), Some(Value::from("b")), None)
            .await
            .unwrap();
        assert!(replaced);

        let deleted = store
            .compare_and_swap("key", Some(Value::from("b")), None, None)
            .await
            .unwrap();
        assert!(deleted);
        assert_eq!(store.get("key").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_increment() {
        let store = MemoryStore::new();

        assert_eq!(store.increment("count", 1).await.unwrap(), 1);
        assert_eq!(store.increment("count", 2).await.unwrap(), 3);
        assert_eq!(store.increment("count", -4).await.unwrap(), -1);

        store.put("text", Value::from("nope"), None).await.unwrap();
        assert!(store.increment("text", 1).await.is_err());
    }
}
