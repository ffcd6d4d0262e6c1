//! Shared persistent store.
//!
//! The hub engine keeps all shared state in a key/value store with Redis-like
//! semantics: plain values, atomic counters, an atomic get-and-set used for
//! the single-writer flags, hashes and lists. Values are opaque strings; the
//! engine stores JSON records in them.
//!
//! Absence is not failure. Reads of a missing key return `None` or an empty
//! collection, while `Err(StoreError)` means the backend could not answer.

pub mod keys;
mod memory;

pub use memory::{MemoryStore, StoreOp};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::StoreError;

/// Operations the hub engine needs from its store.
///
/// List indices follow Redis conventions: negative indices count from the
/// end, `-1` is the last element, and ranges are inclusive.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError>;

    /// Atomically set `key` and return its previous value.
    async fn get_set(&self, key: &str, value: String) -> Result<Option<String>, StoreError>;

    async fn del(&self, key: &str) -> Result<bool, StoreError>;

    /// Atomically add `delta` to the integer at `key` (missing keys count as
    /// zero) and return the new value.
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError>;

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        self.incr_by(key, 1).await
    }

    async fn decr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        self.incr_by(key, -delta).await
    }

    async fn hset(&self, hash: &str, field: &str, value: String) -> Result<(), StoreError>;

    async fn hget(&self, hash: &str, field: &str) -> Result<Option<String>, StoreError>;

    async fn hget_all(&self, hash: &str) -> Result<Vec<(String, String)>, StoreError>;

    async fn hdel(&self, hash: &str, field: &str) -> Result<bool, StoreError>;

    /// Push to the head of a list, returning the new length.
    async fn lpush(&self, list: &str, value: String) -> Result<usize, StoreError>;

    /// Push to the tail of a list, returning the new length.
    async fn rpush(&self, list: &str, value: String) -> Result<usize, StoreError>;

    async fn lpop(&self, list: &str) -> Result<Option<String>, StoreError>;

    async fn rpop(&self, list: &str) -> Result<Option<String>, StoreError>;

    async fn lrange(&self, list: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError>;

    /// Keep only the elements in `start..=stop`.
    async fn ltrim(&self, list: &str, start: i64, stop: i64) -> Result<(), StoreError>;
}

pub async fn get_json<T: DeserializeOwned>(
    store: &dyn Store,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub async fn set_json<T: Serialize + ?Sized>(
    store: &dyn Store,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    store.set(key, serde_json::to_string(value)?).await
}

/// Read an integer counter; `None` when the key is absent.
pub async fn get_int(store: &dyn Store, key: &str) -> Result<Option<i64>, StoreError> {
    match store.get(key).await? {
        Some(raw) => raw
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| StoreError::NotAnInteger {
                key: key.to_string(),
                value: raw,
            }),
        None => Ok(None),
    }
}

pub async fn lpush_json<T: Serialize + ?Sized>(
    store: &dyn Store,
    list: &str,
    value: &T,
) -> Result<usize, StoreError> {
    store.lpush(list, serde_json::to_string(value)?).await
}

pub async fn rpush_json<T: Serialize + ?Sized>(
    store: &dyn Store,
    list: &str,
    value: &T,
) -> Result<usize, StoreError> {
    store.rpush(list, serde_json::to_string(value)?).await
}

pub async fn lpop_json<T: DeserializeOwned>(
    store: &dyn Store,
    list: &str,
) -> Result<Option<T>, StoreError> {
    match store.lpop(list).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub async fn rpop_json<T: DeserializeOwned>(
    store: &dyn Store,
    list: &str,
) -> Result<Option<T>, StoreError> {
    match store.rpop(list).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub async fn lrange_json<T: DeserializeOwned>(
    store: &dyn Store,
    list: &str,
    start: i64,
    stop: i64,
) -> Result<Vec<T>, StoreError> {
    store
        .lrange(list, start, stop)
        .await?
        .iter()
        .map(|raw| serde_json::from_str(raw).map_err(StoreError::from))
        .collect()
}
