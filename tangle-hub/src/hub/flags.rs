//! Single-writer process flags.
//!
//! A cycle claims its flag with an atomic get-and-set. Whoever reads back
//! `true` lost the race and skips the cycle. The winner resets the flag when
//! its body finishes, whatever the outcome. A flag left set by a crashed
//! process stays set until an operator resets it.

use std::future::Future;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::store::Store;

const SET: &str = "true";
const CLEAR: &str = "false";

/// Run `body` while holding the flag at `key`.
///
/// Returns `Ok(None)` when another holder has the flag and `Err` when the
/// flag could not be read, in both cases without running `body`.
pub(crate) async fn guarded<T, F>(
    store: &dyn Store,
    key: &str,
    body: F,
) -> Result<Option<T>, StoreError>
where
    F: Future<Output = T>,
{
    let previous = store.get_set(key, SET.to_string()).await.map_err(|e| {
        warn!("Could not claim flag {}: {}", key, e);
        e
    })?;

    if previous.as_deref() == Some(SET) {
        info!("Flag {} is already set, skipping", key);
        return Ok(None);
    }
    debug!("Claimed flag {}", key);

    let result = body.await;

    if let Err(e) = store.set(key, CLEAR.to_string()).await {
        warn!("Could not reset flag {}: {}", key, e);
    }

    Ok(Some(result))
}

/// Clear the flag at `key`.
pub(crate) async fn reset(store: &dyn Store, key: &str) -> Result<(), StoreError> {
    store.set(key, CLEAR.to_string()).await
}

pub(crate) async fn is_set(store: &dyn Store, key: &str) -> Result<bool, StoreError> {
    Ok(store.get(key).await?.as_deref() == Some(SET))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreOp};

    #[tokio::test]
    async fn test_guard_runs_body_and_resets() {
        let store = MemoryStore::new();

        let result = guarded(&store, "flag", async { 7 }).await.unwrap();

        assert_eq!(result, Some(7));
        assert!(!is_set(&store, "flag").await.unwrap());
    }

    #[tokio::test]
    async fn test_guard_skips_when_set() {
        let store = MemoryStore::new();
        store.set("flag", "true".to_string()).await.unwrap();

        let result = guarded(&store, "flag", async { 7 }).await.unwrap();

        assert_eq!(result, None);
        assert!(is_set(&store, "flag").await.unwrap());
    }

    #[tokio::test]
    async fn test_guard_aborts_when_unreadable() {
        let store = MemoryStore::new();
        store.fail_operation(StoreOp::GetSet);

        assert!(guarded(&store, "flag", async { 7 }).await.is_err());
    }

    #[tokio::test]
    async fn test_guard_result_survives_reset_failure() {
        let store = MemoryStore::new();
        store.fail_operation(StoreOp::Set);

        let result = guarded(&store, "flag", async { 7 }).await.unwrap();

        assert_eq!(result, Some(7));
        store.restore_operation(StoreOp::Set);
        assert!(is_set(&store, "flag").await.unwrap());

        reset(&store, "flag").await.unwrap();
        assert!(!is_set(&store, "flag").await.unwrap());
    }
}
