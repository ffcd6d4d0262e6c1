//! In-process store with optional JSON snapshot persistence.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    path::{Path, PathBuf},
    sync::Mutex,
};

use super::Store;
use crate::error::StoreError;

/// Store operations that can be made to fail on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Get,
    Set,
    GetSet,
    Del,
    IncrBy,
    HSet,
    HGet,
    HGetAll,
    HDel,
    LPush,
    RPush,
    LPop,
    RPop,
    LRange,
    LTrim,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreState {
    strings: HashMap<String, String>,
    hashes: HashMap<String, BTreeMap<String, String>>,
    lists: HashMap<String, VecDeque<String>>,
}

/// Store kept in memory behind a mutex.
///
/// When opened with a snapshot path, every mutation rewrites the snapshot
/// atomically (write to a temp file, then rename). A mutation only becomes
/// visible once its snapshot is on disk; a failed save leaves the store as it
/// was. Operations can be forced to fail with [`MemoryStore::fail_operation`]
/// to exercise the engine's failure paths.
pub struct MemoryStore {
    state: Mutex<StoreState>,
    snapshot_path: Option<PathBuf>,
    failing: Mutex<HashMap<StoreOp, Injected>>,
}

/// An injected failure.
#[derive(Debug, Clone, Copy)]
struct Injected {
    /// Calls that still succeed before failures start.
    skip: usize,
    /// Failures left; `None` fails until cleared.
    remaining: Option<usize>,
}

impl MemoryStore {
    /// Create an empty, non-persistent store.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            snapshot_path: None,
            failing: Mutex::new(HashMap::new()),
        }
    }

    /// Open a store backed by a snapshot file.
    ///
    /// Returns an empty store if the file doesn't exist yet.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let state = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let state: StoreState = serde_json::from_str(&content)?;
            tracing::info!(
                "Loaded store snapshot: {} values, {} hashes, {} lists",
                state.strings.len(),
                state.hashes.len(),
                state.lists.len()
            );
            state
        } else {
            tracing::info!("No store snapshot found at {:?}, starting empty", path);
            StoreState::default()
        };

        Ok(Self {
            state: Mutex::new(state),
            snapshot_path: Some(path.to_path_buf()),
            failing: Mutex::new(HashMap::new()),
        })
    }

    /// Make every subsequent call of `op` fail until cleared.
    pub fn fail_operation(&self, op: StoreOp) {
        self.inject(op, 0, None);
    }

    /// Make only the next call of `op` fail.
    pub fn fail_operation_once(&self, op: StoreOp) {
        self.inject(op, 0, Some(1));
    }

    /// Let the next `calls` calls of `op` through, then fail one.
    pub fn fail_operation_after(&self, op: StoreOp, calls: usize) {
        self.inject(op, calls, Some(1));
    }

    fn inject(&self, op: StoreOp, skip: usize, remaining: Option<usize>) {
        self.lock_failing().insert(op, Injected { skip, remaining });
    }

    /// Let `op` succeed again.
    pub fn restore_operation(&self, op: StoreOp) {
        self.lock_failing().remove(&op);
    }

    fn lock_failing(&self) -> std::sync::MutexGuard<'_, HashMap<StoreOp, Injected>> {
        self.failing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(&self, op: StoreOp) -> Result<(), StoreError> {
        let mut failing = self.lock_failing();
        let Some(injected) = failing.get_mut(&op) else {
            return Ok(());
        };
        if injected.skip > 0 {
            injected.skip -= 1;
            return Ok(());
        }
        if let Some(count) = injected.remaining.as_mut() {
            *count = count.saturating_sub(1);
        }
        if injected.remaining == Some(0) {
            failing.remove(&op);
        }
        Err(StoreError::Unavailable(format!("{:?} disabled", op)))
    }

    fn read<R>(&self, op: StoreOp, f: impl FnOnce(&StoreState) -> R) -> Result<R, StoreError> {
        self.check(op)?;
        let state = self
            .state
            .lock()
            .map_err(|_| StoreError::Unavailable("store mutex poisoned".to_string()))?;
        Ok(f(&state))
    }

    fn write<R>(
        &self,
        op: StoreOp,
        f: impl FnOnce(&mut StoreState) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        self.check(op)?;
        let mut state = self
            .state
            .lock()
            .map_err(|_| StoreError::Unavailable("store mutex poisoned".to_string()))?;
        let Some(path) = &self.snapshot_path else {
            return f(&mut state);
        };
        let mut next = state.clone();
        let result = f(&mut next)?;
        save_snapshot(&next, path)?;
        *state = next;
        Ok(result)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn save_snapshot(state: &StoreState, path: &Path) -> Result<(), StoreError> {
    let content = serde_json::to_string(state)?;

    let temp_path = path.with_extension("tmp");
    std::fs::write(&temp_path, &content)?;
    std::fs::rename(&temp_path, path)?;

    Ok(())
}

/// Resolve an inclusive Redis-style range against a list of `len` elements.
fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };

    if len == 0 || start > stop || start >= len || stop < 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.read(StoreOp::Get, |state| state.strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.write(StoreOp::Set, |state| {
            state.strings.insert(key.to_string(), value);
            Ok(())
        })
    }

    async fn get_set(&self, key: &str, value: String) -> Result<Option<String>, StoreError> {
        self.write(StoreOp::GetSet, |state| {
            Ok(state.strings.insert(key.to_string(), value))
        })
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        self.write(StoreOp::Del, |state| {
            let removed = state.strings.remove(key).is_some()
                | state.hashes.remove(key).is_some()
                | state.lists.remove(key).is_some();
            Ok(removed)
        })
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        self.write(StoreOp::IncrBy, |state| {
            let current = match state.strings.get(key) {
                Some(raw) => raw.trim().parse::<i64>().map_err(|_| StoreError::NotAnInteger {
                    key: key.to_string(),
                    value: raw.clone(),
                })?,
                None => 0,
            };
            let updated = current.checked_add(delta).ok_or_else(|| StoreError::NotAnInteger {
                key: key.to_string(),
                value: format!("{} + {} overflows", current, delta),
            })?;
            state.strings.insert(key.to_string(), updated.to_string());
            Ok(updated)
        })
    }

    async fn hset(&self, hash: &str, field: &str, value: String) -> Result<(), StoreError> {
        self.write(StoreOp::HSet, |state| {
            state
                .hashes
                .entry(hash.to_string())
                .or_default()
                .insert(field.to_string(), value);
            Ok(())
        })
    }

    async fn hget(&self, hash: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.read(StoreOp::HGet, |state| {
            state.hashes.get(hash).and_then(|h| h.get(field)).cloned()
        })
    }

    async fn hget_all(&self, hash: &str) -> Result<Vec<(String, String)>, StoreError> {
        self.read(StoreOp::HGetAll, |state| {
            state
                .hashes
                .get(hash)
                .map(|h| h.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default()
        })
    }

    async fn hdel(&self, hash: &str, field: &str) -> Result<bool, StoreError> {
        self.write(StoreOp::HDel, |state| {
            let removed = match state.hashes.get_mut(hash) {
                Some(h) => h.remove(field).is_some(),
                None => false,
            };
            if state.hashes.get(hash).is_some_and(|h| h.is_empty()) {
                state.hashes.remove(hash);
            }
            Ok(removed)
        })
    }

    async fn lpush(&self, list: &str, value: String) -> Result<usize, StoreError> {
        self.write(StoreOp::LPush, |state| {
            let entries = state.lists.entry(list.to_string()).or_default();
            entries.push_front(value);
            Ok(entries.len())
        })
    }

    async fn rpush(&self, list: &str, value: String) -> Result<usize, StoreError> {
        self.write(StoreOp::RPush, |state| {
            let entries = state.lists.entry(list.to_string()).or_default();
            entries.push_back(value);
            Ok(entries.len())
        })
    }

    async fn lpop(&self, list: &str) -> Result<Option<String>, StoreError> {
        self.write(StoreOp::LPop, |state| {
            Ok(state.lists.get_mut(list).and_then(|l| l.pop_front()))
        })
    }

    async fn rpop(&self, list: &str) -> Result<Option<String>, StoreError> {
        self.write(StoreOp::RPop, |state| {
            Ok(state.lists.get_mut(list).and_then(|l| l.pop_back()))
        })
    }

    async fn lrange(&self, list: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        self.read(StoreOp::LRange, |state| {
            let Some(entries) = state.lists.get(list) else {
                return Vec::new();
            };
            match resolve_range(entries.len(), start, stop) {
                Some((from, to)) => entries.range(from..=to).cloned().collect(),
                None => Vec::new(),
            }
        })
    }

    async fn ltrim(&self, list: &str, start: i64, stop: i64) -> Result<(), StoreError> {
        self.write(StoreOp::LTrim, |state| {
            let Some(entries) = state.lists.get_mut(list) else {
                return Ok(());
            };
            match resolve_range(entries.len(), start, stop) {
                Some((from, to)) => {
                    entries.truncate(to + 1);
                    entries.drain(..from);
                }
                None => entries.clear(),
            }
            Ok(())
        })
    }
}
