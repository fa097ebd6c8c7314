/// Lock Manager - Keyed Read/Write Locks
///
/// **Core Responsibility:**
/// Hand out exclusive and shared locks by string key, created on first use.
///
/// **Contract:**
/// - `lock`/`unlock` and `read_lock`/`read_unlock` are separate calls, so a
///   guard for every acquisition is parked inside the entry until released
/// - `lock` reports whether it had to wait (callers re-check caches when it did)
/// - Unlocking an unknown key or a key that is not held is an error, never a panic
///
/// **Eviction:**
/// Idle entries older than the stale duration are dropped by a periodic sweep.
/// An entry is only removed under the registry mutex, when nobody holds it,
/// nobody else has looked it up, and its lock can be taken without waiting.

use autograder_common::Timestamp;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("Lock key not found: '{0}'")]
    UnknownKey(String),

    #[error("Tried to unlock a lock that is not held: '{0}'")]
    NotHeld(String),
}

struct EntryState {
    last_touch: Timestamp,
    holders: usize,
    write_guard: Option<OwnedRwLockWriteGuard<()>>,
    read_guards: Vec<OwnedRwLockReadGuard<()>>,
}

struct LockEntry {
    lock: Arc<RwLock<()>>,
    state: Mutex<EntryState>,
}

impl LockEntry {
    fn new() -> Self {
        Self {
            lock: Arc::new(RwLock::new(())),
            state: Mutex::new(EntryState {
                last_touch: Timestamp::now(),
                holders: 0,
                write_guard: None,
                read_guards: Vec::new(),
            }),
        }
    }
}

#[derive(Default)]
pub struct LockManager {
    entries: Mutex<HashMap<String, Arc<LockEntry>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    // The registry mutex is released before the caller waits on the entry.
    fn entry(&self, key: &str) -> Arc<LockEntry> {
        let mut entries = self.entries.lock();
        entries
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(LockEntry::new()))
            .clone()
    }

    fn existing(&self, key: &str) -> Result<Arc<LockEntry>, LockError> {
        self.entries
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| LockError::UnknownKey(key.to_string()))
    }

    /// Take the exclusive lock for `key`.
    /// Returns true if it was acquired without waiting.
    pub async fn lock(&self, key: &str) -> bool {
        let entry = self.entry(key);

        let (guard, immediate) = match entry.lock.clone().try_write_owned() {
            Ok(guard) => (guard, true),
            Err(_) => {
                debug!(key = %key, "Waiting for lock");
                (entry.lock.clone().write_owned().await, false)
            }
        };

        let mut state = entry.state.lock();
        state.holders += 1;
        state.last_touch = Timestamp::now();
        state.write_guard = Some(guard);

        immediate
    }

    pub fn unlock(&self, key: &str) -> Result<(), LockError> {
        let entry = self.existing(key)?;

        let guard = {
            let mut state = entry.state.lock();
            let guard = state
                .write_guard
                .take()
                .ok_or_else(|| LockError::NotHeld(key.to_string()))?;
            state.holders = state.holders.saturating_sub(1);
            state.last_touch = Timestamp::now();
            guard
        };

        drop(guard);
        Ok(())
    }

    pub async fn read_lock(&self, key: &str) {
        let entry = self.entry(key);
        let guard = entry.lock.clone().read_owned().await;

        let mut state = entry.state.lock();
        state.holders += 1;
        state.last_touch = Timestamp::now();
        state.read_guards.push(guard);
    }

    pub fn read_unlock(&self, key: &str) -> Result<(), LockError> {
        let entry = self.existing(key)?;

        let guard = {
            let mut state = entry.state.lock();
            let guard = state
                .read_guards
                .pop()
                .ok_or_else(|| LockError::NotHeld(key.to_string()))?;
            state.holders = state.holders.saturating_sub(1);
            state.last_touch = Timestamp::now();
            guard
        };

        drop(guard);
        Ok(())
    }

    /// Exclusive lock released when the returned guard drops.
    pub async fn lock_scoped(self: &Arc<Self>, key: &str) -> (KeyGuard, bool) {
        let immediate = self.lock(key).await;
        let guard = KeyGuard {
            locks: self.clone(),
            key: key.to_string(),
        };

        (guard, immediate)
    }

    pub fn holders(&self, key: &str) -> usize {
        self.entries
            .lock()
            .get(key)
            .map(|entry| entry.state.lock().holders)
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove idle entries not touched within `stale`. Returns the number removed.
    pub fn sweep(&self, stale: Duration) -> usize {
        let stale_msecs = stale.as_millis() as i64;

        let candidates: Vec<String> = {
            let now = Timestamp::now();
            self.entries
                .lock()
                .iter()
                .filter(|(_, entry)| {
                    let state = entry.state.lock();
                    state.holders == 0 && (now - state.last_touch) >= stale_msecs
                })
                .map(|(key, _)| key.clone())
                .collect()
        };

        let mut removed = 0;
        for key in candidates {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get(&key) else {
                continue;
            };

            // Someone has fetched the entry and may be about to lock it.
            if Arc::strong_count(entry) > 1 {
                continue;
            }

            let idle = {
                let state = entry.state.lock();
                state.holders == 0 && (Timestamp::now() - state.last_touch) >= stale_msecs
            };

            if idle && entry.lock.try_write().is_ok() {
                entries.remove(&key);
                removed += 1;
            }
        }

        if removed > 0 {
            debug!(removed = removed, "Removed stale locks");
        }

        removed
    }

    /// Run `sweep` every `interval` until `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, stale: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let locks = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;

            info!(interval_secs = interval.as_secs(), stale_secs = stale.as_secs(), "Lock sweeper started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        locks.sweep(stale);
                    }
                }
            }

            info!("Lock sweeper stopped");
        })
    }
}

/// Releases an exclusive key lock on drop.
pub struct KeyGuard {
    locks: Arc<LockManager>,
    key: String,
}

impl KeyGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        if let Err(err) = self.locks.unlock(&self.key) {
            warn!(key = %self.key, error = %err, "Failed to release lock");
        }
    }
}
