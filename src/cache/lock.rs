use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;
use tracing::warn;

pub(crate) fn rw_read<'a, T>(
    lock: &'a RwLock<T>,
    target: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                target_module = target,
                lock_kind = "rwlock.read",
                result = "poisoned_recovered",
                hint = "state may be stale after panic in another thread",
                "Recovered from poisoned cache lock"
            );
            poisoned.into_inner()
        }
    }
}

pub(crate) fn rw_write<'a, T>(
    lock: &'a RwLock<T>,
    target: &'static str,
    op: &'static str,
) -> RwLockWriteGuard<'a, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                target_module = target,
                lock_kind = "rwlock.write",
                result = "poisoned_recovered",
                hint = "state may be stale after panic in another thread",
                "Recovered from poisoned cache lock"
            );
            poisoned.into_inner()
        }
    }
}

pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    target: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                target_module = target,
                lock_kind = "mutex.lock",
                result = "poisoned_recovered",
                hint = "state may be stale after panic in another thread",
                "Recovered from poisoned cache lock"
            );
            poisoned.into_inner()
        }
    }
}

/// In-process gate allowing at most one active refresh per cache key.
///
/// Callers that lose the race get a [`RefreshWaiter`] that resolves once the
/// winning refresh releases the key, so they can re-read whatever it wrote
/// instead of fetching again.
#[derive(Debug, Default)]
pub struct RefreshingLock {
    inflight: DashMap<String, watch::Sender<bool>>,
}

/// Result of [`RefreshingLock::acquire`].
#[derive(Debug)]
pub enum Acquire {
    Leader(RefreshGuard),
    Follower(RefreshWaiter),
}

impl RefreshingLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn can_refresh(&self, key: &str) -> bool {
        !self.inflight.contains_key(key)
    }

    pub fn set_refreshing(&self, key: &str) {
        self.inflight
            .entry(key.to_string())
            .or_insert_with(|| watch::channel(false).0);
    }

    pub fn set_unrefreshing(&self, key: &str) {
        if let Some((_, done)) = self.inflight.remove(key) {
            done.send_replace(true);
        }
    }

    /// Claim `key`, or subscribe to the refresh already holding it.
    pub fn acquire(self: &Arc<Self>, key: &str) -> Acquire {
        match self.inflight.entry(key.to_string()) {
            Entry::Occupied(held) => Acquire::Follower(RefreshWaiter {
                done: held.get().subscribe(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(watch::channel(false).0);
                Acquire::Leader(RefreshGuard {
                    lock: Arc::clone(self),
                    key: key.to_string(),
                })
            }
        }
    }

    pub fn try_lock(self: &Arc<Self>, key: &str) -> Option<RefreshGuard> {
        match self.acquire(key) {
            Acquire::Leader(guard) => Some(guard),
            Acquire::Follower(_) => None,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }
}

/// Held by the task refreshing a key; releases it on drop.
#[derive(Debug)]
pub struct RefreshGuard {
    lock: Arc<RefreshingLock>,
    key: String,
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        self.lock.set_unrefreshing(&self.key);
    }
}

#[derive(Debug)]
pub struct RefreshWaiter {
    done: watch::Receiver<bool>,
}

impl RefreshWaiter {
    /// Wait for the leader to release its key. Returns `false` on timeout.
    pub async fn wait(mut self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.done.wait_for(|done| *done))
            .await
            .is_ok()
    }
}
