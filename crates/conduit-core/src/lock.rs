// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-channel lock manager.
//!
//! Serializes the read-then-write sequences touching one channel within this
//! process. The store transaction still decides correctness; the lock only keeps
//! concurrent requests for the same channel from colliding in SQLite.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::OwnedMutexGuard;
use tracing::trace;

type LockMap = HashMap<String, Arc<tokio::sync::Mutex<()>>>;

/// Keyed map of async mutexes. Entries disappear once nobody holds or awaits them.
#[derive(Debug, Clone, Default)]
pub struct ChannelLocks {
    locks: Arc<Mutex<LockMap>>,
}

impl ChannelLocks {
    /// Create an empty lock manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> ChannelLockGuard {
        let mutex = {
            let mut locks = lock_map(&self.locks);
            locks.entry(key.to_string()).or_default().clone()
        };
        let guard = mutex.lock_owned().await;
        trace!(key, "Channel lock acquired");
        ChannelLockGuard {
            key: key.to_string(),
            guard: Some(guard),
            locks: self.locks.clone(),
        }
    }

    /// Number of keys currently held or awaited.
    pub fn len(&self) -> usize {
        lock_map(&self.locks).len()
    }

    /// Whether no key is held or awaited.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock_map(locks: &Mutex<LockMap>) -> MutexGuard<'_, LockMap> {
    locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Exclusive access to one key; released on drop.
#[derive(Debug)]
pub struct ChannelLockGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<Mutex<LockMap>>,
}

impl ChannelLockGuard {
    /// The locked key.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for ChannelLockGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = lock_map(&self.locks);
        // Only the map still references the mutex: no holder, no waiter.
        if locks
            .get(&self.key)
            .is_some_and(|mutex| Arc::strong_count(mutex) == 1)
        {
            locks.remove(&self.key);
        }
        trace!(key = %self.key, "Channel lock released");
    }
}
