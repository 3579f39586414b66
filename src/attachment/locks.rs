//! Per-host advisory locks
//!
//! Serializes read-modify-write of a host's exposure table. A lock is held
//! only around the mutation span, never across a whole attach flow. An entry
//! is dropped from the registry once its last holder or waiter is gone.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Lock name prefix for host-scoped locks
pub const HOST_LOCK_PREFIX: &str = "array-host-";

/// Registry of named per-host mutexes
#[derive(Debug, Default)]
pub struct HostLocks {
    enabled: bool,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

/// Held host lock, released on drop
#[derive(Debug)]
pub struct HostLockGuard {
    name: String,
    guard: Option<OwnedMutexGuard<()>>,
    registry: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl HostLockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for HostLockGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters hold a clone of the mutex, so only an idle entry has one owner
        self.registry
            .remove_if(&self.name, |_, mutex| Arc::strong_count(mutex) == 1);
        debug!("Released lock {}", self.name);
    }
}

impl HostLocks {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            locks: Arc::new(DashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn lock_name(host_id: &str) -> String {
        format!("{}{}", HOST_LOCK_PREFIX, host_id)
    }

    /// Number of hosts with a held or awaited lock
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Acquire the lock for `host_id`; `None` when locking is disabled
    pub async fn acquire(&self, host_id: &str) -> Option<HostLockGuard> {
        if !self.enabled {
            return None;
        }
        Some(self.acquire_always(host_id).await)
    }

    /// Acquire the lock for `host_id` regardless of the enabled flag
    pub async fn acquire_always(&self, host_id: &str) -> HostLockGuard {
        let name = Self::lock_name(host_id);
        let mutex = self
            .locks
            .entry(name.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        debug!("Acquired lock {}", name);
        HostLockGuard {
            name,
            guard: Some(guard),
            registry: self.locks.clone(),
        }
    }
}
