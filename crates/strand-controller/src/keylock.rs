//! Per-key mutual exclusion
//!
//! [`KeyLock`] serializes operation cycles per workflow identity. It also owns
//! the named semaphores and mutexes workflows declare in their
//! `synchronization` block, which are held across cycles by identity rather
//! than by a guard.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

#[derive(Debug, Default)]
struct LockTable {
    keys: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
    named: HashMap<String, NamedLock>,
}

impl LockTable {
    /// Drop the entry for `key` if nobody holds or awaits it
    fn discard_idle_key(&mut self, key: &str) {
        let idle = self
            .keys
            .get(key)
            .is_some_and(|e| Arc::strong_count(e) == 1 && e.try_lock().is_ok());
        if idle {
            self.keys.remove(key);
        }
    }
}

#[derive(Debug, Default)]
struct NamedLock {
    limit: usize,
    holders: Vec<String>,
    waiters: VecDeque<String>,
}

impl NamedLock {
    fn free(&self) -> usize {
        self.limit.saturating_sub(self.holders.len())
    }

    fn wakeable(&self) -> Vec<String> {
        self.waiters.iter().take(self.free()).cloned().collect()
    }

    /// Remove `identity` as holder and waiter; returns whether it was either
    fn forget(&mut self, identity: &str) -> bool {
        let before = self.holders.len() + self.waiters.len();
        self.holders.retain(|h| h != identity);
        self.waiters.retain(|w| w != identity);
        self.holders.len() + self.waiters.len() < before
    }

    fn is_idle(&self) -> bool {
        self.holders.is_empty() && self.waiters.is_empty()
    }
}

/// Outcome of a named-lock acquisition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamedAcquire {
    /// The holder now owns a slot
    Acquired,
    /// The holder already owned a slot
    AlreadyHeld,
    /// No capacity; the holder is queued at `position` (0 = next)
    Waiting { position: usize },
}

/// Table of per-key locks and named locks
#[derive(Debug, Clone, Default)]
pub struct KeyLock {
    table: Arc<Mutex<LockTable>>,
}

/// Held per-key lock; released on drop
#[derive(Debug)]
pub struct KeyGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    table: Arc<Mutex<LockTable>>,
}

impl KeyGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.table.lock().discard_idle_key(&self.key);
    }
}

impl KeyLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut table = self.table.lock();
        Arc::clone(table.keys.entry(key.to_string()).or_default())
    }

    /// Wait until no one else holds `key`, then hold it
    pub async fn acquire(&self, key: &str) -> KeyGuard {
        let guard = self.entry(key).lock_owned().await;
        KeyGuard {
            key: key.to_string(),
            guard: Some(guard),
            table: Arc::clone(&self.table),
        }
    }

    /// Hold `key` only if it is free right now
    pub fn try_acquire(&self, key: &str) -> Option<KeyGuard> {
        match self.entry(key).try_lock_owned() {
            Ok(guard) => Some(KeyGuard {
                key: key.to_string(),
                guard: Some(guard),
                table: Arc::clone(&self.table),
            }),
            Err(_) => {
                // The holder may have released while our reference kept the entry alive.
                self.table.lock().discard_idle_key(key);
                None
            }
        }
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.table
            .lock()
            .keys
            .get(key)
            .is_some_and(|entry| entry.try_lock().is_err())
    }

    /// Take a slot of the named lock `name` (capacity `limit`) for `holder`.
    ///
    /// Slots are handed out in arrival order: while others wait, a newcomer
    /// queues even if capacity is free, so released capacity goes to the head.
    pub fn try_acquire_named(&self, holder: &str, name: &str, limit: usize) -> NamedAcquire {
        let mut table = self.table.lock();
        let lock = table.named.entry(name.to_string()).or_default();
        lock.limit = limit.max(1);

        if lock.holders.iter().any(|h| h == holder) {
            return NamedAcquire::AlreadyHeld;
        }

        let at_head = lock.waiters.front().map_or(true, |w| w == holder);
        if lock.free() > 0 && at_head {
            if lock.waiters.front().is_some_and(|w| w == holder) {
                lock.waiters.pop_front();
            }
            lock.holders.push(holder.to_string());
            return NamedAcquire::Acquired;
        }

        let position = match lock.waiters.iter().position(|w| w == holder) {
            Some(position) => position,
            None => {
                lock.waiters.push_back(holder.to_string());
                lock.waiters.len() - 1
            }
        };
        NamedAcquire::Waiting { position }
    }

    /// Drop `holder` from `name`, whether it holds a slot or is still queued.
    ///
    /// Returns the waiters that now fit.
    pub fn release_named(&self, holder: &str, name: &str) -> Vec<String> {
        let mut table = self.table.lock();
        let Some(lock) = table.named.get_mut(name) else {
            return Vec::new();
        };
        let woken = if lock.forget(holder) {
            lock.wakeable()
        } else {
            Vec::new()
        };
        if lock.is_idle() {
            table.named.remove(name);
        }
        woken
    }

    /// Current holders of the named lock `name`
    pub fn named_holders(&self, name: &str) -> Vec<String> {
        self.table
            .lock()
            .named
            .get(name)
            .map(|lock| lock.holders.clone())
            .unwrap_or_default()
    }

    /// Drop everything registered for `identity`.
    ///
    /// Frees its named-lock slots, removes it from every wait queue and
    /// discards its idle per-key entry. A per-key lock that is currently held
    /// is left to its guard. Returns the waiters that can now proceed. Safe to
    /// call any number of times.
    pub fn release_all(&self, identity: &str) -> Vec<String> {
        let mut table = self.table.lock();
        let mut woken = Vec::new();

        table.named.retain(|_, lock| {
            if lock.forget(identity) {
                woken.extend(lock.wakeable());
            }
            !lock.is_idle()
        });
        table.discard_idle_key(identity);

        woken.sort();
        woken.dedup();
        woken
    }
}
