//! Keyed asynchronous locks.
//!
//! Each key gets its own async mutex, created on first acquisition and dropped
//! once the last holder or waiter goes away, so the table never grows past the
//! set of keys currently in use.
//!
//! Acquisition is cancelled by dropping the returned future. A waiter dropped
//! before it is granted gives its reference back immediately.
//!
//! Multi-key acquisition takes keys in the order given and releases them in
//! reverse. Callers are responsible for a consistent global key order (the
//! sync context sorts item ids lexically) so that two multi-key holders can
//! never wait on each other.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug)]
struct LockEntry {
    count: usize,
    lock: Arc<Mutex<()>>,
}

impl LockEntry {
    fn new() -> Self {
        Self {
            count: 0,
            lock: Arc::new(Mutex::new(())),
        }
    }
}

type Entries = Arc<DashMap<String, LockEntry>>;

/// A table of refcounted async mutexes keyed by string.
///
/// Cheap to clone; clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct AsyncLockMap {
    entries: Entries,
}

/// One reference on a lock entry. Dropping it gives the reference back.
#[derive(Debug)]
struct EntryRef {
    entries: Entries,
    key: String,
}

impl Drop for EntryRef {
    fn drop(&mut self) {
        if let Entry::Occupied(mut entry) = self.entries.entry(self.key.clone()) {
            entry.get_mut().count -= 1;
            if entry.get().count == 0 {
                entry.remove();
                tracing::trace!(key = %self.key, "lock entry released");
            }
        }
    }
}

/// Held lock on a single key.
#[derive(Debug)]
pub struct KeyedLockGuard {
    // Field order matters: the mutex is released before the reference.
    _guard: OwnedMutexGuard<()>,
    entry: EntryRef,
}

impl KeyedLockGuard {
    /// The key this guard holds.
    pub fn key(&self) -> &str {
        &self.entry.key
    }
}

/// Held locks on several keys, released in reverse acquisition order.
#[derive(Debug, Default)]
pub struct MultiLockGuard {
    guards: Vec<KeyedLockGuard>,
}

impl MultiLockGuard {
    /// Keys held, in acquisition order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.guards.iter().map(KeyedLockGuard::key)
    }
}

impl Drop for MultiLockGuard {
    fn drop(&mut self) {
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}

impl AsyncLockMap {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, waiting for any current holder.
    pub async fn acquire(&self, key: &str) -> KeyedLockGuard {
        let (lock, entry) = self.reference(key);
        let guard = lock.lock_owned().await;
        KeyedLockGuard {
            _guard: guard,
            entry,
        }
    }

    /// Acquire every key in the order given.
    ///
    /// A key repeated in the list is only taken once.
    pub async fn acquire_many<I, S>(&self, keys: I) -> MultiLockGuard
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut held = MultiLockGuard::default();
        for key in keys {
            let key = key.as_ref();
            if held.keys().any(|k| k == key) {
                continue;
            }
            let guard = self.acquire(key).await;
            held.guards.push(guard);
        }
        held
    }

    /// Whether any holder or waiter references `key`.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of keys currently referenced.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no key is referenced.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn reference(&self, key: &str) -> (Arc<Mutex<()>>, EntryRef) {
        let lock = {
            let mut entry = self
                .entries
                .entry(key.to_string())
                .or_insert_with(LockEntry::new);
            entry.count += 1;
            entry.lock.clone()
        };
        let entry = EntryRef {
            entries: self.entries.clone(),
            key: key.to_string(),
        };
        (lock, entry)
    }

    #[cfg(test)]
    fn ref_count(&self, key: &str) -> Option<usize> {
        self.entries.get(key).map(|e| e.count)
    }
}
