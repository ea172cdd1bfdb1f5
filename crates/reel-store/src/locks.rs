//! Per-key mutual exclusion
//!
//! Callers holding different keys never wait on each other. An entry lives
//! only while some caller holds or waits for its key.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::hash::Hash;
use std::sync::Arc;

#[derive(Debug)]
pub(crate) struct KeyedLocks<K: Eq + Hash> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Copy> KeyedLocks<K> {
    pub(crate) fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Run `f` while holding the lock for `key`
    pub(crate) fn with<T>(&self, key: K, f: impl FnOnce() -> T) -> T {
        let lock = Arc::clone(self.locks.entry(key).or_default().value());
        let result = {
            let _held = lock.lock();
            f()
        };
        drop(lock);
        // only the table's own handle left
        self.locks.remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn same_key_is_serialized() {
        let locks = KeyedLocks::new();
        let inside = AtomicUsize::new(0);
        let overlaps = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..50 {
                        locks.with(7u32, || {
                            if inside.fetch_add(1, Ordering::SeqCst) > 0 {
                                overlaps.fetch_add(1, Ordering::SeqCst);
                            }
                            std::thread::yield_now();
                            inside.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                });
            }
        });
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(locks.len(), 0);
    }

    #[test]
    fn other_keys_are_free_while_one_is_held() {
        let locks = KeyedLocks::new();
        locks.with(1u32, || {
            // would deadlock if keys shared a lock
            assert_eq!(locks.with(2u32, || 42), 42);
            assert_eq!(locks.len(), 1);
        });
        assert_eq!(locks.len(), 0);
    }
}
