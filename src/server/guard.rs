//! Non-blocking per-key mutual exclusion.
//!
//! `try_insert` either registers the key and hands back a [`GuardPermit`], or
//! fails at once because the key is taken or the registry is full. Dropping
//! the permit removes the key.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;

/// Why an insertion was refused.
#[derive(Debug, PartialEq, Eq)]
pub enum GuardError<V> {
    /// The key is held; carries the current holder.
    Occupied(V),
    Full,
}

pub struct WriteGuard<K, V> {
    entries: Mutex<HashMap<K, V>>,
    capacity: usize,
}

/// Scoped registration of one key; released on drop.
#[must_use = "the key is released as soon as the permit is dropped"]
pub struct GuardPermit<'a, K: Eq + Hash, V> {
    guard: &'a WriteGuard<K, V>,
    key: Option<K>,
}

impl<K: Eq + Hash + Clone, V: Clone> WriteGuard<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn try_insert(&self, key: K, holder: V) -> Result<GuardPermit<'_, K, V>, GuardError<V>> {
        let mut entries = self.entries.lock();
        if let Some(current) = entries.get(&key) {
            return Err(GuardError::Occupied(current.clone()));
        }
        if entries.len() >= self.capacity {
            return Err(GuardError::Full);
        }
        entries.insert(key.clone(), holder);
        Ok(GuardPermit {
            guard: self,
            key: Some(key),
        })
    }

    /// Release `key` regardless of who holds it.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.lock().remove(key)
    }

    pub fn holder(&self, key: &K) -> Option<V> {
        self.entries.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash, V> GuardPermit<'_, K, V> {
    pub fn key(&self) -> Option<&K> {
        self.key.as_ref()
    }
}

impl<K: Eq + Hash, V> Drop for GuardPermit<'_, K, V> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.guard.entries.lock().remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn second_insert_conflicts_until_permit_drops() {
        let guard: WriteGuard<(String, String), usize> = WriteGuard::new(8);
        let key = ("alice".to_string(), "a.txt".to_string());

        let permit = guard.try_insert(key.clone(), 1).unwrap();
        assert_eq!(guard.try_insert(key.clone(), 2).err(), Some(GuardError::Occupied(1)));
        // another path of the same user is independent
        assert!(guard
            .try_insert(("alice".into(), "b.txt".into()), 3)
            .is_ok());

        drop(permit);
        assert!(guard.holder(&key).is_none());
        assert!(guard.try_insert(key, 2).is_ok());
    }

    #[test]
    fn full_registry_refuses_new_keys() {
        let guard: WriteGuard<u32, ()> = WriteGuard::new(2);
        let _a = guard.try_insert(1, ()).unwrap();
        let _b = guard.try_insert(2, ()).unwrap();
        assert_eq!(guard.try_insert(3, ()).err(), Some(GuardError::Full));
        assert_eq!(guard.len(), 2);
    }

    #[test]
    fn remove_always_succeeds() {
        let guard: WriteGuard<u32, u32> = WriteGuard::new(2);
        assert_eq!(guard.remove(&7), None);
        let permit = guard.try_insert(7, 1).unwrap();
        assert_eq!(guard.remove(&7), Some(1));
        drop(permit);
        assert!(guard.is_empty());
    }

    #[test]
    fn racing_inserts_admit_exactly_one() {
        let guard = Arc::new(WriteGuard::<&'static str, usize>::new(16));
        let wins = Arc::new(AtomicUsize::new(0));
        let start = Arc::new(Barrier::new(8));
        let hold = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let (guard, wins, start, hold) =
                    (guard.clone(), wins.clone(), start.clone(), hold.clone());
                thread::spawn(move || {
                    start.wait();
                    let permit = guard.try_insert("u>f", i);
                    if permit.is_ok() {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                    // keep the winner's permit alive until everyone tried
                    hold.wait();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(wins.load(Ordering::SeqCst), 1);
        assert!(guard.is_empty());
    }
}
