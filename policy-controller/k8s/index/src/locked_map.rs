//! A map of values with a rendezvous lock per key.
//!
//! Callers acquire a key with [`LockedMap::lock`] and operate on the stored
//! value through the returned guard: at most one guard exists per key, while
//! distinct keys never serialize with each other. `load_or_store` is atomic
//! under the key lock, and a key whose value was removed occupies no storage
//! once the last waiter departs.
//!
//! Per-key locks are async mutexes because holders keep them across
//! northbound transactions; the map itself is only touched in short
//! synchronous critical sections.

use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

struct Slot<T> {
    lock: Arc<AsyncMutex<()>>,
    value: Option<Arc<T>>,
    /// Guards and tasks queued on `lock`. The slot is evicted when this
    /// drops to zero with no stored value.
    waiters: usize,
}

pub(crate) struct LockedMap<T> {
    slots: Mutex<HashMap<String, Slot<T>>>,
}

impl<T> Default for LockedMap<T> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

// === impl LockedMap ===

impl<T> LockedMap<T> {
    /// Acquires the key, waiting for the current holder if any.
    pub(crate) async fn lock(&self, key: &str) -> KeyGuard<'_, T> {
        let lock = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(key.to_string()).or_insert_with(|| Slot {
                lock: Arc::new(AsyncMutex::new(())),
                value: None,
                waiters: 0,
            });
            slot.waiters += 1;
            slot.lock.clone()
        };
        // The waiter is registered before awaiting so a cancelled acquisition
        // still decrements on drop.
        let waiter = Waiter {
            map: self,
            key: key.to_string(),
        };
        let permit = lock.lock_owned().await;
        KeyGuard {
            _permit: permit,
            waiter,
        }
    }

    fn unregister(&self, key: &str) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(key) {
            slot.waiters -= 1;
            if slot.waiters == 0 && slot.value.is_none() {
                slots.remove(key);
            }
        }
    }
}

struct Waiter<'a, T> {
    map: &'a LockedMap<T>,
    key: String,
}

impl<T> Drop for Waiter<'_, T> {
    fn drop(&mut self) {
        self.map.unregister(&self.key);
    }
}

/// Exclusive access to one key. The stored value is read and replaced
/// through the guard; the key stays locked until the guard drops.
pub(crate) struct KeyGuard<'a, T> {
    // Field order matters: the permit must release before the waiter
    // unregisters and possibly evicts the slot.
    _permit: OwnedMutexGuard<()>,
    waiter: Waiter<'a, T>,
}

impl<T> KeyGuard<'_, T> {
    pub(crate) fn key(&self) -> &str {
        &self.waiter.key
    }

    pub(crate) fn load(&self) -> Option<Arc<T>> {
        let slots = self.waiter.map.slots.lock();
        slots.get(self.key()).and_then(|slot| slot.value.clone())
    }

    /// Returns the stored value, inserting `factory()` if none is present.
    /// The boolean reports whether the value already existed.
    pub(crate) fn load_or_store(&self, factory: impl FnOnce() -> T) -> (Arc<T>, bool) {
        let mut slots = self.waiter.map.slots.lock();
        let slot = slots
            .get_mut(self.key())
            .expect("slot must exist while a guard is held");
        match &slot.value {
            Some(value) => (value.clone(), true),
            None => {
                let value = Arc::new(factory());
                slot.value = Some(value.clone());
                (value, false)
            }
        }
    }

    /// Drops the stored value. The key's lock storage is reclaimed once the
    /// last guard or waiter departs.
    pub(crate) fn remove(&self) {
        let mut slots = self.waiter.map.slots.lock();
        if let Some(slot) = slots.get_mut(self.key()) {
            slot.value = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn one_holder_per_key() {
        let map = Arc::new(LockedMap::<usize>::default());
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let map = map.clone();
            let running = running.clone();
            let max_seen = max_seen.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = map.lock("shared").await;
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_serialize() {
        let map = Arc::new(LockedMap::<usize>::default());
        let a = map.lock("a").await;

        // Holding "a" must not block "b".
        let map2 = map.clone();
        let b = tokio::time::timeout(Duration::from_secs(1), async move {
            let guard = map2.lock("b").await;
            guard.load_or_store(|| 2);
        })
        .await;
        assert!(b.is_ok(), "lock on a distinct key must be available");
        drop(a);
    }

    #[tokio::test]
    async fn load_or_store_is_atomic_and_remove_evicts() {
        let map = LockedMap::<String>::default();
        {
            let guard = map.lock("ns1").await;
            let (v, existed) = guard.load_or_store(|| "first".to_string());
            assert!(!existed);
            assert_eq!(*v, "first");
            let (v, existed) = guard.load_or_store(|| "second".to_string());
            assert!(existed);
            assert_eq!(*v, "first");
        }
        // Value persists across lock sessions.
        {
            let guard = map.lock("ns1").await;
            assert_eq!(guard.load().as_deref(), Some(&"first".to_string()));
            guard.remove();
            assert!(guard.load().is_none());
        }
        // Removed and unheld: no storage remains.
        assert!(map.slots.lock().is_empty());
    }
}
