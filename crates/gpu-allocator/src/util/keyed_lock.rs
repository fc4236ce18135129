//! Per-key async lock whose entries disappear once nobody holds them

use std::hash::Hash;
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap<K> = Arc<DashMap<K, Weak<Mutex<()>>>>;

/// Guard of one key. Dropping the last guard of a key removes its entry.
pub struct KeyedLockGuard<K>
where
    K: Hash + Eq + Clone,
{
    guard: Option<OwnedMutexGuard<()>>,
    mutex: Arc<Mutex<()>>,
    key: K,
    locks: LockMap<K>,
}

impl<K> Drop for KeyedLockGuard<K>
where
    K: Hash + Eq + Clone,
{
    fn drop(&mut self) {
        drop(self.guard.take());
        // only `self.mutex` left means no holder and no waiter
        if Arc::strong_count(&self.mutex) == 1 {
            self.locks.remove(&self.key);
        }
    }
}

/// Serializes async work per key while distinct keys proceed in parallel.
///
/// Used to order backend calls that touch the same device, such as a
/// session start racing with a session stop.
pub struct KeyedAsyncLock<K>
where
    K: Hash + Eq + Clone,
{
    locks: LockMap<K>,
}

impl<K> KeyedAsyncLock<K>
where
    K: Hash + Eq + Clone,
{
    pub fn new() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
        }
    }

    pub async fn lock(&self, key: &K) -> KeyedLockGuard<K> {
        let mutex = self.get_or_create(key);
        let guard = Arc::clone(&mutex).lock_owned().await;
        KeyedLockGuard {
            guard: Some(guard),
            mutex,
            key: key.clone(),
            locks: Arc::clone(&self.locks),
        }
    }

    fn get_or_create(&self, key: &K) -> Arc<Mutex<()>> {
        loop {
            match self.locks.entry(key.clone()) {
                Entry::Occupied(occupied) => {
                    if let Some(mutex) = occupied.get().upgrade() {
                        return mutex;
                    }
                    occupied.remove();
                }
                Entry::Vacant(vacant) => {
                    let mutex = Arc::new(Mutex::new(()));
                    vacant.insert(Arc::downgrade(&mutex));
                    return mutex;
                }
            }
        }
    }

    /// Keys currently locked or waited on.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl<K> Default for KeyedAsyncLock<K>
where
    K: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn same_device_is_serialized() {
        let locks = Arc::new(KeyedAsyncLock::<String>::new());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let in_flight = Arc::clone(&in_flight);
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(&"card0".to_string()).await;
                assert_eq!(in_flight.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(Duration::from_millis(1)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn distinct_devices_do_not_block_each_other() {
        let locks = KeyedAsyncLock::<String>::new();
        let card0 = locks.lock(&"card0".to_string()).await;
        let card1 = tokio::time::timeout(
            Duration::from_secs(1),
            locks.lock(&"card1".to_string()),
        )
        .await
        .expect("card1 must not wait for card0");
        assert_eq!(locks.len(), 2);

        drop(card0);
        assert_eq!(locks.len(), 1);
        drop(card1);
        assert!(locks.is_empty());
    }
}
