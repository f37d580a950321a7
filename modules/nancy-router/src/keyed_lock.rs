use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Arena of per-key async locks. Concurrent submissions of the same
/// `packet_id` serialize through the same small mutex while unrelated
/// packets proceed in parallel. The arena is bounded: once it grows past
/// `capacity`, entries nobody currently holds are evicted.
pub struct KeyedLocks {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    capacity: usize,
}

impl KeyedLocks {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap();
            if map.len() >= self.capacity {
                // strong_count == 1 means only the arena holds it: idle.
                map.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_key_serializes() {
        let locks = Arc::new(KeyedLocks::new(16));
        let guard = locks.acquire("pkt").await;

        let locks2 = locks.clone();
        let contender = tokio::spawn(async move { locks2.acquire("pkt").await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn different_keys_are_independent() {
        let locks = KeyedLocks::new(16);
        let _a = locks.acquire("a").await;
        let _b = locks.acquire("b").await; // would deadlock if shared
    }

    #[tokio::test]
    async fn idle_entries_evict_at_capacity() {
        let locks = KeyedLocks::new(4);
        for i in 0..4 {
            let guard = locks.acquire(&format!("k{i}")).await;
            drop(guard);
        }
        assert_eq!(locks.len(), 4);

        // Held locks survive eviction; idle ones go.
        let _held = locks.acquire("held").await;
        let _more = locks.acquire("more").await;
        assert!(locks.len() <= 3);
    }
}
