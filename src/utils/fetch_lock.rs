use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Serializes mirror fetches per URL. Revalidation, rotation and write of
/// one mirror entry run under its guard; unrelated URLs proceed in
/// parallel.
pub struct FetchLockManager {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FetchLockManager {
    pub fn new() -> Self {
        Self { locks: Mutex::new(HashMap::new()) }
    }

    pub async fn lock(&self, url: &str) -> FetchGuard {
        let entry = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(url.to_string()).or_default())
        };
        FetchGuard { _guard: entry.lock_owned().await }
    }
}

impl Default for FetchLockManager {
    fn default() -> Self {
        Self::new()
    }
}

pub struct FetchGuard {
    _guard: OwnedMutexGuard<()>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_lock_is_reacquirable_after_release() {
        let manager = FetchLockManager::new();
        drop(manager.lock("http://a/epg.xml").await);
        let _again = manager.lock("http://a/epg.xml").await;
    }

    #[tokio::test]
    async fn test_distinct_urls_do_not_block_each_other() {
        let manager = FetchLockManager::new();
        let _a = manager.lock("http://a/epg.xml").await;
        // would deadlock here if both URLs shared one lock
        let _b = manager.lock("http://b/epg.xml").await;
    }

    #[tokio::test]
    async fn test_same_url_waits_for_release() {
        let manager = Arc::new(FetchLockManager::new());
        let guard = manager.lock("http://a/epg.xml").await;

        let waiter = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                let _guard = manager.lock("http://a/epg.xml").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
    }
}
