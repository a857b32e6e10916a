//! In-memory lock store

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::repository::LockStore;

struct LockEntry {
    holder: String,
    expires_at: Instant,
}

impl LockEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Process-local [`LockStore`]
///
/// Mutual exclusion only holds within one process; deployments with several
/// orchestrator instances need a shared store.
#[derive(Default)]
pub struct MemoryLockStore {
    entries: Mutex<HashMap<String, LockEntry>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, LockEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Holder of a live entry under `key`
    pub fn holder(&self, key: &str) -> Option<String> {
        self.entries()
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.holder.clone())
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_insert(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries();
        if entries.get(key).is_some_and(|entry| !entry.is_expired()) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            LockEntry {
                holder: holder.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn remove(&self, key: &str, holder: &str) -> Result<bool> {
        let mut entries = self.entries();
        match entries.get(key) {
            Some(entry) if entry.holder == holder => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_is_exclusive_until_removed() {
        let store = MemoryLockStore::new();
        let ttl = Duration::from_secs(30);

        assert!(store.try_insert("k", "a", ttl).await.unwrap());
        assert!(!store.try_insert("k", "b", ttl).await.unwrap());
        assert!(!store.remove("k", "b").await.unwrap());
        assert!(store.remove("k", "a").await.unwrap());
        assert!(store.try_insert("k", "b", ttl).await.unwrap());
        assert_eq!(store.holder("k").as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_expired_entry_can_be_taken() {
        let store = MemoryLockStore::new();
        assert!(store.try_insert("k", "a", Duration::from_millis(1)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(store.try_insert("k", "b", Duration::from_secs(30)).await.unwrap());
        assert!(!store.remove("k", "a").await.unwrap());
    }
}
