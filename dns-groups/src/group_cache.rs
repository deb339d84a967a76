//! A process-wide cache of loaded record stores, keyed by group
//! identifier, with TTL-based idle eviction and single-flight loads.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::Mutex as AsyncMutex;

use crate::error::Error;
use crate::group::GroupIndex;
use crate::record::RecordStore;

/// Loaded record stores are considered fresh for this long before a
/// cache hit re-triggers a load from disk.
pub const DEFAULT_GROUP_CACHE_TTL: Duration = Duration::from_secs(300);

struct Entry {
    store: Arc<AsyncMutex<RecordStore>>,
    loaded_at: Instant,
}

/// Memoizes record stores loaded via a `GroupIndex` so the dispatcher
/// does not re-decode a group's blob from disk on every query.
pub struct GroupCache {
    index: Arc<GroupIndex>,
    ttl: Duration,
    entries: StdMutex<HashMap<String, Entry>>,
    load_locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl GroupCache {
    pub fn new(index: Arc<GroupIndex>) -> Self {
        Self::with_ttl(index, DEFAULT_GROUP_CACHE_TTL)
    }

    pub fn with_ttl(index: Arc<GroupIndex>, ttl: Duration) -> Self {
        GroupCache {
            index,
            ttl,
            entries: StdMutex::new(HashMap::new()),
            load_locks: StdMutex::new(HashMap::new()),
        }
    }

    fn fresh(&self, group_id: &str) -> Option<Arc<AsyncMutex<RecordStore>>> {
        let entries = self.entries.lock().unwrap();
        let entry = entries.get(group_id)?;
        if entry.loaded_at.elapsed() < self.ttl {
            Some(entry.store.clone())
        } else {
            None
        }
    }

    fn load_lock(&self, group_id: &str) -> Arc<AsyncMutex<()>> {
        self.load_locks
            .lock()
            .unwrap()
            .entry(group_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Return the loaded store for `group_id`, loading it via the
    /// group index on a cache miss. At most one load per group
    /// identifier runs concurrently; other callers wait for it.
    ///
    /// # Errors
    ///
    /// `Error::NotFound` if no such group exists in the catalogue, or
    /// an I/O error if the blob cannot be read.
    pub async fn get(&self, group_id: &str) -> Result<Arc<AsyncMutex<RecordStore>>, Error> {
        if let Some(store) = self.fresh(group_id) {
            return Ok(store);
        }

        let lock = self.load_lock(group_id);
        let _guard = lock.lock().await;

        if let Some(store) = self.fresh(group_id) {
            return Ok(store);
        }

        let group = self
            .index
            .get_by_id(group_id)
            .await
            .ok_or_else(|| Error::NotFound(group_id.to_string()))?;
        let store = self.index.load_store(&group).await?;
        let store = Arc::new(AsyncMutex::new(store));

        self.entries.lock().unwrap().insert(
            group_id.to_string(),
            Entry {
                store: store.clone(),
                loaded_at: Instant::now(),
            },
        );

        Ok(store)
    }

    /// Drop any cached entry for `group_id`, forcing the next `get`
    /// to reload it from disk.
    pub fn invalidate(&self, group_id: &str) {
        self.entries.lock().unwrap().remove(group_id);
    }

    /// Remove entries whose age exceeds the TTL. Returns the number
    /// removed.
    pub fn trim(&self) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        let ttl = self.ttl;
        entries.retain(|_, entry| entry.loaded_at.elapsed() < ttl);
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_cache() -> (GroupCache, PathBufGuard) {
        let dir = std::env::temp_dir().join(format!(
            "dns-groups-gc-test-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let index = Arc::new(GroupIndex::load(dir.clone(), Vec::new()).await.unwrap());
        (GroupCache::new(index), PathBufGuard(dir))
    }

    struct PathBufGuard(std::path::PathBuf);
    impl Drop for PathBufGuard {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    #[tokio::test]
    async fn get_loads_and_then_hits_cache() {
        let (cache, _guard) = temp_cache().await;
        let store1 = cache.get("default").await.unwrap();
        let store2 = cache.get("default").await.unwrap();
        assert!(Arc::ptr_eq(&store1, &store2));
    }

    #[tokio::test]
    async fn trim_evicts_expired_entries() {
        let (cache, _guard) = temp_cache_with_zero_ttl().await;
        cache.get("default").await.unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(1, cache.trim());
    }

    async fn temp_cache_with_zero_ttl() -> (GroupCache, PathBufGuard) {
        let dir = std::env::temp_dir().join(format!(
            "dns-groups-gc-test2-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let index = Arc::new(GroupIndex::load(dir.clone(), Vec::new()).await.unwrap());
        (
            GroupCache::with_ttl(index, Duration::from_millis(1)),
            PathBufGuard(dir),
        )
    }
}
