//! LRU read cache over any base storage manager.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::error::Result;
use crate::storage::manager::StorageManager;

/// Wraps a base manager with a bounded entry cache. The cache is populated
/// by `insert` and `fetch` and invalidated by `update` and `free`.
pub struct CachedStorageManager {
    inner: Box<dyn StorageManager>,
    cache: LruCache<u64, Vec<u8>>,
}

impl CachedStorageManager {
    pub fn new(inner: Box<dyn StorageManager>, entries: usize) -> Self {
        let entries = NonZeroUsize::new(entries.max(1)).expect("entries >= 1");
        Self {
            inner,
            cache: LruCache::new(entries),
        }
    }
}

impl StorageManager for CachedStorageManager {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn insert(&mut self, data: &[u8]) -> Result<u64> {
        let location = self.inner.insert(data)?;
        self.cache.put(location, data.to_vec());
        Ok(location)
    }

    fn fetch(&mut self, location: u64) -> Result<Vec<u8>> {
        if let Some(data) = self.cache.get(&location) {
            return Ok(data.clone());
        }
        let data = self.inner.fetch(location)?;
        self.cache.put(location, data.clone());
        Ok(data)
    }

    fn fetch_cached(&mut self, location: u64) -> Result<Option<Vec<u8>>> {
        Ok(self.cache.get(&location).cloned())
    }

    fn update(&mut self, location: u64, data: &[u8]) -> Result<u64> {
        let new_location = self.inner.update(location, data)?;
        self.cache.pop(&location);
        self.cache.put(new_location, data.to_vec());
        Ok(new_location)
    }

    fn free(&mut self, location: u64) -> Result<()> {
        self.cache.pop(&location);
        self.inner.free(location)
    }

    fn set_root(&mut self, root: usize, value: u64) -> Result<()> {
        self.inner.set_root(root, value)
    }

    fn root(&mut self, root: usize) -> Result<u64> {
        self.inner.root(root)
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }

    fn rollback(&mut self) -> Result<()> {
        self.cache.clear();
        self.inner.rollback()
    }

    fn close(&mut self) -> Result<()> {
        self.cache.clear();
        self.inner.close()
    }
}
