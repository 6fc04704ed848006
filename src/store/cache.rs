use crate::prelude::{Arc, Mutex};
use crate::tiles::key::ChunkKey;
use lru::LruCache;
use ndarray::ArrayD;
use std::num::NonZeroUsize;

/// Decoded chunk shared between the store cache and every tile holding it
pub type Chunk = Arc<ArrayD<f32>>;

/// Array path and chunk index of a cached chunk
pub type ChunkCacheKey = (String, ChunkKey);

/// In-memory chunk cache using LRU eviction
#[derive(Debug)]
pub struct ChunkCache {
    cache: Arc<Mutex<LruCache<ChunkCacheKey, Chunk>>>,
}

impl ChunkCache {
    /// Create a cache holding at most `capacity` chunks; `None` never evicts
    pub fn new(capacity: Option<usize>) -> Self {
        let cache = match capacity.and_then(NonZeroUsize::new) {
            Some(capacity) => LruCache::new(capacity),
            None => LruCache::unbounded(),
        };
        Self {
            cache: Arc::new(Mutex::new(cache)),
        }
    }

    /// Get a chunk from the cache
    pub fn get(&self, key: &ChunkCacheKey) -> Option<Chunk> {
        self.cache.lock().ok()?.get(key).cloned()
    }

    pub fn put(&self, key: ChunkCacheKey, chunk: Chunk) {
        if let Ok(mut cache) = self.cache.lock() {
            if let Some((evicted, _)) = cache.push(key, chunk) {
                log::trace!("evicted chunk {} of {}", evicted.1, evicted.0);
            }
        }
    }

    pub fn contains(&self, key: &ChunkCacheKey) -> bool {
        self.cache
            .lock()
            .ok()
            .map(|cache| cache.contains(key))
            .unwrap_or(false)
    }

    pub fn clear(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }

    /// Get the current number of cached chunks
    pub fn len(&self) -> usize {
        self.cache.lock().ok().map(|cache| cache.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    fn chunk(value: f32) -> Chunk {
        Arc::new(ArrayD::from_elem(IxDyn(&[2, 2]), value))
    }

    fn key(path: &str, index: u64) -> ChunkCacheKey {
        (path.to_string(), ChunkKey::new(vec![index, 0]))
    }

    #[test]
    fn test_bounded_cache_evicts_least_recent() {
        let cache = ChunkCache::new(Some(2));
        cache.put(key("0/tavg", 0), chunk(0.0));
        cache.put(key("0/tavg", 1), chunk(1.0));
        assert!(cache.get(&key("0/tavg", 0)).is_some());

        cache.put(key("0/tavg", 2), chunk(2.0));
        assert_eq!(cache.len(), 2);
        assert!(cache.contains(&key("0/tavg", 0)));
        assert!(!cache.contains(&key("0/tavg", 1)));
    }

    #[test]
    fn test_unbounded_cache_keeps_everything() {
        let cache = ChunkCache::new(None);
        for i in 0..100 {
            cache.put(key("1/tavg", i), chunk(i as f32));
        }
        assert_eq!(cache.len(), 100);
        cache.clear();
        assert!(cache.is_empty());
    }
}
