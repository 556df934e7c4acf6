//! LRU cache for computed spectral blocks.

use std::sync::Arc;

use lru::LruCache;
use serde::Serialize;

/// Cache key: (block_row, block_col) in the spatial chunk grid.
pub type BlockKey = (usize, usize);

/// Cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub memory_bytes: u64,
    pub evictions: u64,
}

/// LRU cache of spectral blocks with memory-bounded eviction.
pub struct BlockCache {
    cache: LruCache<BlockKey, Arc<Vec<f32>>>,
    memory_limit: usize,
    current_memory: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl BlockCache {
    /// Create a cache holding at most `memory_limit` bytes of spectra.
    pub fn new(memory_limit: usize) -> Self {
        Self {
            cache: LruCache::unbounded(),
            memory_limit,
            current_memory: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    pub fn get(&mut self, key: &BlockKey) -> Option<Arc<Vec<f32>>> {
        match self.cache.get(key) {
            Some(block) => {
                self.hits += 1;
                Some(block.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Insert a block, evicting least recently used blocks to make room.
    ///
    /// Blocks larger than the whole cache are not kept.
    pub fn insert(&mut self, key: BlockKey, block: Arc<Vec<f32>>) {
        let size = block_size(&block);
        if size > self.memory_limit {
            return;
        }

        if let Some(old) = self.cache.pop(&key) {
            self.current_memory = self.current_memory.saturating_sub(block_size(&old));
        }

        while self.current_memory + size > self.memory_limit {
            match self.cache.pop_lru() {
                Some((_, evicted)) => {
                    self.current_memory = self.current_memory.saturating_sub(block_size(&evicted));
                    self.evictions += 1;
                }
                None => break,
            }
        }

        self.cache.put(key, block);
        self.current_memory += size;
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            entries: self.cache.len(),
            memory_bytes: self.current_memory as u64,
            evictions: self.evictions,
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

fn block_size(block: &[f32]) -> usize {
    std::mem::size_of_val(block)
}
