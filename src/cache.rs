//! Block cache
//!
//! Fixed-capacity, strictly least-recently-used cache of decoded chunk
//! blocks, keyed by `BlockId` (file name + byte offset). Offset 0 of a chunk
//! is its template; every other offset is a leaf block.
//!
//! ```text
//! entries:  BlockId → (CacheEntry, tick)
//! recency:  tick    → BlockId          (oldest tick = eviction victim)
//! ```
//!
//! Every `get` hit and every `put` stamps the entry with a fresh tick, so the
//! first key of `recency` is always the least recently used block.

use crate::btree::node::LeafNode;
use crate::btree::template::Template;
use crate::storage::types::BlockId;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// A decoded block
#[derive(Debug, Clone)]
pub enum CacheEntry {
    /// A chunk's template and its encoded length
    Template { template: Arc<Template>, length: u32 },
    Leaf(Arc<LeafNode>),
}

/// Counters for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug)]
pub struct BlockCache {
    capacity: usize,
    entries: HashMap<BlockId, (CacheEntry, u64)>,
    recency: BTreeMap<u64, BlockId>,
    tick: u64,
    stats: CacheStats,
}

/// Cache shared between executor instances
pub type SharedBlockCache = Arc<Mutex<BlockCache>>;

impl BlockCache {
    /// Create a cache holding at most `capacity` entries (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            recency: BTreeMap::new(),
            tick: 0,
            stats: CacheStats::default(),
        }
    }

    pub fn shared(capacity: usize) -> SharedBlockCache {
        Arc::new(Mutex::new(Self::new(capacity)))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Look up a block, marking it most recently used on a hit
    pub fn get(&mut self, id: &BlockId) -> Option<CacheEntry> {
        let tick = self.next_tick();
        match self.entries.get_mut(id) {
            Some((entry, stamp)) => {
                self.recency.remove(stamp);
                *stamp = tick;
                self.recency.insert(tick, id.clone());
                self.stats.hits += 1;
                Some(entry.clone())
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Membership test that leaves recency untouched
    pub fn contains(&self, id: &BlockId) -> bool {
        self.entries.contains_key(id)
    }

    /// Insert or overwrite a block. Overwriting refreshes recency without
    /// growing the cache; inserting into a full cache evicts the least
    /// recently used block first.
    pub fn put(&mut self, id: BlockId, entry: CacheEntry) {
        let tick = self.next_tick();
        self.stats.inserts += 1;

        if let Some((slot, stamp)) = self.entries.get_mut(&id) {
            self.recency.remove(stamp);
            *slot = entry;
            *stamp = tick;
            self.recency.insert(tick, id);
            return;
        }

        if self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        self.recency.insert(tick, id.clone());
        self.entries.insert(id, (entry, tick));
    }

    fn evict_oldest(&mut self) {
        if let Some((_, victim)) = self.recency.pop_first() {
            self.entries.remove(&victim);
            self.stats.evictions += 1;
            tracing::trace!(block = %victim, "Evicted block from cache");
        }
    }

    pub fn get_template(&mut self, id: &BlockId) -> Option<(Arc<Template>, u32)> {
        match self.get(id)? {
            CacheEntry::Template { template, length } => Some((template, length)),
            CacheEntry::Leaf(_) => None,
        }
    }

    pub fn get_leaf(&mut self, id: &BlockId) -> Option<Arc<LeafNode>> {
        match self.get(id)? {
            CacheEntry::Leaf(leaf) => Some(leaf),
            CacheEntry::Template { .. } => None,
        }
    }

    /// Drop every entry; counters are kept
    pub fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
    }
}
