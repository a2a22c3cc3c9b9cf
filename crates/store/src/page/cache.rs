//! Shared cache of committed pages.
//!
//! Committed pages are immutable, so entries never go stale: a page is keyed by
//! the file offset of its blob, which is never reused in an append-only file.
//! Uses clock eviction (approximate LRU) for low overhead. A miss is never an
//! error; the caller re-reads the blob from the backend and inserts it.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::RwLock;

use super::Page;

/// Page cache with clock eviction.
///
/// Dirty pages never enter the cache; they live in the owning write
/// transaction's log until commit. Every entry is therefore evictable.
pub struct PageCache {
    /// Cached pages by blob offset.
    pages: RwLock<HashMap<u64, CacheEntry>>,
    /// Maximum number of pages to cache.
    capacity: usize,
    /// Clock hand for eviction.
    clock_hand: RwLock<usize>,
    /// Order of pages for clock algorithm.
    page_order: RwLock<Vec<u64>>,
    /// Total cache hits since creation.
    hits: AtomicU64,
    /// Total cache misses since creation.
    misses: AtomicU64,
}

/// Cache entry with access tracking.
struct CacheEntry {
    page: Arc<Page>,
    /// Whether page was accessed since last clock sweep (second chance).
    accessed: bool,
}

impl PageCache {
    /// Creates a new cache with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            pages: RwLock::new(HashMap::with_capacity(capacity)),
            capacity,
            clock_hand: RwLock::new(0),
            page_order: RwLock::new(Vec::with_capacity(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the cached page at `offset`, or `None` if not present.
    pub fn get(&self, offset: u64) -> Option<Arc<Page>> {
        let mut pages = self.pages.write();
        if let Some(entry) = pages.get_mut(&offset) {
            entry.accessed = true;
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(Arc::clone(&entry.page))
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Inserts a committed page, evicting one entry if the cache is full.
    ///
    /// Both locks are held across the eviction, so an offset appears in
    /// the clock order at most once.
    pub fn insert(&self, offset: u64, page: Arc<Page>) {
        let mut pages = self.pages.write();

        if let Some(entry) = pages.get_mut(&offset) {
            entry.accessed = true;
            return;
        }

        let mut page_order = self.page_order.write();
        if pages.len() >= self.capacity {
            self.evict_one(&mut pages, &mut page_order);
        }

        page_order.push(offset);
        pages.insert(offset, CacheEntry { page, accessed: true });
    }

    /// Evicts one page using the clock algorithm.
    fn evict_one(&self, pages: &mut HashMap<u64, CacheEntry>, page_order: &mut Vec<u64>) {
        let mut clock_hand = self.clock_hand.write();

        // Two sweeps at most: the first clears every second-chance bit.
        let max_iterations = page_order.len() * 2;
        for _ in 0..max_iterations {
            if *clock_hand >= page_order.len() {
                *clock_hand = 0;
            }
            let offset = page_order[*clock_hand];

            match pages.get_mut(&offset) {
                Some(entry) if entry.accessed => {
                    entry.accessed = false;
                    *clock_hand += 1;
                },
                _ => {
                    pages.remove(&offset);
                    page_order.remove(*clock_hand);
                    return;
                },
            }
        }
    }

    /// Clears all cached pages.
    pub fn clear(&self) {
        self.pages.write().clear();
        self.page_order.write().clear();
        *self.clock_hand.write() = 0;
    }

    /// Returns the number of cached pages.
    pub fn len(&self) -> usize {
        self.pages.read().len()
    }

    /// Checks if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.pages.read().is_empty()
    }

    /// Checks if the page at `offset` is cached.
    pub fn contains(&self, offset: u64) -> bool {
        self.pages.read().contains_key(&offset)
    }

    /// Returns cache statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.pages.read().len(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    /// Current number of cached pages.
    pub size: usize,
    /// Maximum capacity.
    pub capacity: usize,
    /// Total cache hits since creation.
    pub hits: u64,
    /// Total cache misses since creation.
    pub misses: u64,
}
