//! Byte-bounded in-memory cache with reference-aware eviction.
//!
//! Three tiers inside one lock: a strong LRU bounded by a byte budget, a
//! retained set exempt from eviction (entries some caller has explicitly
//! pinned via [`MemoryCache::retain`], modelling "never evict what's on
//! screen"), and a small fixed-slot weak buffer that briefly holds
//! evicted entries so an immediate re-request resurrects them without a
//! re-decode.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::decode::DecodedImage;
use crate::key::RequestKey;

/// Default number of slots in the weak recency buffer.
pub const DEFAULT_WEAK_SLOTS: usize = 16;

/// Bounded memory cache keyed by [`RequestKey`].
///
/// All operations are atomic with respect to each other (one lock).
pub struct MemoryCache {
    inner: Mutex<Inner>,
    max_bytes: u64,
    hits: AtomicU64,
    misses: AtomicU64,
}

struct Inner {
    lru: LruCache<RequestKey, Entry>,
    lru_bytes: u64,
    retained: HashMap<RequestKey, Retained>,
    retained_bytes: u64,
    weak: LruCache<RequestKey, Entry>,
}

#[derive(Clone)]
struct Entry {
    image: DecodedImage,
    size_bytes: u64,
}

struct Retained {
    entry: Option<Entry>,
    holders: usize,
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("max_bytes", &self.max_bytes)
            .finish_non_exhaustive()
    }
}

impl MemoryCache {
    /// Creates a cache with the given byte budget and the default weak
    /// buffer size.
    #[must_use]
    pub fn new(max_bytes: u64) -> Self {
        Self::with_weak_slots(max_bytes, DEFAULT_WEAK_SLOTS)
    }

    /// Creates a cache with an explicit weak buffer slot count.
    #[must_use]
    pub fn with_weak_slots(max_bytes: u64, weak_slots: usize) -> Self {
        let weak_cap = NonZeroUsize::new(weak_slots).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                lru: LruCache::unbounded(),
                lru_bytes: 0,
                retained: HashMap::new(),
                retained_bytes: 0,
                weak: LruCache::new(weak_cap),
            }),
            max_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// The configured byte budget for evictable entries.
    #[must_use]
    pub fn max_size(&self) -> u64 {
        self.max_bytes
    }

    /// Looks up an image, promoting it in the LRU.
    ///
    /// A hit in the weak buffer resurrects the entry into the strong
    /// tier.
    #[must_use]
    pub fn get(&self, key: &RequestKey) -> Option<DecodedImage> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Some(entry) = inner.lru.get(key) {
            let image = entry.image.clone();
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "memory cache hit");
            return Some(image);
        }
        if let Some(retained) = inner.retained.get(key)
            && let Some(entry) = retained.entry.as_ref()
        {
            let image = entry.image.clone();
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "memory cache hit (retained)");
            return Some(image);
        }
        if let Some(entry) = inner.weak.pop(key) {
            let image = entry.image.clone();
            inner.lru_bytes += entry.size_bytes;
            inner.lru.put(key.clone(), entry);
            Self::evict_over_budget(inner, self.max_bytes);
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "memory cache hit (resurrected)");
            return Some(image);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        trace!(key = %key, "memory cache miss");
        None
    }

    /// Looks up an image without promoting it or touching statistics.
    #[must_use]
    pub fn peek(&self, key: &RequestKey) -> Option<DecodedImage> {
        let inner = self.inner.lock();
        if let Some(entry) = inner.lru.peek(key) {
            return Some(entry.image.clone());
        }
        if let Some(retained) = inner.retained.get(key) {
            return retained.entry.as_ref().map(|e| e.image.clone());
        }
        inner.weak.peek(key).map(|e| e.image.clone())
    }

    /// Stores an image, then evicts least-recently-used unpinned entries
    /// until the evictable total fits the budget.
    pub fn put(&self, key: RequestKey, image: DecodedImage) {
        let size_bytes = image.size_bytes();
        let entry = Entry { image, size_bytes };
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.weak.pop(&key);
        if let Some(retained) = inner.retained.get_mut(&key) {
            // The key is pinned; the value lands (or is replaced) there.
            if let Some(old) = retained.entry.replace(entry) {
                inner.retained_bytes -= old.size_bytes;
            }
            inner.retained_bytes += size_bytes;
            debug!(key = %key, size = size_bytes, "stored retained image");
            return;
        }
        if let Some(old) = inner.lru.put(key.clone(), entry) {
            inner.lru_bytes -= old.size_bytes;
        }
        inner.lru_bytes += size_bytes;
        debug!(key = %key, size = size_bytes, "stored image in memory cache");
        Self::evict_over_budget(inner, self.max_bytes);
    }

    /// Removes an entry from every tier. Returns true if one existed.
    pub fn remove(&self, key: &RequestKey) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let mut removed = false;
        if let Some(entry) = inner.lru.pop(key) {
            inner.lru_bytes -= entry.size_bytes;
            removed = true;
        }
        if let Some(retained) = inner.retained.get_mut(key)
            && let Some(entry) = retained.entry.take()
        {
            inner.retained_bytes -= entry.size_bytes;
            removed = true;
        }
        removed |= inner.weak.pop(key).is_some();
        if removed {
            debug!(key = %key, "removed image from memory cache");
        }
        removed
    }

    /// Drops every entry, including retained values (holder counts
    /// survive so a later `put` for a still-pinned key lands retained).
    pub fn clear(&self) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.lru.clear();
        inner.lru_bytes = 0;
        inner.weak.clear();
        for retained in inner.retained.values_mut() {
            retained.entry = None;
        }
        inner.retained_bytes = 0;
        debug!("cleared memory cache");
    }

    /// Evicts unpinned entries, least-recently-used first, until the
    /// evictable total is at most `max_bytes`. Retained entries are
    /// untouched.
    pub fn trim_to_size(&self, max_bytes: u64) {
        let mut guard = self.inner.lock();
        Self::evict_over_budget(&mut guard, max_bytes);
    }

    /// Pins a key: while any holder remains, size-triggered eviction
    /// skips its entry. Call once per holder.
    pub fn retain(&self, key: &RequestKey) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let mut entry = inner.lru.pop(key);
        if entry.is_none() {
            entry = inner.weak.pop(key);
        } else if let Some(entry) = &entry {
            inner.lru_bytes -= entry.size_bytes;
        }
        if let Some(entry) = &entry {
            inner.retained_bytes += entry.size_bytes;
        }
        let slot = inner.retained.entry(key.clone()).or_insert(Retained {
            entry: None,
            holders: 0,
        });
        slot.holders += 1;
        if entry.is_some() {
            slot.entry = entry;
        }
        trace!(key = %key, "retained image");
    }

    /// Releases one holder of a pinned key. When the last holder
    /// releases, the entry moves back into the evictable LRU (most
    /// recently used) and the budget is re-enforced.
    pub fn release(&self, key: &RequestKey) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(retained) = inner.retained.get_mut(key) else {
            return;
        };
        retained.holders = retained.holders.saturating_sub(1);
        if retained.holders > 0 {
            return;
        }
        let slot = inner.retained.remove(key);
        if let Some(entry) = slot.and_then(|r| r.entry) {
            inner.retained_bytes -= entry.size_bytes;
            inner.lru_bytes += entry.size_bytes;
            inner.lru.put(key.clone(), entry);
        }
        trace!(key = %key, "released image");
        Self::evict_over_budget(inner, self.max_bytes);
    }

    /// Bytes held by evictable (strong, unpinned) entries.
    #[must_use]
    pub fn evictable_bytes(&self) -> u64 {
        self.inner.lock().lru_bytes
    }

    /// Bytes held by retained entries. Not bounded by the budget.
    #[must_use]
    pub fn retained_bytes(&self) -> u64 {
        self.inner.lock().retained_bytes
    }

    /// Total strong bytes (evictable + retained).
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        let inner = self.inner.lock();
        inner.lru_bytes + inner.retained_bytes
    }

    /// Cache statistics.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        let inner = self.inner.lock();
        CacheStats {
            hits,
            misses,
            hit_rate,
            entries: inner.lru.len() + inner.retained.values().filter(|r| r.entry.is_some()).count(),
            bytes: inner.lru_bytes + inner.retained_bytes,
        }
    }

    /// Walks from least-recently-used, moving evicted entries into the
    /// weak buffer. Weak-buffer eviction is unconditional LRU.
    fn evict_over_budget(inner: &mut Inner, max_bytes: u64) {
        while inner.lru_bytes > max_bytes {
            let Some((key, entry)) = inner.lru.pop_lru() else {
                break;
            };
            inner.lru_bytes -= entry.size_bytes;
            trace!(key = %key, size = entry.size_bytes, "evicted to weak buffer");
            inner.weak.put(key, entry);
        }
    }
}

/// Statistics about memory cache performance.
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Hit rate as a percentage.
    pub hit_rate: f64,
    /// Current number of strong entries.
    pub entries: usize,
    /// Current strong bytes (evictable + retained).
    pub bytes: u64,
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cache: {} entries, {} bytes, {:.1}% hit rate ({} hits, {} misses)",
            self.entries, self.bytes, self.hit_rate, self.hits, self.misses
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ImageRequest;

    fn key(name: &str) -> RequestKey {
        RequestKey::for_request(&ImageRequest::builder(name).build())
    }

    /// A 10x10 RGBA image weighs 400 bytes.
    fn image() -> DecodedImage {
        DecodedImage::new(image::DynamicImage::new_rgba8(10, 10), None)
    }

    #[test]
    fn test_put_and_get() {
        let cache = MemoryCache::new(10_000);
        cache.put(key("a"), image());
        assert!(cache.get(&key("a")).is_some());
        assert!(cache.get(&key("missing")).is_none());
        assert_eq!(cache.total_bytes(), 400);
    }

    #[test]
    fn test_budget_bound_holds_after_eviction() {
        let cache = MemoryCache::new(1_000);
        for name in ["a", "b", "c", "d", "e"] {
            cache.put(key(name), image());
        }
        // 5 * 400 = 2000 inserted; only 2 entries fit.
        assert!(cache.evictable_bytes() <= 1_000);
        assert!(cache.get(&key("e")).is_some());
        assert!(cache.get(&key("d")).is_some());
    }

    #[test]
    fn test_lru_order_evicts_oldest() {
        let cache = MemoryCache::with_weak_slots(800, 1);
        cache.put(key("a"), image());
        cache.put(key("b"), image());
        // Touch "a" so "b" is oldest.
        assert!(cache.get(&key("a")).is_some());
        cache.put(key("c"), image());
        // "b" went to the single weak slot, then nothing else evicted.
        assert!(cache.peek(&key("b")).is_some());
        cache.put(key("d"), image());
        // "a" displaced "b" from the weak slot.
        assert!(cache.peek(&key("b")).is_none());
    }

    #[test]
    fn test_weak_buffer_resurrection() {
        let cache = MemoryCache::new(400);
        cache.put(key("a"), image());
        cache.put(key("b"), image());
        // "a" was evicted into the weak buffer.
        assert_eq!(cache.evictable_bytes(), 400);
        // Re-request resurrects it into the strong tier, displacing "b".
        assert!(cache.get(&key("a")).is_some());
        assert_eq!(cache.evictable_bytes(), 400);
        let stats = cache.stats();
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn test_retained_exempt_from_eviction() {
        let cache = MemoryCache::new(400);
        cache.put(key("pinned"), image());
        cache.retain(&key("pinned"));
        cache.put(key("b"), image());
        cache.put(key("c"), image());

        // Retained bytes may exceed what the budget would allow.
        assert!(cache.get(&key("pinned")).is_some());
        assert_eq!(cache.retained_bytes(), 400);
        assert!(cache.evictable_bytes() <= 400);
    }

    #[test]
    fn test_trim_to_zero_spares_retained() {
        let cache = MemoryCache::new(10_000);
        cache.put(key("pinned"), image());
        cache.retain(&key("pinned"));
        cache.put(key("a"), image());
        cache.put(key("b"), image());

        cache.trim_to_size(0);

        assert_eq!(cache.evictable_bytes(), 0);
        assert_eq!(cache.retained_bytes(), 400);
        assert_eq!(cache.total_bytes(), 400);
        assert!(cache.get(&key("pinned")).is_some());
    }

    #[test]
    fn test_release_moves_back_to_lru() {
        let cache = MemoryCache::new(10_000);
        cache.put(key("a"), image());
        cache.retain(&key("a"));
        cache.retain(&key("a"));

        cache.release(&key("a"));
        // One holder left: still pinned.
        cache.trim_to_size(0);
        assert!(cache.get(&key("a")).is_some());

        cache.release(&key("a"));
        cache.trim_to_size(0);
        assert_eq!(cache.total_bytes(), 0);
    }

    #[test]
    fn test_put_while_retained_lands_retained() {
        let cache = MemoryCache::new(400);
        cache.retain(&key("a"));
        cache.put(key("a"), image());
        cache.put(key("b"), image());

        assert_eq!(cache.retained_bytes(), 400);
        assert!(cache.get(&key("a")).is_some());
        assert!(cache.get(&key("b")).is_some());
    }

    #[test]
    fn test_remove_and_clear() {
        let cache = MemoryCache::new(10_000);
        cache.put(key("a"), image());
        cache.put(key("b"), image());
        assert!(cache.remove(&key("a")));
        assert!(!cache.remove(&key("a")));
        cache.clear();
        assert_eq!(cache.total_bytes(), 0);
        assert!(cache.get(&key("b")).is_none());
    }

    #[test]
    fn test_stats_track_hits_and_misses() {
        let cache = MemoryCache::new(10_000);
        cache.put(key("a"), image());
        let _ = cache.get(&key("a"));
        let _ = cache.get(&key("missing"));
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }
}
