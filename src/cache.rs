//! Bounded in-memory volume cache with LRU eviction.
//!
//! Entries are keyed by resource key (plus a `-t{n}` suffix for
//! single-timepoint volumes) and accounted by voxel-buffer byte size. Every
//! hit bumps a monotonic use counter; inserting past capacity evicts the
//! entries with the smallest counter until the total fits again.

use crate::utils::format_bytes;
use crate::volume::Volume;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Default capacity: 1 GiB of voxel data.
pub const DEFAULT_CACHE_CAPACITY: usize = 1024 * 1024 * 1024;

struct VolumeEntry {
    volume: Arc<Volume>,
    size_in_bytes: usize,
    last_use_index: u64,
}

struct CacheInner {
    entries: HashMap<String, VolumeEntry>,
    // monotonic counter shared by all entries, the LRU ordering signal
    cache_uses: u64,
    total_bytes: usize,
}

/// Shared cache of normalized volumes.
pub struct VolumeCache {
    inner: Mutex<CacheInner>,
    capacity_bytes: usize,
}

impl VolumeCache {
    pub fn new(capacity_bytes: usize) -> Self {
        VolumeCache {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                cache_uses: 0,
                total_bytes: 0,
            }),
            capacity_bytes,
        }
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    /// Look up a whole-volume entry, marking it as recently used.
    pub fn get(&self, key: &str) -> Option<Arc<Volume>> {
        let mut inner = self.inner.lock();
        let use_index = inner.cache_uses;
        inner.cache_uses += 1;
        let entry = inner.entries.get_mut(key)?;
        entry.last_use_index = use_index;
        Some(Arc::clone(&entry.volume))
    }

    /// Insert or replace a whole-volume entry, evicting as needed.
    pub fn put(&self, key: &str, volume: Arc<Volume>) {
        let size_in_bytes = volume.size_in_bytes();
        if size_in_bytes > self.capacity_bytes {
            warn!(
                key,
                size = %format_bytes(size_in_bytes),
                capacity = %format_bytes(self.capacity_bytes),
                "volume exceeds cache capacity, not caching"
            );
            return;
        }

        let mut inner = self.inner.lock();
        let use_index = inner.cache_uses;
        inner.cache_uses += 1;
        if let Some(previous) = inner.entries.insert(
            key.to_string(),
            VolumeEntry {
                volume,
                size_in_bytes,
                last_use_index: use_index,
            },
        ) {
            inner.total_bytes -= previous.size_in_bytes;
        }
        inner.total_bytes += size_in_bytes;

        while inner.total_bytes > self.capacity_bytes {
            let evict_key = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_use_index)
                .map(|(key, _)| key.clone());
            match evict_key {
                Some(evict_key) => {
                    if let Some(evicted) = inner.entries.remove(&evict_key) {
                        inner.total_bytes -= evicted.size_in_bytes;
                        debug!(
                            key = %evict_key,
                            freed = %format_bytes(evicted.size_in_bytes),
                            remaining = %format_bytes(inner.total_bytes),
                            "evicted least recently used volume"
                        );
                    }
                }
                None => break,
            }
        }
    }

    /// Look up a single-timepoint entry.
    pub fn get_timepoint(&self, key: &str, time_point: usize) -> Option<Arc<Volume>> {
        self.get(&Self::timepoint_key(key, time_point))
    }

    /// Insert a single-timepoint entry.
    pub fn put_timepoint(&self, key: &str, time_point: usize, volume: Arc<Volume>) {
        self.put(&Self::timepoint_key(key, time_point), volume);
    }

    pub fn total_bytes(&self) -> usize {
        self.inner.lock().total_bytes
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Drop every entry.
    pub fn purge(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.total_bytes = 0;
    }

    fn timepoint_key(key: &str, time_point: usize) -> String {
        format!("{key}-t{time_point}")
    }
}

impl Default for VolumeCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}
