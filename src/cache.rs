//! Least-recently-used cache bounded both by entry count and by estimated bytes.
//!
//! Entries are borrowed out of the cache for exclusive use and handed back with
//! [`LruCache::put`]. A borrowed entry is not resident, so a second borrow of the
//! same key while the first is checked out builds an independent duplicate.

// Standard library imports
use std::fmt;
use std::hash::Hash;

// External crate imports
use log::{debug, warn};

// Internal crate imports
use crate::errors::Error;

/// Values that know roughly how much memory they pin.
pub trait CanEstimateSize {
    fn size(&self) -> usize;
}

/// Builds a value on cache miss.
pub type CreateAction<K, V> = Box<dyn Fn(&K) -> Result<V, Error> + Send + Sync>;

/// Releases whatever an evicted value holds outside the process.
pub type EvictAction<V> = Box<dyn Fn(V) -> Result<(), Error> + Send + Sync>;

pub struct LruCache<K, V>
where
    K: Hash + Eq,
    V: CanEstimateSize,
{
    entries: lru::LruCache<K, V>,
    max_entries: usize,
    max_bytes: usize,
    current_size: usize,
    create_action: CreateAction<K, V>,
    on_evict: EvictAction<V>,
}

impl<K, V> fmt::Debug for LruCache<K, V>
where
    K: Hash + Eq,
    V: CanEstimateSize,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LruCache")
            .field("len", &self.entries.len())
            .field("max_entries", &self.max_entries)
            .field("max_bytes", &self.max_bytes)
            .field("current_size", &self.current_size)
            .finish()
    }
}

impl<K, V> LruCache<K, V>
where
    K: Hash + Eq,
    V: CanEstimateSize,
{
    /// A zero bound on either dimension disables caching entirely.
    pub fn new(
        max_entries: usize,
        max_bytes: usize,
        create_action: CreateAction<K, V>,
        on_evict: EvictAction<V>,
    ) -> LruCache<K, V> {
        LruCache {
            entries: lru::LruCache::unbounded(),
            max_entries,
            max_bytes,
            current_size: 0,
            create_action,
            on_evict,
        }
    }

    /// Take the entry for `key` out of the cache, or build a fresh one.
    pub fn borrow(&mut self, key: K) -> Result<V, Error> {
        match self.entries.pop(&key) {
            Some(value) => {
                self.current_size -= value.size();
                Ok(value)
            }
            None => self.create(&key),
        }
    }

    /// Build a value without looking at resident entries.
    pub fn create(&self, key: &K) -> Result<V, Error> {
        (self.create_action)(key).map_err(|err| match err {
            Error::StatementCreation(_) => err,
            other => Error::StatementCreation(other.to_string()),
        })
    }

    /// Return a value to the cache, evicting least recently used entries
    /// until both bounds hold again.
    pub fn put(&mut self, key: K, value: V) {
        let value_size = value.size();
        if self.max_entries == 0 || self.max_bytes == 0 || value_size.saturating_mul(2) > self.max_bytes
        {
            // Cache disabled, or a single entry would take over half the budget.
            self.evict_value(value);
            return;
        }

        self.current_size += value_size;
        if let Some((_, previous)) = self.entries.push(key, value) {
            // A duplicate built by a concurrent borrow of the same key.
            self.current_size -= previous.size();
            self.evict_value(previous);
        }

        self.enforce_bounds();
    }

    /// Drop a resident entry without running the evict hook.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let value = self.entries.pop(key)?;
        self.current_size -= value.size();
        Some(value)
    }

    /// Forget every resident entry without running the evict hook. Used when
    /// the server side has already released what the entries refer to.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.current_size = 0;
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn current_size(&self) -> usize {
        self.current_size
    }

    fn enforce_bounds(&mut self) {
        while self.entries.len() > self.max_entries || self.current_size > self.max_bytes {
            match self.entries.pop_lru() {
                Some((_, eldest)) => {
                    self.current_size -= eldest.size();
                    self.evict_value(eldest);
                }
                None => break,
            }
        }
    }

    fn evict_value(&self, value: V) {
        let size = value.size();
        match (self.on_evict)(value) {
            Ok(()) => debug!("Evicted cache entry of {size} bytes"),
            // The bounding pass keeps going regardless.
            Err(err) => warn!("Error while evicting cache entry: {err}"),
        }
    }
}
