#![forbid(unsafe_code)]

//! Small in-memory metadata cache shared by every request.
//!
//! Entries expire after a fixed TTL and the map never grows beyond its
//! capacity. A single mutex guards everything; lookups are a hash probe and an
//! `Instant` comparison, so contention does not matter at the request rates
//! this service sees.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

pub const DEFAULT_TTL: Duration = Duration::from_secs(180);
pub const DEFAULT_CAPACITY: usize = 50;

struct Entry<V> {
    value: V,
    stored_at: Instant,
    // Breaks ties between entries stored at the same instant.
    sequence: u64,
}

struct Inner<V> {
    entries: HashMap<String, Entry<V>>,
    next_sequence: u64,
}

/// Key/value store with per-entry expiry and oldest-first eviction.
pub struct TtlCache<V> {
    inner: Mutex<Inner<V>>,
    ttl: Duration,
    capacity: usize,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                next_sequence: 0,
            }),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Returns the value while it is younger than the TTL. Expired entries are
    /// dropped on the way out.
    pub fn get(&self, key: &str) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    /// Inserts or refreshes `key`, evicting the oldest entry when the cache
    /// grows past its capacity.
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_at(key.into(), value, Instant::now());
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn get_at(&self, key: &str, now: Instant) -> Option<V> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.get(key)?;
        if now.saturating_duration_since(entry.stored_at) < self.ttl {
            return Some(entry.value.clone());
        }
        inner.entries.remove(key);
        None
    }

    fn set_at(&self, key: String, value: V, now: Instant) {
        let mut inner = self.inner.lock();
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.entries.insert(
            key,
            Entry {
                value,
                stored_at: now,
                sequence,
            },
        );

        if inner.entries.len() > self.capacity {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| (entry.stored_at, entry.sequence))
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                inner.entries.remove(&oldest);
            }
        }
    }
}

impl<V: Clone> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_CAPACITY)
    }
}
