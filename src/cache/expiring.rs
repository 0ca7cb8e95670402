//! In-memory key/value cache with per-entry expiry.
//!
//! Entries carry an absolute expiry computed once at write time.  Reads judge
//! expiry lazily and never evict; expired entries stay in storage until
//! [`ExpiringCache::cleanup`] (usually driven by [`super::sweep`]) or
//! [`ExpiringCache::flush`] removes them.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use super::sweep::Sweep;

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Source of "now" for expiry decisions.  Swapped out in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall-clock backed by [`Instant::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    /// `None` means the entry never expires.
    expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    fn expired(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(at) => now > at,
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Concurrency-safe expiring map.
///
/// Reads (`get`, `count`) take a shared lock; everything else takes the
/// exclusive lock.  A zero TTL (default or per-call) means "never expires".
pub struct ExpiringCache<K, V> {
    default_ttl: Duration,
    items: RwLock<HashMap<K, Entry<V>>>,
    clock: Arc<dyn Clock>,
}

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    /// Create a cache whose entries expire `default_ttl` after being set.
    pub fn new(default_ttl: Duration) -> Self {
        Self::with_clock(default_ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(default_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            default_ttl,
            items: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Return the value for `key` if present and not yet expired.
    pub fn get(&self, key: &K) -> Option<V> {
        let items = self.read();
        let entry = items.get(key)?;
        if entry.expired(self.clock.now()) {
            return None;
        }
        Some(entry.value.clone())
    }

    /// Insert `value` under `key` using the default TTL, replacing any
    /// previous entry.
    pub fn set(&self, key: K, value: V) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    /// Insert `value` under `key` with an explicit TTL.
    pub fn set_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let expires_at = if ttl.is_zero() {
            None
        } else {
            self.clock.now().checked_add(ttl)
        };
        self.write().insert(key, Entry { value, expires_at });
    }

    /// Remove `key`.  Returns `true` if an entry was present.
    pub fn delete(&self, key: &K) -> bool {
        self.write().remove(key).is_some()
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn count(&self) -> usize {
        self.read().len()
    }

    /// Remove every expired entry and return how many were removed.
    pub fn cleanup(&self) -> usize {
        let mut items = self.write();
        let now = self.clock.now();
        let before = items.len();
        items.retain(|_, entry| !entry.expired(now));
        before - items.len()
    }

    /// Drop every entry regardless of expiry.
    pub fn flush(&self) {
        self.write().clear();
    }

    // A panic while holding the lock cannot leave the map half-updated
    // (every mutation is a single HashMap call), so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<K, Entry<V>>> {
        self.items.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<K, Entry<V>>> {
        self.items.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl<K, V> Sweep for ExpiringCache<K, V>
where
    K: Eq + Hash + Send + Sync,
    V: Clone + Send + Sync,
{
    fn cleanup(&self) -> usize {
        ExpiringCache::cleanup(self)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
