//! Bounded, expiry-aware local caches.
//!
//! Each entry carries the timestamp at which it stops being valid. Moka
//! reclaims the memory once that much wall time has passed; reads check the
//! recorded expiry against the caller's `now`, so an entry is never returned
//! at or after its expiry even if moka has not reclaimed it yet.

use std::time::{Duration, Instant};

use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use moka::Expiry;

use super::clock::Micros;
use super::key::VisitorKey;

/// Upper bound on how long moka keeps an entry; reads still honour the
/// recorded expiry.
const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

#[derive(Debug, Clone)]
struct Timed<V> {
    value: V,
    expiry: Micros,
    ttl: Duration,
}

struct EntryExpiry;

impl<V> Expiry<VisitorKey, Timed<V>> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &VisitorKey,
        value: &Timed<V>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &VisitorKey,
        value: &Timed<V>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// A bounded map from visitor key to a value with a per-entry expiry.
pub struct LocalCache<V> {
    inner: Cache<VisitorKey, Timed<V>>,
}

impl<V> LocalCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache holding at most `capacity` entries.
    ///
    /// When full, the least recently used entry makes room for the new one.
    pub fn new(capacity: u64) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(capacity)
                .eviction_policy(EvictionPolicy::lru())
                .expire_after(EntryExpiry)
                .build(),
        }
    }

    /// Get the value for `key` if it has not expired at `now`.
    pub fn get(&self, key: &VisitorKey, now: Micros) -> Option<V> {
        let entry = self.inner.get(key)?;
        if entry.expiry <= now {
            self.inner.invalidate(key);
            return None;
        }
        Some(entry.value)
    }

    /// Store `value` until `expiry`.
    ///
    /// Returns `false`, and drops any previous entry, when `expiry` is not
    /// after `now`.
    pub fn set(&self, key: VisitorKey, value: V, expiry: Micros, now: Micros) -> bool {
        if expiry <= now {
            self.inner.invalidate(&key);
            return false;
        }
        let ttl = Duration::from_micros(expiry - now).min(MAX_TTL);
        self.inner.insert(key, Timed { value, expiry, ttl });
        true
    }

    pub fn delete(&self, key: &VisitorKey) {
        self.inner.invalidate(key);
    }

    /// Keys of all entries still valid at `now`.
    pub fn keys(&self, now: Micros) -> Vec<VisitorKey> {
        self.inner
            .iter()
            .filter(|(_, entry)| entry.expiry > now)
            .map(|(key, _)| (*key).clone())
            .collect()
    }
}
