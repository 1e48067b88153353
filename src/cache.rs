//! Time-bounded memoization handed to whichever service needs it.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tracing::trace;

/// TTL per key, with a fallback for keys not listed.
#[derive(Debug, Clone)]
pub struct TtlPolicy<K> {
    default_ttl: Duration,
    overrides: HashMap<K, Duration>,
}

impl<K: Hash + Eq> TtlPolicy<K> {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            overrides: HashMap::new(),
        }
    }

    pub fn with(mut self, key: K, ttl: Duration) -> Self {
        self.overrides.insert(key, ttl);
        self
    }

    pub fn ttl_for(&self, key: &K) -> Duration {
        self.overrides.get(key).copied().unwrap_or(self.default_ttl)
    }
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    stored_at: Instant,
}

#[derive(Debug)]
pub struct TtlCache<K, V> {
    entries: RwLock<HashMap<K, Entry<V>>>,
    policy: TtlPolicy<K>,
}

impl<K, V> TtlCache<K, V>
where
    K: Hash + Eq + Clone + std::fmt::Debug,
    V: Clone,
{
    pub fn new(policy: TtlPolicy<K>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            policy,
        }
    }

    /// Returns the cached value unless it has outlived its TTL.
    pub fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.read().ok()?;
        let entry = entries.get(key)?;
        if entry.stored_at.elapsed() < self.policy.ttl_for(key) {
            trace!(?key, "cache hit");
            Some(entry.value.clone())
        } else {
            trace!(?key, "cache entry expired");
            None
        }
    }

    pub fn set(&self, key: K, value: V) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(
                key,
                Entry {
                    value,
                    stored_at: Instant::now(),
                },
            );
        }
    }

    pub fn invalidate(&self, key: &K) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(key);
        }
    }
}
