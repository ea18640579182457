//! # Result Cache
//!
//! Short-lived memoization of classifications. Bounded by capacity with
//! oldest-inserted eviction; staleness is checked lazily when an entry is
//! read, there is no background sweep.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{Classification, ErrorContext};

/// Number of message characters that participate in the cache key
pub const KEY_MESSAGE_CHARS: usize = 50;

/// Configuration for the result cache
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries
    pub capacity: usize,
    /// Maximum age of a usable entry
    #[serde(with = "crate::config::duration_secs")]
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            ttl: Duration::from_secs(300),
        }
    }
}

/// Builds the cache key: `{status|unknown}_{first 50 chars of message}`
pub fn cache_key(context: &ErrorContext) -> String {
    let message: String = context
        .error_message
        .as_deref()
        .unwrap_or_default()
        .chars()
        .take(KEY_MESSAGE_CHARS)
        .collect();
    format!("{}_{}", context.status_key(), message)
}

/// A cache entry stamped with its insertion time and order
#[derive(Debug, Clone)]
struct CacheEntry {
    result: Classification,
    stored_at: Instant,
    seq: u64,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    /// Insertion sequence -> key, oldest first
    order: BTreeMap<u64, String>,
}

/// Bounded TTL cache of classification results
#[derive(Debug)]
pub struct ResultCache {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
    next_seq: AtomicU64,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CacheInner::default()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Gets a fresh value; an entry older than the TTL reads as a miss
    pub fn get(&self, key: &str) -> Option<Classification> {
        self.get_at(key, Instant::now())
    }

    pub(crate) fn get_at(&self, key: &str, now: Instant) -> Option<Classification> {
        let inner = self.lock();

        match inner.entries.get(key) {
            Some(entry) if now.saturating_duration_since(entry.stored_at) <= self.config.ttl => {
                counter!("error_classifier.cache.hit", 1);
                Some(entry.result.clone())
            }
            Some(_) => {
                counter!("error_classifier.cache.miss", 1);
                debug!(key = %key, "Cache entry expired");
                None
            }
            None => {
                counter!("error_classifier.cache.miss", 1);
                None
            }
        }
    }

    /// Stores a value, evicting the oldest-inserted entry when full
    pub fn put(&self, key: String, result: Classification) {
        self.put_at(key, result, Instant::now())
    }

    pub(crate) fn put_at(&self, key: String, result: Classification, now: Instant) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.lock();

        // Re-inserting a key refreshes it as the newest entry
        if let Some(previous) = inner.entries.remove(&key) {
            inner.order.remove(&previous.seq);
        } else if inner.entries.len() >= self.config.capacity {
            if let Some((_, oldest)) = inner.order.pop_first() {
                inner.entries.remove(&oldest);
            }
        }

        inner.order.insert(seq, key.clone());
        inner.entries.insert(
            key,
            CacheEntry {
                result,
                stored_at: now,
                seq,
            },
        );

        gauge!("error_classifier.cache.size", inner.entries.len() as f64);
    }

    /// Gets current cache size
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clears the entire cache
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision_tree;

    fn cache(capacity: usize, ttl: Duration) -> ResultCache {
        ResultCache::new(CacheConfig { capacity, ttl })
    }

    #[test]
    fn test_cache_key_format() {
        let ctx = ErrorContext {
            http_status: Some(503),
            error_message: Some("a".repeat(80)),
            ..Default::default()
        };
        assert_eq!(cache_key(&ctx), format!("503_{}", "a".repeat(50)));

        let ctx = ErrorContext::default();
        assert_eq!(cache_key(&ctx), "unknown_");
    }

    #[test]
    fn test_hit_within_ttl_and_miss_after() {
        let c = cache(10, Duration::from_secs(300));
        let t0 = Instant::now();
        let value = decision_tree::classify(Some(429), None);

        c.put_at("429_".to_string(), value.clone(), t0);
        assert_eq!(c.get_at("429_", t0 + Duration::from_secs(299)), Some(value));
        assert_eq!(c.get_at("429_", t0 + Duration::from_secs(301)), None);

        // Lazy expiry keeps the stale entry in place
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_evicts_oldest_inserted() {
        let c = cache(3, Duration::from_secs(300));
        let value = decision_tree::classify(Some(500), None);

        for key in ["a", "b", "c"] {
            c.put(key.to_string(), value.clone());
        }
        // Reads do not affect eviction order
        assert!(c.get("a").is_some());

        c.put("d".to_string(), value.clone());
        assert_eq!(c.len(), 3);
        assert!(c.get("a").is_none());
        assert!(c.get("b").is_some());
        assert!(c.get("d").is_some());
    }

    #[test]
    fn test_reinsert_refreshes_without_eviction() {
        let c = cache(2, Duration::from_secs(300));
        let value = decision_tree::classify(Some(404), None);

        c.put("a".to_string(), value.clone());
        c.put("b".to_string(), value.clone());
        c.put("a".to_string(), value.clone());
        assert_eq!(c.len(), 2);

        // "b" is now the oldest
        c.put("c".to_string(), value);
        assert!(c.get("b").is_none());
        assert!(c.get("a").is_some());
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let c = cache(50, Duration::from_secs(300));
        let value = decision_tree::classify(Some(503), None);
        for i in 0..500 {
            c.put(format!("k{}", i), value.clone());
            assert!(c.len() <= 50);
        }
    }
}
