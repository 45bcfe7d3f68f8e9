//! LRU cache of processed payment sessions.
//!
//! Maps a payment session token to the wallet it was applied to, so the
//! store-wide "already processed?" check can usually answer from a single
//! record lookup instead of scanning every wallet. Entries are hints: the
//! caller confirms a hit against the store and evicts it if stale.

use crate::identity::WalletAddress;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Default cache capacity.
const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// LRU cache of session token to wallet.
#[derive(Clone)]
pub struct SessionCache {
    inner: Arc<Mutex<LruCache<String, WalletAddress>>>,
    stats: Arc<Mutex<CacheStats>>,
}

/// Cache statistics for monitoring.
#[derive(Debug, Default, Clone)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries added.
    pub additions: u64,
    /// Number of stale entries evicted after a failed confirmation.
    pub invalidations: u64,
}

impl CacheStats {
    /// Calculate hit rate as a percentage.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            let rate = (self.hits as f64 / total as f64) * 100.0;
            rate
        }
    }
}

impl SessionCache {
    /// Create a new cache with default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }

    /// Create a new cache with the specified capacity (minimum 1).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(Mutex::new(LruCache::new(cap))),
            stats: Arc::new(Mutex::new(CacheStats::default())),
        }
    }

    /// Wallet the session was last seen applied to.
    pub fn get(&self, session_id: &str) -> Option<WalletAddress> {
        let found = self.inner.lock().get(session_id).cloned();

        let mut stats = self.stats.lock();
        if found.is_some() {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }

        found
    }

    /// Remember that `session_id` was applied to `wallet`.
    pub fn insert(&self, session_id: &str, wallet: WalletAddress) {
        self.inner.lock().put(session_id.to_string(), wallet);
        self.stats.lock().additions += 1;
    }

    /// Drop a stale entry.
    pub fn invalidate(&self, session_id: &str) {
        if self.inner.lock().pop(session_id).is_some() {
            self.stats.lock().invalidations += 1;
        }
    }

    /// Get current cache statistics.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.stats.lock().clone()
    }

    /// Get the current number of entries in the cache.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Check if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new()
    }
}
