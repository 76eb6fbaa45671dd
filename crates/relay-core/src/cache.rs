//! TTL cache for serialized query results.
//!
//! The cache is advisory: callers treat every error as a miss. A stored empty
//! result (`[]`) is a hit, distinct from `None`.

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex as SyncMutex;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::CacheError;

/// Default capacity of [`MemoryCache`].
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// Key/value store for serialized results with per-entry expiry.
#[async_trait]
pub trait ResultCache: Send + Sync {
    /// `Ok(Some(_))` for a live entry, `Ok(None)` for absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Store `value` under `key`, expiring `ttl` after now.
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;
}

struct Entry {
    payload: Vec<u8>,
    expires_at: Instant,
}

/// In-process LRU cache with lazy expiry.
pub struct MemoryCache {
    entries: SyncMutex<LruCache<String, Entry>>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl MemoryCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: SyncMutex::new(LruCache::new(capacity)),
        }
    }

    /// Number of entries held, including ones that expired but were not
    /// read since.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl ResultCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            None => return Ok(None),
            Some(entry) if entry.expires_at > Instant::now() => {
                return Ok(Some(entry.payload.clone()));
            }
            Some(_) => true,
        };
        if expired {
            entries.pop(key);
        }
        Ok(None)
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let entry = Entry {
            payload: value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.lock().put(key.to_string(), entry);
        Ok(())
    }
}
