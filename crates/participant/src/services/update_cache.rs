use std::num::NonZeroUsize;

use chrono::{DateTime, Utc};
use lru::LruCache;

/// Bounded LRU of peer sid to the latest `updated_at` sent to this
/// participant. Used to suppress single-peer updates that arrive out of
/// order.
pub struct UpdateCache {
    inner: LruCache<String, DateTime<Utc>>,
}

impl UpdateCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    /// Reports whether an update stamped `updated_at` is older than what was
    /// already sent for this peer. Fresh stamps are recorded.
    pub fn is_stale(&mut self, sid: &str, updated_at: DateTime<Utc>) -> bool {
        if let Some(prev) = self.inner.get(sid) {
            if *prev > updated_at {
                return true;
            }
        }
        self.inner.put(sid.to_owned(), updated_at);
        false
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
