//! Cache invalidation seam.
//!
//! List-level and item-level cache entries are invalidated before any
//! background work is scheduled, so a `pending` read is never served from a
//! stale cache. The default implementation is a no-op for deployments
//! without a cache tier.

use async_trait::async_trait;
use tokio::sync::RwLock;

/// Invalidates cache entries keyed by entity identity or query shape.
#[async_trait]
pub trait CacheInvalidator: Send + Sync {
    /// Invalidate every list-level cache entry.
    async fn invalidate_lists(&self);

    /// Invalidate the item-level entry (or pattern) for one key.
    async fn invalidate_item(&self, key: &str);
}

/// No-op invalidator.
pub struct NoopCache;

#[async_trait]
impl CacheInvalidator for NoopCache {
    async fn invalidate_lists(&self) {}

    async fn invalidate_item(&self, _key: &str) {}
}

/// Records invalidations; used by tests to assert ordering guarantees.
#[derive(Default)]
pub struct RecordingCache {
    pub list_invalidations: RwLock<u64>,
    pub item_invalidations: RwLock<Vec<String>>,
}

impl RecordingCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheInvalidator for RecordingCache {
    async fn invalidate_lists(&self) {
        *self.list_invalidations.write().await += 1;
    }

    async fn invalidate_item(&self, key: &str) {
        self.item_invalidations.write().await.push(key.to_string());
    }
}
