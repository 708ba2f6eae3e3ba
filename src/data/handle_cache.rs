//! Handle caching
//!
//! Caches DID → handle lookups so one run never asks the service for the
//! same profile twice. Handles are display-only, so a stale entry is harmless.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::atproto::DirectoryClient;
use crate::error::AppError;

/// Cached handle entry
#[derive(Debug, Clone)]
struct CachedHandle {
    handle: String,
    cached_at: Instant,
    ttl: Duration,
}

impl CachedHandle {
    fn is_valid(&self) -> bool {
        self.cached_at.elapsed() < self.ttl
    }
}

/// DID → handle cache
///
/// Thread-safe; shared by all reconcilers of a run.
pub struct HandleCache {
    /// Cache storage: did -> cached handle
    cache: Arc<RwLock<HashMap<String, CachedHandle>>>,
    /// Default TTL for cached handles
    default_ttl: Duration,
}

impl HandleCache {
    /// Create new handle cache
    ///
    /// # Arguments
    /// * `default_ttl` - TTL for cached handles (default: 1 hour)
    pub fn new(default_ttl: Option<Duration>) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            default_ttl: default_ttl.unwrap_or(Duration::from_secs(3600)),
        }
    }

    /// Get the handle for a DID
    ///
    /// Checks the cache first and fetches the profile on a miss.
    pub async fn get(&self, client: &dyn DirectoryClient, did: &str) -> Result<String, AppError> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(did) {
                if cached.is_valid() {
                    tracing::trace!(%did, "Handle cache hit");
                    return Ok(cached.handle.clone());
                }
            }
        }

        tracing::trace!(%did, "Handle cache miss, fetching profile");
        let profile = client.get_profile(did).await?;
        self.insert(did, &profile.handle).await;
        Ok(profile.handle)
    }

    /// Record a handle observed elsewhere (e.g. in a followers page)
    pub async fn insert(&self, did: &str, handle: &str) {
        let mut cache = self.cache.write().await;
        cache.insert(
            did.to_string(),
            CachedHandle {
                handle: handle.to_string(),
                cached_at: Instant::now(),
                ttl: self.default_ttl,
            },
        );
    }

    /// Drop expired entries
    pub async fn cleanup_expired(&self) {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, entry| entry.is_valid());
        let removed = before - cache.len();
        if removed > 0 {
            tracing::debug!(removed, "Cleaned up expired handle cache entries");
        }
    }

    /// Number of cached entries, expired included
    pub async fn size(&self) -> usize {
        self.cache.read().await.len()
    }
}

impl Default for HandleCache {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atproto::{MockDirectoryClient, Profile};

    #[tokio::test]
    async fn fetches_profile_once_per_did() {
        let mut client = MockDirectoryClient::new();
        client
            .expect_get_profile()
            .times(1)
            .returning(|did| {
                Ok(Profile {
                    did: did.to_string(),
                    handle: "alice.test".to_string(),
                    follows_count: Some(10),
                })
            });

        let cache = HandleCache::default();
        assert_eq!(cache.get(&client, "did:plc:alice").await.unwrap(), "alice.test");
        assert_eq!(cache.get(&client, "did:plc:alice").await.unwrap(), "alice.test");
        assert_eq!(cache.size().await, 1);
    }

    #[tokio::test]
    async fn expired_entries_are_refetched() {
        let mut client = MockDirectoryClient::new();
        client.expect_get_profile().times(1).returning(|did| {
            Ok(Profile {
                did: did.to_string(),
                handle: "new.test".to_string(),
                follows_count: None,
            })
        });

        let cache = HandleCache::new(Some(Duration::from_millis(0)));
        cache.insert("did:plc:bob", "old.test").await;
        assert_eq!(cache.get(&client, "did:plc:bob").await.unwrap(), "new.test");

        cache.cleanup_expired().await;
        assert_eq!(cache.size().await, 0);
    }
}
