//! Read-through helpers shared by the entity services
//!
//! A lookup checks the cache, falls through to the authoritative backend on a
//! miss and repopulates the cache with the backend's answer. Absent entities
//! are not cached.
//!
//! Listings are invalidated wholesale: every listing key embeds the current
//! *generation* of its namespace, kept under one sentinel key. Rotating the
//! generation orphans all cached pages at once. Redis ages them out through
//! their TTL; the local shadow never expires anything, so rotation also drops
//! them from the shadow.

use std::{future::Future, time::Duration};

use tracing::{debug, warn};

use crate::{BackendError, CacheService, CacheValue, Cacheable, RemoteStore, ServiceError};

/// Return the cached value for `key`, or run `fetch` and cache its result.
///
/// `fetch` is only polled on a miss.
pub(crate) async fn read_through<S, T, F>(
    cache: &CacheService<S>,
    key: &str,
    ttl: Duration,
    fetch: F,
) -> Result<Option<T>, ServiceError>
where
    S: RemoteStore,
    T: Cacheable,
    F: Future<Output = Result<Option<T>, BackendError>>,
{
    if let Some(value) = cache.get(key).await? {
        let kind = value.kind();
        match T::from_value(value) {
            Some(hit) => {
                debug!("Cache hit for key: {}", key);
                return Ok(Some(hit));
            }
            None => warn!("Unexpected {} value under key {}; refetching", kind, key),
        }
    }

    let Some(fresh) = fetch.await? else {
        debug!("Value not found for key: {}", key);
        return Ok(None);
    };

    debug!("Cache miss - fetched from backend for key: {}", key);
    if !cache.set(key, &fresh.clone().into_value(), Some(ttl)).await? {
        warn!("Cache populate for key {} did not reach Redis", key);
    }
    Ok(Some(fresh))
}

/// Generation counter for one listing namespace
pub(crate) struct ListGeneration<S: RemoteStore> {
    cache: CacheService<S>,
    sentinel: &'static str,
    /// Shared prefix of every page key in this namespace
    pages: &'static str,
}

impl<S: RemoteStore> Clone for ListGeneration<S> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            sentinel: self.sentinel,
            pages: self.pages,
        }
    }
}

impl<S: RemoteStore> ListGeneration<S> {
    pub(crate) fn new(cache: CacheService<S>, sentinel: &'static str, pages: &'static str) -> Self {
        Self {
            cache,
            sentinel,
            pages,
        }
    }

    /// Current generation, minting one if none is recorded
    pub(crate) async fn current(&self) -> Result<String, ServiceError> {
        match self.cache.get(self.sentinel).await? {
            Some(CacheValue::Generation(generation)) => Ok(generation),
            Some(other) => {
                warn!(
                    "Unexpected {} value under {}; resetting",
                    other.kind(),
                    self.sentinel
                );
                self.rotate().await
            }
            None => self.rotate().await,
        }
    }

    /// Invalidate every cached page of this namespace
    pub(crate) async fn rotate(&self) -> Result<String, ServiceError> {
        let generation = uuid::Uuid::new_v4().simple().to_string();
        debug!("Listing generation {} -> {}", self.sentinel, generation);
        self.cache
            .set(
                self.sentinel,
                &CacheValue::Generation(generation.clone()),
                None,
            )
            .await?;

        let dropped = self
            .cache
            .shadow()
            .delete_prefix(self.pages, self.sentinel);
        if dropped > 0 {
            debug!("Dropped {} stale listing pages from local shadow", dropped);
        }
        Ok(generation)
    }
}
