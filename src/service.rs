//! Dual-tier cache service
//!
//! Combines the remote store (shared, TTL-aware) with the local shadow
//! (process-only, never expires):
//! - reads go to the remote store when it is live and refresh the shadow on a
//!   hit; otherwise, or on a remote miss, the shadow answers
//! - writes always land in the shadow first, then in the remote store when live
//! - remote failures flip liveness and degrade to the shadow; they are never
//!   returned to callers
//!
//! The shadow is not reconciled with the remote store. A value whose remote
//! write failed, or whose remote TTL lapsed, can keep being served locally.

use std::{sync::Arc, time::Duration};

use serde::Serialize;
use tracing::{debug, error, warn};

use crate::{
    CacheConfig, CacheError, CacheValue, LinkState, LocalShadow, RedisStore, RemoteStore,
};

/// Why a remote operation was not carried out
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DegradeReason {
    /// Liveness flag was down; no I/O attempted
    NotReady,
    /// The command failed; liveness has been cleared
    Failed(String),
    /// The stored payload did not decode; the entry has been dropped
    Corrupt(String),
}

/// Outcome of one remote call, before it is flattened for callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Remote<T> {
    Ok(T),
    Degraded(DegradeReason),
}

/// Result of [`CacheService::health_check`]
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub shadow_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_info: Option<String>,
}

/// Result of [`CacheService::status`]
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub ready: bool,
    pub state: LinkState,
    pub last_error: Option<String>,
    pub shadow_size: usize,
}

/// Result of [`CacheService::stats`]
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub shadow_size: usize,
    pub shadow_keys: Vec<String>,
    pub remote: CacheStatus,
    pub remote_info: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Dual-tier cache handle; cheap to clone, all clones share state
pub struct CacheService<S: RemoteStore = RedisStore> {
    inner: Arc<CacheServiceInner<S>>,
}

struct CacheServiceInner<S> {
    remote: S,
    shadow: LocalShadow,
    config: CacheConfig,
}

impl<S: RemoteStore> Clone for CacheService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl CacheService<RedisStore> {
    /// Connect to Redis and build the service.
    ///
    /// Fails only on an invalid Redis URL; an unreachable server yields a
    /// service running on the shadow until the reconnect succeeds.
    pub async fn connect(config: CacheConfig) -> Result<Self, CacheError> {
        let remote = RedisStore::connect(config.clone()).await?;
        Ok(Self::with_store(remote, config))
    }
}

impl<S: RemoteStore> CacheService<S> {
    pub fn with_store(remote: S, config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(CacheServiceInner {
                remote,
                shadow: LocalShadow::new(),
                config,
            }),
        }
    }

    pub fn remote(&self) -> &S {
        &self.inner.remote
    }

    pub fn shadow(&self) -> &LocalShadow {
        &self.inner.shadow
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn is_live(&self) -> bool {
        self.inner.remote.liveness().is_ready()
    }

    /// Get a value, preferring the remote store when it is live
    pub async fn get(&self, key: &str) -> Result<Option<CacheValue>, CacheError> {
        validate_key(key)?;

        match self.remote_get(key).await {
            Remote::Ok(Some(value)) => {
                self.inner.shadow.set(key, value.clone());
                return Ok(Some(value));
            }
            Remote::Ok(None) => debug!("Cache miss L2 for key: {}", key),
            Remote::Degraded(reason) => debug!("L2 skipped for key {}: {:?}", key, reason),
        }

        if let Some(value) = self.inner.shadow.get(key) {
            warn!("Cache GET {} served from local shadow", key);
            return Ok(Some(value));
        }

        debug!("Cache miss for key: {}", key);
        Ok(None)
    }

    /// Store a value in both tiers.
    ///
    /// Returns `false` only when the remote store was live and rejected the
    /// write. A write made while the remote is down returns `true` but lives
    /// only in this process.
    pub async fn set(
        &self,
        key: &str,
        value: &CacheValue,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        validate_key(key)?;

        self.inner.shadow.set(key, value.clone());

        match self.remote_set(key, value, ttl).await {
            Remote::Ok(()) => Ok(true),
            Remote::Degraded(DegradeReason::NotReady) => Ok(true),
            Remote::Degraded(_) => Ok(false),
        }
    }

    /// [`CacheService::set`] with the configured default TTL
    pub async fn set_default(&self, key: &str, value: &CacheValue) -> Result<bool, CacheError> {
        self.set(key, value, Some(self.inner.config.default_ttl))
            .await
    }

    /// Delete a key from both tiers; `true` if either tier succeeded
    pub async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        validate_key(key)?;

        let local = self.inner.shadow.delete(key);
        let remote = matches!(self.remote_delete(key).await, Remote::Ok(()));
        Ok(local || remote)
    }

    /// Clear the shadow and, unless `local_only`, the whole remote database.
    ///
    /// The remote flush is not scoped to this service's keys.
    pub async fn flush(&self, local_only: bool) -> bool {
        self.inner.shadow.clear();
        if local_only || !self.is_live() {
            return true;
        }

        match self.inner.remote.flush().await {
            Ok(()) => {
                debug!("Remote store flushed");
                true
            }
            Err(e) => {
                error!("Cache FLUSH failed on Redis: {}", e);
                self.inner.remote.liveness().mark_down(&e.to_string());
                false
            }
        }
    }

    /// Probe the remote store.
    ///
    /// Without `force`, a link that is already down is reported unhealthy
    /// without any I/O.
    pub async fn health_check(&self, force: bool) -> HealthReport {
        let liveness = self.inner.remote.liveness();
        let shadow_size = self.inner.shadow.size();

        if !force && !liveness.is_ready() {
            return HealthReport {
                healthy: false,
                latency_ms: None,
                error: Some("Redis not ready".to_owned()),
                last_error: liveness.last_error(),
                shadow_size,
                remote_info: None,
            };
        }

        match self.inner.remote.ping().await {
            Ok(latency) => HealthReport {
                healthy: true,
                latency_ms: Some(latency.as_secs_f64() * 1000.0),
                error: None,
                last_error: liveness.last_error(),
                shadow_size,
                remote_info: self.inner.remote.info().await.ok(),
            },
            Err(e) => {
                liveness.mark_down(&e.to_string());
                HealthReport {
                    healthy: false,
                    latency_ms: None,
                    error: Some(e.to_string()),
                    last_error: liveness.last_error(),
                    shadow_size,
                    remote_info: None,
                }
            }
        }
    }

    pub fn status(&self) -> CacheStatus {
        let liveness = self.inner.remote.liveness();
        let link = liveness.status();
        CacheStatus {
            ready: liveness.is_ready(),
            state: link.state,
            last_error: link.last_error,
            shadow_size: self.inner.shadow.size(),
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let remote_info = if self.is_live() {
            self.inner.remote.info().await.ok()
        } else {
            None
        };
        CacheStats {
            shadow_size: self.inner.shadow.size(),
            shadow_keys: self.inner.shadow.keys(),
            remote: self.status(),
            remote_info,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Stop the remote store's reconnect loop and drop its connection.
    ///
    /// The shadow stays usable; the service keeps working in local-only mode.
    pub async fn shutdown(&self) {
        self.inner.remote.shutdown().await;
    }

    pub(crate) async fn remote_get(&self, key: &str) -> Remote<Option<CacheValue>> {
        let liveness = self.inner.remote.liveness();
        if !liveness.is_ready() {
            return Remote::Degraded(DegradeReason::NotReady);
        }

        let start = std::time::Instant::now();
        let json = match self.inner.remote.get(key).await {
            Ok(Some(json)) => json,
            Ok(None) => return Remote::Ok(None),
            Err(e) => {
                warn!(
                    "L2 (Redis) GET error for key {} ({}). Falling back to local shadow.",
                    key, e
                );
                liveness.mark_down(&e.to_string());
                return Remote::Degraded(DegradeReason::Failed(e.to_string()));
            }
        };

        match serde_json::from_str::<CacheValue>(&json) {
            Ok(value) => {
                debug!(
                    "Cache hit L2 for key: {} ({}, {}us)",
                    key,
                    value.kind(),
                    start.elapsed().as_micros()
                );
                Remote::Ok(Some(value))
            }
            Err(e) => {
                warn!(
                    "Failed to deserialize cached value for key {}: {}. Deleting corrupt entry.",
                    key, e
                );
                if let Err(del_err) = self.inner.remote.delete(key).await {
                    warn!("Failed to delete corrupt L2 entry for key {}: {}", key, del_err);
                }
                Remote::Degraded(DegradeReason::Corrupt(e.to_string()))
            }
        }
    }

    pub(crate) async fn remote_set(
        &self,
        key: &str,
        value: &CacheValue,
        ttl: Option<Duration>,
    ) -> Remote<()> {
        let liveness = self.inner.remote.liveness();
        if !liveness.is_ready() {
            debug!("Cache SET {} kept local only (Redis not ready)", key);
            return Remote::Degraded(DegradeReason::NotReady);
        }

        let json = match serde_json::to_string(value) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize value for key {}: {}", key, e);
                return Remote::Degraded(DegradeReason::Corrupt(e.to_string()));
            }
        };

        match self.inner.remote.set(key, &json, ttl).await {
            Ok(()) => {
                debug!("Cache SET {} (Redis)", key);
                Remote::Ok(())
            }
            Err(e) => {
                warn!("L2 (Redis) SET error for key {}: {}. Kept in local shadow.", key, e);
                liveness.mark_down(&e.to_string());
                Remote::Degraded(DegradeReason::Failed(e.to_string()))
            }
        }
    }

    pub(crate) async fn remote_delete(&self, key: &str) -> Remote<()> {
        let liveness = self.inner.remote.liveness();
        if !liveness.is_ready() {
            return Remote::Degraded(DegradeReason::NotReady);
        }

        match self.inner.remote.delete(key).await {
            Ok(removed) => {
                debug!("Cache DEL {} (Redis, removed: {})", key, removed);
                Remote::Ok(())
            }
            Err(e) => {
                warn!("L2 (Redis) DEL error for key {}: {}. Continuing.", key, e);
                liveness.mark_down(&e.to_string());
                Remote::Degraded(DegradeReason::Failed(e.to_string()))
            }
        }
    }
}

fn validate_key(key: &str) -> Result<(), CacheError> {
    if key.is_empty() {
        error!("Invalid cache key: {:?}", key);
        return Err(CacheError::InvalidKey(key.to_owned()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{UserView, testing::MemoryStore};

    fn service(store: &MemoryStore) -> CacheService<MemoryStore> {
        CacheService::with_store(store.clone(), CacheConfig::default())
    }

    fn ana() -> CacheValue {
        CacheValue::User(UserView {
            id: "42".into(),
            name: "Ana".into(),
            email: "ana@example.com".into(),
            role: "Usuario".into(),
            status: "Ativo".into(),
        })
    }

    #[tokio::test]
    async fn empty_key_is_rejected_without_io() {
        let store = MemoryStore::ready();
        let cache = service(&store);

        assert!(matches!(cache.get("").await, Err(CacheError::InvalidKey(_))));
        assert!(matches!(
            cache.set("", &ana(), None).await,
            Err(CacheError::InvalidKey(_))
        ));
        assert!(matches!(cache.delete("").await, Err(CacheError::InvalidKey(_))));
        assert_eq!(store.commands(), 0);
        assert_eq!(cache.shadow().size(), 0);
    }

    #[tokio::test]
    async fn read_your_write_with_remote_live() {
        let store = MemoryStore::ready();
        let cache = service(&store);

        assert!(cache.set("user:42", &ana(), Some(Duration::from_secs(3600))).await.unwrap());
        assert_eq!(cache.get("user:42").await.unwrap(), Some(ana()));
        assert_eq!(store.ttl_of("user:42"), Some(Duration::from_secs(3600)));
        assert!(store.raw("user:42").unwrap().contains(r#""kind":"user""#));
    }

    #[tokio::test]
    async fn read_your_write_with_remote_down() {
        let store = MemoryStore::default();
        let cache = service(&store);

        assert!(cache.set("user:42", &ana(), None).await.unwrap());
        assert_eq!(cache.get("user:42").await.unwrap(), Some(ana()));
        assert!(cache.delete("user:42").await.unwrap());
        assert_eq!(cache.get("user:42").await.unwrap(), None);
        assert_eq!(store.commands(), 0, "no remote I/O while not ready");
    }

    #[tokio::test]
    async fn disconnect_after_write_serves_from_shadow() {
        let store = MemoryStore::ready();
        let cache = service(&store);
        cache.set("user:42", &ana(), Some(Duration::from_secs(3600))).await.unwrap();

        store.break_link();
        assert_eq!(cache.get("user:42").await.unwrap(), Some(ana()));
        assert!(!cache.is_live(), "failed GET must clear liveness");
        assert_eq!(cache.status().state, LinkState::Error);
    }

    #[tokio::test]
    async fn remote_hit_refreshes_shadow() {
        let store = MemoryStore::ready();
        let cache = service(&store);
        store.put_raw("token:7", r#"{"kind":"token","data":"abc"}"#);
        assert!(cache.shadow().get("token:7").is_none());

        assert_eq!(
            cache.get("token:7").await.unwrap(),
            Some(CacheValue::Token("abc".into()))
        );
        assert_eq!(
            cache.shadow().get("token:7"),
            Some(CacheValue::Token("abc".into()))
        );
    }

    #[tokio::test]
    async fn set_reports_failure_only_when_live_remote_rejects() {
        let store = MemoryStore::ready();
        let cache = service(&store);

        store.break_link();
        assert!(!cache.set("user:1", &ana(), None).await.unwrap());
        // Now not live: local-only writes count as success.
        assert!(cache.set("user:2", &ana(), None).await.unwrap());
        assert_eq!(cache.get("user:1").await.unwrap(), Some(ana()));
    }

    #[tokio::test]
    async fn corrupt_remote_entry_is_dropped() {
        let store = MemoryStore::ready();
        let cache = service(&store);
        store.put_raw("user:9", "not json");

        assert_eq!(cache.get("user:9").await.unwrap(), None);
        assert!(store.raw("user:9").is_none());
        assert!(cache.is_live(), "decode errors are not link failures");
    }

    #[tokio::test]
    async fn delete_is_true_if_either_tier_succeeds() {
        let store = MemoryStore::ready();
        let cache = service(&store);
        assert!(cache.delete("missing").await.unwrap());

        store.disconnect();
        assert!(!cache.delete("missing").await.unwrap());
        cache.set("user:1", &ana(), None).await.unwrap();
        assert!(cache.delete("user:1").await.unwrap());
    }

    #[tokio::test]
    async fn flush_local_only_keeps_remote() {
        let store = MemoryStore::ready();
        let cache = service(&store);
        cache.set("user:42", &ana(), None).await.unwrap();

        assert!(cache.flush(true).await);
        assert_eq!(cache.shadow().size(), 0);
        assert!(store.raw("user:42").is_some());

        assert!(cache.flush(false).await);
        assert!(store.raw("user:42").is_none());
    }

    #[tokio::test]
    async fn health_check_reports_and_flips_liveness() {
        let store = MemoryStore::ready();
        let cache = service(&store);
        cache.set("user:42", &ana(), None).await.unwrap();

        let report = cache.health_check(false).await;
        assert!(report.healthy);
        assert!(report.latency_ms.is_some());
        assert_eq!(report.shadow_size, 1);
        assert!(report.remote_info.unwrap().contains("keys=1"));

        store.break_link();
        let report = cache.health_check(false).await;
        assert!(!report.healthy);
        assert!(!cache.is_live());

        let commands = store.commands();
        let report = cache.health_check(false).await;
        assert_eq!(report.error.as_deref(), Some("Redis not ready"));
        assert_eq!(store.commands(), commands, "unforced check does no I/O when down");

        store.connect();
        assert!(cache.health_check(true).await.healthy);
    }

    #[tokio::test]
    async fn stats_lists_shadow_keys() {
        let store = MemoryStore::ready();
        let cache = service(&store);
        cache.set("b", &ana(), None).await.unwrap();
        cache.set("a", &ana(), None).await.unwrap();

        let stats = cache.stats().await;
        assert_eq!(stats.shadow_keys, vec!["a".to_owned(), "b".to_owned()]);
        assert!(stats.remote.ready);
        assert!(stats.remote_info.is_some());
    }

    #[tokio::test]
    async fn remote_outcome_is_auditable() {
        let store = MemoryStore::default();
        let cache = service(&store);
        assert_eq!(
            cache.remote_get("user:1").await,
            Remote::Degraded(DegradeReason::NotReady)
        );

        store.connect();
        store.break_link();
        assert!(matches!(
            cache.remote_set("user:1", &ana(), None).await,
            Remote::Degraded(DegradeReason::Failed(_))
        ));
        assert_eq!(
            cache.remote_delete("user:1").await,
            Remote::Degraded(DegradeReason::NotReady)
        );
    }
}
