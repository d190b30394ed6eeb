//! Per-tenant service configuration and the registry that publishes it.
//!
//! A [`ServiceConfig`] is immutable once built. The configuration-refresh
//! side publishes a whole new snapshot with [`ServiceRegistry::publish`];
//! requests already holding the previous `Arc` keep using it until they
//! finish, so nothing is ever mutated in place.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::traits::{ConfigWatcher, FeatureStore, PredictionService, VectorIndex};
use crate::types::TenantKey;
use crate::{Error, Result};

// ============================================================================
// ServiceConfig
// ============================================================================

/// Feature store key prefixes for each entity class.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPrefixes {
    /// Prefix of offline user feature keys.
    pub user_offline: String,

    /// Prefix of online/realtime user feature keys.
    pub user_realtime: String,

    /// Prefix of item feature keys.
    pub item: String,
}

impl KeyPrefixes {
    /// Create key prefixes.
    pub fn new(
        user_offline: impl Into<String>,
        user_realtime: impl Into<String>,
        item: impl Into<String>,
    ) -> Self {
        Self {
            user_offline: user_offline.into(),
            user_realtime: user_realtime.into(),
            item: item.into(),
        }
    }
}

/// Model-specific configuration of a tenant.
#[derive(Clone)]
pub struct ModelConfig {
    /// Served model name; also part of cache keys.
    pub model_name: String,

    /// Feature key prefixes.
    pub prefixes: KeyPrefixes,

    /// Prediction service serving the model.
    pub predictor: Arc<dyn PredictionService>,
}

impl ModelConfig {
    /// Create a model config.
    pub fn new(
        model_name: impl Into<String>,
        prefixes: KeyPrefixes,
        predictor: Arc<dyn PredictionService>,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            prefixes,
            predictor,
        }
    }
}

impl fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelConfig")
            .field("model_name", &self.model_name)
            .field("prefixes", &self.prefixes)
            .field("predictor", &self.predictor.name())
            .finish()
    }
}

/// A tenant's configuration snapshot.
#[derive(Clone)]
pub struct ServiceConfig {
    service_id: String,
    feature_store: Arc<dyn FeatureStore>,
    model: ModelConfig,
    index_shards: Vec<Arc<dyn VectorIndex>>,
}

impl ServiceConfig {
    /// Start building a config for a service id.
    pub fn builder(service_id: impl Into<String>) -> ServiceConfigBuilder {
        ServiceConfigBuilder::new(service_id)
    }

    /// Service (tenant) id.
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Feature store handle.
    pub fn feature_store(&self) -> &Arc<dyn FeatureStore> {
        &self.feature_store
    }

    /// Model configuration.
    pub fn model(&self) -> &ModelConfig {
        &self.model
    }

    /// Vector index shards used for recall.
    pub fn index_shards(&self) -> &[Arc<dyn VectorIndex>] {
        &self.index_shards
    }
}

impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shards: Vec<&str> = self.index_shards.iter().map(|s| s.name()).collect();
        f.debug_struct("ServiceConfig")
            .field("service_id", &self.service_id)
            .field("feature_store", &self.feature_store.name())
            .field("model", &self.model)
            .field("index_shards", &shards)
            .finish()
    }
}

/// Builder for [`ServiceConfig`].
pub struct ServiceConfigBuilder {
    service_id: String,
    feature_store: Option<Arc<dyn FeatureStore>>,
    model: Option<ModelConfig>,
    index_shards: Vec<Arc<dyn VectorIndex>>,
}

impl ServiceConfigBuilder {
    /// Create a builder.
    pub fn new(service_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            feature_store: None,
            model: None,
            index_shards: Vec::new(),
        }
    }

    /// Set the feature store.
    pub fn feature_store(mut self, store: Arc<dyn FeatureStore>) -> Self {
        self.feature_store = Some(store);
        self
    }

    /// Set the model config.
    pub fn model(mut self, model: ModelConfig) -> Self {
        self.model = Some(model);
        self
    }

    /// Add a vector index shard.
    pub fn index_shard(mut self, shard: Arc<dyn VectorIndex>) -> Self {
        self.index_shards.push(shard);
        self
    }

    /// Finish the config.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the service id, feature store or model
    /// config is missing.
    pub fn build(self) -> Result<ServiceConfig> {
        if self.service_id.is_empty() {
            return Err(Error::config("service id is required"));
        }
        let feature_store = self.feature_store.ok_or_else(|| {
            Error::config(format!("{}: feature store is required", self.service_id))
        })?;
        let model = self
            .model
            .ok_or_else(|| Error::config(format!("{}: model config is required", self.service_id)))?;

        Ok(ServiceConfig {
            service_id: self.service_id,
            feature_store,
            model,
            index_shards: self.index_shards,
        })
    }
}

// ============================================================================
// ServiceRegistry
// ============================================================================

/// Resolves tenant ids to configuration snapshots.
#[derive(Default)]
pub struct ServiceRegistry {
    configs: RwLock<HashMap<String, Arc<ServiceConfig>>>,
    watched: Mutex<HashMap<String, Arc<OnceCell<()>>>>,
}

impl ServiceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a snapshot, replacing any previous one for the same tenant.
    pub fn publish(&self, config: ServiceConfig) {
        let id = config.service_id().to_string();
        let snapshot = Arc::new(config);
        match self.configs.write() {
            Ok(mut configs) => {
                configs.insert(id.clone(), snapshot);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(id.clone(), snapshot);
            }
        }
        tracing::info!(tenant = %id, "published service config");
    }

    /// Drop a tenant's snapshot.
    pub fn remove(&self, tenant_id: &str) -> Option<Arc<ServiceConfig>> {
        match self.configs.write() {
            Ok(mut configs) => configs.remove(tenant_id),
            Err(poisoned) => poisoned.into_inner().remove(tenant_id),
        }
    }

    /// Resolve a tenant to its current snapshot.
    pub fn resolve(&self, tenant_id: &str) -> Option<Arc<ServiceConfig>> {
        match self.configs.read() {
            Ok(configs) => configs.get(tenant_id).cloned(),
            Err(poisoned) => poisoned.into_inner().get(tenant_id).cloned(),
        }
    }

    /// Number of published tenants.
    pub fn len(&self) -> usize {
        self.configs.read().map(|c| c.len()).unwrap_or_default()
    }

    /// Whether no tenant is published.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register the tenant with `watcher` unless that already succeeded.
    ///
    /// Concurrent first requests for the same tenant share one registration.
    /// A failed registration is not remembered, so the next request retries.
    ///
    /// Returns `true` when this call performed the registration.
    pub async fn ensure_watched(
        &self,
        tenant: &TenantKey,
        watcher: &dyn ConfigWatcher,
    ) -> Result<bool> {
        let cell = {
            let mut watched = match self.watched.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            Arc::clone(watched.entry(tenant.data_id.clone()).or_default())
        };

        if cell.initialized() {
            return Ok(false);
        }

        let mut registered = false;
        let performed = &mut registered;
        cell.get_or_try_init(|| async move {
            watcher.watch(tenant).await?;
            *performed = true;
            tracing::info!(tenant = %tenant.data_id, "watching service config");
            Ok::<(), Error>(())
        })
        .await?;

        Ok(registered)
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("tenants", &self.len())
            .finish()
    }
}

// ============================================================================
// Watchers
// ============================================================================

/// Watcher that registers nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopWatcher;

#[async_trait]
impl ConfigWatcher for NoopWatcher {
    async fn watch(&self, _tenant: &TenantKey) -> Result<()> {
        Ok(())
    }
}

/// Watcher that records registrations, for tests.
#[derive(Debug, Clone, Default)]
pub struct RecordingWatcher {
    calls: Arc<Mutex<Vec<TenantKey>>>,
    fail: Arc<std::sync::atomic::AtomicBool>,
}

impl RecordingWatcher {
    /// Create a recording watcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent registrations fail (or succeed again).
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    /// Tenants registered so far, including failed attempts.
    pub fn calls(&self) -> Vec<TenantKey> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ConfigWatcher for RecordingWatcher {
    async fn watch(&self, tenant: &TenantKey) -> Result<()> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(tenant.clone());
        }
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::config(format!("cannot watch {}", tenant.data_id)));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::tensor::{PredictRequest, PredictResponse};
    use crate::types::ItemInfo;

    struct NullStore;

    #[async_trait]
    impl FeatureStore for NullStore {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }

        fn name(&self) -> &str {
            "null"
        }
    }

    struct NullPredictor;

    #[async_trait]
    impl PredictionService for NullPredictor {
        async fn predict(&self, _request: PredictRequest) -> Result<PredictResponse> {
            Ok(PredictResponse::default())
        }

        fn name(&self) -> &str {
            "null"
        }
    }

    struct NullIndex;

    #[async_trait]
    impl VectorIndex for NullIndex {
        async fn search(&self, _embedding: &[f32], _top_k: usize) -> Result<Vec<ItemInfo>> {
            Ok(Vec::new())
        }

        fn name(&self) -> &str {
            "null-index"
        }
    }

    fn config(id: &str, model: &str) -> ServiceConfig {
        ServiceConfig::builder(id)
            .feature_store(Arc::new(NullStore))
            .model(ModelConfig::new(
                model,
                KeyPrefixes::new("uo:", "ur:", "it:"),
                Arc::new(NullPredictor),
            ))
            .index_shard(Arc::new(NullIndex))
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_requires_store_and_model() {
        let err = ServiceConfig::builder("t1").build().unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = ServiceConfig::builder("t1")
            .feature_store(Arc::new(NullStore))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("model config"));
    }

    #[test]
    fn test_debug_names_collaborators() {
        let debug = format!("{:?}", config("t1", "dssm"));
        assert!(debug.contains("null-index"));
        assert!(debug.contains("dssm"));
    }

    #[test]
    fn test_publish_and_resolve() {
        let registry = ServiceRegistry::new();
        assert!(registry.resolve("t1").is_none());

        registry.publish(config("t1", "dssm"));
        let snapshot = registry.resolve("t1").unwrap();
        assert_eq!(snapshot.service_id(), "t1");
        assert_eq!(snapshot.model().model_name, "dssm");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_publish_replaces_without_touching_held_snapshot() {
        let registry = ServiceRegistry::new();
        registry.publish(config("t1", "dssm-v1"));
        let held = registry.resolve("t1").unwrap();

        registry.publish(config("t1", "dssm-v2"));

        assert_eq!(held.model().model_name, "dssm-v1");
        assert_eq!(registry.resolve("t1").unwrap().model().model_name, "dssm-v2");
    }

    #[test]
    fn test_remove() {
        let registry = ServiceRegistry::new();
        registry.publish(config("t1", "dssm"));
        assert!(registry.remove("t1").is_some());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_ensure_watched_deduplicates() {
        let registry = ServiceRegistry::new();
        let watcher = RecordingWatcher::new();
        let tenant = TenantKey::new("t1", "g", "ns");

        assert!(registry.ensure_watched(&tenant, &watcher).await.unwrap());
        assert!(!registry.ensure_watched(&tenant, &watcher).await.unwrap());
        assert!(!registry.ensure_watched(&tenant, &watcher).await.unwrap());

        assert_eq!(watcher.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_ensure_watched_retries_after_failure() {
        let registry = ServiceRegistry::new();
        let watcher = RecordingWatcher::new();
        let tenant = TenantKey::new("t1", "g", "ns");

        watcher.set_failing(true);
        assert!(registry.ensure_watched(&tenant, &watcher).await.is_err());

        watcher.set_failing(false);
        assert!(registry.ensure_watched(&tenant, &watcher).await.unwrap());
        assert_eq!(watcher.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_ensure_watched_per_tenant() {
        let registry = ServiceRegistry::new();
        let watcher = RecordingWatcher::new();

        registry
            .ensure_watched(&TenantKey::new("t1", "g", "ns"), &watcher)
            .await
            .unwrap();
        registry
            .ensure_watched(&TenantKey::new("t2", "g", "ns"), &watcher)
            .await
            .unwrap();

        assert_eq!(watcher.calls().len(), 2);
    }
}
