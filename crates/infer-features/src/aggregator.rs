//! Feature assembly.
//!
//! [`FeatureAggregator::assemble`] fans out one lookup task per signal (user
//! offline, user context and, for rank, one per candidate item) into a single
//! [`JoinSet`] and merges whatever reports before the local deadline. Results
//! are keyed by task identity, so arrival order never matters. Lookups still
//! running at the deadline are aborted and their slots stay empty.
//!
//! Each lookup is gated by the existence filters: a negative test means no
//! store read at all. Store failures are logged and become empty blobs.

use std::sync::Arc;
use std::time::Duration;

use infer_core::{
    ExampleFeatures, FeatureSettings, FeatureStore, KeyPrefixes, SeqExampleBuff, ServiceConfig,
};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::cache::{TtlCache, features_key};
use crate::filter::ExistenceFilters;

/// Which part of [`ExampleFeatures`] a lookup fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    UserOffline,
    UserContext,
    Item(usize),
}

/// Assembles the feature bundle for one request.
#[derive(Clone)]
pub struct FeatureAggregator {
    store: Arc<dyn FeatureStore>,
    filters: Arc<ExistenceFilters>,
    prefixes: KeyPrefixes,
    cache: Arc<TtlCache>,
    bypass_cache: bool,
    timeout: Duration,
}

impl FeatureAggregator {
    /// Create an aggregator.
    pub fn new(
        store: Arc<dyn FeatureStore>,
        filters: Arc<ExistenceFilters>,
        prefixes: KeyPrefixes,
        settings: &FeatureSettings,
        cache: Arc<TtlCache>,
    ) -> Self {
        Self {
            store,
            filters,
            prefixes,
            cache,
            bypass_cache: false,
            timeout: settings.assembly_timeout(),
        }
    }

    /// Neither read nor write the features cache.
    pub fn bypassing_cache(mut self) -> Self {
        self.bypass_cache = true;
        self
    }

    /// Create an aggregator over a tenant's store and key prefixes.
    pub fn for_service(
        config: &ServiceConfig,
        filters: Arc<ExistenceFilters>,
        settings: &FeatureSettings,
        cache: Arc<TtlCache>,
    ) -> Self {
        Self::new(
            Arc::clone(config.feature_store()),
            filters,
            config.model().prefixes.clone(),
            settings,
            cache,
        )
    }

    /// Local assembly deadline.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Assemble features for `user_id` and, when given, the candidate items.
    ///
    /// Never fails: missing signals are left empty. Items whose existence
    /// test is negative, or whose lookup missed the deadline, are omitted;
    /// the rest keep their request order.
    pub async fn assemble(
        &self,
        user_id: &str,
        items: Option<&[String]>,
        tenant_id: &str,
        model_name: &str,
    ) -> ExampleFeatures {
        if self.bypass_cache || !self.cache.is_enabled() {
            return self.collect(user_id, items).await;
        }

        let cache_key = features_key(user_id, tenant_id, model_name, items);
        if let Some(features) = self.cached(&cache_key) {
            tracing::debug!(user_id, tenant = tenant_id, "feature cache hit");
            return features;
        }

        let features = self.collect(user_id, items).await;

        match serde_json::to_vec(&features) {
            Ok(bytes) => {
                self.cache.set(&cache_key, &bytes);
            }
            Err(e) => tracing::warn!(error = %e, "cannot encode features for cache"),
        }
        features
    }

    fn cached(&self, key: &str) -> Option<ExampleFeatures> {
        let bytes = self.cache.get(key)?;
        match serde_json::from_slice(&bytes) {
            Ok(features) => Some(features),
            Err(e) => {
                tracing::warn!(key, error = %e, "undecodable cached features, treating as miss");
                None
            }
        }
    }

    async fn collect(&self, user_id: &str, items: Option<&[String]>) -> ExampleFeatures {
        let deadline = Instant::now() + self.timeout;
        let mut tasks: JoinSet<(Slot, SeqExampleBuff)> = JoinSet::new();

        let user_known = self.filters.user_may_exist(user_id);
        for (slot, prefix) in [
            (Slot::UserOffline, &self.prefixes.user_offline),
            (Slot::UserContext, &self.prefixes.user_realtime),
        ] {
            let store = Arc::clone(&self.store);
            let user = user_id.to_string();
            let key = format!("{prefix}{user_id}");
            tasks.spawn(async move {
                let blob = if user_known {
                    lookup(store.as_ref(), &key, user).await
                } else {
                    SeqExampleBuff::empty(user)
                };
                (slot, blob)
            });
        }

        if let Some(items) = items {
            let item_filter = self.filters.items();
            for (index, item_id) in items.iter().enumerate() {
                if !item_filter.contains(item_id.as_bytes()) {
                    continue;
                }
                let store = Arc::clone(&self.store);
                let item = item_id.clone();
                let key = format!("{}{item_id}", self.prefixes.item);
                tasks.spawn(async move { (Slot::Item(index), lookup(store.as_ref(), &key, item).await) });
            }
        }

        let mut features = ExampleFeatures::empty_for(user_id);
        let mut arrived: Vec<(usize, SeqExampleBuff)> = Vec::new();

        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((slot, blob)))) => match slot {
                    Slot::UserOffline => features.user = blob,
                    Slot::UserContext => features.user_context = blob,
                    Slot::Item(index) => arrived.push((index, blob)),
                },
                Ok(Some(Err(e))) => {
                    tracing::error!(user_id, error = %e, "feature lookup task failed");
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        user_id,
                        pending = tasks.len(),
                        timeout = ?self.timeout,
                        "feature assembly deadline reached, using partial features"
                    );
                    break;
                }
            }
        }
        tasks.abort_all();

        arrived.sort_by_key(|(index, _)| *index);
        features.items = arrived.into_iter().map(|(_, blob)| blob).collect();
        features
    }
}

async fn lookup(store: &dyn FeatureStore, key: &str, entity_id: String) -> SeqExampleBuff {
    match store.get(key).await {
        Ok(Some(buff)) => SeqExampleBuff::new(entity_id, buff),
        Ok(None) => {
            tracing::debug!(key, store = store.name(), "feature key absent");
            SeqExampleBuff::empty(entity_id)
        }
        Err(e) => {
            tracing::warn!(key, store = store.name(), error = %e, "feature read failed");
            SeqExampleBuff::empty(entity_id)
        }
    }
}

impl std::fmt::Debug for FeatureAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureAggregator")
            .field("store", &self.store.name())
            .field("prefixes", &self.prefixes)
            .field("bypass_cache", &self.bypass_cache)
            .field("timeout", &self.timeout)
            .finish()
    }
}
