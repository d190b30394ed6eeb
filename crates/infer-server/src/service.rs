//! Process-wide service assembly.
//!
//! [`InferService`] builds every shared component once from
//! [`InferSettings`] and owns them for the life of the process:
//!
//! - the tenant [`ServiceRegistry`], filled by the configuration-refresh side;
//! - the [`ExistenceFilters`], rebuilt by the filter-refresh side;
//! - the [`TtlCache`] and its background sweeper;
//! - the [`CircuitBreakers`], [`ModelPipeline`] and [`Dispatcher`];
//! - one [`GrpcFrontend`] and one [`DubboFrontend`].
//!
//! Refresh collaborators publish into the registry and filters by
//! replacement; requests only read.
//!
//! # Example
//!
//! ```rust,ignore
//! let settings = InferSettings::load(None)?;
//! let service = InferService::new(settings, Arc::new(NoopWatcher))?;
//! service.registry().publish(config);
//! let reply = service.recommend_grpc(request).await;
//! ```

use std::sync::Arc;

use infer_core::{ConfigWatcher, InferSettings, Result, ServiceRegistry};
use infer_features::{ExistenceFilters, TtlCache};
use infer_model::ModelPipeline;
use tokio::task::JoinHandle;

use crate::breaker::CircuitBreakers;
use crate::dispatcher::Dispatcher;
use crate::frontend::{
    DubboFrontend, GrpcFrontend, RecRequest, RecResponse, RecommendRequest, RecommendResponse,
    Reply, serve,
};

/// Everything one server process shares between requests.
#[derive(Debug)]
pub struct InferService {
    settings: InferSettings,
    filters: Arc<ExistenceFilters>,
    cache: Arc<TtlCache>,
    sweeper: Option<JoinHandle<()>>,
    dispatcher: Dispatcher,
    grpc: GrpcFrontend,
    dubbo: DubboFrontend,
}

impl InferService {
    /// Assemble the service.
    ///
    /// Must be called from within a Tokio runtime when caching is enabled,
    /// since the cache sweeper is spawned here.
    ///
    /// # Errors
    ///
    /// Returns [`infer_core::Error::Config`] if `settings` fail validation.
    pub fn new(settings: InferSettings, watcher: Arc<dyn ConfigWatcher>) -> Result<Self> {
        settings.validate()?;

        let registry = Arc::new(ServiceRegistry::new());
        let filters = Arc::new(ExistenceFilters::from_settings(&settings.features));
        let cache = Arc::new(TtlCache::new(settings.cache.clone()));
        let sweeper = cache.spawn_sweeper();
        let breakers = Arc::new(CircuitBreakers::new(settings.breaker.clone()));
        let pipeline = Arc::new(ModelPipeline::new(
            Arc::clone(&filters),
            Arc::clone(&cache),
            settings.clone(),
        ));
        let dispatcher = Dispatcher::new(registry, pipeline, breakers, watcher);

        tracing::info!(
            grpc_deadline_ms = settings.dispatch.grpc_deadline_ms,
            dubbo_deadline_ms = settings.dispatch.dubbo_deadline_ms,
            cache_enabled = cache.is_enabled(),
            "inference service assembled"
        );

        Ok(Self {
            grpc: GrpcFrontend::new(&settings.dispatch),
            dubbo: DubboFrontend::new(&settings.dispatch),
            settings,
            filters,
            cache,
            sweeper,
            dispatcher,
        })
    }

    /// Settings the service was built with.
    pub fn settings(&self) -> &InferSettings {
        &self.settings
    }

    /// Tenant configuration registry.
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        self.dispatcher.registry()
    }

    /// Existence filters.
    pub fn filters(&self) -> &Arc<ExistenceFilters> {
        &self.filters
    }

    /// Response and feature cache.
    pub fn cache(&self) -> &Arc<TtlCache> {
        &self.cache
    }

    /// The dispatcher.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// The gRPC front end.
    pub fn grpc(&self) -> &GrpcFrontend {
        &self.grpc
    }

    /// The Dubbo front end.
    pub fn dubbo(&self) -> &DubboFrontend {
        &self.dubbo
    }

    /// Serve a gRPC recommend call.
    pub async fn recommend_grpc(&self, request: RecommendRequest) -> Reply<RecommendResponse> {
        serve(&self.grpc, &self.dispatcher, request).await
    }

    /// Serve a Dubbo recommend call.
    pub async fn recommend_dubbo(&self, request: RecRequest) -> Reply<RecResponse> {
        serve(&self.dubbo, &self.dispatcher, request).await
    }
}

impl Drop for InferService {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::frontend::Frontend;
    use infer_core::{Error, NoopWatcher};

    #[tokio::test]
    async fn test_new_with_defaults() {
        let service = InferService::new(InferSettings::default(), Arc::new(NoopWatcher)).unwrap();

        assert!(!service.cache().is_enabled());
        assert!(service.registry().is_empty());
        assert!(service.filters().user_may_exist("anyone"));
        assert_eq!(service.grpc().profile().breaker_key, "grpcServer");
    }

    #[tokio::test]
    async fn test_filters_rebuild_at_configured_rate() {
        let mut settings = InferSettings::default();
        settings.features.filter_false_positive_rate = 0.05;
        let service = InferService::new(settings, Arc::new(NoopWatcher)).unwrap();

        assert_eq!(service.filters().false_positive_rate(), 0.05);
        service.filters().rebuild_users(["u1", "u2"]);
        assert!(service.filters().user_may_exist("u1"));
        assert_eq!(
            service.filters().users().num_bits(),
            infer_features::BloomFilter::with_rate(2, 0.05).num_bits()
        );
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_settings() {
        let mut settings = InferSettings::default();
        settings.breaker.lower_rank_num = 0;

        let err = InferService::new(settings, Arc::new(NoopWatcher)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_unknown_tenant_reply() {
        let service = InferService::new(InferSettings::default(), Arc::new(NoopWatcher)).unwrap();

        let reply = service
            .recommend_dubbo(RecRequest {
                data_id: "nobody".into(),
                user_id: "u1".into(),
                model_type: "recall".into(),
                ..RecRequest::default()
            })
            .await;

        assert!(reply.interrupted.is_none());
        assert_eq!(reply.response.code, infer_core::STATUS_NOT_FOUND);
        assert!(reply.response.message.contains("nobody"));
    }
}
