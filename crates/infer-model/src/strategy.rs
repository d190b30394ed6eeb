//! Recall and rank strategies.
//!
//! A [`Strategy`] is chosen per request from the request's model type and
//! carries that request through the pipeline. Nothing about the choice is
//! shared between requests.
//!
//! [`ModelPipeline::run`] executes a strategy against one tenant snapshot:
//!
//! ```text
//! response cache ─hit──────────────────────────────────────────▶ response
//!       │miss
//!       ▼
//! FeatureAggregator ─▶ InferenceClient ─┬─recall─▶ scatter_gather ─▶ format
//!                                       └─rank───▶ zip item keys ──▶ format, sort
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use infer_core::{
    Error, ExampleFeatures, InferResponse, InferSettings, InferenceRequest, ItemInfo, Result,
    ScoredItem, ServiceConfig,
};
use infer_features::{ExistenceFilters, FeatureAggregator, TtlCache, response_key};

use crate::format::format_items;
use crate::predict::InferenceClient;
use crate::search::scatter_gather;

/// Output tensor holding the user embedding.
pub const RECALL_OUTPUT: &str = "user_embedding";

/// Output tensor holding per-item scores.
pub const RANK_OUTPUT: &str = "scores";

// ============================================================================
// Strategy selection
// ============================================================================

/// The two inference modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKind {
    /// Retrieve candidates by embedding similarity.
    Recall,
    /// Score a given candidate set.
    Rank,
}

impl ModelKind {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recall => "recall",
            Self::Rank => "rank",
        }
    }

    /// Output tensor the model is asked for.
    pub fn output_tensor(&self) -> &'static str {
        match self {
            Self::Recall => RECALL_OUTPUT,
            Self::Rank => RANK_OUTPUT,
        }
    }
}

impl FromStr for ModelKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "recall" => Ok(Self::Recall),
            "rank" => Ok(Self::Rank),
            other => Err(Error::UnknownModelType(other.to_string())),
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated request bound to its inference mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Strategy {
    kind: ModelKind,
    request: InferenceRequest,
    degraded: bool,
}

impl Strategy {
    /// Choose and validate the strategy for `request`.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownModelType`] unless the model type is exactly
    ///   `"recall"` or `"rank"`
    /// - [`Error::InvalidInput`] if the user id is empty, or a rank request
    ///   has no candidate items
    pub fn select(request: InferenceRequest) -> Result<Self> {
        let kind: ModelKind = request.model_type.parse()?;

        if request.user_id.is_empty() {
            return Err(Error::invalid_input("user id is required"));
        }
        if kind == ModelKind::Rank && request.item_list.is_empty() {
            return Err(Error::invalid_input("rank requires a non-empty item list"));
        }

        Ok(Self {
            kind,
            request,
            degraded: false,
        })
    }

    /// Inference mode.
    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    /// The request being served.
    pub fn request(&self) -> &InferenceRequest {
        &self.request
    }

    /// Whether this is the reduced-workload fallback.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Candidate items the request is scored on; `None` for recall.
    pub fn items(&self) -> Option<&[String]> {
        match self.kind {
            ModelKind::Recall => None,
            ModelKind::Rank => Some(self.request.item_list.as_slice()),
        }
    }

    /// The same strategy on a reduced workload.
    ///
    /// Consumes the strategy, so the trimmed item list cannot grow back.
    /// A degraded strategy never reads assembled features from the cache.
    pub fn degrade(self, lower_rank_num: usize, lower_recall_num: u32) -> Self {
        Self {
            kind: self.kind,
            request: self.request.degrade(lower_rank_num, lower_recall_num),
            degraded: true,
        }
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Runs strategies against tenant configuration snapshots.
#[derive(Clone)]
pub struct ModelPipeline {
    filters: Arc<ExistenceFilters>,
    cache: Arc<TtlCache>,
    settings: InferSettings,
}

impl ModelPipeline {
    /// Create a pipeline over the process-wide filters and cache.
    pub fn new(filters: Arc<ExistenceFilters>, cache: Arc<TtlCache>, settings: InferSettings) -> Self {
        Self {
            filters,
            cache,
            settings,
        }
    }

    /// Shared TTL cache.
    pub fn cache(&self) -> &Arc<TtlCache> {
        &self.cache
    }

    /// Shared existence filters.
    pub fn filters(&self) -> &Arc<ExistenceFilters> {
        &self.filters
    }

    /// Process settings.
    pub fn settings(&self) -> &InferSettings {
        &self.settings
    }

    /// Serve `strategy` with `config`.
    ///
    /// # Errors
    ///
    /// - [`Error::PoolExhausted`], [`Error::Timeout`] or [`Error::Inference`]
    ///   from the inference call
    /// - [`Error::NotFound`] when no result row survives
    pub async fn run(&self, strategy: &Strategy, config: &ServiceConfig) -> Result<InferResponse> {
        let request = strategy.request();
        let model_name = config.model().model_name.as_str();
        let cache_key = response_key(
            &request.user_id,
            config.service_id(),
            model_name,
            strategy.items(),
        );

        if let Some(response) = self.cached_response(&cache_key) {
            tracing::debug!(
                tenant = config.service_id(),
                user_id = %request.user_id,
                kind = %strategy.kind(),
                "response cache hit"
            );
            return Ok(response);
        }

        let mut aggregator = FeatureAggregator::for_service(
            config,
            Arc::clone(&self.filters),
            &self.settings.features,
            Arc::clone(&self.cache),
        );
        if strategy.is_degraded() {
            aggregator = aggregator.bypassing_cache();
        }
        let inference = InferenceClient::for_model(config.model(), &self.settings.inference);

        let rows = match strategy.kind() {
            ModelKind::Recall => self.recall(request, config, &aggregator, &inference).await?,
            ModelKind::Rank => self.rank(request, config, &aggregator, &inference).await?,
        };

        let response = InferResponse::ok(rows);
        if self.cache.is_enabled() {
            match serde_json::to_vec(&response) {
                Ok(bytes) => {
                    self.cache.set(&cache_key, &bytes);
                }
                Err(e) => tracing::warn!(error = %e, "cannot encode response for cache"),
            }
        }
        Ok(response)
    }

    fn cached_response(&self, key: &str) -> Option<InferResponse> {
        let bytes = self.cache.get(key)?;
        match serde_json::from_slice(&bytes) {
            Ok(response) => Some(response),
            Err(e) => {
                tracing::warn!(key, error = %e, "undecodable cached response, treating as miss");
                None
            }
        }
    }

    async fn recall(
        &self,
        request: &InferenceRequest,
        config: &ServiceConfig,
        aggregator: &FeatureAggregator,
        inference: &InferenceClient,
    ) -> Result<Vec<ScoredItem>> {
        let features = aggregator
            .assemble(&request.user_id, None, config.service_id(), &config.model().model_name)
            .await;

        let embedding = inference.infer(&features, RECALL_OUTPUT, false).await?;
        tracing::debug!(user_id = %request.user_id, dims = embedding.len(), "user embedding");

        let candidates = scatter_gather(
            config.index_shards(),
            &embedding,
            request.recall_num as usize,
            self.settings.search.gather_timeout(),
        )
        .await;

        let rows = format_items(candidates, self.settings.search.format_timeout()).await;
        if rows.is_empty() {
            tracing::error!(
                tenant = config.service_id(),
                user_id = %request.user_id,
                shards = config.index_shards().len(),
                "recall produced no items, check the vector index"
            );
            return Err(Error::not_found(format!("recall 0 item for user {}", request.user_id)));
        }
        Ok(rows)
    }

    async fn rank(
        &self,
        request: &InferenceRequest,
        config: &ServiceConfig,
        aggregator: &FeatureAggregator,
        inference: &InferenceClient,
    ) -> Result<Vec<ScoredItem>> {
        let features = aggregator
            .assemble(
                &request.user_id,
                Some(request.item_list.as_slice()),
                config.service_id(),
                &config.model().model_name,
            )
            .await;

        let scores = inference.infer(&features, RANK_OUTPUT, true).await?;
        let scored = score_items(&features, scores);

        let mut rows = format_items(scored, self.settings.search.format_timeout()).await;
        rows.sort_by(|a, b| b.score.total_cmp(&a.score));
        if request.recall_num > 0 {
            rows.truncate(request.recall_num as usize);
        }

        if rows.is_empty() {
            return Err(Error::not_found(format!("rank 0 item for user {}", request.user_id)));
        }
        Ok(rows)
    }
}

/// Pair item keys with model scores, in feature order.
fn score_items(features: &ExampleFeatures, scores: Vec<f32>) -> Vec<ItemInfo> {
    if scores.len() != features.items.len() {
        tracing::warn!(
            items = features.items.len(),
            scores = scores.len(),
            "score count differs from item count"
        );
    }
    features
        .items
        .iter()
        .zip(scores)
        .map(|(item, score)| ItemInfo::new(item.key.clone(), score))
        .collect()
}

impl fmt::Debug for ModelPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelPipeline")
            .field("cache", &self.cache)
            .field("settings", &self.settings)
            .finish()
    }
}
