//! Collaborator traits for the inference pipeline.
//!
//! The pipeline never talks to Redis, TF-Serving or an index service
//! directly; it talks to these traits. Backends live in `infer-features`
//! (feature stores) and `infer-model` (prediction and index clients), each
//! with an in-memory mock for tests.
//!
//! # Bounds
//!
//! All traits are `Send + Sync` so implementations can be shared across the
//! short-lived tasks spawned for every request.

use async_trait::async_trait;

use crate::Result;
use crate::tensor::{PredictRequest, PredictResponse};
use crate::types::{ItemInfo, TenantKey};

/// Keyed point lookups of serialized feature blobs.
#[async_trait]
pub trait FeatureStore: Send + Sync {
    /// Read the blob stored under `key`.
    ///
    /// Returns `Ok(None)` when the key is absent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`](crate::Error::Store) when the read fails.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Backend name for diagnostics.
    fn name(&self) -> &str;
}

/// Remote tensor-prediction service.
#[async_trait]
pub trait PredictionService: Send + Sync {
    /// Run a prediction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Inference`](crate::Error::Inference) when the remote
    /// call fails, or [`Error::PoolExhausted`](crate::Error::PoolExhausted)
    /// when no connection could be acquired.
    async fn predict(&self, request: PredictRequest) -> Result<PredictResponse>;

    /// Service name for diagnostics.
    fn name(&self) -> &str;
}

/// One shard of a vector-similarity index.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Return up to `top_k` candidates nearest to `embedding`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Search`](crate::Error::Search) when the shard fails.
    async fn search(&self, embedding: &[f32], top_k: usize) -> Result<Vec<ItemInfo>>;

    /// Shard name for diagnostics.
    fn name(&self) -> &str;
}

/// Registers interest in configuration pushes for a tenant.
///
/// Called at most once per tenant that registered successfully; see
/// [`ServiceRegistry::ensure_watched`](crate::ServiceRegistry::ensure_watched).
#[async_trait]
pub trait ConfigWatcher: Send + Sync {
    /// Start watching the tenant's configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when the registration could not be made; it will be
    /// attempted again on the tenant's next request.
    async fn watch(&self, tenant: &TenantKey) -> Result<()>;
}
