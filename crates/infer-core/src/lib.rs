//! Inference Core: shared types, traits, errors and settings.
//!
//! This crate provides the foundational types used across all inference
//! crates. It has no internal dependencies (dependency level 0).
//!
//! # Modules
//!
//! - [`error`]: Error types and Result alias
//! - [`types`]: Requests, feature bundles, results and responses
//! - [`tensor`]: Prediction request/response shapes
//! - [`traits`]: Collaborator traits (feature store, predictor, index, watcher)
//! - [`registry`]: Per-tenant service configuration snapshots
//! - [`settings`]: Process settings loaded once at startup

#![doc = include_str!("../README.md")]

pub mod error;
pub mod registry;
pub mod settings;
pub mod tensor;
pub mod traits;
pub mod types;

// Re-export key types at crate root for convenience
pub use error::{Error, Result};
pub use registry::{
    KeyPrefixes, ModelConfig, NoopWatcher, RecordingWatcher, ServiceConfig, ServiceConfigBuilder,
    ServiceRegistry,
};
pub use settings::{
    BreakerSettings, CacheSettings, DispatchSettings, FeatureSettings, InferSettings,
    InferenceSettings, SearchSettings,
};
pub use tensor::{PredictRequest, PredictResponse, StringTensor};
pub use traits::{ConfigWatcher, FeatureStore, PredictionService, VectorIndex};
pub use types::{
    ExampleFeatures, InferResponse, InferenceRequest, ItemInfo, STATUS_NOT_FOUND, STATUS_OK,
    ScoredItem, SeqExampleBuff, TenantKey,
};
