//! Feature assembly for the inference server.
//!
//! This crate turns a user id (and, for rank, a candidate item list) into an
//! [`ExampleFeatures`](infer_core::ExampleFeatures) bundle, best-effort and
//! under a local deadline.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     infer-features                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  FeatureAggregator (JoinSet fan-out, deadline fan-in)       │
//! │  ├── TtlCache gate (features key, JSON payload)             │
//! │  └── ExistenceFilters (skip reads of absent ids)            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  FeatureStore trait (infer-core)                            │
//! │  ├── MockFeatureStore (always available)                    │
//! │  └── RedisFeatureStore (ConnectionManager)                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use infer_features::{ExistenceFilters, FeatureAggregator, MockFeatureStore, TtlCache};
//! use std::sync::Arc;
//!
//! let store = MockFeatureStore::new().with_value("uo:u1", b"...".to_vec());
//! let aggregator = FeatureAggregator::new(
//!     Arc::new(store),
//!     Arc::new(ExistenceFilters::allow_all()),
//!     KeyPrefixes::new("uo:", "ur:", "it:"),
//!     &settings.features,
//!     Arc::new(TtlCache::new(settings.cache.clone())),
//! );
//!
//! let features = aggregator.assemble("u1", None, "shop-a", "dssm").await;
//! ```

pub mod aggregator;
pub mod cache;
pub mod filter;
pub mod store;

pub use aggregator::FeatureAggregator;
pub use cache::{CacheStats, TtlCache, features_key, response_key};
pub use filter::{BloomFilter, ExistenceFilters};
pub use store::{MockFeatureStore, RedisFeatureStore};
