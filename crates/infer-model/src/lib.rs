//! Model execution for the inference server.
//!
//! This crate holds everything after feature assembly: the tensor inference
//! client, vector search across index shards, result formatting, and the
//! recall/rank strategies that tie them together.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       infer-model                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Strategy (per request: Recall | Rank)                      │
//! │  ModelPipeline::run (response cache, recall/rank paths)     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  PredictionService trait (infer-core)                       │
//! │  ├── MockPredictionService (always available)               │
//! │  └── TfServingClient (REST, ConnectionPool)                 │
//! │  InferenceClient (named inputs, own timeout)                │
//! ├─────────────────────────────────────────────────────────────┤
//! │  VectorIndex trait (infer-core)                             │
//! │  ├── MockVectorIndex (always available)                     │
//! │  └── HttpVectorIndex                                        │
//! │  scatter_gather (one task per shard, deadline merge)        │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod format;
pub mod predict;
pub mod search;
pub mod strategy;

pub use format::{format_items, round_score};
pub use predict::{
    ConnectionPool, InferenceClient, MockPredictionService, PooledConnection, TfServingClient,
};
pub use search::{HttpVectorIndex, IndexShardConfig, MockVectorIndex, scatter_gather};
pub use strategy::{ModelKind, ModelPipeline, RANK_OUTPUT, RECALL_OUTPUT, Strategy};
