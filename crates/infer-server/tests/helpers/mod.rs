//! Shared fixtures for the serving tests.
#![allow(dead_code, clippy::unwrap_used)]

use std::sync::Arc;

use infer_core::{
    InferSettings, KeyPrefixes, ModelConfig, NoopWatcher, ServiceConfig, TenantKey,
};
use infer_features::MockFeatureStore;
use infer_model::{MockPredictionService, MockVectorIndex};
use infer_server::{InferService, RecRequest, RecommendRequest, StringList};

pub const TENANT: &str = "shop-a";

/// A service with one published tenant backed by mocks.
pub struct Harness {
    pub service: InferService,
    pub store: MockFeatureStore,
    pub predictor: MockPredictionService,
}

/// Timeouts that fit inside both front-end deadlines.
pub fn settings() -> InferSettings {
    let mut settings = InferSettings::default();
    settings.breaker.primary_timeout_ms = 140;
    settings.features.assembly_timeout_ms = 50;
    settings.search.gather_timeout_ms = 40;
    settings.search.format_timeout_ms = 20;
    settings
}

pub fn store() -> MockFeatureStore {
    MockFeatureStore::new()
        .with_value("uo:u1", b"offline".to_vec())
        .with_value("ur:u1", b"context".to_vec())
        .with_value("it:i1", b"item-1".to_vec())
        .with_value("it:i2", b"item-2".to_vec())
        .with_value("it:i3", b"item-3".to_vec())
        .with_value("it:i4", b"item-4".to_vec())
}

pub fn harness(
    settings: InferSettings,
    store: MockFeatureStore,
    predictor: MockPredictionService,
    shards: Vec<MockVectorIndex>,
) -> Harness {
    let service = InferService::new(settings, Arc::new(NoopWatcher)).unwrap();

    let mut builder = ServiceConfig::builder(TENANT)
        .feature_store(Arc::new(store.clone()))
        .model(ModelConfig::new(
            "deepfm",
            KeyPrefixes::new("uo:", "ur:", "it:"),
            Arc::new(predictor.clone()),
        ));
    for shard in shards {
        builder = builder.index_shard(Arc::new(shard));
    }
    service.registry().publish(builder.build().unwrap());

    Harness {
        service,
        store,
        predictor,
    }
}

pub fn tenant() -> TenantKey {
    TenantKey::new(TENANT, "DEFAULT_GROUP", "prod")
}

pub fn grpc_rank(items: &[&str], recall_num: i32) -> RecommendRequest {
    RecommendRequest {
        data_id: TENANT.into(),
        group_id: "DEFAULT_GROUP".into(),
        namespace: "prod".into(),
        user_id: "u1".into(),
        recall_num,
        item_list: Some(StringList {
            value: items.iter().map(|s| s.to_string()).collect(),
        }),
        model_type: "rank".into(),
    }
}

pub fn dubbo_recall(recall_num: i32) -> RecRequest {
    RecRequest {
        data_id: TENANT.into(),
        group_id: "DEFAULT_GROUP".into(),
        namespace_id: "prod".into(),
        user_id: "u1".into(),
        recall_num,
        item_list: Vec::new(),
        model_type: "recall".into(),
    }
}
