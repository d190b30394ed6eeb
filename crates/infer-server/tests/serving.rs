//! End-to-end serving behaviour through the protocol front ends.
#![allow(clippy::unwrap_used)]

mod helpers;

use std::time::Duration;

use futures::future::join_all;
use infer_core::tensor::{ITEM_EXAMPLES, USER_CONTEXT_EXAMPLES, USER_EXAMPLES};
use infer_core::{ItemInfo, STATUS_NOT_FOUND, STATUS_OK};
use infer_features::BloomFilter;
use infer_model::{MockPredictionService, MockVectorIndex, RANK_OUTPUT, RECALL_OUTPUT};
use infer_server::{InterruptReason, RecommendRequest};
use tokio::time::Instant;

use helpers::{dubbo_recall, grpc_rank, harness, settings, store};

fn rank_predictor() -> MockPredictionService {
    MockPredictionService::new().with_output(RANK_OUTPUT, vec![0.1, 0.9, 0.5, 0.3])
}

// ============================================================================
// Deadlines
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_slow_backends_never_exceed_deadline() {
    let h = harness(
        settings(),
        store(),
        rank_predictor().with_delay(Duration::from_secs(5)),
        Vec::new(),
    );

    let started = Instant::now();
    let replies =
        join_all((0..16).map(|_| h.service.recommend_grpc(grpc_rank(&["i1", "i2"], 10)))).await;

    assert!(started.elapsed() <= Duration::from_millis(151));
    for reply in replies {
        assert_eq!(reply.interrupted, Some(InterruptReason::DeadlineExceeded));
        assert_eq!(reply.response.code, STATUS_NOT_FOUND);
        assert!(reply.response.data.is_empty());
    }
}

#[tokio::test(start_paused = true)]
async fn test_dubbo_deadline_is_shorter() {
    let slow_shard = MockVectorIndex::new("s0", vec![ItemInfo::new("a", 0.5)])
        .with_delay(Duration::from_secs(5));
    let mut settings = settings();
    settings.search.gather_timeout_ms = 120;
    let h = harness(
        settings,
        store(),
        MockPredictionService::new().with_output(RECALL_OUTPUT, vec![0.1, 0.2]),
        vec![slow_shard],
    );

    let started = Instant::now();
    let reply = h.service.recommend_dubbo(dubbo_recall(10)).await;

    assert_eq!(reply.interrupted, Some(InterruptReason::DeadlineExceeded));
    assert!(started.elapsed() <= Duration::from_millis(101));
}

// ============================================================================
// Validation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_unknown_model_type_touches_nothing() {
    let h = harness(settings(), store(), rank_predictor(), Vec::new());

    let reply = h
        .service
        .recommend_grpc(RecommendRequest {
            model_type: "ctr".into(),
            ..grpc_rank(&["i1"], 10)
        })
        .await;

    assert!(reply.interrupted.is_none());
    assert_eq!(reply.response.code, STATUS_NOT_FOUND);
    assert!(reply.response.message.contains("ctr"));
    assert_eq!(h.store.read_count(), 0);
    assert_eq!(h.predictor.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_rank_without_items_is_rejected() {
    let h = harness(settings(), store(), rank_predictor(), Vec::new());

    let reply = h.service.recommend_grpc(grpc_rank(&[], 10)).await;

    assert_eq!(reply.response.code, STATUS_NOT_FOUND);
    assert_eq!(h.store.read_count(), 0);
    assert_eq!(h.predictor.calls(), 0);
}

// ============================================================================
// Circuit breaker
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_open_breaker_serves_degraded_workload_only() {
    let mut settings = settings();
    settings.breaker.consecutive_failures = 2;
    settings.breaker.lower_rank_num = 2;
    settings.breaker.lower_recall_num = 1;
    let h = harness(settings, store(), rank_predictor(), Vec::new());
    h.predictor.set_failing(true);

    let items = ["i1", "i2", "i3", "i4"];
    for _ in 0..2 {
        let reply = h.service.recommend_grpc(grpc_rank(&items, 10)).await;
        assert_eq!(reply.response.code, STATUS_NOT_FOUND);
    }
    // primary and fallback each called once per request
    assert_eq!(h.predictor.calls(), 4);
    assert!(!h.service.dispatcher().breakers().is_call_permitted("grpcServer"));

    h.predictor.set_failing(false);
    let reply = h.service.recommend_grpc(grpc_rank(&items, 10)).await;

    // only the fallback ran, on two items and one result
    assert_eq!(h.predictor.calls(), 5);
    let sent = h.predictor.last_request().unwrap();
    assert_eq!(sent.inputs[ITEM_EXAMPLES].len(), 2);
    assert_eq!(reply.response.code, STATUS_OK);
    assert_eq!(reply.response.data.len(), 1);
    assert_eq!(reply.response.data[0].itemid, "i2");

    // the other front end has its own breaker
    assert!(h.service.dispatcher().breakers().is_call_permitted("dubboServer"));
}

#[tokio::test(start_paused = true)]
async fn test_fallback_after_cached_assembly_stays_trimmed() {
    let mut settings = settings();
    settings.cache.life_window_secs = 30;
    settings.breaker.lower_rank_num = 2;
    let h = harness(settings, store(), rank_predictor(), Vec::new());
    h.predictor.fail_next(1);

    let reply = h
        .service
        .recommend_grpc(grpc_rank(&["i1", "i2", "i3", "i4"], 10))
        .await;

    // primary assembled and cached four items, then failed at inference
    assert_eq!(h.predictor.item_counts(), vec![4, 2]);
    assert_eq!(reply.response.code, STATUS_OK);
    assert_eq!(reply.response.data.len(), 2);
}

// ============================================================================
// Feature assembly
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_missing_context_signal_is_empty_blob() {
    let store = store().with_delay("ur:u1", Duration::from_secs(1));
    let h = harness(settings(), store, rank_predictor(), Vec::new());

    let reply = h.service.recommend_grpc(grpc_rank(&["i1", "i2"], 10)).await;

    assert!(reply.interrupted.is_none());
    assert_eq!(reply.response.data.len(), 2);
    let sent = h.predictor.last_request().unwrap();
    assert_eq!(sent.inputs[USER_EXAMPLES].values, vec![b"offline".to_vec()]);
    assert_eq!(sent.inputs[USER_CONTEXT_EXAMPLES].values, vec![Vec::<u8>::new()]);
}

#[tokio::test(start_paused = true)]
async fn test_filter_negative_skips_read() {
    let h = harness(settings(), store(), rank_predictor(), Vec::new());
    h.service
        .filters()
        .replace_items(BloomFilter::from_keys(["i1"], 0.0001));

    let reply = h.service.recommend_grpc(grpc_rank(&["i1", "i2"], 10)).await;

    assert_eq!(h.store.reads_of("it:i1"), 1);
    assert_eq!(h.store.reads_of("it:i2"), 0);
    assert_eq!(h.store.reads_of("uo:u1"), 1);
    assert_eq!(reply.response.data.len(), 1);
    assert_eq!(reply.response.data[0].itemid, "i1");
}

// ============================================================================
// Response cache
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_cache_round_trip_is_byte_identical() {
    let mut settings = settings();
    settings.cache.life_window_secs = 30;
    let h = harness(settings, store(), rank_predictor(), Vec::new());

    let first = h.service.recommend_grpc(grpc_rank(&["i1", "i2"], 10)).await;
    let reads = h.store.read_count();
    let calls = h.predictor.calls();
    assert_eq!(calls, 1);

    let second = h.service.recommend_grpc(grpc_rank(&["i1", "i2"], 10)).await;

    assert_eq!(
        serde_json::to_vec(&first.response).unwrap(),
        serde_json::to_vec(&second.response).unwrap()
    );
    assert_eq!(h.store.read_count(), reads);
    assert_eq!(h.predictor.calls(), calls);

    tokio::time::advance(Duration::from_secs(31)).await;
    h.service.recommend_grpc(grpc_rank(&["i1", "i2"], 10)).await;
    assert_eq!(h.predictor.calls(), calls + 1);
}

// ============================================================================
// Vector search
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_recall_merges_responding_shards() {
    let shards = vec![
        MockVectorIndex::new("s0", vec![ItemInfo::new("a", 0.123_456)]),
        MockVectorIndex::new("s1", vec![ItemInfo::new("b", 0.987_654)]),
        MockVectorIndex::new("s2", vec![ItemInfo::new("c", 0.5)]).with_delay(Duration::from_secs(1)),
    ];
    let h = harness(
        settings(),
        store(),
        MockPredictionService::new().with_output(RECALL_OUTPUT, vec![0.1, 0.2, 0.3]),
        shards,
    );

    let reply = h
        .service
        .recommend_grpc(RecommendRequest {
            model_type: "recall".into(),
            item_list: None,
            ..grpc_rank(&[], 10)
        })
        .await;

    assert!(reply.interrupted.is_none());
    let mut rows = reply.response.data;
    rows.sort_by(|a, b| a.itemid.cmp(&b.itemid));
    let ids: Vec<&str> = rows.iter().map(|r| r.itemid.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert_eq!(rows[0].score, 0.1235);
    assert_eq!(rows[1].score, 0.9877);

    // recall sends no item blobs
    let sent = h.predictor.last_request().unwrap();
    assert!(sent.inputs[ITEM_EXAMPLES].is_empty());
}
