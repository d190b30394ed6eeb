//! Vector search across index shards.
//!
//! [`scatter_gather`] sends one embedding to every shard at once and merges
//! whatever comes back before the local deadline. A shard that errors or is
//! still running at the deadline contributes nothing; neither case fails the
//! search.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use infer_core::{Error, ItemInfo, Result, VectorIndex};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

/// Default result count of a shard when the request asks for none.
pub const DEFAULT_TOP_K: usize = 100;

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

/// Configuration of one index shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexShardConfig {
    /// Shard name for diagnostics.
    pub name: String,

    /// Base URL of the index service.
    pub endpoint: String,

    /// Index name on that service.
    pub index_name: String,

    /// Result count used when a search asks for zero.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl IndexShardConfig {
    /// Create a shard config.
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        index_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            index_name: index_name.into(),
            top_k: DEFAULT_TOP_K,
        }
    }
}

// ============================================================================
// HTTP shard
// ============================================================================

#[derive(Debug, Serialize)]
struct SearchBody<'a> {
    index: &'a str,
    vector: &'a [f32],
    top_k: usize,
}

#[derive(Debug, Deserialize)]
struct SearchReply {
    #[serde(default)]
    items: Vec<ItemInfo>,
}

/// Index shard reached over HTTP (`POST {endpoint}/search`).
#[derive(Debug, Clone)]
pub struct HttpVectorIndex {
    config: IndexShardConfig,
    client: reqwest::Client,
}

impl HttpVectorIndex {
    /// Create a shard client.
    pub fn new(config: IndexShardConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Shard configuration.
    pub fn config(&self) -> &IndexShardConfig {
        &self.config
    }

    fn search_url(&self) -> String {
        format!("{}/search", self.config.endpoint.trim_end_matches('/'))
    }
}

#[async_trait]
impl VectorIndex for HttpVectorIndex {
    async fn search(&self, embedding: &[f32], top_k: usize) -> Result<Vec<ItemInfo>> {
        let body = SearchBody {
            index: &self.config.index_name,
            vector: embedding,
            top_k: if top_k == 0 { self.config.top_k } else { top_k },
        };

        let response = self
            .client
            .post(self.search_url())
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::search_with_source(format!("{}: search call failed", self.config.name), e))?;

        if !response.status().is_success() {
            return Err(Error::search(format!(
                "{}: search error {}",
                self.config.name,
                response.status()
            )));
        }

        let reply: SearchReply = response
            .json()
            .await
            .map_err(|e| Error::search_with_source(format!("{}: bad search response", self.config.name), e))?;
        Ok(reply.items)
    }

    fn name(&self) -> &str {
        &self.config.name
    }
}

// ============================================================================
// Scatter-gather
// ============================================================================

/// Search every shard concurrently and merge what arrives within `timeout`.
///
/// The merged list is unordered.
pub async fn scatter_gather(
    shards: &[Arc<dyn VectorIndex>],
    embedding: &[f32],
    recall_num: usize,
    timeout: Duration,
) -> Vec<ItemInfo> {
    let deadline = tokio::time::Instant::now() + timeout;
    let embedding: Arc<[f32]> = Arc::from(embedding);
    let mut tasks = JoinSet::new();

    for shard in shards {
        let shard = Arc::clone(shard);
        let embedding = Arc::clone(&embedding);
        tasks.spawn(async move {
            let result = shard.search(&embedding, recall_num).await;
            (shard.name().to_string(), result)
        });
    }

    let mut merged = Vec::new();
    loop {
        match tokio::time::timeout_at(deadline, tasks.join_next()).await {
            Ok(Some(Ok((shard, Ok(items))))) => {
                tracing::debug!(shard = %shard, count = items.len(), "shard responded");
                merged.extend(items);
            }
            Ok(Some(Ok((shard, Err(e))))) => {
                tracing::warn!(shard = %shard, error = %e, "shard search failed");
            }
            Ok(Some(Err(e))) => {
                tracing::error!(error = %e, "shard search task failed");
            }
            Ok(None) => break,
            Err(_) => {
                tracing::warn!(
                    pending = tasks.len(),
                    timeout = ?timeout,
                    "vector search deadline reached, dropping slow shards"
                );
                break;
            }
        }
    }
    tasks.abort_all();
    merged
}

// ============================================================================
// Mock
// ============================================================================

/// Index shard returning canned candidates.
#[derive(Debug, Clone)]
pub struct MockVectorIndex {
    name: String,
    items: Vec<ItemInfo>,
    delay: Option<Duration>,
    failing: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
}

impl MockVectorIndex {
    /// Create a shard returning `items`.
    pub fn new(name: impl Into<String>, items: Vec<ItemInfo>) -> Self {
        Self {
            name: name.into(),
            items,
            delay: None,
            failing: Arc::new(AtomicBool::new(false)),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Delay every search.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make searches fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Searches made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VectorIndex for MockVectorIndex {
    async fn search(&self, _embedding: &[f32], top_k: usize) -> Result<Vec<ItemInfo>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::search(format!("{}: mock search failed", self.name)));
        }
        let limit = if top_k == 0 { self.items.len() } else { top_k };
        Ok(self.items.iter().take(limit).cloned().collect())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn shard(name: &str, ids: &[&str]) -> MockVectorIndex {
        MockVectorIndex::new(
            name,
            ids.iter().map(|id| ItemInfo::new(*id, 0.5)).collect(),
        )
    }

    fn ids(items: &[ItemInfo]) -> Vec<String> {
        let mut ids: Vec<String> = items.iter().map(|i| i.item_id.clone()).collect();
        ids.sort();
        ids
    }

    #[tokio::test(start_paused = true)]
    async fn test_merges_all_shards() {
        let shards: Vec<Arc<dyn VectorIndex>> = vec![
            Arc::new(shard("a", &["a1", "a2"])),
            Arc::new(shard("b", &["b1"])),
        ];
        let merged = scatter_gather(&shards, &[0.1, 0.2], 10, Duration::from_millis(100)).await;
        assert_eq!(ids(&merged), vec!["a1", "a2", "b1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_shard_absent() {
        let slow = shard("slow", &["s1"]).with_delay(Duration::from_secs(1));
        let shards: Vec<Arc<dyn VectorIndex>> = vec![
            Arc::new(shard("a", &["a1"])),
            Arc::new(slow),
            Arc::new(shard("c", &["c1"])),
        ];

        let started = tokio::time::Instant::now();
        let merged = scatter_gather(&shards, &[0.1], 10, Duration::from_millis(100)).await;

        assert!(started.elapsed() <= Duration::from_millis(110));
        assert_eq!(ids(&merged), vec!["a1", "c1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_shard_contributes_nothing() {
        let broken = shard("broken", &["x1"]);
        broken.set_failing(true);
        let shards: Vec<Arc<dyn VectorIndex>> =
            vec![Arc::new(broken.clone()), Arc::new(shard("a", &["a1"]))];

        let merged = scatter_gather(&shards, &[0.1], 10, Duration::from_millis(100)).await;

        assert_eq!(ids(&merged), vec!["a1"]);
        assert_eq!(broken.calls(), 1);
    }

    #[tokio::test]
    async fn test_no_shards() {
        let merged = scatter_gather(&[], &[0.1], 10, Duration::from_millis(100)).await;
        assert!(merged.is_empty());
    }

    #[tokio::test]
    async fn test_mock_respects_top_k() {
        let index = shard("a", &["a1", "a2", "a3"]);
        assert_eq!(index.search(&[0.0], 2).await.unwrap().len(), 2);
        assert_eq!(index.search(&[0.0], 0).await.unwrap().len(), 3);
    }

    #[test]
    fn test_shard_config_default_top_k() {
        let config: IndexShardConfig = serde_json::from_str(
            r#"{"name":"s0","endpoint":"http://faiss:8080/","index_name":"items"}"#,
        )
        .unwrap();
        assert_eq!(config.top_k, DEFAULT_TOP_K);
        assert_eq!(HttpVectorIndex::new(config).search_url(), "http://faiss:8080/search");
    }
}
