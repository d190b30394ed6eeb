//! Feature store clients.
//!
//! [`RedisFeatureStore`] reads blobs from Redis through a reconnecting,
//! multiplexed [`ConnectionManager`]. [`MockFeatureStore`] keeps blobs in
//! memory and records every read, so tests can assert exactly which keys the
//! aggregator touched.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use infer_core::{Error, FeatureSettings, FeatureStore, Result};
use redis::aio::ConnectionManager;

// ============================================================================
// Redis
// ============================================================================

/// Connection attempts made by [`RedisFeatureStore::from_settings`].
pub const DEFAULT_CONNECT_ATTEMPTS: usize = 3;

/// Redis-backed feature store.
#[derive(Clone)]
pub struct RedisFeatureStore {
    name: String,
    conn: ConnectionManager,
    read_timeout: Duration,
}

impl RedisFeatureStore {
    /// Connect to `url`, retrying the initial connection with backoff.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] if the URL is invalid or every connection
    /// attempt fails.
    pub async fn connect(
        name: impl Into<String>,
        url: &str,
        read_timeout: Duration,
        max_attempts: usize,
    ) -> Result<Self> {
        let name = name.into();
        let client = redis::Client::open(url)
            .map_err(|e| Error::store_with_source(format!("{name}: invalid redis url"), e))?;

        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(2))
            .with_max_times(max_attempts);

        let conn = (|| {
            let client = client.clone();
            async move { ConnectionManager::new(client).await }
        })
        .retry(backoff)
        .notify(|err, delay| {
            tracing::warn!(store = %name, error = %err, ?delay, "redis connect failed, retrying");
        })
        .await
        .map_err(|e| Error::store_with_source(format!("{name}: cannot connect"), e))?;

        tracing::info!(store = %name, "connected to redis feature store");
        Ok(Self {
            name,
            conn,
            read_timeout,
        })
    }

    /// Connect with the read timeout from `settings`.
    ///
    /// # Errors
    ///
    /// Same as [`RedisFeatureStore::connect`].
    pub async fn from_settings(
        name: impl Into<String>,
        url: &str,
        settings: &FeatureSettings,
    ) -> Result<Self> {
        Self::connect(name, url, settings.store_read_timeout(), DEFAULT_CONNECT_ATTEMPTS).await
    }

    /// Read timeout applied to each lookup.
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }
}

#[async_trait]
impl FeatureStore for RedisFeatureStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        let read = cmd.query_async::<Option<Vec<u8>>>(&mut conn);

        match tokio::time::timeout(self.read_timeout, read).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Error::store_with_source(
                format!("{}: GET {key} failed", self.name),
                e,
            )),
            Err(_) => Err(Error::Timeout(self.read_timeout)),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for RedisFeatureStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisFeatureStore")
            .field("name", &self.name)
            .field("read_timeout", &self.read_timeout)
            .finish()
    }
}

// ============================================================================
// Mock
// ============================================================================

#[derive(Debug, Default)]
struct MockState {
    values: HashMap<String, Vec<u8>>,
    delays: HashMap<String, Duration>,
    failing: HashSet<String>,
    reads: Vec<String>,
}

/// In-memory feature store for tests.
///
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockFeatureStore {
    state: Arc<Mutex<MockState>>,
    read_count: Arc<AtomicUsize>,
}

impl MockFeatureStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a blob.
    pub fn with_value(self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.insert(key, value);
        self
    }

    /// Delay reads of one key.
    pub fn with_delay(self, key: impl Into<String>, delay: Duration) -> Self {
        self.lock().delays.insert(key.into(), delay);
        self
    }

    /// Make reads of one key fail.
    pub fn with_failure(self, key: impl Into<String>) -> Self {
        self.lock().failing.insert(key.into());
        self
    }

    /// Store a blob.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.lock().values.insert(key.into(), value.into());
    }

    /// Total reads performed.
    pub fn read_count(&self) -> usize {
        self.read_count.load(Ordering::SeqCst)
    }

    /// Keys read, in the order the reads started.
    pub fn reads(&self) -> Vec<String> {
        self.lock().reads.clone()
    }

    /// How many times one key was read.
    pub fn reads_of(&self, key: &str) -> usize {
        self.lock().reads.iter().filter(|k| *k == key).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl FeatureStore for MockFeatureStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.read_count.fetch_add(1, Ordering::SeqCst);
        let (delay, failing, value) = {
            let mut state = self.lock();
            state.reads.push(key.to_string());
            (
                state.delays.get(key).copied(),
                state.failing.contains(key),
                state.values.get(key).cloned(),
            )
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if failing {
            return Err(Error::store(format!("mock read of {key} failed")));
        }
        Ok(value)
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_returns_values() {
        let store = MockFeatureStore::new().with_value("uo:u1", b"blob".to_vec());
        assert_eq!(store.get("uo:u1").await.unwrap(), Some(b"blob".to_vec()));
        assert_eq!(store.get("uo:u2").await.unwrap(), None);
        assert_eq!(store.read_count(), 2);
        assert_eq!(store.reads(), vec!["uo:u1", "uo:u2"]);
    }

    #[tokio::test]
    async fn test_mock_failure() {
        let store = MockFeatureStore::new().with_failure("bad");
        let err = store.get("bad").await.unwrap_err();
        assert!(matches!(err, Error::Store { .. }));
        assert_eq!(store.reads_of("bad"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_delay() {
        let store = MockFeatureStore::new()
            .with_value("slow", b"x".to_vec())
            .with_delay("slow", Duration::from_millis(200));

        let started = tokio::time::Instant::now();
        store.get("slow").await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let store = MockFeatureStore::new();
        let other = store.clone();
        other.insert("k", b"v".to_vec());
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(other.read_count(), 1);
    }

    #[tokio::test]
    async fn test_redis_rejects_bad_url() {
        let err = RedisFeatureStore::connect("bad", "not-a-url", Duration::from_millis(10), 1)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid redis url"));
    }

    #[tokio::test]
    async fn test_redis_from_settings_rejects_bad_url() {
        let settings = FeatureSettings {
            store_read_timeout_ms: 25,
            ..FeatureSettings::default()
        };
        let err = RedisFeatureStore::from_settings("bad", "not-a-url", &settings)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Store { .. }));
        assert!(err.to_string().contains("bad: invalid redis url"));
    }
}
