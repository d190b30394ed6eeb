//! Byte-oriented TTL cache.
//!
//! Entries live for a fixed life window from the moment they are written;
//! reads after expiry behave as a miss. There is no per-call expiration and no
//! explicit invalidation: expired entries are dropped lazily on access and by
//! a periodic sweep (see [`TtlCache::spawn_sweeper`]).
//!
//! A zero life window disables the cache: every read misses and every write
//! is ignored.
//!
//! # Limits
//!
//! - Entries larger than `max_entry_size` are rejected.
//! - When `hard_max_cache_size_mb` would be exceeded, the oldest entries are
//!   evicted first.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use infer_core::CacheSettings;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Cache key of a formatted response.
///
/// Rank requests pass their candidate items, whose digest is appended so
/// that a different item list never hits another list's entry.
pub fn response_key(
    user_id: &str,
    tenant_id: &str,
    model_name: &str,
    items: Option<&[String]>,
) -> String {
    match items {
        Some(items) => format!("{user_id}:{tenant_id}:{model_name}:{}", item_digest(items)),
        None => format!("{user_id}:{tenant_id}:{model_name}"),
    }
}

/// Cache key of an assembled feature bundle.
pub fn features_key(
    user_id: &str,
    tenant_id: &str,
    model_name: &str,
    items: Option<&[String]>,
) -> String {
    format!("{}_samples", response_key(user_id, tenant_id, model_name, items))
}

/// Order-sensitive digest of an item list, 16 hex chars.
fn item_digest(items: &[String]) -> String {
    let mut hasher = blake3::Hasher::new();
    for item in items {
        hasher.update(item.as_bytes());
        hasher.update(&[0]);
    }
    let hex = hasher.finalize().to_hex();
    hex.as_str()[..16].to_string()
}

struct CacheEntry {
    value: Arc<[u8]>,
    created_at: Instant,
    seq: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// Insertion order; stale pairs are skipped by sequence number.
    order: VecDeque<(u64, String)>,
    total_bytes: usize,
    next_seq: u64,
}

impl CacheState {
    fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.total_bytes -= entry.value.len();
                true
            }
            None => false,
        }
    }

    fn evict_oldest(&mut self) -> bool {
        while let Some((seq, key)) = self.order.pop_front() {
            let current = self.entries.get(&key).map(|e| e.seq);
            if current == Some(seq) {
                return self.remove(&key);
            }
        }
        false
    }
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads that returned a value.
    pub hits: u64,
    /// Reads that found nothing or an expired entry.
    pub misses: u64,
    /// Live entries (including not-yet-swept expired ones).
    pub entries: usize,
    /// Bytes held by live entries.
    pub bytes: usize,
}

/// TTL cache shared by every request.
pub struct TtlCache {
    settings: CacheSettings,
    state: RwLock<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TtlCache {
    /// Create a cache.
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            settings,
            state: RwLock::new(CacheState::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// A cache that never stores anything.
    pub fn disabled() -> Self {
        Self::new(CacheSettings {
            life_window_secs: 0,
            ..CacheSettings::default()
        })
    }

    /// Whether the life window is positive.
    pub fn is_enabled(&self) -> bool {
        self.settings.is_enabled()
    }

    /// Read a live entry.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        if !self.is_enabled() {
            return None;
        }

        let ttl = self.settings.life_window();
        {
            let state = self.read();
            match state.entries.get(key) {
                Some(entry) if entry.created_at.elapsed() < ttl => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.to_vec());
                }
                Some(_) => {}
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        }

        // expired: drop it, unless a writer refreshed it in between
        let mut state = self.write();
        let still_expired = state
            .entries
            .get(key)
            .is_some_and(|e| e.created_at.elapsed() >= ttl);
        if still_expired {
            state.remove(key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store an entry; it expires one life window from now.
    ///
    /// Returns `false` when the cache is disabled or the entry is too large.
    pub fn set(&self, key: &str, value: &[u8]) -> bool {
        if !self.is_enabled() {
            return false;
        }
        if value.len() > self.settings.max_entry_size {
            tracing::warn!(
                key,
                size = value.len(),
                max = self.settings.max_entry_size,
                "cache entry too large, not stored"
            );
            return false;
        }

        let mut state = self.write();
        state.remove(key);

        if let Some(limit) = self.settings.hard_max_bytes() {
            while state.total_bytes + value.len() > limit {
                if !state.evict_oldest() {
                    break;
                }
            }
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.total_bytes += value.len();
        state.order.push_back((seq, key.to_string()));
        state.entries.insert(
            key.to_string(),
            CacheEntry {
                value: Arc::from(value),
                created_at: Instant::now(),
                seq,
            },
        );
        true
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let ttl = self.settings.life_window();
        let mut state = self.write();
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| e.created_at.elapsed() >= ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            state.remove(key);
        }
        let live: std::collections::HashSet<u64> = state.entries.values().map(|e| e.seq).collect();
        state.order.retain(|(seq, _)| live.contains(seq));
        expired.len()
    }

    /// Run [`sweep`](Self::sweep) every clean window until the cache is dropped.
    ///
    /// Returns `None` when the cache is disabled or the clean window is zero.
    pub fn spawn_sweeper(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let period = self.settings.clean_window();
        if !self.is_enabled() || period.is_zero() {
            return None;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                let removed = cache.sweep();
                if removed > 0 {
                    tracing::debug!(removed, "swept expired cache entries");
                }
            }
        }))
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        let state = self.read();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: state.entries.len(),
            bytes: state.total_bytes,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for TtlCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache")
            .field("settings", &self.settings)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn enabled(life_secs: u64) -> CacheSettings {
        CacheSettings {
            life_window_secs: life_secs,
            clean_window_secs: 1,
            max_entry_size: 64,
            hard_max_cache_size_mb: 0,
        }
    }

    #[test]
    fn test_keys() {
        assert_eq!(response_key("u1", "t1", "dssm", None), "u1:t1:dssm");
        assert_eq!(features_key("u1", "t1", "dssm", None), "u1:t1:dssm_samples");
    }

    #[test]
    fn test_item_list_changes_key() {
        let four: Vec<String> = ["i1", "i2", "i3", "i4"].iter().map(|s| s.to_string()).collect();
        let two = &four[..2];

        let full = features_key("u1", "t1", "deepfm", Some(&four));
        let trimmed = features_key("u1", "t1", "deepfm", Some(two));
        assert_ne!(full, trimmed);
        assert_eq!(full, features_key("u1", "t1", "deepfm", Some(&four)));
        assert!(full.starts_with("u1:t1:deepfm:"));
        assert!(full.ends_with("_samples"));

        // separators keep ["ab"] and ["a", "b"] apart
        let joined = vec!["ab".to_string()];
        let split = vec!["a".to_string(), "b".to_string()];
        assert_ne!(
            response_key("u1", "t1", "deepfm", Some(&joined)),
            response_key("u1", "t1", "deepfm", Some(&split))
        );
    }

    #[tokio::test]
    async fn test_disabled_cache_ignores_everything() {
        let cache = TtlCache::disabled();
        assert!(!cache.is_enabled());
        assert!(!cache.set("k", b"v"));
        assert_eq!(cache.get("k"), None);
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let cache = TtlCache::new(enabled(60));
        assert!(cache.set("k", b"value"));
        assert_eq!(cache.get("k").as_deref(), Some(&b"value"[..]));
        assert_eq!(cache.get("missing"), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.bytes, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_life_window() {
        let cache = TtlCache::new(enabled(10));
        cache.set("k", b"v");

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(cache.get("k").is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("k").is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_restarts_life_window() {
        let cache = TtlCache::new(enabled(10));
        cache.set("k", b"old");
        tokio::time::advance(Duration::from_secs(8)).await;
        cache.set("k", b"new");
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(cache.get("k").as_deref(), Some(&b"new"[..]));
        assert_eq!(cache.stats().bytes, 3);
    }

    #[tokio::test]
    async fn test_oversized_entry_rejected() {
        let cache = TtlCache::new(enabled(60));
        assert!(!cache.set("big", &[0u8; 65]));
        assert!(cache.get("big").is_none());
    }

    #[tokio::test]
    async fn test_hard_limit_evicts_oldest() {
        let settings = CacheSettings {
            life_window_secs: 60,
            clean_window_secs: 0,
            max_entry_size: 1024 * 1024,
            hard_max_cache_size_mb: 1,
        };
        let cache = TtlCache::new(settings);
        let half = vec![7u8; 600 * 1024];

        cache.set("first", &half);
        cache.set("second", &half);

        assert!(cache.get("first").is_none());
        assert!(cache.get("second").is_some());
        assert_eq!(cache.stats().entries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_expired() {
        let cache = TtlCache::new(enabled(5));
        cache.set("a", b"1");
        cache.set("b", b"2");
        tokio::time::advance(Duration::from_secs(6)).await;
        cache.set("c", b"3");

        assert_eq!(cache.sweep(), 2);
        assert_eq!(cache.stats().entries, 1);
        assert!(cache.get("c").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_periodically() {
        let cache = Arc::new(TtlCache::new(enabled(1)));
        let handle = cache.spawn_sweeper().unwrap();
        cache.set("a", b"1");

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(cache.stats().entries, 0);

        drop(cache);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(handle.is_finished());
    }
}
