//! Probabilistic existence filters.
//!
//! A [`BloomFilter`] answers "may this key exist?" with no false negatives:
//! every inserted key always tests positive. A negative answer lets the
//! feature aggregator skip a store read; a positive answer costs one read
//! even when the key turns out to be absent.
//!
//! # Hashing
//!
//! Each key is hashed once with `blake3`. The first two 64-bit words of the
//! digest seed Kirsch–Mitzenmacher double hashing:
//! `index_i = (h1 + i * h2) mod m` for `i in 0..k`.
//!
//! # Sizing
//!
//! For `n` expected keys and a target false-positive rate `p`:
//! `m = ceil(-n ln p / (ln 2)^2)` bits and `k = round(m / n * ln 2)` hashes.

use std::fmt;
use std::sync::{Arc, RwLock};

use infer_core::FeatureSettings;

/// A fixed-size Bloom filter.
#[derive(Clone, PartialEq, Eq)]
pub struct BloomFilter {
    words: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
    inserted: usize,
}

impl BloomFilter {
    /// Size a filter for `expected_items` keys at `false_positive_rate`.
    ///
    /// The rate is clamped into `(0, 1)`; `expected_items` of zero is treated
    /// as one.
    pub fn with_rate(expected_items: usize, false_positive_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let p = false_positive_rate.clamp(f64::MIN_POSITIVE, 0.999_999);
        let ln2 = std::f64::consts::LN_2;

        let num_bits = (-(n * p.ln()) / (ln2 * ln2)).ceil().max(64.0) as u64;
        let num_hashes = ((num_bits as f64 / n) * ln2).round().clamp(1.0, 32.0) as u32;

        Self::with_params(num_bits, num_hashes)
    }

    /// Create a filter with an explicit bit count and hash count.
    pub fn with_params(num_bits: u64, num_hashes: u32) -> Self {
        let num_bits = num_bits.max(1);
        let words = vec![0u64; num_bits.div_ceil(64) as usize];
        Self {
            words,
            num_bits,
            num_hashes: num_hashes.max(1),
            inserted: 0,
        }
    }

    /// A filter that reports every key as possibly present.
    ///
    /// Used until the first real filter is built: it never lets a lookup be
    /// skipped, so it can never cause a false negative.
    pub fn allow_all() -> Self {
        Self {
            words: Vec::new(),
            num_bits: 0,
            num_hashes: 0,
            inserted: 0,
        }
    }

    /// Build a filter from a key set.
    pub fn from_keys<I, K>(keys: I, false_positive_rate: f64) -> Self
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
    {
        let keys: Vec<K> = keys.into_iter().collect();
        let mut filter = Self::with_rate(keys.len(), false_positive_rate);
        for key in &keys {
            filter.insert(key.as_ref());
        }
        filter
    }

    /// Insert a key.
    pub fn insert(&mut self, key: &[u8]) {
        if self.is_allow_all() {
            return;
        }
        let (h1, h2) = Self::hash_pair(key);
        for i in 0..u64::from(self.num_hashes) {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits;
            self.words[(bit / 64) as usize] |= 1u64 << (bit % 64);
        }
        self.inserted += 1;
    }

    /// Test whether a key may be present.
    pub fn contains(&self, key: &[u8]) -> bool {
        if self.is_allow_all() {
            return true;
        }
        let (h1, h2) = Self::hash_pair(key);
        (0..u64::from(self.num_hashes)).all(|i| {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits;
            self.words[(bit / 64) as usize] & (1u64 << (bit % 64)) != 0
        })
    }

    /// Whether this is the admit-everything filter.
    pub fn is_allow_all(&self) -> bool {
        self.num_bits == 0
    }

    /// Number of bits in the filter.
    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    /// Number of hash functions.
    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Number of keys inserted.
    pub fn len(&self) -> usize {
        self.inserted
    }

    /// Whether no key was inserted.
    pub fn is_empty(&self) -> bool {
        self.inserted == 0
    }

    /// Estimated false-positive rate at the current fill.
    pub fn estimated_false_positive_rate(&self) -> f64 {
        if self.is_allow_all() {
            return 1.0;
        }
        let k = f64::from(self.num_hashes);
        let n = self.inserted as f64;
        let m = self.num_bits as f64;
        (1.0 - (-k * n / m).exp()).powf(k)
    }

    fn hash_pair(key: &[u8]) -> (u64, u64) {
        let digest = blake3::hash(key);
        let bytes = digest.as_bytes();
        let mut lo = [0u8; 8];
        let mut hi = [0u8; 8];
        lo.copy_from_slice(&bytes[..8]);
        hi.copy_from_slice(&bytes[8..16]);
        // odd step so the probe sequence never collapses onto one bit
        (u64::from_le_bytes(lo), u64::from_le_bytes(hi) | 1)
    }
}

impl fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BloomFilter")
            .field("num_bits", &self.num_bits)
            .field("num_hashes", &self.num_hashes)
            .field("inserted", &self.inserted)
            .finish()
    }
}

/// The process-wide user and item filters.
///
/// Readers take a cheap `Arc` snapshot; the refresh side swaps in a freshly
/// built filter. A filter is never mutated once published.
#[derive(Debug)]
pub struct ExistenceFilters {
    users: RwLock<Arc<BloomFilter>>,
    items: RwLock<Arc<BloomFilter>>,
    false_positive_rate: f64,
}

impl ExistenceFilters {
    /// Create from built filters.
    pub fn new(users: BloomFilter, items: BloomFilter) -> Self {
        Self {
            users: RwLock::new(Arc::new(users)),
            items: RwLock::new(Arc::new(items)),
            false_positive_rate: FeatureSettings::default().filter_false_positive_rate,
        }
    }

    /// Filters that skip nothing.
    pub fn allow_all() -> Self {
        Self::new(BloomFilter::allow_all(), BloomFilter::allow_all())
    }

    /// Admit-everything filters that rebuild at the configured rate.
    pub fn from_settings(settings: &FeatureSettings) -> Self {
        Self {
            false_positive_rate: settings.filter_false_positive_rate,
            ..Self::allow_all()
        }
    }

    /// Target false-positive rate used by the `rebuild_*` methods.
    pub fn false_positive_rate(&self) -> f64 {
        self.false_positive_rate
    }

    /// Build a user filter from `keys` at the configured rate and publish it.
    pub fn rebuild_users<I, K>(&self, keys: I)
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
    {
        self.replace_users(BloomFilter::from_keys(keys, self.false_positive_rate));
    }

    /// Build an item filter from `keys` at the configured rate and publish it.
    pub fn rebuild_items<I, K>(&self, keys: I)
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
    {
        self.replace_items(BloomFilter::from_keys(keys, self.false_positive_rate));
    }

    /// Current user filter snapshot.
    pub fn users(&self) -> Arc<BloomFilter> {
        Self::snapshot(&self.users)
    }

    /// Current item filter snapshot.
    pub fn items(&self) -> Arc<BloomFilter> {
        Self::snapshot(&self.items)
    }

    /// Publish a new user filter.
    pub fn replace_users(&self, filter: BloomFilter) {
        tracing::info!(keys = filter.len(), "replacing user existence filter");
        Self::swap(&self.users, filter);
    }

    /// Publish a new item filter.
    pub fn replace_items(&self, filter: BloomFilter) {
        tracing::info!(keys = filter.len(), "replacing item existence filter");
        Self::swap(&self.items, filter);
    }

    /// Whether a user may have stored features.
    pub fn user_may_exist(&self, user_id: &str) -> bool {
        self.users().contains(user_id.as_bytes())
    }

    /// Whether an item may have stored features.
    pub fn item_may_exist(&self, item_id: &str) -> bool {
        self.items().contains(item_id.as_bytes())
    }

    fn snapshot(slot: &RwLock<Arc<BloomFilter>>) -> Arc<BloomFilter> {
        match slot.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn swap(slot: &RwLock<Arc<BloomFilter>>, filter: BloomFilter) {
        let fresh = Arc::new(filter);
        match slot.write() {
            Ok(mut guard) => *guard = fresh,
            Err(poisoned) => *poisoned.into_inner() = fresh,
        }
    }
}

impl Default for ExistenceFilters {
    fn default() -> Self {
        Self::allow_all()
    }
}
