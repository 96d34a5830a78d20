//! Fingerprint cache.
//!
//! Memoizes model answers by `(fingerprint, prompt version, namespace)`.
//! An in-memory LRU bounded by entry count sits in front of an optional
//! persistent [`CacheStore`]. Entries never expire by time. Storing a value
//! that differs from an existing entry for the same key is a hard
//! [`CacheError::Conflict`].

pub mod fs;
pub mod store;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::assessment::RiskVerdict;
use crate::domain::test_case::TestArtifact;
use crate::domain::unit::Fingerprint;

pub use fs::FsCacheStore;
pub use store::{CacheStore, CasOutcome, MemoryCacheStore};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("conflicting value already cached for {key}")]
    Conflict { key: String },

    #[error("cache store error: {0}")]
    Store(String),

    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache entry serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Which kind of answer an entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheNamespace {
    Risk,
    Test,
}

impl CacheNamespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheNamespace::Risk => "risk",
            CacheNamespace::Test => "test",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub fingerprint: Fingerprint,
    pub prompt_version: String,
    pub namespace: CacheNamespace,
}

impl CacheKey {
    pub fn risk(fingerprint: &Fingerprint, prompt_version: &str) -> Self {
        Self {
            fingerprint: fingerprint.clone(),
            prompt_version: prompt_version.to_string(),
            namespace: CacheNamespace::Risk,
        }
    }

    pub fn test(fingerprint: &Fingerprint, prompt_version: &str) -> Self {
        Self {
            fingerprint: fingerprint.clone(),
            prompt_version: prompt_version.to_string(),
            namespace: CacheNamespace::Test,
        }
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.namespace.as_str(),
            self.prompt_version,
            self.fingerprint.short()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CachedValue {
    Risk(RiskVerdict),
    Test(TestArtifact),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Inserted,
    /// An equal value was already cached; nothing changed.
    AlreadyPresent,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
    pub conflicts: u64,
    pub entries: usize,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    evictions: AtomicU64,
    conflicts: AtomicU64,
}

/// Entry-count bounded LRU. Recency is a monotonically increasing tick.
#[derive(Default)]
struct Lru {
    entries: HashMap<CacheKey, (CachedValue, u64)>,
    recency: BTreeMap<u64, CacheKey>,
    tick: u64,
}

impl Lru {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn get(&mut self, key: &CacheKey) -> Option<CachedValue> {
        let tick = self.next_tick();
        let (value, last) = self.entries.get_mut(key)?;
        self.recency.remove(last);
        *last = tick;
        self.recency.insert(tick, key.clone());
        Some(value.clone())
    }

    fn peek(&self, key: &CacheKey) -> Option<&CachedValue> {
        self.entries.get(key).map(|(value, _)| value)
    }

    /// Insert and evict down to `capacity`. Returns the number evicted.
    fn insert(&mut self, key: CacheKey, value: CachedValue, capacity: usize) -> u64 {
        let tick = self.next_tick();
        if let Some((_, old)) = self.entries.insert(key.clone(), (value, tick)) {
            self.recency.remove(&old);
        }
        self.recency.insert(tick, key);

        let mut evicted = 0;
        while self.entries.len() > capacity {
            let Some((_, oldest)) = self.recency.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
            evicted += 1;
        }
        evicted
    }
}

/// Memoizing cache shared by every run of one engine.
pub struct FingerprintCache {
    capacity: usize,
    lru: Mutex<Lru>,
    store: Option<Arc<dyn CacheStore>>,
    counters: Counters,
    flights: Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl FingerprintCache {
    /// Memory-only cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            lru: Mutex::new(Lru::default()),
            store: None,
            counters: Counters::default(),
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// Cache backed by a persistent store.
    pub fn with_store(capacity: usize, store: Arc<dyn CacheStore>) -> Self {
        Self {
            store: Some(store),
            ..Self::new(capacity)
        }
    }

    /// Serialize compute-then-store for one key.
    ///
    /// Callers that miss hold the returned guard while asking the model, so
    /// a concurrent caller for the same key waits and then hits the cache
    /// instead of issuing a second request.
    pub async fn single_flight(&self, key: &CacheKey) -> SingleFlight<'_> {
        let lock = {
            let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
            flights.entry(key.clone()).or_default().clone()
        };
        let guard = lock.clone().lock_owned().await;
        SingleFlight {
            cache: self,
            key: key.clone(),
            lock,
            guard: Some(guard),
        }
    }

    fn lru(&self) -> std::sync::MutexGuard<'_, Lru> {
        self.lru.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remember(&self, key: CacheKey, value: CachedValue) {
        let evicted = self.lru().insert(key, value, self.capacity);
        if evicted > 0 {
            self.counters.evictions.fetch_add(evicted, Ordering::Relaxed);
        }
    }

    pub async fn lookup(&self, key: &CacheKey) -> Result<Option<CachedValue>> {
        if let Some(value) = self.lru().get(key) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(value));
        }

        if let Some(store) = &self.store {
            if let Some(value) = store.get(key).await? {
                debug!(key = %key, "cache hit from persistent store");
                self.remember(key.clone(), value.clone());
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(value));
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    /// Store `value` under `key`.
    ///
    /// Idempotent for equal values; a different value for an existing key
    /// is a [`CacheError::Conflict`].
    pub async fn store(&self, key: &CacheKey, value: CachedValue) -> Result<StoreOutcome> {
        let Some(store) = &self.store else {
            let mut lru = self.lru();
            if let Some(existing) = lru.peek(key) {
                return self.settle_existing(key, existing == &value);
            }
            let evicted = lru.insert(key.clone(), value, self.capacity);
            drop(lru);
            self.counters.evictions.fetch_add(evicted, Ordering::Relaxed);
            self.counters.inserts.fetch_add(1, Ordering::Relaxed);
            return Ok(StoreOutcome::Inserted);
        };

        let cached_equal = self.lru().peek(key).map(|existing| existing == &value);
        if let Some(equal) = cached_equal {
            return self.settle_existing(key, equal);
        }

        match store.compare_and_set(key, None, &value).await? {
            CasOutcome::Swapped => {
                self.remember(key.clone(), value);
                self.counters.inserts.fetch_add(1, Ordering::Relaxed);
                Ok(StoreOutcome::Inserted)
            }
            CasOutcome::Mismatch(Some(existing)) => {
                let equal = existing == value;
                if equal {
                    self.remember(key.clone(), existing);
                }
                self.settle_existing(key, equal)
            }
            CasOutcome::Mismatch(None) => Err(CacheError::Store(format!(
                "compare-and-set on {key} reported a mismatch without a current value"
            ))),
        }
    }

    fn settle_existing(&self, key: &CacheKey, equal: bool) -> Result<StoreOutcome> {
        if equal {
            return Ok(StoreOutcome::AlreadyPresent);
        }
        self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
        warn!(key = %key, "cache conflict: different value already stored");
        Err(CacheError::Conflict {
            key: key.to_string(),
        })
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            inserts: self.counters.inserts.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            conflicts: self.counters.conflicts.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    /// Entries currently held in memory.
    pub fn len(&self) -> usize {
        self.lru().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Guard returned by [`FingerprintCache::single_flight`].
pub struct SingleFlight<'a> {
    cache: &'a FingerprintCache,
    key: CacheKey,
    lock: Arc<tokio::sync::Mutex<()>>,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for SingleFlight<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut flights = self
            .cache
            .flights
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Only the map and this guard hold the lock: nobody is waiting.
        if Arc::strong_count(&self.lock) == 2 {
            flights.remove(&self.key);
        }
    }
}
