//! Persistent cache store seam.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use super::{CacheKey, CachedValue, Result};

/// Result of a compare-and-set.
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    Swapped,
    /// The current value did not match `expected`; carries the current value.
    Mismatch(Option<CachedValue>),
}

/// Durable key-value store behind the in-memory LRU.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<CachedValue>>;

    /// Unconditional write.
    async fn put(&self, key: &CacheKey, value: &CachedValue) -> Result<()>;

    /// Write `value` only if the current entry equals `expected`
    /// (`None` = the key must be absent).
    async fn compare_and_set(
        &self,
        key: &CacheKey,
        expected: Option<&CachedValue>,
        value: &CachedValue,
    ) -> Result<CasOutcome>;
}

/// In-process store, mainly for tests and single-run engines.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<CacheKey, CachedValue>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<CachedValue>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    async fn put(&self, key: &CacheKey, value: &CachedValue) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.clone(), value.clone());
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &CacheKey,
        expected: Option<&CachedValue>,
        value: &CachedValue,
    ) -> Result<CasOutcome> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let current = entries.get(key);
        if current != expected {
            return Ok(CasOutcome::Mismatch(current.cloned()));
        }
        entries.insert(key.clone(), value.clone());
        Ok(CasOutcome::Swapped)
    }
}
