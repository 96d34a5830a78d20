//! Process-wide counters for commitprobe.
//!
//! Counters are bumped silently where the work happens. [`Metrics::flush`]
//! emits every value as one `tracing::info!` event, which the orchestrator
//! does once per run while reporting.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    model_calls: AtomicU64,
    cache_hits: AtomicU64,
    tests_executed: AtomicU64,
    units_degraded: AtomicU64,
}

/// Copy of all counters at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub model_calls: u64,
    pub cache_hits: u64,
    pub tests_executed: u64,
    pub units_degraded: u64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            model_calls: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            tests_executed: AtomicU64::new(0),
            units_degraded: AtomicU64::new(0),
        }
    }

    /// One backend request issued (every attempt counts).
    pub fn inc_model_calls(&self) {
        self.model_calls.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "model_calls", "counter incremented");
    }

    pub fn inc_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "cache_hits", "counter incremented");
    }

    /// One sandbox execution (retries count separately).
    pub fn inc_tests_executed(&self) {
        self.tests_executed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "tests_executed", "counter incremented");
    }

    pub fn inc_units_degraded(&self) {
        self.units_degraded.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "units_degraded", "counter incremented");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            model_calls: self.model_calls.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            tests_executed: self.tests_executed.load(Ordering::Relaxed),
            units_degraded: self.units_degraded.load(Ordering::Relaxed),
        }
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        let s = self.snapshot();
        tracing::info!(
            metric = "flush",
            model_calls = s.model_calls,
            cache_hits = s.cache_hits,
            tests_executed = s.tests_executed,
            units_degraded = s.units_degraded,
        );
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.model_calls.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.tests_executed.store(0, Ordering::Relaxed);
        self.units_degraded.store(0, Ordering::Relaxed);
    }
}
