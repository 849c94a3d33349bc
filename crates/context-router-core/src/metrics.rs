//! Observability sink for counters and timings.
//!
//! The core only emits raw measurements through [`MetricsSink`]; formatting
//! and export belong to whoever consumes them. [`InMemoryMetrics`] keeps
//! simple aggregates that the app crate serves as JSON.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;

/// Metric names emitted by the core.
pub mod names {
    pub const CLASSIFIER_LATENCY: &str = "classifier.latency";
    pub const CLASSIFIER_HINT: &str = "classifier.outcome.hint";
    pub const CLASSIFIER_INFERRED: &str = "classifier.outcome.inferred";
    pub const CLASSIFIER_DEFAULT: &str = "classifier.outcome.default";
    pub const RETRIEVAL_LATENCY: &str = "retrieval.latency";
    pub const RETRIEVAL_MERGE_HIT_RATIO: &str = "retrieval.merge_hit_ratio";
    pub const RETRIEVAL_DEGRADED: &str = "retrieval.degraded";
    pub const RETRIEVAL_UNAVAILABLE: &str = "retrieval.unavailable";
    pub const RANKER_LATENCY: &str = "ranker.latency";
    pub const QUERY_LATENCY: &str = "query.latency";
    pub const FEEDBACK_RECORDED: &str = "feedback.recorded";
    pub const FEEDBACK_DROPPED: &str = "feedback.dropped";
    pub const FEEDBACK_PUBLISHED: &str = "feedback.published";
    pub const FEEDBACK_REJECTED: &str = "feedback.rejected";
}

pub trait MetricsSink: Send + Sync {
    /// Increment a counter.
    fn incr(&self, name: &'static str, value: u64);
    /// Record an elapsed duration.
    fn timing(&self, name: &'static str, elapsed: Duration);
    /// Record a unitless observation (ratios, sizes).
    fn observe(&self, name: &'static str, value: f64);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn incr(&self, _name: &'static str, _value: u64) {}
    fn timing(&self, _name: &'static str, _elapsed: Duration) {}
    fn observe(&self, _name: &'static str, _value: f64) {}
}

/// Count, sum, and max of a stream of values.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct Distribution {
    pub count: u64,
    pub sum: f64,
    pub max: f64,
}

impl Distribution {
    fn record(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        if value > self.max {
            self.max = value;
        }
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    /// Timings are recorded in microseconds.
    pub distributions: BTreeMap<String, Distribution>,
}

#[derive(Default)]
struct Registry {
    counters: BTreeMap<&'static str, u64>,
    distributions: BTreeMap<&'static str, Distribution>,
}

/// In-process aggregates, shared behind an `Arc`.
#[derive(Default)]
pub struct InMemoryMetrics {
    inner: Mutex<Registry>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> u64 {
        let reg = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        reg.counters.get(name).copied().unwrap_or(0)
    }

    pub fn distribution(&self, name: &str) -> Option<Distribution> {
        let reg = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        reg.distributions.get(name).cloned()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let reg = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        MetricsSnapshot {
            counters: reg
                .counters
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            distributions: reg
                .distributions
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }
}

impl MetricsSink for InMemoryMetrics {
    fn incr(&self, name: &'static str, value: u64) {
        let mut reg = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        *reg.counters.entry(name).or_insert(0) += value;
    }

    fn timing(&self, name: &'static str, elapsed: Duration) {
        self.observe(name, elapsed.as_secs_f64() * 1_000_000.0);
    }

    fn observe(&self, name: &'static str, value: f64) {
        if !value.is_finite() {
            return;
        }
        let mut reg = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        reg.distributions.entry(name).or_default().record(value);
    }
}
