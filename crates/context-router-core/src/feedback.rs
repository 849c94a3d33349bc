//! Feedback recording and offline adaptation of the ranking model.
//!
//! The hot path only enqueues: [`FeedbackRecorder::record`] never awaits
//! and never blocks. A background [`AdaptationWorker`] drains the queue,
//! joins each event to the [`Impression`] recorded when its query was
//! answered, and publishes a new [`RankingModelState`] through
//! [`ModelHandle::publish`].
//!
//! ```text
//! record() ──try_send──▶ mpsc ──▶ AdaptationWorker ──▶ UpdateRule ──▶ ModelHandle::publish
//!                                        ▲                                   │
//!                                  ImpressionLog                     ModelPersistence
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::metrics::{names, MetricsSink};
use crate::models::FeedbackEvent;
use crate::ranker::{FeatureActivation, ModelHandle, RankingModelState, FEATURE_BOOST_SCALE};

/// Non-blocking sink for feedback events.
pub trait FeedbackRecorder: Send + Sync {
    /// Enqueue `event`. Returns `false` when the event was dropped.
    fn record(&self, event: FeedbackEvent) -> bool;
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecorder;

impl FeedbackRecorder for NoopRecorder {
    fn record(&self, _event: FeedbackEvent) -> bool {
        false
    }
}

/// Bounded channel recorder. A full or closed channel drops the event.
#[derive(Clone)]
pub struct ChannelRecorder {
    tx: mpsc::Sender<FeedbackEvent>,
    metrics: Arc<dyn MetricsSink>,
}

impl FeedbackRecorder for ChannelRecorder {
    fn record(&self, event: FeedbackEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.metrics.incr(names::FEEDBACK_RECORDED, 1);
                true
            }
            Err(TrySendError::Full(ev)) => {
                self.metrics.incr(names::FEEDBACK_DROPPED, 1);
                debug!(query_id = %ev.query_id, "feedback queue full; event dropped");
                false
            }
            Err(TrySendError::Closed(ev)) => {
                self.metrics.incr(names::FEEDBACK_DROPPED, 1);
                debug!(query_id = %ev.query_id, "feedback queue closed; event dropped");
                false
            }
        }
    }
}

/// A recorder and the receiving end for an [`AdaptationWorker`].
pub fn feedback_channel(
    capacity: usize,
    metrics: Arc<dyn MetricsSink>,
) -> (ChannelRecorder, mpsc::Receiver<FeedbackEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ChannelRecorder { tx, metrics }, rx)
}

// ============ Impressions ============

/// One returned chunk as the ranker saw it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImpressionEntry {
    pub chunk_id: String,
    pub merged_score: f64,
    pub activations: Vec<FeatureActivation>,
}

/// What a sampled query returned, kept for feedback attribution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Impression {
    pub query_id: Uuid,
    pub profile_id: String,
    pub model_version: u64,
    pub entries: Vec<ImpressionEntry>,
}

impl Impression {
    fn entry(&self, chunk_id: &str) -> Option<&ImpressionEntry> {
        self.entries.iter().find(|e| e.chunk_id == chunk_id)
    }
}

#[derive(Debug, Clone)]
pub struct ImpressionSettings {
    pub capacity: u64,
    pub ttl: Duration,
    /// Fraction of queries recorded, in `[0, 1]`.
    pub sample_rate: f64,
}

impl Default for ImpressionSettings {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            ttl: Duration::from_secs(3600),
            sample_rate: 1.0,
        }
    }
}

/// Bounded, expiring map from query id to [`Impression`].
pub struct ImpressionLog {
    cache: Cache<Uuid, Arc<Impression>>,
    sample_rate: f64,
}

impl ImpressionLog {
    pub fn new(settings: &ImpressionSettings) -> Self {
        let cache = Cache::builder()
            .max_capacity(settings.capacity)
            .time_to_live(settings.ttl)
            .build();
        Self {
            cache,
            sample_rate: settings.sample_rate.clamp(0.0, 1.0),
        }
    }

    /// Deterministic per-query sampling decision.
    pub fn should_sample(&self, query_id: &Uuid) -> bool {
        let bucket = (query_id.as_u128() % 10_000) as f64;
        bucket < self.sample_rate * 10_000.0
    }

    /// Store `impression` if its query is sampled.
    pub fn record(&self, impression: Impression) -> bool {
        if !self.should_sample(&impression.query_id) {
            return false;
        }
        self.cache.insert(impression.query_id, Arc::new(impression));
        true
    }

    pub fn get(&self, query_id: &Uuid) -> Option<Arc<Impression>> {
        self.cache.get(query_id)
    }
}

// ============ Update rules ============

/// How a batch of joined feedback moves the feature weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum UpdateRule {
    /// `w_f += lr * mean(strength * (Σ selected act_f - Σ rejected act_f))`.
    Frequency { learning_rate: f64 },
    /// Logistic loss over (selected, rejected) pairs, with L2 shrinkage of
    /// each weight toward the neutral 1.0.
    Pairwise { learning_rate: f64, l2: f64 },
}

impl Default for UpdateRule {
    fn default() -> Self {
        UpdateRule::Frequency {
            learning_rate: 0.05,
        }
    }
}

/// An impression joined to the feedback that referenced it.
struct Joined<'a> {
    strength: f64,
    selected: Vec<&'a ImpressionEntry>,
    rejected: Vec<&'a ImpressionEntry>,
}

fn contributions(entry: &ImpressionEntry) -> impl Iterator<Item = (&str, f64)> {
    entry
        .activations
        .iter()
        .map(|a| (a.key.as_str(), a.value * a.decay))
}

fn entry_score(entry: &ImpressionEntry, model: &RankingModelState) -> f64 {
    crate::ranker::score(entry.merged_score, &entry.activations, model)
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

impl UpdateRule {
    fn gradient(&self, joined: &[Joined<'_>], model: &RankingModelState) -> BTreeMap<String, f64> {
        let mut grad: BTreeMap<String, f64> = BTreeMap::new();
        match self {
            UpdateRule::Frequency { learning_rate } => {
                let n = joined.len().max(1) as f64;
                for j in joined {
                    for e in &j.selected {
                        for (key, c) in contributions(e) {
                            *grad.entry(key.to_string()).or_insert(0.0) += j.strength * c;
                        }
                    }
                    for e in &j.rejected {
                        for (key, c) in contributions(e) {
                            *grad.entry(key.to_string()).or_insert(0.0) -= j.strength * c;
                        }
                    }
                }
                for g in grad.values_mut() {
                    *g = learning_rate * *g / n;
                }
            }
            UpdateRule::Pairwise { learning_rate, l2 } => {
                let mut pairs = 0usize;
                for j in joined {
                    for s in &j.selected {
                        for r in &j.rejected {
                            pairs += 1;
                            let margin = entry_score(s, model) - entry_score(r, model);
                            let push = j.strength * sigmoid(-margin) * FEATURE_BOOST_SCALE;
                            for (key, c) in contributions(s) {
                                *grad.entry(key.to_string()).or_insert(0.0) += push * c;
                            }
                            for (key, c) in contributions(r) {
                                *grad.entry(key.to_string()).or_insert(0.0) -= push * c;
                            }
                        }
                    }
                }
                let n = pairs.max(1) as f64;
                for (key, g) in grad.iter_mut() {
                    let shrink = l2 * (model.weight(key) - 1.0);
                    *g = learning_rate * (*g / n - shrink);
                }
            }
        }
        grad
    }

    /// The successor of `model` after applying `joined` feedback. Weights
    /// are clamped to `[0, max_weight]`.
    fn apply(&self, joined: &[Joined<'_>], model: &RankingModelState, max_weight: f64) -> RankingModelState {
        let mut next = model.successor();
        for (key, delta) in self.gradient(joined, model) {
            let w = (model.weight(&key) + delta).clamp(0.0, max_weight);
            next.feature_weights.insert(key, w);
        }
        next
    }
}

// ============ Worker ============

/// Called after each successful publish.
#[async_trait]
pub trait ModelPersistence: Send + Sync {
    async fn save_model(&self, model: &RankingModelState) -> anyhow::Result<()>;
}

/// Shortest flush period the worker will tick at.
pub const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct AdaptationSettings {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub rule: UpdateRule,
    pub max_weight: f64,
}

impl Default for AdaptationSettings {
    fn default() -> Self {
        Self {
            batch_size: 64,
            flush_interval: Duration::from_secs(30),
            rule: UpdateRule::default(),
            max_weight: 5.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    /// A new model version went live.
    Published(u64),
    /// The candidate failed validation; the previous version stays.
    Rejected(String),
    /// Nothing in the batch matched a known impression.
    Skipped,
}

pub struct AdaptationWorker {
    rx: mpsc::Receiver<FeedbackEvent>,
    impressions: Arc<ImpressionLog>,
    model: Arc<ModelHandle>,
    settings: AdaptationSettings,
    persistence: Option<Arc<dyn ModelPersistence>>,
    metrics: Arc<dyn MetricsSink>,
}

impl AdaptationWorker {
    pub fn new(
        rx: mpsc::Receiver<FeedbackEvent>,
        impressions: Arc<ImpressionLog>,
        model: Arc<ModelHandle>,
        settings: AdaptationSettings,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            rx,
            impressions,
            model,
            settings,
            persistence: None,
            metrics,
        }
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn ModelPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Drain the queue until every sender is dropped or `shutdown`
    /// resolves. Buffered events are flushed before returning.
    pub async fn run(mut self, shutdown: impl Future<Output = ()> + Send) {
        let mut buffer: Vec<FeedbackEvent> = Vec::with_capacity(self.settings.batch_size);
        // A zero period would panic in `interval`.
        let period = self.settings.flush_interval.max(MIN_FLUSH_INTERVAL);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                received = self.rx.recv() => match received {
                    Some(event) => {
                        buffer.push(event);
                        if buffer.len() >= self.settings.batch_size {
                            self.flush(&mut buffer).await;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if !buffer.is_empty() {
                        self.flush(&mut buffer).await;
                    }
                }
                _ = &mut shutdown => break,
            }
        }
        if !buffer.is_empty() {
            self.flush(&mut buffer).await;
        }
        debug!("adaptation worker stopped");
    }

    async fn flush(&self, buffer: &mut Vec<FeedbackEvent>) {
        let events = std::mem::take(buffer);
        let outcome = self.adapt(&events).await;
        debug!(events = events.len(), outcome = ?outcome, "feedback batch flushed");
    }

    /// Join `events` to impressions, compute a candidate model, and try to
    /// publish it.
    pub async fn adapt(&self, events: &[FeedbackEvent]) -> FlushOutcome {
        let impressions: HashMap<Uuid, Arc<Impression>> = events
            .iter()
            .map(|e| e.query_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter_map(|id| self.impressions.get(&id).map(|imp| (id, imp)))
            .collect();

        let joined: Vec<Joined<'_>> = events
            .iter()
            .filter_map(|e| {
                let imp = impressions.get(&e.query_id)?;
                let selected: Vec<_> = e.selected.iter().filter_map(|id| imp.entry(id)).collect();
                let rejected: Vec<_> = e.rejected.iter().filter_map(|id| imp.entry(id)).collect();
                if selected.is_empty() && rejected.is_empty() {
                    return None;
                }
                Some(Joined {
                    strength: e.signal.strength(),
                    selected,
                    rejected,
                })
            })
            .collect();

        if joined.is_empty() {
            debug!(events = events.len(), "no feedback matched a known impression");
            return FlushOutcome::Skipped;
        }

        let current = self.model.current();
        let candidate = self
            .settings
            .rule
            .apply(&joined, &current, self.settings.max_weight);

        match self.model.publish(candidate) {
            Ok(published) => {
                self.metrics.incr(names::FEEDBACK_PUBLISHED, 1);
                info!(
                    version = published.version,
                    events = joined.len(),
                    "ranking model published"
                );
                if let Some(persistence) = &self.persistence {
                    if let Err(e) = persistence.save_model(&published).await {
                        warn!(version = published.version, error = %format!("{:#}", e), "failed to persist ranking model");
                    }
                }
                FlushOutcome::Published(published.version)
            }
            Err(e) => {
                self.metrics.incr(names::FEEDBACK_REJECTED, 1);
                warn!(version = current.version, error = %e, "candidate ranking model rejected");
                FlushOutcome::Rejected(e.to_string())
            }
        }
    }
}
