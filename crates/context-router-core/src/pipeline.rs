//! [`ContextRouter`]: classification, retrieval, and ranking for one query.
//!
//! Each stage absorbs its own non-fatal errors. Only
//! [`RetrievalError::RetrievalUnavailable`] and
//! [`RetrievalError::MalformedQuery`] reach the caller of
//! [`ContextRouter::query`].

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::classifier::{AgentClassifier, Classification};
use crate::embedding::EmbeddingProvider;
use crate::error::{RetrievalError, RetrievalResult};
use crate::feedback::{FeedbackRecorder, Impression, ImpressionEntry, ImpressionLog, NoopRecorder};
use crate::metrics::{names, MetricsSink, NoopMetrics};
use crate::models::{CandidateResult, FeedbackEvent, Query};
use crate::profile::ProfileRegistry;
use crate::ranker::{feature_activations, rank, ModelHandle};
use crate::retrieval::{HybridRetrievalEngine, RetrievalMode, RetrievalSettings};
use crate::store::ChunkStore;

pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.2;

/// The answer to one query.
#[derive(Debug, Clone, Serialize)]
pub struct RankedResponse {
    pub query_id: Uuid,
    pub profile_id: String,
    pub classification: Classification,
    pub model_version: u64,
    pub mode: RetrievalMode,
    pub results: Vec<CandidateResult>,
    /// Candidates produced by retrieval before ranking and truncation.
    pub candidates_considered: usize,
    pub elapsed_ms: u64,
}

pub struct ContextRouter {
    registry: Arc<ProfileRegistry>,
    classifier: AgentClassifier,
    engine: HybridRetrievalEngine,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    model: Arc<ModelHandle>,
    recorder: Arc<dyn FeedbackRecorder>,
    impressions: Option<Arc<ImpressionLog>>,
    metrics: Arc<dyn MetricsSink>,
}

pub struct ContextRouterBuilder {
    store: Arc<dyn ChunkStore>,
    registry: Option<Arc<ProfileRegistry>>,
    min_confidence: f64,
    retrieval: RetrievalSettings,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    model: Option<Arc<ModelHandle>>,
    recorder: Option<Arc<dyn FeedbackRecorder>>,
    impressions: Option<Arc<ImpressionLog>>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl ContextRouterBuilder {
    pub fn registry(mut self, registry: Arc<ProfileRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn min_confidence(mut self, min_confidence: f64) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    pub fn retrieval(mut self, settings: RetrievalSettings) -> Self {
        self.retrieval = settings;
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn model(mut self, model: Arc<ModelHandle>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn recorder(mut self, recorder: Arc<dyn FeedbackRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn impressions(mut self, impressions: Arc<ImpressionLog>) -> Self {
        self.impressions = Some(impressions);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> ContextRouter {
        let metrics = self.metrics.unwrap_or_else(|| Arc::new(NoopMetrics));
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(ProfileRegistry::with_builtins()));
        ContextRouter {
            classifier: AgentClassifier::new(
                Arc::clone(&registry),
                self.min_confidence,
                Arc::clone(&metrics),
            ),
            engine: HybridRetrievalEngine::new(self.store, self.retrieval, Arc::clone(&metrics)),
            registry,
            embedder: self.embedder,
            model: self.model.unwrap_or_default(),
            recorder: self.recorder.unwrap_or_else(|| Arc::new(NoopRecorder)),
            impressions: self.impressions,
            metrics,
        }
    }
}

impl ContextRouter {
    pub fn builder(store: Arc<dyn ChunkStore>) -> ContextRouterBuilder {
        ContextRouterBuilder {
            store,
            registry: None,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            retrieval: RetrievalSettings::default(),
            embedder: None,
            model: None,
            recorder: None,
            impressions: None,
            metrics: None,
        }
    }

    pub fn registry(&self) -> &Arc<ProfileRegistry> {
        &self.registry
    }

    pub fn classifier(&self) -> &AgentClassifier {
        &self.classifier
    }

    pub fn model(&self) -> &Arc<ModelHandle> {
        &self.model
    }

    pub fn store(&self) -> &Arc<dyn ChunkStore> {
        self.engine.store()
    }

    pub fn embedder(&self) -> Option<&Arc<dyn EmbeddingProvider>> {
        self.embedder.as_ref()
    }

    pub async fn query(&self, query: Query) -> RetrievalResult<RankedResponse> {
        let started = Instant::now();
        if query.text.trim().is_empty() {
            return Err(RetrievalError::MalformedQuery(
                "query text is empty".to_string(),
            ));
        }

        let classification = self
            .classifier
            .classify(&query.text, query.agent_hint.as_deref());
        let profile = self.registry.get(&classification.profile_id);

        let outcome = self
            .engine
            .retrieve_embedding(&query, self.embedder.as_deref(), &profile)
            .await?;
        let candidates_considered = outcome.candidates.len();

        // One model snapshot for the whole ranking pass.
        let model = self.model.current();
        let rank_started = Instant::now();
        let results = rank(outcome.candidates, &query, &profile, &model);
        self.metrics.timing(names::RANKER_LATENCY, rank_started.elapsed());

        if let Some(log) = &self.impressions {
            if log.should_sample(&query.id) {
                let keywords = query.keywords();
                let entries = results
                    .iter()
                    .map(|c| ImpressionEntry {
                        chunk_id: c.chunk.id.clone(),
                        merged_score: c.merged_score,
                        activations: feature_activations(&c.chunk, &keywords, &profile),
                    })
                    .collect();
                log.record(Impression {
                    query_id: query.id,
                    profile_id: profile.id.clone(),
                    model_version: model.version,
                    entries,
                });
            }
        }

        let elapsed = started.elapsed();
        self.metrics.timing(names::QUERY_LATENCY, elapsed);
        debug!(
            query_id = %query.id,
            profile = %profile.id,
            results = results.len(),
            candidates = candidates_considered,
            "query answered"
        );

        Ok(RankedResponse {
            query_id: query.id,
            profile_id: profile.id.clone(),
            classification,
            model_version: model.version,
            mode: outcome.mode,
            results,
            candidates_considered,
            elapsed_ms: elapsed.as_millis() as u64,
        })
    }

    /// Enqueue an outcome signal. Never blocks.
    pub fn record_feedback(&self, event: FeedbackEvent) -> bool {
        self.recorder.record(event)
    }
}
