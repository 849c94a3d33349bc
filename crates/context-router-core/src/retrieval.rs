//! Hybrid retrieval: concurrent vector and keyword sub-searches, merged.
//!
//! # Algorithm
//!
//! 1. Extract keywords from the query. Empty text is a [`RetrievalError::MalformedQuery`].
//! 2. Run both sub-searches with `tokio::join!`, each under its own
//!    timeout, each capped at `profile.candidate_limit` and restricted to
//!    `profile.content_types`. Embedding the query text is part of the
//!    vector sub-search and shares its timeout. Without an embedder the
//!    vector sub-search fails at once.
//! 3. Merge by chunk id:
//!    - found by both: `w_v * v + w_k * k`
//!    - found by one: `w * s * (1 - single_modality_penalty)`
//!    - when one sub-search failed, the survivor's raw score is used as is
//! 4. Sort by merged score, then vector score, then chunk id.
//!
//! Both sub-searches failing is [`RetrievalError::RetrievalUnavailable`].

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use serde::Serialize;
use tracing::{debug, warn};

use crate::embedding::{embed_one, EmbeddingProvider};
use crate::error::{RetrievalError, RetrievalResult};
use crate::metrics::{names, MetricsSink};
use crate::models::{CandidateResult, Chunk, Modality, Query};
use crate::profile::{AgentProfile, FeatureWeights};
use crate::store::{ChunkStore, ScoredChunk};

pub const DEFAULT_SUBSEARCH_TIMEOUT: Duration = Duration::from_millis(150);

#[derive(Debug, Clone)]
pub struct RetrievalSettings {
    pub subsearch_timeout: Duration,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            subsearch_timeout: DEFAULT_SUBSEARCH_TIMEOUT,
        }
    }
}

/// Which sub-searches contributed to an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    Hybrid,
    /// Degraded: the keyword sub-search failed.
    VectorOnly,
    /// Degraded: the vector sub-search failed.
    KeywordOnly,
}

impl RetrievalMode {
    pub fn is_degraded(&self) -> bool {
        !matches!(self, RetrievalMode::Hybrid)
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalOutcome {
    pub mode: RetrievalMode,
    /// Merged candidates, best first, ranks assigned.
    pub candidates: Vec<CandidateResult>,
    pub vector_hits: usize,
    pub keyword_hits: usize,
    /// Chunks returned by both sub-searches.
    pub both_hits: usize,
}

impl RetrievalOutcome {
    /// Both-hit count over the union of both result sets.
    pub fn merge_hit_ratio(&self) -> Option<f64> {
        let union = self.vector_hits + self.keyword_hits - self.both_hits;
        (union > 0).then(|| self.both_hits as f64 / union as f64)
    }
}

/// Hybrid merge of two sub-search scores.
///
/// ```rust
/// use context_router_core::profile::FeatureWeights;
/// use context_router_core::retrieval::merged_score;
///
/// let w = FeatureWeights { vector: 0.6, keyword: 0.4, single_modality_penalty: 0.15 };
/// assert!((merged_score(Some(0.8), Some(0.5), &w) - 0.68).abs() < 1e-12);
/// ```
pub fn merged_score(vector: Option<f64>, keyword: Option<f64>, weights: &FeatureWeights) -> f64 {
    let keep = 1.0 - weights.single_modality_penalty;
    match (vector, keyword) {
        (Some(v), Some(k)) => weights.vector * v + weights.keyword * k,
        (Some(v), None) => weights.vector * v * keep,
        (None, Some(k)) => weights.keyword * k * keep,
        (None, None) => 0.0,
    }
}

/// Descending order for scores; NaN sorts last.
pub(crate) fn desc(a: f64, b: f64) -> Ordering {
    b.partial_cmp(&a).unwrap_or_else(|| a.is_nan().cmp(&b.is_nan()))
}

/// Descending order for optional scores; `None` sorts last.
pub(crate) fn desc_opt(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => desc(a, b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

struct Merged {
    chunk: Arc<Chunk>,
    vector: Option<f64>,
    keyword: Option<f64>,
}

/// Where the vector sub-search gets its query vector.
#[derive(Clone, Copy)]
enum QueryVector<'a> {
    Missing,
    Ready(&'a [f32]),
    Embed(&'a dyn EmbeddingProvider),
}

pub struct HybridRetrievalEngine {
    store: Arc<dyn ChunkStore>,
    settings: RetrievalSettings,
    metrics: Arc<dyn MetricsSink>,
}

impl HybridRetrievalEngine {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        settings: RetrievalSettings,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            store,
            settings,
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<dyn ChunkStore> {
        &self.store
    }

    pub fn settings(&self) -> &RetrievalSettings {
        &self.settings
    }

    async fn bounded<F>(&self, modality: Modality, search: F) -> RetrievalResult<Vec<ScoredChunk>>
    where
        F: Future<Output = anyhow::Result<Vec<ScoredChunk>>>,
    {
        match tokio::time::timeout(self.settings.subsearch_timeout, search).await {
            Ok(Ok(hits)) => Ok(hits),
            Ok(Err(e)) => Err(RetrievalError::SubsearchFailed {
                modality,
                reason: format!("{:#}", e),
            }),
            Err(_) => Err(RetrievalError::SubsearchTimeout {
                modality,
                timeout_ms: self.settings.subsearch_timeout.as_millis() as u64,
            }),
        }
    }

    /// Retrieve with a precomputed query embedding. `None` runs keyword only.
    pub async fn retrieve(
        &self,
        query: &Query,
        embedding: Option<&[f32]>,
        profile: &AgentProfile,
    ) -> RetrievalResult<RetrievalOutcome> {
        let vector = match embedding {
            Some(e) => QueryVector::Ready(e),
            None => QueryVector::Missing,
        };
        self.run(query, vector, profile).await
    }

    /// Retrieve, embedding the query text inside the vector sub-search so
    /// the provider call shares that sub-search's timeout.
    pub async fn retrieve_embedding(
        &self,
        query: &Query,
        embedder: Option<&dyn EmbeddingProvider>,
        profile: &AgentProfile,
    ) -> RetrievalResult<RetrievalOutcome> {
        let vector = match embedder {
            Some(p) => QueryVector::Embed(p),
            None => QueryVector::Missing,
        };
        self.run(query, vector, profile).await
    }

    async fn run(
        &self,
        query: &Query,
        vector: QueryVector<'_>,
        profile: &AgentProfile,
    ) -> RetrievalResult<RetrievalOutcome> {
        if query.text.trim().is_empty() {
            return Err(RetrievalError::MalformedQuery(
                "query text is empty".to_string(),
            ));
        }
        let started = Instant::now();
        let keywords = query.keywords();
        let limit = profile.candidate_limit;
        let types = profile.content_types.as_deref();

        let expects_vector = !matches!(vector, QueryVector::Missing);

        let vector_search = async {
            match vector {
                QueryVector::Ready(e) => {
                    self.bounded(Modality::Vector, self.store.vector_search(e, limit, types))
                        .await
                }
                QueryVector::Embed(provider) => {
                    let search = async {
                        let e = embed_one(provider, &query.text)
                            .await
                            .context("query embedding failed")?;
                        self.store.vector_search(&e, limit, types).await
                    };
                    self.bounded(Modality::Vector, search).await
                }
                QueryVector::Missing => Err(RetrievalError::SubsearchFailed {
                    modality: Modality::Vector,
                    reason: "no query embedding".to_string(),
                }),
            }
        };
        let keyword_search = async {
            if keywords.is_empty() {
                return Ok(Vec::new());
            }
            self.bounded(
                Modality::Keyword,
                self.store.keyword_search(&keywords, limit, types),
            )
            .await
        };
        let (vector, keyword) = tokio::join!(vector_search, keyword_search);

        let (mode, vector_hits, keyword_hits) = match (vector, keyword) {
            (Ok(v), Ok(k)) => (RetrievalMode::Hybrid, v, k),
            (Ok(v), Err(e)) => {
                warn!(query_id = %query.id, error = %e, "keyword sub-search degraded");
                (RetrievalMode::VectorOnly, v, Vec::new())
            }
            (Err(e), Ok(k)) => {
                if expects_vector {
                    warn!(query_id = %query.id, error = %e, "vector sub-search degraded");
                } else {
                    debug!(query_id = %query.id, "no query embedding; keyword only");
                }
                (RetrievalMode::KeywordOnly, Vec::new(), k)
            }
            (Err(v), Err(k)) => {
                self.metrics.incr(names::RETRIEVAL_UNAVAILABLE, 1);
                self.metrics.timing(names::RETRIEVAL_LATENCY, started.elapsed());
                warn!(query_id = %query.id, vector = %v, keyword = %k, "retrieval unavailable");
                return Err(RetrievalError::RetrievalUnavailable {
                    vector: v.to_string(),
                    keyword: k.to_string(),
                });
            }
        };

        let outcome = merge(mode, vector_hits, keyword_hits, &profile.weights);

        self.metrics.timing(names::RETRIEVAL_LATENCY, started.elapsed());
        // Keyword-only deployments are not degraded.
        if mode.is_degraded() && expects_vector {
            self.metrics.incr(names::RETRIEVAL_DEGRADED, 1);
        } else if let Some(ratio) = outcome.merge_hit_ratio() {
            self.metrics.observe(names::RETRIEVAL_MERGE_HIT_RATIO, ratio);
        }
        debug!(
            query_id = %query.id,
            profile = %profile.id,
            mode = ?mode,
            vector_hits = outcome.vector_hits,
            keyword_hits = outcome.keyword_hits,
            both_hits = outcome.both_hits,
            "retrieval complete"
        );
        Ok(outcome)
    }
}

fn merge(
    mode: RetrievalMode,
    vector_hits: Vec<ScoredChunk>,
    keyword_hits: Vec<ScoredChunk>,
    weights: &FeatureWeights,
) -> RetrievalOutcome {
    let n_vector = vector_hits.len();
    let n_keyword = keyword_hits.len();
    let mut merged: BTreeMap<String, Merged> = BTreeMap::new();

    for hit in vector_hits {
        merged.insert(
            hit.chunk.id.clone(),
            Merged {
                chunk: hit.chunk,
                vector: Some(hit.score),
                keyword: None,
            },
        );
    }
    let mut both = 0;
    for hit in keyword_hits {
        match merged.get_mut(&hit.chunk.id) {
            Some(m) => {
                m.keyword = Some(hit.score);
                both += 1;
            }
            None => {
                merged.insert(
                    hit.chunk.id.clone(),
                    Merged {
                        chunk: hit.chunk,
                        vector: None,
                        keyword: Some(hit.score),
                    },
                );
            }
        }
    }

    let mut candidates: Vec<CandidateResult> = merged
        .into_values()
        .map(|m| {
            let score = match mode {
                RetrievalMode::Hybrid => merged_score(m.vector, m.keyword, weights),
                RetrievalMode::VectorOnly => m.vector.unwrap_or(0.0),
                RetrievalMode::KeywordOnly => m.keyword.unwrap_or(0.0),
            };
            CandidateResult {
                chunk: m.chunk,
                vector_score: m.vector,
                keyword_score: m.keyword,
                merged_score: score,
                final_score: score,
                rank: 0,
            }
        })
        .collect();

    candidates.sort_by(|a, b| {
        desc(a.merged_score, b.merged_score)
            .then_with(|| desc_opt(a.vector_score, b.vector_score))
            .then_with(|| a.chunk.id.cmp(&b.chunk.id))
    });
    for (i, c) in candidates.iter_mut().enumerate() {
        c.rank = i + 1;
    }

    RetrievalOutcome {
        mode,
        candidates,
        vector_hits: n_vector,
        keyword_hits: n_keyword,
        both_hits: both,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::make_chunk;
    use crate::metrics::InMemoryMetrics;
    use crate::models::{ContentType, StrategyKind};
    use crate::profile::ProfileRegistry;
    use crate::store::InMemoryChunkStore;

    fn scored(id_text: &str, score: f64) -> ScoredChunk {
        ScoredChunk {
            chunk: Arc::new(make_chunk(
                "s",
                0,
                ContentType::Unknown,
                StrategyKind::SemanticSimilarity,
                id_text,
                None,
            )),
            score,
        }
    }

    fn weights(v: f64, k: f64, p: f64) -> FeatureWeights {
        FeatureWeights {
            vector: v,
            keyword: k,
            single_modality_penalty: p,
        }
    }

    #[test]
    fn merged_score_formula() {
        let w = weights(0.6, 0.4, 0.15);
        assert!((merged_score(Some(0.8), Some(0.5), &w) - 0.68).abs() < 1e-12);
        assert!((merged_score(Some(0.8), None, &w) - 0.6 * 0.8 * 0.85).abs() < 1e-12);
        assert!((merged_score(None, Some(0.5), &w) - 0.4 * 0.5 * 0.85).abs() < 1e-12);
    }

    #[test]
    fn merge_counts_and_orders() {
        let a = scored("alpha", 0.9);
        let b = scored("beta", 0.4);
        let c = scored("gamma", 0.7);
        let outcome = merge(
            RetrievalMode::Hybrid,
            vec![a.clone(), b.clone()],
            vec![b.clone(), c],
            &weights(0.5, 0.5, 0.0),
        );
        assert_eq!(outcome.vector_hits, 2);
        assert_eq!(outcome.keyword_hits, 2);
        assert_eq!(outcome.both_hits, 1);
        assert!((outcome.merge_hit_ratio().unwrap() - 1.0 / 3.0).abs() < 1e-12);
        let order: Vec<&str> = outcome.candidates.iter().map(|c| c.chunk.text.as_str()).collect();
        assert_eq!(order, vec!["alpha", "beta", "gamma"]);
        assert_eq!(outcome.candidates[0].rank, 1);
        assert_eq!(outcome.candidates[2].rank, 3);
    }

    #[test]
    fn degraded_mode_keeps_raw_scores() {
        let outcome = merge(
            RetrievalMode::VectorOnly,
            vec![scored("one", 0.3), scored("two", 0.9)],
            vec![],
            &weights(0.6, 0.4, 0.5),
        );
        assert_eq!(outcome.candidates[0].merged_score, 0.9);
        assert_eq!(outcome.candidates[1].merged_score, 0.3);
    }

    #[test]
    fn ties_prefer_vector_then_id() {
        let w = weights(0.5, 0.5, 0.0);
        // Same merged score (0.25): vector-only 0.5 vs keyword-only 0.5.
        let outcome = merge(
            RetrievalMode::Hybrid,
            vec![scored("vec", 0.5)],
            vec![scored("kw", 0.5)],
            &w,
        );
        assert_eq!(outcome.candidates[0].chunk.text, "vec");
    }

    #[tokio::test]
    async fn empty_query_is_malformed() {
        let engine = HybridRetrievalEngine::new(
            Arc::new(InMemoryChunkStore::new()),
            RetrievalSettings::default(),
            Arc::new(InMemoryMetrics::new()),
        );
        let profile = ProfileRegistry::with_builtins().default_profile();
        let err = engine
            .retrieve(&Query::new("   ", None), None, &profile)
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::MalformedQuery(_)));
    }

    #[tokio::test]
    async fn no_embedder_runs_keyword_only_without_degrading() {
        let store = Arc::new(InMemoryChunkStore::new());
        store
            .replace_source(
                "a.md",
                "h",
                vec![make_chunk(
                    "a.md",
                    0,
                    ContentType::Documentation,
                    StrategyKind::HierarchicalSection,
                    "install the router",
                    None,
                )],
            )
            .await
            .unwrap();
        let metrics = Arc::new(InMemoryMetrics::new());
        let engine = HybridRetrievalEngine::new(store, RetrievalSettings::default(), metrics.clone());
        let profile = ProfileRegistry::with_builtins().default_profile();
        let outcome = engine
            .retrieve(&Query::new("install", None), None, &profile)
            .await
            .unwrap();
        assert_eq!(outcome.mode, RetrievalMode::KeywordOnly);
        assert_eq!(outcome.candidates.len(), 1);
        assert_eq!(metrics.counter(names::RETRIEVAL_DEGRADED), 0);
    }
}
