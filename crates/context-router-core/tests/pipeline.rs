//! End-to-end behaviour of the query pipeline against in-memory and
//! fault-injecting stores.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use async_trait::async_trait;
use context_router_core::chunk::{chunk_descriptor, make_chunk, ContentDescriptor};
use context_router_core::embedding::{EmbeddingProvider, HashingEmbedder};
use context_router_core::feedback::{feedback_channel, ImpressionLog, ImpressionSettings};
use context_router_core::metrics::{names, InMemoryMetrics};
use context_router_core::models::{Chunk, ContentType, FeedbackEvent, Query, Signal, StrategyKind};
use context_router_core::profile::FeatureWeights;
use context_router_core::ranker::{rank, ModelHandle};
use context_router_core::retrieval::{merged_score, RetrievalMode, RetrievalSettings};
use context_router_core::store::{ChunkStore, InMemoryChunkStore, ScoredChunk, StoreStats};
use context_router_core::{ContextRouter, RetrievalError};
use uuid::Uuid;

const CORPUS: &[(&str, &str)] = &[
    (
        "src/config.rs",
        "use std::fs;\n\npub fn parse_config(path: &str) -> Config {\n    let raw = fs::read_to_string(path);\n    Config::from(raw)\n}\n\npub struct Config {\n    port: u16,\n}\n",
    ),
    (
        "src/server.rs",
        "pub async fn serve(config: Config) {\n    bind(config.port).await;\n}\n",
    ),
    (
        "docs/deploy.md",
        "# Deploy\n\nBuild the image with docker.\n\n## Ports\n\nThe server listens on port 7331.\n",
    ),
    (
        "config/app.toml",
        "[server]\nport = 7331\nhost = \"0.0.0.0\"\n\n[store]\npath = \"./data/ctx.sqlite\"\n",
    ),
];

async fn seeded() -> (Arc<InMemoryChunkStore>, HashingEmbedder) {
    let embedder = HashingEmbedder::new(256);
    let store = Arc::new(InMemoryChunkStore::new());
    for &(path, text) in CORPUS {
        let mut chunks = chunk_descriptor(path, &ContentDescriptor::new(Some(path), text), 200);
        for c in chunks.iter_mut() {
            c.embedding = Some(embedder.embed_text(&c.text));
        }
        store.replace_source(path, "v1", chunks).await.unwrap();
    }
    (store, embedder)
}

#[derive(Clone, Copy)]
enum Behaviour {
    Ok,
    Hang,
    Fail,
}

/// Serves `vector_hits` synthetic chunks to vector search and none to
/// keyword search, misbehaving per modality as configured.
struct FaultyStore {
    vector: Behaviour,
    keyword: Behaviour,
    hits: Vec<Arc<Chunk>>,
}

impl FaultyStore {
    fn new(vector: Behaviour, keyword: Behaviour, vector_hits: usize) -> Self {
        let hits = (0..vector_hits)
            .map(|i| {
                Arc::new(make_chunk(
                    "synthetic",
                    i,
                    ContentType::Unknown,
                    StrategyKind::SemanticSimilarity,
                    &format!("synthetic chunk number {}", i),
                    None,
                ))
            })
            .collect();
        Self {
            vector,
            keyword,
            hits,
        }
    }

    async fn behave(b: Behaviour) -> Result<()> {
        match b {
            Behaviour::Ok => Ok(()),
            Behaviour::Hang => {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            }
            Behaviour::Fail => bail!("index offline"),
        }
    }
}

#[async_trait]
impl ChunkStore for FaultyStore {
    async fn keyword_search(
        &self,
        _terms: &[String],
        _limit: usize,
        _types: Option<&[ContentType]>,
    ) -> Result<Vec<ScoredChunk>> {
        Self::behave(self.keyword).await?;
        Ok(Vec::new())
    }

    async fn vector_search(
        &self,
        _embedding: &[f32],
        limit: usize,
        _types: Option<&[ContentType]>,
    ) -> Result<Vec<ScoredChunk>> {
        Self::behave(self.vector).await?;
        Ok(self
            .hits
            .iter()
            .take(limit)
            .enumerate()
            .map(|(i, c)| ScoredChunk {
                chunk: Arc::clone(c),
                score: 0.9 - i as f64 * 0.1,
            })
            .collect())
    }

    async fn get_chunk(&self, _id: &str) -> Result<Option<Arc<Chunk>>> {
        Ok(None)
    }

    async fn source_fingerprint(&self, _source: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn replace_source(&self, _source: &str, _fp: &str, chunks: Vec<Chunk>) -> Result<usize> {
        Ok(chunks.len())
    }

    async fn stats(&self) -> Result<StoreStats> {
        Ok(StoreStats::default())
    }
}

fn fast_timeout() -> RetrievalSettings {
    RetrievalSettings {
        subsearch_timeout: Duration::from_millis(50),
    }
}

#[tokio::test]
async fn explicit_hint_overrides_inference() {
    let (store, embedder) = seeded().await;
    let router = ContextRouter::builder(store)
        .embedder(Arc::new(embedder))
        .build();

    let inferred = router
        .query(Query::new("implement the parse_config function", None))
        .await
        .unwrap();
    assert_eq!(inferred.profile_id, "code-completion");

    let hinted = router
        .query(Query::new(
            "implement the parse_config function",
            Some("documentation".into()),
        ))
        .await
        .unwrap();
    assert_eq!(hinted.profile_id, "documentation");
    assert_eq!(hinted.classification.confidence, 1.0);
}

#[tokio::test]
async fn identical_inputs_rank_identically() {
    let (store, embedder) = seeded().await;
    let router = ContextRouter::builder(store)
        .embedder(Arc::new(embedder))
        .build();

    let run = |text: &'static str| {
        let router = &router;
        async move {
            router
                .query(Query::new(text, None))
                .await
                .unwrap()
                .results
                .into_iter()
                .map(|c| (c.chunk.id.clone(), c.final_score))
                .collect::<Vec<_>>()
        }
    };
    let first = run("which port does the server listen on").await;
    let second = run("which port does the server listen on").await;
    assert!(!first.is_empty());
    assert_eq!(first, second);
}

#[test]
fn merged_score_example() {
    let weights = FeatureWeights {
        vector: 0.6,
        keyword: 0.4,
        single_modality_penalty: 0.15,
    };
    assert!((merged_score(Some(0.8), Some(0.5), &weights) - 0.68).abs() < 1e-12);
}

#[tokio::test]
async fn keyword_timeout_degrades_to_vector_results() {
    let metrics = Arc::new(InMemoryMetrics::new());
    let store = Arc::new(FaultyStore::new(Behaviour::Ok, Behaviour::Hang, 5));
    let router = ContextRouter::builder(store)
        .embedder(Arc::new(HashingEmbedder::new(16)))
        .retrieval(fast_timeout())
        .metrics(metrics.clone())
        .build();

    let started = Instant::now();
    let resp = router
        .query(Query::new("synthetic chunk", None))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(resp.mode, RetrievalMode::VectorOnly);
    assert_eq!(resp.results.len(), 5);
    let ranks: Vec<usize> = resp.results.iter().map(|c| c.rank).collect();
    assert_eq!(ranks, vec![1, 2, 3, 4, 5]);
    assert!(resp.results.iter().all(|c| c.keyword_score.is_none()));
    assert_eq!(metrics.counter(names::RETRIEVAL_DEGRADED), 1);
}

#[tokio::test]
async fn both_subsearches_failing_is_unavailable() {
    let metrics = Arc::new(InMemoryMetrics::new());
    let store = Arc::new(FaultyStore::new(Behaviour::Hang, Behaviour::Fail, 5));
    let router = ContextRouter::builder(store)
        .embedder(Arc::new(HashingEmbedder::new(16)))
        .retrieval(fast_timeout())
        .metrics(metrics.clone())
        .build();

    let err = router
        .query(Query::new("synthetic chunk", None))
        .await
        .unwrap_err();
    match err {
        RetrievalError::RetrievalUnavailable { vector, keyword } => {
            assert!(vector.contains("timed out"));
            assert!(keyword.contains("index offline"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(metrics.counter(names::RETRIEVAL_UNAVAILABLE), 1);
}

#[tokio::test]
async fn an_empty_index_is_not_an_error() {
    let router = ContextRouter::builder(Arc::new(InMemoryChunkStore::new()))
        .embedder(Arc::new(HashingEmbedder::new(16)))
        .build();
    let resp = router.query(Query::new("anything at all", None)).await.unwrap();
    assert_eq!(resp.mode, RetrievalMode::Hybrid);
    assert!(resp.results.is_empty());
}

#[tokio::test]
async fn recording_feedback_does_not_block() {
    let metrics = Arc::new(InMemoryMetrics::new());
    let (recorder, _rx) = feedback_channel(64, metrics.clone());
    let router = ContextRouter::builder(Arc::new(InMemoryChunkStore::new()))
        .recorder(Arc::new(recorder))
        .build();

    let n = 1_000u32;
    let started = Instant::now();
    for _ in 0..n {
        router.record_feedback(FeedbackEvent::new(
            Uuid::new_v4(),
            vec!["a".into()],
            vec![],
            Signal::Implicit(0.5),
        ));
    }
    let per_event = started.elapsed() / n;
    assert!(per_event < Duration::from_millis(1), "{per_event:?} per event");
    assert_eq!(metrics.counter(names::FEEDBACK_RECORDED), 64);
    assert_eq!(metrics.counter(names::FEEDBACK_DROPPED), u64::from(n) - 64);
}

#[tokio::test]
async fn rejected_model_keeps_prior_weights() {
    let (store, embedder) = seeded().await;
    let model = Arc::new(ModelHandle::default());
    let router = ContextRouter::builder(store)
        .embedder(Arc::new(embedder))
        .model(model.clone())
        .build();

    let query = Query::new("implement the parse_config function", None);
    let before = router.query(query.clone()).await.unwrap();

    let mut degenerate = model.current().successor();
    degenerate.retrieval_weight = 0.0;
    for key in ["content_type:code", "symbol_match", "brevity", "structural_boundary"] {
        degenerate.feature_weights.insert(key.to_string(), 0.0);
    }
    assert!(matches!(
        model.publish(degenerate),
        Err(RetrievalError::ModelPublishRejected { .. })
    ));
    assert_eq!(model.version(), 1);

    let after = router.query(query).await.unwrap();
    assert_eq!(after.model_version, 1);
    let scores = |r: &context_router_core::RankedResponse| {
        r.results
            .iter()
            .map(|c| (c.chunk.id.clone(), c.final_score))
            .collect::<Vec<_>>()
    };
    assert_eq!(scores(&before), scores(&after));
}

#[tokio::test]
async fn ranking_truncates_to_the_context_window() {
    let (store, embedder) = seeded().await;
    let router = ContextRouter::builder(store.clone())
        .embedder(Arc::new(embedder))
        .build();
    let profile = router.registry().get("code-completion");

    let many: Vec<Chunk> = (0..40)
        .map(|i| {
            make_chunk(
                "src/gen.rs",
                i,
                ContentType::Code,
                StrategyKind::SemanticFunction,
                &format!("fn generated_{}() {{ parse(config) }}", i),
                None,
            )
        })
        .collect();
    store.replace_source("src/gen.rs", "g", many).await.unwrap();

    let resp = router
        .query(Query::new("parse config", Some("code-completion".into())))
        .await
        .unwrap();
    assert!(resp.candidates_considered > profile.context_window.max_chunks);
    assert_eq!(resp.results.len(), profile.context_window.max_chunks);

    let model = router.model().current();
    let query = Query::new("parse config", None);
    let reranked = rank(resp.results.clone(), &query, &profile, &model);
    assert!(reranked.len() <= profile.context_window.max_chunks);
}

/// Embedder that answers only after `delay`.
struct SlowEmbedder {
    inner: HashingEmbedder,
    delay: Duration,
}

#[async_trait]
impl EmbeddingProvider for SlowEmbedder {
    fn model_name(&self) -> &str {
        "slow"
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        tokio::time::sleep(self.delay).await;
        self.inner.embed(texts).await
    }
}

#[tokio::test]
async fn slow_query_embedding_degrades_to_keyword_only() {
    let (store, _) = seeded().await;
    let metrics = Arc::new(InMemoryMetrics::new());
    let router = ContextRouter::builder(store)
        .embedder(Arc::new(SlowEmbedder {
            inner: HashingEmbedder::new(256),
            delay: Duration::from_secs(3),
        }))
        .retrieval(fast_timeout())
        .metrics(metrics.clone())
        .build();

    let started = Instant::now();
    let resp = router
        .query(Query::new("build the docker image", None))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(1), "{:?}", started.elapsed());
    assert_eq!(resp.mode, RetrievalMode::KeywordOnly);
    assert!(!resp.results.is_empty());
    assert!(resp.results.iter().all(|c| c.vector_score.is_none()));
    assert_eq!(metrics.counter(names::RETRIEVAL_DEGRADED), 1);
}

#[tokio::test]
async fn keyword_only_deployment_is_not_degraded() {
    let (store, _) = seeded().await;
    let metrics = Arc::new(InMemoryMetrics::new());
    let router = ContextRouter::builder(store).metrics(metrics.clone()).build();

    let resp = router
        .query(Query::new("build the docker image", None))
        .await
        .unwrap();
    assert_eq!(resp.mode, RetrievalMode::KeywordOnly);
    assert!(!resp.results.is_empty());
    assert_eq!(metrics.counter(names::RETRIEVAL_DEGRADED), 0);
}

#[tokio::test]
async fn feedback_recording_adds_no_query_latency() {
    let (store, embedder) = seeded().await;
    let embedder = Arc::new(embedder);
    let baseline = ContextRouter::builder(store.clone())
        .embedder(embedder.clone())
        .build();
    let (recorder, _rx) = feedback_channel(16, Arc::new(InMemoryMetrics::new()));
    let recording = ContextRouter::builder(store)
        .embedder(embedder)
        .recorder(Arc::new(recorder))
        .impressions(Arc::new(ImpressionLog::new(&ImpressionSettings::default())))
        .build();

    let n = 50u32;
    let text = "where is parse_config defined";

    let started = Instant::now();
    for _ in 0..n {
        baseline.query(Query::new(text, None)).await.unwrap();
    }
    let noop_mean = started.elapsed() / n;

    let started = Instant::now();
    for _ in 0..n {
        let resp = recording.query(Query::new(text, None)).await.unwrap();
        let selected = resp.results.iter().take(1).map(|c| c.chunk.id.clone()).collect();
        recording.record_feedback(FeedbackEvent::new(
            resp.query_id,
            selected,
            vec![],
            Signal::Explicit(1.0),
        ));
    }
    let recording_mean = started.elapsed() / n;

    assert!(
        recording_mean <= noop_mean * 3 + Duration::from_millis(2),
        "recording {recording_mean:?} vs noop {noop_mean:?}"
    );
}
