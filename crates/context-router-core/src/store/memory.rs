//! In-memory [`ChunkStore`] for tests and ephemeral deployments.
//!
//! The whole index is one immutable generation behind a
//! [`SnapshotCell`]. A search works on the generation it loaded, so a
//! concurrent `replace_source` can never hand it half of a source.
//! Vector search is brute-force cosine similarity.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use super::{keyword_score, sort_and_truncate, type_allowed, ChunkStore, ScoredChunk, StoreStats};
use crate::embedding::similarity_score;
use crate::models::{Chunk, ContentType};
use crate::snapshot::SnapshotCell;

struct IndexedChunk {
    chunk: Arc<Chunk>,
    terms: HashMap<String, usize>,
}

struct SourceEntry {
    fingerprint: String,
    chunk_ids: Vec<String>,
}

#[derive(Default)]
struct Generation {
    version: u64,
    chunks: BTreeMap<String, Arc<IndexedChunk>>,
    sources: BTreeMap<String, Arc<SourceEntry>>,
}

#[derive(Default)]
pub struct InMemoryChunkStore {
    state: SnapshotCell<Generation>,
}

impl InMemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed `replace_source` calls.
    pub fn generation(&self) -> u64 {
        self.state.load().version
    }
}

fn filtered<'a>(
    generation: &'a Generation,
    types: Option<&'a [ContentType]>,
) -> impl Iterator<Item = &'a Arc<IndexedChunk>> + 'a {
    generation
        .chunks
        .values()
        .filter(move |c| type_allowed(types, c.chunk.content_type))
}

#[async_trait]
impl ChunkStore for InMemoryChunkStore {
    async fn keyword_search(
        &self,
        terms: &[String],
        limit: usize,
        types: Option<&[ContentType]>,
    ) -> Result<Vec<ScoredChunk>> {
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let generation = self.state.load();
        let mut results: Vec<ScoredChunk> = filtered(&generation, types)
            .filter_map(|c| {
                let mut matched = 0;
                let mut occurrences = 0;
                for term in terms {
                    if let Some(n) = c.terms.get(term) {
                        matched += 1;
                        occurrences += *n;
                    }
                }
                let score = keyword_score(matched, terms.len(), occurrences);
                (score > 0.0).then(|| ScoredChunk {
                    chunk: Arc::clone(&c.chunk),
                    score,
                })
            })
            .collect();
        sort_and_truncate(&mut results, limit);
        Ok(results)
    }

    async fn vector_search(
        &self,
        embedding: &[f32],
        limit: usize,
        types: Option<&[ContentType]>,
    ) -> Result<Vec<ScoredChunk>> {
        if embedding.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let generation = self.state.load();
        let mut results: Vec<ScoredChunk> = filtered(&generation, types)
            .filter_map(|c| {
                let vector = c.chunk.embedding.as_deref()?;
                let score = similarity_score(embedding, vector);
                (score > 0.0).then(|| ScoredChunk {
                    chunk: Arc::clone(&c.chunk),
                    score,
                })
            })
            .collect();
        sort_and_truncate(&mut results, limit);
        Ok(results)
    }

    async fn get_chunk(&self, id: &str) -> Result<Option<Arc<Chunk>>> {
        Ok(self
            .state
            .load()
            .chunks
            .get(id)
            .map(|c| Arc::clone(&c.chunk)))
    }

    async fn source_fingerprint(&self, source: &str) -> Result<Option<String>> {
        Ok(self
            .state
            .load()
            .sources
            .get(source)
            .map(|s| s.fingerprint.clone()))
    }

    async fn replace_source(
        &self,
        source: &str,
        fingerprint: &str,
        chunks: Vec<Chunk>,
    ) -> Result<usize> {
        let indexed: Vec<Arc<IndexedChunk>> = chunks
            .into_iter()
            .map(|mut chunk| {
                chunk.source = source.to_string();
                let terms = crate::text::term_counts(&chunk.text);
                Arc::new(IndexedChunk {
                    chunk: Arc::new(chunk),
                    terms,
                })
            })
            .collect();
        let count = indexed.len();

        self.state.update(|current| {
            let mut chunks = current.chunks.clone();
            let mut sources = current.sources.clone();
            if let Some(old) = sources.remove(source) {
                for id in &old.chunk_ids {
                    chunks.remove(id);
                }
            }
            let mut chunk_ids = Vec::with_capacity(indexed.len());
            for c in &indexed {
                chunk_ids.push(c.chunk.id.clone());
                chunks.insert(c.chunk.id.clone(), Arc::clone(c));
            }
            if !chunk_ids.is_empty() || !fingerprint.is_empty() {
                sources.insert(
                    source.to_string(),
                    Arc::new(SourceEntry {
                        fingerprint: fingerprint.to_string(),
                        chunk_ids,
                    }),
                );
            }
            Ok::<_, anyhow::Error>(Generation {
                version: current.version + 1,
                chunks,
                sources,
            })
        })?;
        Ok(count)
    }

    async fn stats(&self) -> Result<StoreStats> {
        let generation = self.state.load();
        let mut stats = StoreStats {
            chunks: generation.chunks.len(),
            sources: generation.sources.len(),
            ..StoreStats::default()
        };
        for c in generation.chunks.values() {
            *stats
                .by_content_type
                .entry(c.chunk.content_type.to_string())
                .or_insert(0) += 1;
            if c.chunk.embedding.is_some() {
                stats.with_embeddings += 1;
            }
        }
        Ok(stats)
    }
}
