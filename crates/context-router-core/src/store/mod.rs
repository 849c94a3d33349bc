//! Chunk storage abstraction.
//!
//! The [`ChunkStore`] trait is everything the retrieval engine and the
//! ingestion path need from a backend. The in-memory implementation lives
//! here; the SQLite one lives in the app crate.
//!
//! Both search methods return scores in `[0, 1]`, highest first, ties
//! broken by ascending chunk id.

pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::models::{Chunk, ContentType};

pub use memory::InMemoryChunkStore;

/// A chunk with its score from one sub-search.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Arc<Chunk>,
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreStats {
    pub chunks: usize,
    pub sources: usize,
    pub with_embeddings: usize,
    pub by_content_type: BTreeMap<String, usize>,
}

/// Abstract storage backend for chunks.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`keyword_search`](ChunkStore::keyword_search) | Term-match search |
/// | [`vector_search`](ChunkStore::vector_search) | Cosine similarity search |
/// | [`get_chunk`](ChunkStore::get_chunk) | Fetch one chunk by id |
/// | [`source_fingerprint`](ChunkStore::source_fingerprint) | Content hash of the last indexed version of a source |
/// | [`replace_source`](ChunkStore::replace_source) | Supersede all chunks of a source |
/// | [`stats`](ChunkStore::stats) | Counts for status output |
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Chunks matching any of `terms`, restricted to `types` when given.
    async fn keyword_search(
        &self,
        terms: &[String],
        limit: usize,
        types: Option<&[ContentType]>,
    ) -> Result<Vec<ScoredChunk>>;

    /// Chunks nearest to `embedding`. Negative cosine clamps to 0 and such
    /// chunks are not returned.
    async fn vector_search(
        &self,
        embedding: &[f32],
        limit: usize,
        types: Option<&[ContentType]>,
    ) -> Result<Vec<ScoredChunk>>;

    async fn get_chunk(&self, id: &str) -> Result<Option<Arc<Chunk>>>;

    async fn source_fingerprint(&self, source: &str) -> Result<Option<String>>;

    /// Replace every chunk of `source` with `chunks`. Readers see either the
    /// old or the new set. Returns the number of chunks stored.
    async fn replace_source(
        &self,
        source: &str,
        fingerprint: &str,
        chunks: Vec<Chunk>,
    ) -> Result<usize>;

    async fn stats(&self) -> Result<StoreStats>;
}

/// Keyword score shared by store backends: query-term coverage plus a
/// bounded term-frequency bonus, capped at 1.0.
pub fn keyword_score(matched_terms: usize, total_terms: usize, occurrences: usize) -> f64 {
    if total_terms == 0 || matched_terms == 0 {
        return 0.0;
    }
    let coverage = matched_terms as f64 / total_terms as f64;
    let tf = (occurrences as f64 / (3.0 * total_terms as f64)).min(1.0);
    (0.85 * coverage + 0.15 * tf).min(1.0)
}

/// Sort by score descending then chunk id ascending, and keep `limit`.
pub fn sort_and_truncate(results: &mut Vec<ScoredChunk>, limit: usize) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk.id.cmp(&b.chunk.id))
    });
    results.truncate(limit);
}

/// Min-max normalize raw backend scores into `[0, 1]`. When every score
/// is equal they all normalize to 1.0.
pub fn normalize_scores(raw: &[f64]) -> Vec<f64> {
    let s_min = raw.iter().copied().fold(f64::INFINITY, f64::min);
    let s_max = raw.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    raw.iter()
        .map(|&s| {
            if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (s - s_min) / (s_max - s_min)
            }
        })
        .collect()
}

pub fn type_allowed(types: Option<&[ContentType]>, t: ContentType) -> bool {
    types.map_or(true, |types| types.contains(&t))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_score_bounds() {
        assert_eq!(keyword_score(0, 3, 0), 0.0);
        assert_eq!(keyword_score(1, 0, 1), 0.0);
        let full = keyword_score(3, 3, 9);
        assert!((full - 1.0).abs() < 1e-12);
        let partial = keyword_score(1, 2, 1);
        assert!(partial > 0.4 && partial < 0.6);
        assert!(keyword_score(2, 2, 2) > keyword_score(1, 2, 10));
    }

    #[test]
    fn normalize_scores_min_max() {
        assert!(normalize_scores(&[]).is_empty());
        assert_eq!(normalize_scores(&[3.0, 3.0]), vec![1.0, 1.0]);
        assert_eq!(normalize_scores(&[2.0, 4.0, 3.0]), vec![0.0, 1.0, 0.5]);
    }

    #[test]
    fn type_filter() {
        assert!(type_allowed(None, ContentType::Code));
        assert!(type_allowed(Some(&[ContentType::Code]), ContentType::Code));
        assert!(!type_allowed(Some(&[ContentType::Config]), ContentType::Code));
    }
}
