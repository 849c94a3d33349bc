//! SQLite-backed [`ChunkStore`].
//!
//! Keyword search runs FTS5 `MATCH` over `chunks_fts` and min-max
//! normalizes the bm25 scores of the returned candidates. Vector search is
//! brute-force cosine over the `chunk_vectors` blobs. `replace_source`
//! runs in one transaction, so under WAL a reader sees either the old or
//! the new chunk set of a source.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use context_router_core::embedding::{blob_to_vec, similarity_score, vec_to_blob};
use context_router_core::models::{Chunk, ChunkStructure, ContentType, StrategyKind};
use context_router_core::store::{
    normalize_scores, sort_and_truncate, ChunkStore, ScoredChunk, StoreStats,
};

const CHUNK_COLUMNS: &str =
    "c.id, c.source, c.chunk_index, c.content_type, c.strategy, c.text, c.hash, c.structure_json";

pub struct SqliteChunkStore {
    pool: SqlitePool,
}

impl SqliteChunkStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn row_to_chunk(row: &SqliteRow, embedding: Option<Vec<f32>>) -> Result<Chunk> {
    let content_type: String = row.get("content_type");
    let strategy: String = row.get("strategy");
    let structure_json: Option<String> = row.get("structure_json");
    let structure = structure_json
        .map(|s| serde_json::from_str::<ChunkStructure>(&s))
        .transpose()
        .context("corrupt structure_json")?;
    let index: i64 = row.get("chunk_index");

    Ok(Chunk {
        id: row.get("id"),
        source: row.get("source"),
        index: index as usize,
        content_type: content_type.parse::<ContentType>()?,
        strategy: strategy.parse::<StrategyKind>()?,
        text: row.get("text"),
        hash: row.get("hash"),
        embedding,
        structure,
    })
}

/// `AND c.content_type IN (?, ...)`, or nothing when unrestricted.
fn type_clause(types: Option<&[ContentType]>) -> String {
    match types {
        Some(types) if !types.is_empty() => {
            let placeholders = vec!["?"; types.len()].join(", ");
            format!(" AND c.content_type IN ({})", placeholders)
        }
        _ => String::new(),
    }
}

/// FTS5 query matching any of `terms`, each as a quoted string.
fn match_expression(terms: &[String]) -> String {
    terms
        .iter()
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

#[async_trait]
impl ChunkStore for SqliteChunkStore {
    async fn keyword_search(
        &self,
        terms: &[String],
        limit: usize,
        types: Option<&[ContentType]>,
    ) -> Result<Vec<ScoredChunk>> {
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let sql = format!(
            r#"
            SELECT {cols}, bm25(chunks_fts) AS rank_score
            FROM chunks_fts
            JOIN chunks c ON c.id = chunks_fts.chunk_id
            WHERE chunks_fts MATCH ?{types}
            ORDER BY rank_score
            LIMIT ?
            "#,
            cols = CHUNK_COLUMNS,
            types = type_clause(types),
        );
        let mut query = sqlx::query(&sql).bind(match_expression(terms));
        for t in types.unwrap_or_default() {
            query = query.bind(t.as_str());
        }
        let rows = query.bind(limit as i64).fetch_all(&self.pool).await?;

        // bm25 is lower-is-better.
        let raw: Vec<f64> = rows.iter().map(|r| -r.get::<f64, _>("rank_score")).collect();
        let mut results = Vec::with_capacity(rows.len());
        for (row, score) in rows.iter().zip(normalize_scores(&raw)) {
            results.push(ScoredChunk {
                chunk: Arc::new(row_to_chunk(row, None)?),
                score,
            });
        }
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
        let sql = format!(
            r#"
            SELECT {cols}, v.embedding
            FROM chunk_vectors v
            JOIN chunks c ON c.id = v.chunk_id
            WHERE v.dims = ?{types}
            "#,
            cols = CHUNK_COLUMNS,
            types = type_clause(types),
        );
        let mut query = sqlx::query(&sql).bind(embedding.len() as i64);
        for t in types.unwrap_or_default() {
            query = query.bind(t.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut results = Vec::new();
        for row in &rows {
            let blob: Vec<u8> = row.get("embedding");
            let vector = blob_to_vec(&blob);
            let score = similarity_score(embedding, &vector);
            if score > 0.0 {
                results.push(ScoredChunk {
                    chunk: Arc::new(row_to_chunk(row, Some(vector))?),
                    score,
                });
            }
        }
        sort_and_truncate(&mut results, limit);
        Ok(results)
    }

    async fn get_chunk(&self, id: &str) -> Result<Option<Arc<Chunk>>> {
        let sql = format!(
            r#"
            SELECT {cols}, v.embedding
            FROM chunks c
            LEFT JOIN chunk_vectors v ON v.chunk_id = c.id
            WHERE c.id = ?
            "#,
            cols = CHUNK_COLUMNS,
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let blob: Option<Vec<u8>> = row.get("embedding");
                let chunk = row_to_chunk(&row, blob.map(|b| blob_to_vec(&b)))?;
                Ok(Some(Arc::new(chunk)))
            }
            None => Ok(None),
        }
    }

    async fn source_fingerprint(&self, source: &str) -> Result<Option<String>> {
        let fp = sqlx::query_scalar("SELECT fingerprint FROM sources WHERE source = ?")
            .bind(source)
            .fetch_optional(&self.pool)
            .await?;
        Ok(fp)
    }

    async fn replace_source(
        &self,
        source: &str,
        fingerprint: &str,
        chunks: Vec<Chunk>,
    ) -> Result<usize> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunk_vectors WHERE source = ?")
            .bind(source)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks_fts WHERE source = ?")
            .bind(source)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE source = ?")
            .bind(source)
            .execute(&mut *tx)
            .await?;

        for chunk in &chunks {
            let structure_json = chunk
                .structure
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            sqlx::query(
                r#"
                INSERT INTO chunks (id, source, chunk_index, content_type, strategy, text, hash, structure_json)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(source)
            .bind(chunk.index as i64)
            .bind(chunk.content_type.as_str())
            .bind(chunk.strategy.as_str())
            .bind(&chunk.text)
            .bind(&chunk.hash)
            .bind(structure_json)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO chunks_fts (chunk_id, source, content_type, text) VALUES (?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(source)
            .bind(chunk.content_type.as_str())
            .bind(&chunk.text)
            .execute(&mut *tx)
            .await?;

            if let Some(vector) = &chunk.embedding {
                sqlx::query(
                    r#"
                    INSERT INTO chunk_vectors (chunk_id, source, dims, embedding)
                    VALUES (?, ?, ?, ?)
                    ON CONFLICT(chunk_id) DO UPDATE SET
                        source = excluded.source,
                        dims = excluded.dims,
                        embedding = excluded.embedding
                    "#,
                )
                .bind(&chunk.id)
                .bind(source)
                .bind(vector.len() as i64)
                .bind(vec_to_blob(vector))
                .execute(&mut *tx)
                .await?;
            }
        }

        if chunks.is_empty() && fingerprint.is_empty() {
            sqlx::query("DELETE FROM sources WHERE source = ?")
                .bind(source)
                .execute(&mut *tx)
                .await?;
        } else {
            sqlx::query(
                r#"
                INSERT INTO sources (source, fingerprint, chunk_count, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(source) DO UPDATE SET
                    fingerprint = excluded.fingerprint,
                    chunk_count = excluded.chunk_count,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(source)
            .bind(fingerprint)
            .bind(chunks.len() as i64)
            .bind(chrono::Utc::now().timestamp())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(chunks.len())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        let sources: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sources")
            .fetch_one(&self.pool)
            .await?;
        let with_embeddings: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
            .fetch_one(&self.pool)
            .await?;
        let rows = sqlx::query(
            "SELECT content_type, COUNT(*) AS n FROM chunks GROUP BY content_type ORDER BY content_type",
        )
        .fetch_all(&self.pool)
        .await?;

        let by_content_type: BTreeMap<String, usize> = rows
            .iter()
            .map(|r| {
                let n: i64 = r.get("n");
                (r.get::<String, _>("content_type"), n as usize)
            })
            .collect();

        Ok(StoreStats {
            chunks: chunks as usize,
            sources: sources as usize,
            with_embeddings: with_embeddings as usize,
            by_content_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};
    use context_router_core::chunk::make_chunk;

    async fn store() -> SqliteChunkStore {
        let pool = db::connect_memory().await.unwrap();
        migrate::apply(&pool).await.unwrap();
        SqliteChunkStore::new(pool)
    }

    fn chunk(source: &str, index: usize, t: ContentType, text: &str, emb: Option<Vec<f32>>) -> Chunk {
        let mut c = make_chunk(source, index, t, StrategyKind::SemanticSimilarity, text, None);
        c.embedding = emb;
        c
    }

    fn terms(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[tokio::test]
    async fn keyword_search_normalizes_into_unit_range() {
        let store = store().await;
        store
            .replace_source(
                "notes.md",
                "v1",
                vec![
                    chunk("notes.md", 0, ContentType::Documentation, "deploy deploy deploy the service", None),
                    chunk("notes.md", 1, ContentType::Documentation, "deploy once", None),
                    chunk("notes.md", 2, ContentType::Documentation, "nothing relevant", None),
                    chunk("notes.md", 3, ContentType::Documentation, "release checklist", None),
                    chunk("notes.md", 4, ContentType::Documentation, "rollback plan", None),
                ],
            )
            .await
            .unwrap();

        let hits = store.keyword_search(&terms(&["deploy"]), 10, None).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| (0.0..=1.0).contains(&h.score)));
        assert_eq!(hits[0].score, 1.0);
        assert_eq!(hits[0].chunk.index, 0);
    }

    #[tokio::test]
    async fn type_filter_and_vector_search() {
        let store = store().await;
        store
            .replace_source(
                "mixed",
                "v1",
                vec![
                    chunk("mixed", 0, ContentType::Code, "port binding", Some(vec![1.0, 0.0])),
                    chunk("mixed", 1, ContentType::Config, "port = 80", Some(vec![0.9, 0.1])),
                    chunk("mixed", 2, ContentType::Config, "opposite", Some(vec![-1.0, 0.0])),
                ],
            )
            .await
            .unwrap();

        let config_only = [ContentType::Config];
        let kw = store
            .keyword_search(&terms(&["port"]), 10, Some(&config_only))
            .await
            .unwrap();
        assert_eq!(kw.len(), 1);
        assert_eq!(kw[0].chunk.content_type, ContentType::Config);

        let vec = store.vector_search(&[1.0, 0.0], 10, None).await.unwrap();
        assert_eq!(vec.len(), 2);
        assert_eq!(vec[0].chunk.index, 0);
        assert!(vec[0].chunk.embedding.is_some());

        let mismatched = store.vector_search(&[1.0, 0.0, 0.0], 10, None).await.unwrap();
        assert!(mismatched.is_empty());
    }

    #[tokio::test]
    async fn replace_source_supersedes_rows() {
        let store = store().await;
        let first = chunk("a.rs", 0, ContentType::Code, "fn old_name() {}", Some(vec![1.0]));
        let old_id = first.id.clone();
        store.replace_source("a.rs", "v1", vec![first]).await.unwrap();
        store
            .replace_source(
                "a.rs",
                "v2",
                vec![chunk("a.rs", 0, ContentType::Code, "fn new_name() {}", None)],
            )
            .await
            .unwrap();

        assert!(store.get_chunk(&old_id).await.unwrap().is_none());
        assert!(store
            .keyword_search(&terms(&["old_name"]), 10, None)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(store.source_fingerprint("a.rs").await.unwrap().as_deref(), Some("v2"));

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.chunks, 1);
        assert_eq!(stats.sources, 1);
        assert_eq!(stats.with_embeddings, 0);
        assert_eq!(stats.by_content_type.get("code"), Some(&1));
    }

    #[tokio::test]
    async fn structure_survives_storage() {
        let store = store().await;
        let mut c = chunk("doc.md", 0, ContentType::Documentation, "body", None);
        c.structure = Some(ChunkStructure::Section {
            path: vec!["Guide".into(), "Install".into()],
            level: 2,
        });
        let id = c.id.clone();
        store.replace_source("doc.md", "v1", vec![c.clone()]).await.unwrap();
        let back = store.get_chunk(&id).await.unwrap().unwrap();
        assert_eq!(back.structure, c.structure);
        assert_eq!(back.strategy, StrategyKind::SemanticSimilarity);
    }
}
