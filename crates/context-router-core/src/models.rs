//! Core data models that flow through the retrieval pipeline.
//!
//! Chunks are produced by ingestion and never mutated afterwards; queries,
//! candidates, and feedback events are per-request values.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A retrieval request as received from the transport layer.
#[derive(Debug, Clone, Serialize)]
pub struct Query {
    /// Unique id, echoed back in responses and referenced by feedback.
    pub id: Uuid,
    /// Raw query text.
    pub text: String,
    /// Caller-supplied agent profile hint (e.g. `"code-review"`).
    pub agent_hint: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl Query {
    pub fn new(text: impl Into<String>, agent_hint: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            agent_hint,
            received_at: Utc::now(),
        }
    }

    /// Normalized keyword terms, see [`crate::text::keywords`].
    pub fn keywords(&self) -> Vec<String> {
        crate::text::keywords(&self.text)
    }
}

/// Content-type tag carried by every chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Code,
    Documentation,
    Conversation,
    Config,
    Unknown,
}

impl ContentType {
    pub const ALL: [ContentType; 5] = [
        ContentType::Code,
        ContentType::Documentation,
        ContentType::Conversation,
        ContentType::Config,
        ContentType::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Code => "code",
            ContentType::Documentation => "documentation",
            ContentType::Conversation => "conversation",
            ContentType::Config => "config",
            ContentType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ContentType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown content type: '{}'", s))
    }
}

/// Which chunking strategy produced a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    SemanticFunction,
    HierarchicalSection,
    Thread,
    KeyValue,
    SemanticSimilarity,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 5] = [
        StrategyKind::SemanticFunction,
        StrategyKind::HierarchicalSection,
        StrategyKind::Thread,
        StrategyKind::KeyValue,
        StrategyKind::SemanticSimilarity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::SemanticFunction => "semantic_function",
            StrategyKind::HierarchicalSection => "hierarchical_section",
            StrategyKind::Thread => "thread",
            StrategyKind::KeyValue => "key_value",
            StrategyKind::SemanticSimilarity => "semantic_similarity",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StrategyKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown chunking strategy: '{}'", s))
    }
}

/// Structural metadata recorded by the chunking strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChunkStructure {
    /// A code unit: function, class, struct, impl block, ...
    Symbol {
        symbol_kind: String,
        name: String,
        /// 1-based, inclusive.
        start_line: usize,
        end_line: usize,
    },
    /// A documentation section with its full heading path.
    Section { path: Vec<String>, level: usize },
    /// A window of conversation turns (0-based turn indices, inclusive).
    Turns {
        first: usize,
        last: usize,
        speakers: Vec<String>,
    },
    /// One logical configuration entry.
    Entry { key: String },
}

impl ChunkStructure {
    /// Identifier-like label used for symbol matching (symbol name or config key).
    pub fn label(&self) -> Option<&str> {
        match self {
            ChunkStructure::Symbol { name, .. } if !name.is_empty() => Some(name),
            ChunkStructure::Entry { key } => Some(key),
            _ => None,
        }
    }

    /// Heading path, for documentation sections.
    pub fn section_path(&self) -> Option<&[String]> {
        match self {
            ChunkStructure::Section { path, .. } => Some(path),
            _ => None,
        }
    }
}

/// A bounded unit of source content, indexed and retrieved as one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Deterministic id derived from source, index, and text.
    pub id: String,
    /// Source reference (relative path, URL, thread id).
    pub source: String,
    /// Position within the source, starting at 0.
    pub index: usize,
    pub content_type: ContentType,
    pub strategy: StrategyKind,
    pub text: String,
    /// SHA-256 of `text`.
    pub hash: String,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structure: Option<ChunkStructure>,
}

/// The two retrieval modalities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Vector,
    Keyword,
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Modality::Vector => f.write_str("vector"),
            Modality::Keyword => f.write_str("keyword"),
        }
    }
}

/// A per-query candidate. Not persisted beyond the response.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateResult {
    pub chunk: Arc<Chunk>,
    /// Similarity from the vector sub-search, if the chunk was found there.
    pub vector_score: Option<f64>,
    /// Score from the keyword sub-search, if the chunk was found there.
    pub keyword_score: Option<f64>,
    /// Score after hybrid merging.
    pub merged_score: f64,
    /// Score after contextual ranking; equals `merged_score` before ranking.
    pub final_score: f64,
    /// 1-based position.
    pub rank: usize,
}

/// Strength of an outcome signal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "strength", rename_all = "snake_case")]
pub enum Signal {
    /// The user explicitly accepted or rejected a result.
    Explicit(f64),
    /// Inferred from behaviour (the agent used or ignored a chunk).
    Implicit(f64),
}

impl Signal {
    /// Signal strength clamped to `[0, 1]`; non-finite values count as 0.
    pub fn strength(&self) -> f64 {
        let raw = match self {
            Signal::Explicit(s) | Signal::Implicit(s) => *s,
        };
        if raw.is_finite() {
            raw.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

impl Default for Signal {
    fn default() -> Self {
        Signal::Explicit(1.0)
    }
}

/// A recorded outcome for one query. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEvent {
    pub query_id: Uuid,
    #[serde(default)]
    pub selected: Vec<String>,
    #[serde(default)]
    pub rejected: Vec<String>,
    #[serde(default)]
    pub signal: Signal,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl FeedbackEvent {
    pub fn new(query_id: Uuid, selected: Vec<String>, rejected: Vec<String>, signal: Signal) -> Self {
        Self {
            query_id,
            selected,
            rejected,
            signal,
            timestamp: Utc::now(),
        }
    }
}
