//! Content-type router and chunking strategies.
//!
//! [`route`] picks a [`ChunkingStrategy`] for a piece of content, and
//! [`chunk_content`] applies it. Each strategy cuts at the boundaries that
//! matter for its content type and records structural metadata:
//!
//! | Strategy | Content | Boundary |
//! |----------|---------|----------|
//! | `SemanticFunction` | code | function / class declarations |
//! | `HierarchicalSection` | documentation | markdown headings |
//! | `Thread` | conversation | `Speaker:` turns, sliding window |
//! | `KeyValue` | config | top-level entries |
//! | `SemanticSimilarity` | anything else | paragraphs merged by term overlap |
//!
//! Every strategy respects `max_tokens` (4 chars per token). A piece that
//! is still too large is hard-split on whitespace, keeping its structure.
//! Chunking runs at ingestion time, never on the query path.

mod code;
mod keyvalue;
mod paragraph;
mod section;
mod thread;

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::{Chunk, ChunkStructure, ContentType, StrategyKind};

pub use code::Language;
pub use keyvalue::ConfigFormat;

/// Approximate characters-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

pub const DEFAULT_SECTION_DEPTH: usize = 6;
pub const DEFAULT_THREAD_WINDOW: usize = 6;
pub const DEFAULT_THREAD_OVERLAP: usize = 2;
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.2;

/// What the router knows about a piece of content.
#[derive(Debug, Clone, Copy)]
pub struct ContentDescriptor<'a> {
    pub path: Option<&'a str>,
    pub declared_type: Option<ContentType>,
    pub text: &'a str,
}

impl<'a> ContentDescriptor<'a> {
    pub fn new(path: Option<&'a str>, text: &'a str) -> Self {
        Self {
            path,
            declared_type: None,
            text,
        }
    }

    pub fn declared(mut self, content_type: ContentType) -> Self {
        self.declared_type = Some(content_type);
        self
    }

    fn extension(&self) -> Option<String> {
        let path = Path::new(self.path?);
        let name = path.file_name()?.to_str()?;
        if name == ".env" || name.starts_with(".env.") {
            return Some("env".to_string());
        }
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ChunkingStrategy {
    SemanticFunction { language: Language },
    HierarchicalSection { max_depth: usize },
    Thread { window: usize, overlap: usize },
    KeyValue { format: ConfigFormat },
    SemanticSimilarity { threshold: f64 },
}

impl ChunkingStrategy {
    pub fn kind(&self) -> StrategyKind {
        match self {
            ChunkingStrategy::SemanticFunction { .. } => StrategyKind::SemanticFunction,
            ChunkingStrategy::HierarchicalSection { .. } => StrategyKind::HierarchicalSection,
            ChunkingStrategy::Thread { .. } => StrategyKind::Thread,
            ChunkingStrategy::KeyValue { .. } => StrategyKind::KeyValue,
            ChunkingStrategy::SemanticSimilarity { .. } => StrategyKind::SemanticSimilarity,
        }
    }

    /// Content type tagged on chunks this strategy produces.
    pub fn content_type(&self) -> ContentType {
        match self {
            ChunkingStrategy::SemanticFunction { .. } => ContentType::Code,
            ChunkingStrategy::HierarchicalSection { .. } => ContentType::Documentation,
            ChunkingStrategy::Thread { .. } => ContentType::Conversation,
            ChunkingStrategy::KeyValue { .. } => ContentType::Config,
            ChunkingStrategy::SemanticSimilarity { .. } => ContentType::Unknown,
        }
    }

    pub fn fallback() -> Self {
        ChunkingStrategy::SemanticSimilarity {
            threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }

    fn documentation() -> Self {
        ChunkingStrategy::HierarchicalSection {
            max_depth: DEFAULT_SECTION_DEPTH,
        }
    }

    fn conversation() -> Self {
        ChunkingStrategy::Thread {
            window: DEFAULT_THREAD_WINDOW,
            overlap: DEFAULT_THREAD_OVERLAP,
        }
    }
}

/// Pick the chunking strategy for `desc`.
///
/// A declared type wins, then the file extension, then content heuristics.
pub fn route(desc: &ContentDescriptor<'_>) -> ChunkingStrategy {
    let ext = desc.extension();

    if let Some(declared) = desc.declared_type {
        return match declared {
            ContentType::Code => ChunkingStrategy::SemanticFunction {
                language: ext
                    .as_deref()
                    .and_then(Language::from_extension)
                    .unwrap_or(Language::Generic),
            },
            ContentType::Documentation => ChunkingStrategy::documentation(),
            ContentType::Conversation => ChunkingStrategy::conversation(),
            ContentType::Config => ChunkingStrategy::KeyValue {
                format: ext
                    .as_deref()
                    .and_then(ConfigFormat::from_extension)
                    .unwrap_or_else(|| ConfigFormat::sniff(desc.text)),
            },
            ContentType::Unknown => ChunkingStrategy::fallback(),
        };
    }

    if let Some(ext) = ext.as_deref() {
        if let Some(language) = Language::from_extension(ext) {
            return ChunkingStrategy::SemanticFunction { language };
        }
        if let Some(format) = ConfigFormat::from_extension(ext) {
            return ChunkingStrategy::KeyValue { format };
        }
        match ext {
            "md" | "markdown" | "mdx" | "rst" | "adoc" => return ChunkingStrategy::documentation(),
            "chat" | "transcript" => return ChunkingStrategy::conversation(),
            _ => {}
        }
    }

    sniff(desc.text)
}

static HEADING: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^#{1,6}\s+\S").ok());
static KV_LINE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^\s*([\w.-]+\s*[:=]\s*\S|[\w.-]+:\s*$|\[[\w.\-\x22]+\]\s*$|-\s+[\w.-]+:\s)").ok()
});

fn sniff(text: &str) -> ChunkingStrategy {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty())
        .collect();
    if lines.is_empty() {
        return ChunkingStrategy::fallback();
    }

    if thread::looks_like_conversation(&lines) {
        return ChunkingStrategy::conversation();
    }

    let content_lines: Vec<&str> = lines
        .iter()
        .copied()
        .filter(|l| {
            let t = l.trim_start();
            !t.starts_with('#') || t.starts_with("#[")
        })
        .collect();
    let kv = KV_LINE.as_ref().map_or(0, |re| {
        content_lines.iter().filter(|l| re.is_match(l)).count()
    });
    let trimmed = text.trim();
    if trimmed.starts_with('{')
        && trimmed.ends_with('}')
        && serde_json::from_str::<serde_json::Value>(trimmed).is_ok()
    {
        return ChunkingStrategy::KeyValue {
            format: ConfigFormat::Json,
        };
    }
    if kv >= 2 && kv * 10 >= content_lines.len() * 7 {
        return ChunkingStrategy::KeyValue {
            format: ConfigFormat::sniff(text),
        };
    }

    if let Some(re) = HEADING.as_ref() {
        if section::outside_fences(text).any(|l| re.is_match(l)) {
            return ChunkingStrategy::documentation();
        }
    }

    if code::has_declarations(Language::Generic, text) {
        return ChunkingStrategy::SemanticFunction {
            language: Language::Generic,
        };
    }

    ChunkingStrategy::fallback()
}

/// A strategy's output before indexing: one logical unit of content.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Piece {
    pub text: String,
    pub structure: Option<ChunkStructure>,
}

impl Piece {
    pub(crate) fn new(text: impl Into<String>, structure: Option<ChunkStructure>) -> Self {
        Self {
            text: text.into(),
            structure,
        }
    }
}

/// Chunk `text` from `source` with `strategy`.
///
/// Returns chunks with contiguous indices starting at 0. Empty or
/// whitespace-only text yields no chunks.
pub fn chunk_content(
    source: &str,
    text: &str,
    strategy: &ChunkingStrategy,
    max_tokens: usize,
) -> Vec<Chunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;

    let pieces = match *strategy {
        ChunkingStrategy::SemanticFunction { language } => code::split(text, language, max_chars),
        ChunkingStrategy::HierarchicalSection { max_depth } => section::split(text, max_depth),
        ChunkingStrategy::Thread { window, overlap } => thread::split(text, window, overlap),
        ChunkingStrategy::KeyValue { format } => keyvalue::split(text, format),
        ChunkingStrategy::SemanticSimilarity { threshold } => {
            paragraph::split(text, threshold, max_chars)
        }
    };

    let content_type = strategy.content_type();
    let kind = strategy.kind();
    let mut chunks = Vec::new();
    for piece in pieces {
        for part in hard_split(piece.text.trim(), max_chars) {
            chunks.push(make_chunk(
                source,
                chunks.len(),
                content_type,
                kind,
                part,
                piece.structure.clone(),
            ));
        }
    }
    chunks
}

/// Route and chunk in one step.
pub fn chunk_descriptor(source: &str, desc: &ContentDescriptor<'_>, max_tokens: usize) -> Vec<Chunk> {
    chunk_content(source, desc.text, &route(desc), max_tokens)
}

/// Split `text` into pieces of at most `max_chars` bytes, preferring the
/// last newline, then the last space, before the limit.
pub(crate) fn hard_split(text: &str, max_chars: usize) -> Vec<&str> {
    let mut out = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        if remaining.len() <= max_chars {
            out.push(remaining);
            break;
        }
        let limit = at_least_one_char(remaining, snap_to_char_boundary(remaining, max_chars));
        let split_at = remaining[..limit]
            .rfind('\n')
            .or_else(|| remaining[..limit].rfind(' '))
            .map(|pos| pos + 1)
            .unwrap_or(limit);
        let piece = remaining[..split_at].trim();
        if !piece.is_empty() {
            out.push(piece);
        }
        remaining = remaining[split_at..].trim_start();
    }
    out
}

fn at_least_one_char(s: &str, index: usize) -> usize {
    if index == 0 {
        s.char_indices().nth(1).map(|(i, _)| i).unwrap_or(s.len())
    } else {
        index
    }
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn sha256_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update([0u8]);
        }
        hasher.update(part);
    }
    format!("{:x}", hasher.finalize())
}

/// Build a chunk with a deterministic id and a SHA-256 content hash.
pub fn make_chunk(
    source: &str,
    index: usize,
    content_type: ContentType,
    strategy: StrategyKind,
    text: &str,
    structure: Option<ChunkStructure>,
) -> Chunk {
    let index_str = index.to_string();
    let mut id = sha256_hex(&[source.as_bytes(), index_str.as_bytes(), text.as_bytes()]);
    id.truncate(32);

    Chunk {
        id,
        source: source.to_string(),
        index,
        content_type,
        strategy,
        text: text.to_string(),
        hash: sha256_hex(&[text.as_bytes()]),
        embedding: None,
        structure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routed(path: Option<&str>, text: &str) -> ChunkingStrategy {
        route(&ContentDescriptor::new(path, text))
    }

    #[test]
    fn declared_type_wins_over_extension() {
        let desc = ContentDescriptor::new(Some("notes.rs"), "fn main() {}")
            .declared(ContentType::Documentation);
        assert_eq!(route(&desc).kind(), StrategyKind::HierarchicalSection);
    }

    #[test]
    fn extension_routing() {
        assert_eq!(
            routed(Some("src/lib.rs"), ""),
            ChunkingStrategy::SemanticFunction { language: Language::Rust }
        );
        assert_eq!(routed(Some("docs/guide.md"), "").kind(), StrategyKind::HierarchicalSection);
        assert_eq!(
            routed(Some("deploy/values.yaml"), ""),
            ChunkingStrategy::KeyValue { format: ConfigFormat::Yaml }
        );
        assert_eq!(
            routed(Some(".env.production"), ""),
            ChunkingStrategy::KeyValue { format: ConfigFormat::Env }
        );
        assert_eq!(routed(Some("logs/standup.chat"), "").kind(), StrategyKind::Thread);
    }

    #[test]
    fn heuristics_without_extension() {
        let chat = "Alice: did the deploy finish?\nBob: yes, an hour ago\nAlice: great";
        assert_eq!(routed(None, chat).kind(), StrategyKind::Thread);

        let kv = "host = \"localhost\"\nport = 8080\n[database]\nurl = \"pg://\"";
        assert_eq!(
            routed(Some("settings"), kv),
            ChunkingStrategy::KeyValue { format: ConfigFormat::Toml }
        );

        let doc = "# Title\n\nSome prose here.\n\n## Part\n\nMore prose.";
        assert_eq!(routed(None, doc).kind(), StrategyKind::HierarchicalSection);

        let code = "def handler(event):\n    return event\n";
        assert_eq!(routed(None, code).kind(), StrategyKind::SemanticFunction);

        assert_eq!(routed(None, "just some words.\n\nand more words."), ChunkingStrategy::fallback());
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(chunk_content("a.md", "", &ChunkingStrategy::fallback(), 100).is_empty());
        assert!(chunk_content("a.md", "  \n\n ", &ChunkingStrategy::fallback(), 100).is_empty());
    }

    #[test]
    fn chunks_respect_max_tokens_and_are_contiguous() {
        let text = (0..40)
            .map(|i| format!("word{} lorem ipsum dolor sit amet", i))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = chunk_content("big.txt", &text, &ChunkingStrategy::fallback(), 10);
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i);
            assert!(c.text.len() <= 40, "chunk {} has {} bytes", i, c.text.len());
        }
    }

    #[test]
    fn hard_split_handles_multibyte_text() {
        let text = "┌──────────────────┐ │ Hello world │ └──────────────────┘";
        let parts = hard_split(text, 7);
        assert!(!parts.is_empty());
        assert_eq!(parts.concat().replace(' ', ""), text.replace(' ', ""));
    }

    #[test]
    fn chunk_ids_are_deterministic_and_source_scoped() {
        let text = "Alpha.\n\nBeta.";
        let a = chunk_content("doc1", text, &ChunkingStrategy::fallback(), 700);
        let b = chunk_content("doc1", text, &ChunkingStrategy::fallback(), 700);
        let c = chunk_content("doc2", text, &ChunkingStrategy::fallback(), 700);
        assert_eq!(a, b);
        assert_eq!(a[0].id.len(), 32);
        assert_ne!(a[0].id, c[0].id);
        assert_eq!(a[0].hash, c[0].hash);
    }
}
