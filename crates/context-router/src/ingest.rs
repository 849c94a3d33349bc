//! Reference ingestion pipeline.
//!
//! Walks a directory tree, routes each file to its chunking strategy,
//! embeds the chunks when a provider is configured, and replaces the file's
//! chunks in the store. Sources are keyed by path relative to the ingest
//! root. A file whose fingerprint (content, chunk size, embedding model) is
//! unchanged since the last run is skipped unless `--full` is given.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use walkdir::WalkDir;

use context_router_core::chunk::{chunk_content, route, ContentDescriptor};

use crate::config::{Config, IngestConfig};
use crate::embedding::embed_chunks;
use crate::runtime::Runtime;

const DEFAULT_EXCLUDES: &[&str] = &["**/.git/**", "**/target/**", "**/node_modules/**"];

#[derive(Debug, Default, Clone, Serialize, PartialEq)]
pub struct IngestReport {
    pub files_seen: usize,
    pub files_indexed: usize,
    pub files_unchanged: usize,
    /// Unreadable or non-UTF-8 files.
    pub files_skipped: usize,
    pub chunks_written: usize,
    pub embeddings_written: usize,
    pub embeddings_failed: usize,
    /// Indexed files per chunking strategy.
    pub strategies: BTreeMap<String, usize>,
}

/// A file selected for ingestion.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceFile {
    pub path: PathBuf,
    /// Relative to the ingest root, `/`-separated.
    pub source: String,
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

/// Files under `root` passing the include and exclude globs, sorted by
/// source. A single file yields itself, keyed by its file name.
pub fn discover(root: &Path, config: &IngestConfig) -> Result<Vec<SourceFile>> {
    if !root.exists() {
        bail!("Ingest path does not exist: {}", root.display());
    }
    if root.is_file() {
        let source = root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        return Ok(vec![SourceFile {
            path: root.to_path_buf(),
            source,
        }]);
    }

    let include_set = build_globset(&config.include_globs)?;
    let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
    excludes.extend(config.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let source = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if exclude_set.is_match(&source) || !include_set.is_match(&source) {
            continue;
        }
        files.push(SourceFile {
            path: path.to_path_buf(),
            source,
        });
    }

    files.sort_by(|a, b| a.source.cmp(&b.source));
    Ok(files)
}

/// Identifies what was indexed: re-chunking or re-embedding is needed when
/// any of these change.
pub fn fingerprint(text: &str, max_tokens: usize, embedding_model: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hasher.update([0u8]);
    hasher.update(max_tokens.to_le_bytes());
    hasher.update([0u8]);
    hasher.update(embedding_model.unwrap_or("none").as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Index everything under `root` into the runtime's store.
pub async fn ingest_path(rt: &Runtime, root: &Path, full: bool) -> Result<IngestReport> {
    let ingest = &rt.config.ingest;
    let files = discover(root, ingest)?;
    let model_name = rt.embedder.as_ref().map(|e| e.model_name().to_string());

    let mut report = IngestReport {
        files_seen: files.len(),
        ..Default::default()
    };

    for file in &files {
        let text = match std::fs::read(&file.path).map(String::from_utf8) {
            Ok(Ok(text)) => text,
            Ok(Err(_)) => {
                debug!(source = %file.source, "skipping non-UTF-8 file");
                report.files_skipped += 1;
                continue;
            }
            Err(e) => {
                debug!(source = %file.source, error = %e, "skipping unreadable file");
                report.files_skipped += 1;
                continue;
            }
        };

        let fp = fingerprint(&text, ingest.max_tokens, model_name.as_deref());
        if !full && rt.store.source_fingerprint(&file.source).await?.as_deref() == Some(fp.as_str())
        {
            report.files_unchanged += 1;
            continue;
        }

        let desc = ContentDescriptor::new(Some(&file.source), &text);
        let strategy = route(&desc);
        let mut chunks = chunk_content(&file.source, &text, &strategy, ingest.max_tokens);

        if let Some(embedder) = &rt.embedder {
            let (ok, failed) =
                embed_chunks(embedder.as_ref(), &mut chunks, rt.config.embedding.batch_size).await;
            report.embeddings_written += ok;
            report.embeddings_failed += failed;
        }

        let written = rt
            .store
            .replace_source(&file.source, &fp, chunks)
            .await
            .with_context(|| format!("Failed to store chunks for {}", file.source))?;
        debug!(source = %file.source, strategy = %strategy.kind(), chunks = written, "indexed");

        report.files_indexed += 1;
        report.chunks_written += written;
        *report
            .strategies
            .entry(strategy.kind().to_string())
            .or_insert(0) += 1;
    }

    info!(
        files = report.files_seen,
        indexed = report.files_indexed,
        unchanged = report.files_unchanged,
        chunks = report.chunks_written,
        "ingest finished"
    );
    Ok(report)
}

pub fn print_report(report: &IngestReport, embeddings_enabled: bool) {
    println!("  files seen: {}", report.files_seen);
    println!("  files indexed: {}", report.files_indexed);
    println!("  files unchanged: {}", report.files_unchanged);
    if report.files_skipped > 0 {
        println!("  files skipped: {}", report.files_skipped);
    }
    println!("  chunks written: {}", report.chunks_written);
    for (strategy, count) in &report.strategies {
        println!("    {}: {} files", strategy, count);
    }
    if embeddings_enabled {
        println!("  embeddings written: {}", report.embeddings_written);
        println!("  embeddings failed: {}", report.embeddings_failed);
    }
}

pub async fn run_ingest(config: &Config, path: &Path, full: bool) -> Result<()> {
    let rt = Runtime::open(config).await?;
    let report = ingest_path(&rt, path, full).await?;

    println!("ingest {}", path.display());
    print_report(&report, rt.embedder.is_some());
    println!("ok");

    rt.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use std::fs;
    use tempfile::TempDir;

    fn write_tree(root: &Path) {
        fs::create_dir_all(root.join("src")).unwrap();
        fs::create_dir_all(root.join("docs")).unwrap();
        fs::create_dir_all(root.join("target/debug")).unwrap();
        fs::write(
            root.join("src/lib.rs"),
            "pub fn parse_config(path: &str) -> Config {\n    load(path)\n}\n\npub struct Config {\n    name: String,\n}\n",
        )
        .unwrap();
        fs::write(
            root.join("docs/guide.md"),
            "# Guide\n\nInstall the router.\n\n## Usage\n\nRun queries.\n",
        )
        .unwrap();
        fs::write(root.join("Cargo.toml"), "[package]\nname = \"demo\"\n\n[dependencies]\nserde = \"1\"\n").unwrap();
        fs::write(root.join("target/debug/junk.rs"), "fn ignored() {}\n").unwrap();
        fs::write(root.join("blob.bin"), [0xff, 0xfe, 0x00, 0x81]).unwrap();
    }

    #[test]
    fn discover_applies_default_excludes_and_sorts() {
        let tmp = TempDir::new().unwrap();
        write_tree(tmp.path());
        let files = discover(tmp.path(), &IngestConfig::default()).unwrap();
        let sources: Vec<_> = files.iter().map(|f| f.source.as_str()).collect();
        assert_eq!(sources, vec!["Cargo.toml", "blob.bin", "docs/guide.md", "src/lib.rs"]);
    }

    #[test]
    fn discover_honors_include_globs() {
        let tmp = TempDir::new().unwrap();
        write_tree(tmp.path());
        let cfg = IngestConfig {
            include_globs: vec!["**/*.md".into()],
            ..Default::default()
        };
        let files = discover(tmp.path(), &cfg).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].source, "docs/guide.md");
    }

    #[test]
    fn fingerprint_tracks_model_and_chunk_size() {
        let a = fingerprint("text", 512, None);
        assert_eq!(a, fingerprint("text", 512, None));
        assert_ne!(a, fingerprint("text", 256, None));
        assert_ne!(a, fingerprint("text", 512, Some("hashing-256")));
        assert_ne!(a, fingerprint("other", 512, None));
    }

    #[tokio::test]
    async fn ingest_routes_each_file_and_skips_unchanged() {
        let tmp = TempDir::new().unwrap();
        write_tree(tmp.path());
        let cfg = parse_config("[store]\nbackend = \"memory\"\n[embedding]\nprovider = \"hashing\"").unwrap();
        let rt = Runtime::open(&cfg).await.unwrap();

        let first = ingest_path(&rt, tmp.path(), false).await.unwrap();
        assert_eq!(first.files_seen, 4);
        assert_eq!(first.files_indexed, 3);
        assert_eq!(first.files_skipped, 1);
        assert_eq!(first.strategies.get("semantic_function"), Some(&1));
        assert_eq!(first.strategies.get("hierarchical_section"), Some(&1));
        assert_eq!(first.strategies.get("key_value"), Some(&1));
        assert_eq!(first.embeddings_written, first.chunks_written);

        let second = ingest_path(&rt, tmp.path(), false).await.unwrap();
        assert_eq!(second.files_indexed, 0);
        assert_eq!(second.files_unchanged, 3);

        let full = ingest_path(&rt, tmp.path(), true).await.unwrap();
        assert_eq!(full.files_indexed, 3);

        let stats = rt.store.stats().await.unwrap();
        assert_eq!(stats.sources, 3);
        assert_eq!(stats.chunks, first.chunks_written);
        rt.close().await;
    }

    #[tokio::test]
    async fn missing_path_is_an_error() {
        let cfg = parse_config("[store]\nbackend = \"memory\"").unwrap();
        let rt = Runtime::open(&cfg).await.unwrap();
        let err = ingest_path(&rt, Path::new("/definitely/not/here"), false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
