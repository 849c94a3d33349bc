//! `ctxr query` and `ctxr classify`.
//!
//! `query` runs the full pipeline once: classify, look up the profile,
//! embed, retrieve, rank. A retrieval failure is reported as
//! "retrieval unavailable" and exits non-zero; an empty result list is a
//! normal outcome and prints `No results.`.

use anyhow::{bail, Result};

use context_router_core::classifier::{Classification, ClassificationMethod};
use context_router_core::models::{CandidateResult, ChunkStructure, Query};
use context_router_core::ranker::feature_activations;
use context_router_core::{RankedResponse, RetrievalError};

use crate::config::Config;
use crate::runtime::Runtime;

const SNIPPET_CHARS: usize = 240;

pub fn method_label(method: ClassificationMethod) -> &'static str {
    match method {
        ClassificationMethod::Hint => "hint",
        ClassificationMethod::Inferred => "inferred",
        ClassificationMethod::Default => "default",
    }
}

/// First `SNIPPET_CHARS` characters on one line.
fn snippet(text: &str) -> String {
    let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= SNIPPET_CHARS {
        flat
    } else {
        let cut: String = flat.chars().take(SNIPPET_CHARS).collect();
        format!("{}...", cut)
    }
}

fn location(result: &CandidateResult) -> String {
    match &result.chunk.structure {
        Some(ChunkStructure::Symbol {
            symbol_kind,
            name,
            start_line,
            end_line,
        }) => format!(
            "{}:{}-{} ({} {})",
            result.chunk.source, start_line, end_line, symbol_kind, name
        ),
        Some(ChunkStructure::Section { path, .. }) => {
            format!("{} § {}", result.chunk.source, path.join(" > "))
        }
        Some(ChunkStructure::Turns { first, last, .. }) => {
            format!("{} (turns {}-{})", result.chunk.source, first, last)
        }
        Some(ChunkStructure::Entry { key }) => format!("{} [{}]", result.chunk.source, key),
        None => format!("{} #{}", result.chunk.source, result.chunk.index),
    }
}

fn fmt_score(score: Option<f64>) -> String {
    score.map_or_else(|| "-".to_string(), |s| format!("{:.3}", s))
}

fn print_classification(c: &Classification) {
    println!(
        "profile: {} ({}, confidence {:.2})",
        c.profile_id,
        method_label(c.method),
        c.confidence
    );
}

fn print_response(rt: &Runtime, query: &Query, resp: &RankedResponse, explain: bool) {
    print_classification(&resp.classification);
    println!(
        "query: {}  mode: {}  model: v{}  candidates: {}  elapsed: {}ms",
        resp.query_id,
        serde_json::to_value(resp.mode)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default(),
        resp.model_version,
        resp.candidates_considered,
        resp.elapsed_ms
    );

    if resp.results.is_empty() {
        println!("No results.");
        return;
    }

    let profile = rt.router.registry().get(&resp.profile_id);
    let keywords = query.keywords();
    for r in &resp.results {
        println!();
        println!(
            "{}. [{:.3}] {} ({}, {})",
            r.rank,
            r.final_score,
            location(r),
            r.chunk.content_type,
            r.chunk.strategy
        );
        println!("   id: {}", r.chunk.id);
        if explain {
            println!(
                "   vector: {}  keyword: {}  merged: {:.3}",
                fmt_score(r.vector_score),
                fmt_score(r.keyword_score),
                r.merged_score
            );
            for a in feature_activations(&r.chunk, &keywords, &profile) {
                if a.value > 0.0 {
                    println!("   feature {}: {:.3} x {:.2}", a.key, a.value, a.decay);
                }
            }
        }
        println!("   {}", snippet(&r.chunk.text));
    }
}

pub async fn run_query(
    config: &Config,
    text: &str,
    agent: Option<String>,
    explain: bool,
    json: bool,
) -> Result<()> {
    let rt = Runtime::open(config).await?;
    let query = Query::new(text, agent);

    let outcome = rt.router.query(query.clone()).await;
    let resp = match outcome {
        Ok(resp) => resp,
        Err(e @ RetrievalError::RetrievalUnavailable { .. }) => {
            rt.close().await;
            bail!("retrieval unavailable: {}", e);
        }
        Err(e) => {
            rt.close().await;
            bail!("{}", e);
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&resp)?);
    } else {
        print_response(&rt, &query, &resp, explain);
    }

    rt.close().await;
    Ok(())
}

pub async fn run_classify(config: &Config, text: &str, agent: Option<&str>) -> Result<()> {
    let rt = Runtime::open(config).await?;
    let classification = rt.router.classifier().classify(text, agent);
    print_classification(&classification);
    rt.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use context_router_core::chunk::make_chunk;
    use context_router_core::models::{ContentType, StrategyKind};
    use std::sync::Arc;

    fn candidate(structure: Option<ChunkStructure>) -> CandidateResult {
        let mut chunk = make_chunk(
            "src/lib.rs",
            3,
            ContentType::Code,
            StrategyKind::SemanticFunction,
            "fn main() {}",
            None,
        );
        chunk.structure = structure;
        CandidateResult {
            chunk: Arc::new(chunk),
            vector_score: Some(0.5),
            keyword_score: None,
            merged_score: 0.5,
            final_score: 0.5,
            rank: 1,
        }
    }

    #[test]
    fn snippet_flattens_and_truncates() {
        assert_eq!(snippet("a\n  b\tc"), "a b c");
        let long = "x ".repeat(400);
        let s = snippet(&long);
        assert!(s.ends_with("..."));
        assert_eq!(s.chars().count(), SNIPPET_CHARS + 3);
    }

    #[test]
    fn location_describes_structure() {
        assert_eq!(location(&candidate(None)), "src/lib.rs #3");
        let sym = ChunkStructure::Symbol {
            symbol_kind: "fn".into(),
            name: "main".into(),
            start_line: 1,
            end_line: 2,
        };
        assert_eq!(location(&candidate(Some(sym))), "src/lib.rs:1-2 (fn main)");
        let section = ChunkStructure::Section {
            path: vec!["Guide".into(), "Usage".into()],
            level: 2,
        };
        assert_eq!(location(&candidate(Some(section))), "src/lib.rs § Guide > Usage");
    }

    #[test]
    fn scores_render_dash_when_absent() {
        assert_eq!(fmt_score(None), "-");
        assert_eq!(fmt_score(Some(0.6789)), "0.679");
    }
}
