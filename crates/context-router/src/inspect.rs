//! `ctxr profiles`, `ctxr model`, and `ctxr stats`.

use anyhow::Result;

use context_router_core::profile::AgentProfile;
use context_router_core::ranker::RankingModelState;

use crate::config::Config;
use crate::runtime::Runtime;

fn profile_line(p: &AgentProfile) -> String {
    let types = match &p.content_types {
        Some(types) => types
            .iter()
            .map(|t| t.as_str())
            .collect::<Vec<_>>()
            .join(","),
        None => "all".to_string(),
    };
    format!(
        "{:<18} chunks={:<3} candidates={:<4} chunking={:<21} weights={:.2}/{:.2} types={}",
        p.id,
        p.context_window.max_chunks,
        p.candidate_limit,
        p.chunking.as_str(),
        p.weights.vector,
        p.weights.keyword,
        types
    )
}

pub async fn run_profiles(config: &Config, json: bool) -> Result<()> {
    let rt = Runtime::open(config).await?;
    let profiles = rt.router.registry().list();
    if json {
        let values: Vec<&AgentProfile> = profiles.iter().map(|p| p.as_ref()).collect();
        println!("{}", serde_json::to_string_pretty(&values)?);
    } else {
        for p in &profiles {
            println!("{}", profile_line(p));
        }
    }
    rt.close().await;
    Ok(())
}

fn print_model(model: &RankingModelState) {
    println!("model version: {}", model.version);
    println!("updated at: {}", model.updated_at.to_rfc3339());
    println!("retrieval weight: {:.3}", model.retrieval_weight);
    if model.feature_weights.is_empty() {
        println!("feature weights: (all 1.0)");
    } else {
        println!("feature weights:");
        for (key, w) in &model.feature_weights {
            println!("  {}: {:.4}", key, w);
        }
    }
}

pub async fn run_model(config: &Config, json: bool) -> Result<()> {
    let rt = Runtime::open(config).await?;
    let model = rt.router.model().current();
    if json {
        println!("{}", serde_json::to_string_pretty(model.as_ref())?);
    } else {
        print_model(&model);
        let history = rt.state.model_history().await?;
        if !history.is_empty() {
            println!("persisted versions: {}", history.len());
        }
    }
    rt.close().await;
    Ok(())
}

pub async fn run_stats(config: &Config) -> Result<()> {
    let rt = Runtime::open(config).await?;
    let stats = rt.store.stats().await?;

    println!("sources: {}", stats.sources);
    println!("chunks: {}", stats.chunks);
    println!("with embeddings: {}", stats.with_embeddings);
    println!("by content type:");
    for (t, n) in &stats.by_content_type {
        println!("  {}: {}", t, n);
    }

    rt.close().await;
    Ok(())
}
