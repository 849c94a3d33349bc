//! Configuration parsing and validation.
//!
//! Everything is read from one TOML file (`--config`, default
//! `./config/ctxr.toml`). Every section is optional; missing keys take
//! their defaults. [`load_config`] validates the result and bails with a
//! descriptive message on the first problem.
//!
//! ```toml
//! [store]
//! backend = "sqlite"
//! path = "./data/ctxr.sqlite"
//!
//! [retrieval]
//! subsearch_timeout_ms = 150
//!
//! [embedding]
//! provider = "hashing"
//! dims = 256
//!
//! [profiles.code-completion.context_window]
//! max_chunks = 8
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use context_router_core::feedback::{AdaptationSettings, ImpressionSettings, UpdateRule};
use context_router_core::profile::{builtin_profiles, AgentProfile};
use context_router_core::retrieval::RetrievalSettings;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub retrieval: RetrievalConfig,
    pub classifier: ClassifierConfig,
    pub embedding: EmbeddingConfig,
    pub feedback: FeedbackConfig,
    pub ingest: IngestConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    /// Per-profile overrides, merged over the built-in profile of the same
    /// id. Unknown ids must be complete profiles.
    pub profiles: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            path: PathBuf::from("./data/ctxr.sqlite"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub subsearch_timeout_ms: u64,
    /// When set, replaces `candidate_limit` on every built-in profile.
    pub candidate_limit: Option<usize>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            subsearch_timeout_ms: 150,
            candidate_limit: None,
        }
    }
}

impl RetrievalConfig {
    pub fn settings(&self) -> RetrievalSettings {
        RetrievalSettings {
            subsearch_timeout: Duration::from_millis(self.subsearch_timeout_ms),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ClassifierConfig {
    pub min_confidence: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            min_confidence: context_router_core::pipeline::DEFAULT_MIN_CONFIDENCE,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `disabled`, `hashing`, or `openai`.
    pub provider: String,
    pub model: Option<String>,
    pub dims: Option<usize>,
    pub batch_size: usize,
    pub max_retries: u32,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FeedbackConfig {
    pub enabled: bool,
    pub channel_capacity: usize,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub sample_rate: f64,
    pub impression_capacity: u64,
    pub impression_ttl_secs: u64,
    /// `frequency` or `pairwise`.
    pub rule: String,
    pub learning_rate: f64,
    pub l2: f64,
    pub max_weight: f64,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channel_capacity: 1024,
            batch_size: 64,
            flush_interval_ms: 30_000,
            sample_rate: 1.0,
            impression_capacity: 10_000,
            impression_ttl_secs: 3600,
            rule: "frequency".to_string(),
            learning_rate: 0.05,
            l2: 0.01,
            max_weight: 5.0,
        }
    }
}

impl FeedbackConfig {
    pub fn update_rule(&self) -> Result<UpdateRule> {
        match self.rule.as_str() {
            "frequency" => Ok(UpdateRule::Frequency {
                learning_rate: self.learning_rate,
            }),
            "pairwise" => Ok(UpdateRule::Pairwise {
                learning_rate: self.learning_rate,
                l2: self.l2,
            }),
            other => bail!(
                "Unknown feedback rule: '{}'. Must be frequency or pairwise.",
                other
            ),
        }
    }

    pub fn adaptation_settings(&self) -> Result<AdaptationSettings> {
        Ok(AdaptationSettings {
            batch_size: self.batch_size,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            rule: self.update_rule()?,
            max_weight: self.max_weight,
        })
    }

    pub fn impression_settings(&self) -> ImpressionSettings {
        ImpressionSettings {
            capacity: self.impression_capacity,
            ttl: Duration::from_secs(self.impression_ttl_secs),
            sample_rate: self.sample_rate,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IngestConfig {
    pub max_tokens: usize,
    pub include_globs: Vec<String>,
    pub exclude_globs: Vec<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            include_globs: vec!["**/*".to_string()],
            exclude_globs: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7331".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Built-ins with `[retrieval].candidate_limit` and `[profiles.*]`
    /// applied, validated.
    pub fn effective_profiles(&self) -> Result<Vec<AgentProfile>> {
        let mut profiles: BTreeMap<String, AgentProfile> = builtin_profiles()
            .into_iter()
            .map(|mut p| {
                if let Some(limit) = self.retrieval.candidate_limit {
                    p.candidate_limit = limit.max(p.context_window.max_chunks);
                }
                (p.id.clone(), p)
            })
            .collect();

        for (id, overrides) in &self.profiles {
            let mut merged = match profiles.get(id) {
                Some(base) => {
                    let mut value = toml::Value::try_from(base)
                        .with_context(|| format!("Failed to serialize profile '{}'", id))?;
                    merge_toml(&mut value, overrides);
                    value
                }
                None => overrides.clone(),
            };
            match &mut merged {
                toml::Value::Table(table) => {
                    table.insert("id".to_string(), toml::Value::String(id.clone()));
                }
                _ => bail!("[profiles.{}] must be a table", id),
            }
            let profile: AgentProfile = merged
                .try_into()
                .with_context(|| format!("Invalid [profiles.{}]", id))?;
            profile
                .validate()
                .with_context(|| format!("Invalid [profiles.{}]", id))?;
            profiles.insert(id.clone(), profile);
        }

        Ok(profiles.into_values().collect())
    }
}

/// Deep-merge `overlay` into `base`: tables merge key by key, everything
/// else is replaced.
fn merge_toml(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(key) {
                    Some(existing) => merge_toml(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

fn validate(config: &Config) -> Result<()> {
    if config.ingest.max_tokens == 0 {
        bail!("ingest.max_tokens must be > 0");
    }
    if config.retrieval.subsearch_timeout_ms == 0 {
        bail!("retrieval.subsearch_timeout_ms must be > 0");
    }
    if config.retrieval.candidate_limit == Some(0) {
        bail!("retrieval.candidate_limit must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.classifier.min_confidence) {
        bail!("classifier.min_confidence must be in [0.0, 1.0]");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "hashing" => {}
        "openai" => {
            if config.embedding.model.is_none() {
                bail!("embedding.model must be specified when provider is 'openai'");
            }
            if config.embedding.dims.unwrap_or(0) == 0 {
                bail!("embedding.dims must be > 0 when provider is 'openai'");
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hashing, or openai.",
            other
        ),
    }
    if config.embedding.dims == Some(0) {
        bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }

    let fb = &config.feedback;
    fb.update_rule()?;
    if fb.channel_capacity == 0 || fb.batch_size == 0 {
        bail!("feedback.channel_capacity and feedback.batch_size must be > 0");
    }
    if fb.flush_interval_ms == 0 {
        bail!("feedback.flush_interval_ms must be > 0");
    }
    if !(0.0..=1.0).contains(&fb.sample_rate) {
        bail!("feedback.sample_rate must be in [0.0, 1.0]");
    }
    if !(fb.learning_rate.is_finite() && fb.learning_rate > 0.0) {
        bail!("feedback.learning_rate must be > 0");
    }
    if !(fb.l2.is_finite() && fb.l2 >= 0.0) {
        bail!("feedback.l2 must be >= 0");
    }
    if !(fb.max_weight.is_finite() && fb.max_weight > 0.0) {
        bail!("feedback.max_weight must be > 0");
    }

    config.effective_profiles()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let cfg = parse_config("").unwrap();
        assert_eq!(cfg.store.backend, StoreBackend::Sqlite);
        assert_eq!(cfg.retrieval.subsearch_timeout_ms, 150);
        assert!(!cfg.embedding.is_enabled());
        assert_eq!(cfg.effective_profiles().unwrap().len(), builtin_profiles().len());
    }

    #[test]
    fn partial_profile_override_merges_over_builtin() {
        let cfg = parse_config(
            r#"
            [profiles.code-completion.context_window]
            max_chunks = 3

            [profiles.code-completion.weights]
            vector = 0.9
            "#,
        )
        .unwrap();
        let profiles = cfg.effective_profiles().unwrap();
        let cc = profiles.iter().find(|p| p.id == "code-completion").unwrap();
        assert_eq!(cc.context_window.max_chunks, 3);
        assert_eq!(cc.context_window.max_chars, Some(6000));
        assert_eq!(cc.weights.vector, 0.9);
        assert_eq!(cc.weights.keyword, 0.3);
    }

    #[test]
    fn new_profile_must_be_complete() {
        let err = parse_config(
            r#"
            [profiles.security]
            description = "missing everything else"
            "#,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("profiles.security"));

        let cfg = parse_config(
            r#"
            [profiles.security]
            context_window = { max_chunks = 4 }
            candidate_limit = 20
            chunking = "semantic_function"
            priority_features = ["content_type:code", "symbol_match"]
            weights = { vector = 0.5, keyword = 0.5 }
            signature = { keywords = ["cve", "vulnerability"] }
            "#,
        )
        .unwrap();
        let profiles = cfg.effective_profiles().unwrap();
        assert!(profiles.iter().any(|p| p.id == "security"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(parse_config("[embedding]\nprovider = \"magic\"").is_err());
        assert!(parse_config("[embedding]\nprovider = \"openai\"").is_err());
        assert!(parse_config("[feedback]\nrule = \"genetic\"").is_err());
        assert!(parse_config("[feedback]\nflush_interval_ms = 0").is_err());
        assert!(parse_config("[ingest]\nmax_tokens = 0").is_err());
        assert!(parse_config("[profiles.devops.context_window]\nmax_chunks = 0").is_err());
    }

    #[test]
    fn candidate_limit_applies_to_builtins() {
        let cfg = parse_config("[retrieval]\ncandidate_limit = 2").unwrap();
        for p in cfg.effective_profiles().unwrap() {
            assert_eq!(p.candidate_limit, p.context_window.max_chunks.max(2));
        }
    }
}
