//! Agent profiles and the profile registry.
//!
//! An [`AgentProfile`] is a named configuration bundle: how many chunks an
//! agent can take, which content it wants, which features rank first, and
//! how vector and keyword scores are weighted.
//!
//! The [`ProfileRegistry`] serves profiles from one [`SnapshotCell`]. An
//! upsert builds a new profile set and swaps it in whole, so an in-flight
//! lookup sees either the old or the new profile, never a blend.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RetrievalError, RetrievalResult};
use crate::models::{ContentType, StrategyKind};
use crate::snapshot::SnapshotCell;

/// Id of the fallback profile used when no other profile applies.
pub const DEFAULT_PROFILE_ID: &str = "unclassified";

/// Budget of chunks returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextWindow {
    /// Ceiling on the number of ranked results.
    pub max_chunks: usize,
    /// Optional ceiling on the total characters of ranked results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_chars: Option<usize>,
}

/// Hybrid merge weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureWeights {
    pub vector: f64,
    pub keyword: f64,
    /// Fraction removed from the score of a chunk found by only one sub-search.
    #[serde(default = "default_single_modality_penalty")]
    pub single_modality_penalty: f64,
}

fn default_single_modality_penalty() -> f64 {
    0.15
}

/// A ranking feature the profile cares about, in priority order.
///
/// Written in config as a string: `"content_type:code"`, `"symbol_match"`, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PriorityFeature {
    /// The chunk has this content type.
    ContentType(ContentType),
    /// The chunk was produced by the profile's preferred chunking strategy.
    PreferredStrategy,
    /// The chunk carries structural metadata (symbol, section, entry).
    StructuralBoundary,
    /// Query keywords appear in the chunk's symbol name or config key.
    SymbolMatch,
    /// Query keywords appear in the chunk's heading path.
    SectionMatch,
    /// Shorter chunks score higher.
    Brevity,
}

impl PriorityFeature {
    /// Stable key used for ranking-model weights.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for PriorityFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriorityFeature::ContentType(t) => write!(f, "content_type:{}", t),
            PriorityFeature::PreferredStrategy => f.write_str("preferred_strategy"),
            PriorityFeature::StructuralBoundary => f.write_str("structural_boundary"),
            PriorityFeature::SymbolMatch => f.write_str("symbol_match"),
            PriorityFeature::SectionMatch => f.write_str("section_match"),
            PriorityFeature::Brevity => f.write_str("brevity"),
        }
    }
}

impl FromStr for PriorityFeature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(t) = s.strip_prefix("content_type:") {
            return t
                .parse::<ContentType>()
                .map(PriorityFeature::ContentType)
                .map_err(|e| e.to_string());
        }
        match s {
            "preferred_strategy" => Ok(PriorityFeature::PreferredStrategy),
            "structural_boundary" => Ok(PriorityFeature::StructuralBoundary),
            "symbol_match" => Ok(PriorityFeature::SymbolMatch),
            "section_match" => Ok(PriorityFeature::SectionMatch),
            "brevity" => Ok(PriorityFeature::Brevity),
            other => Err(format!("unknown priority feature: '{}'", other)),
        }
    }
}

impl TryFrom<String> for PriorityFeature {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PriorityFeature> for String {
    fn from(f: PriorityFeature) -> Self {
        f.to_string()
    }
}

/// Structural cues the classifier can look for in query text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructuralCue {
    CodeSyntax,
    StackTrace,
    ConfigSyntax,
    MarkdownSyntax,
    Question,
}

/// Per-profile classification signature.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub cues: Vec<StructuralCue>,
}

impl Signature {
    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty() && self.cues.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub context_window: ContextWindow,
    /// Ceiling on candidates fetched by each sub-search.
    pub candidate_limit: usize,
    /// Chunking strategy whose output this agent prefers.
    pub chunking: StrategyKind,
    #[serde(default)]
    pub priority_features: Vec<PriorityFeature>,
    pub weights: FeatureWeights,
    /// Restrict retrieval to these content types (`None` = all).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_types: Option<Vec<ContentType>>,
    #[serde(default)]
    pub signature: Signature,
}

impl AgentProfile {
    pub fn validate(&self) -> RetrievalResult<()> {
        let invalid = |reason: String| Err(RetrievalError::InvalidProfile { reason });

        if self.id.trim().is_empty() {
            return invalid("profile id must not be empty".to_string());
        }
        if self.context_window.max_chunks == 0 {
            return invalid(format!("{}: context_window.max_chunks must be >= 1", self.id));
        }
        if self.context_window.max_chars == Some(0) {
            return invalid(format!("{}: context_window.max_chars must be >= 1", self.id));
        }
        if self.candidate_limit < self.context_window.max_chunks {
            return invalid(format!(
                "{}: candidate_limit ({}) must be >= max_chunks ({})",
                self.id, self.candidate_limit, self.context_window.max_chunks
            ));
        }
        let w = &self.weights;
        for (name, value) in [("vector", w.vector), ("keyword", w.keyword)] {
            if !value.is_finite() || value < 0.0 {
                return invalid(format!(
                    "{}: weights.{} must be finite and >= 0",
                    self.id, name
                ));
            }
        }
        if w.vector == 0.0 && w.keyword == 0.0 {
            return invalid(format!("{}: weights must not both be zero", self.id));
        }
        if !(0.0..1.0).contains(&w.single_modality_penalty) {
            return invalid(format!(
                "{}: weights.single_modality_penalty must be in [0, 1)",
                self.id
            ));
        }
        if let Some(types) = &self.content_types {
            if types.is_empty() {
                return invalid(format!(
                    "{}: content_types must be omitted or non-empty",
                    self.id
                ));
            }
        }
        Ok(())
    }

    /// Whether retrieval for this profile may return `t`.
    pub fn allows(&self, t: ContentType) -> bool {
        self.content_types
            .as_ref()
            .map_or(true, |types| types.contains(&t))
    }
}

fn profile(
    id: &str,
    description: &str,
    window: (usize, Option<usize>),
    candidate_limit: usize,
    chunking: StrategyKind,
    priority_features: Vec<PriorityFeature>,
    weights: (f64, f64, f64),
    content_types: Option<Vec<ContentType>>,
    keywords: &[&str],
    cues: Vec<StructuralCue>,
) -> AgentProfile {
    AgentProfile {
        id: id.to_string(),
        description: description.to_string(),
        context_window: ContextWindow {
            max_chunks: window.0,
            max_chars: window.1,
        },
        candidate_limit,
        chunking,
        priority_features,
        weights: FeatureWeights {
            vector: weights.0,
            keyword: weights.1,
            single_modality_penalty: weights.2,
        },
        content_types,
        signature: Signature {
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            cues,
        },
    }
}

/// The profiles shipped with the router. Config may override any of them.
pub fn builtin_profiles() -> Vec<AgentProfile> {
    use PriorityFeature::*;
    use StructuralCue::*;

    vec![
        profile(
            DEFAULT_PROFILE_ID,
            "Generic assistant; no agent-specific shaping",
            (10, None),
            40,
            StrategyKind::SemanticSimilarity,
            vec![],
            (0.5, 0.5, 0.15),
            None,
            &[],
            vec![],
        ),
        profile(
            "code-completion",
            "Inline completion: few, short, code-only chunks",
            (5, Some(6_000)),
            30,
            StrategyKind::SemanticFunction,
            vec![
                ContentType(crate::models::ContentType::Code),
                SymbolMatch,
                Brevity,
                StructuralBoundary,
            ],
            (0.7, 0.3, 0.2),
            Some(vec![crate::models::ContentType::Code]),
            &[
                "complete", "completion", "implement", "function", "fn", "method", "class",
                "struct", "impl", "return", "signature", "snippet",
            ],
            vec![CodeSyntax],
        ),
        profile(
            "code-review",
            "Review and debugging: code with surrounding docs",
            (12, None),
            48,
            StrategyKind::SemanticFunction,
            vec![
                ContentType(crate::models::ContentType::Code),
                StructuralBoundary,
                SymbolMatch,
                ContentType(crate::models::ContentType::Documentation),
            ],
            (0.5, 0.5, 0.15),
            None,
            &[
                "review", "refactor", "bug", "fix", "error", "panic", "exception", "crash",
                "diff", "regression", "lint", "unsafe", "failing",
            ],
            vec![StackTrace, CodeSyntax],
        ),
        profile(
            "documentation",
            "Explanations and guides: section-shaped documentation",
            (8, Some(12_000)),
            40,
            StrategyKind::HierarchicalSection,
            vec![
                ContentType(crate::models::ContentType::Documentation),
                SectionMatch,
                StructuralBoundary,
            ],
            (0.6, 0.4, 0.15),
            None,
            &[
                "docs", "documentation", "explain", "guide", "readme", "overview", "tutorial",
                "example", "usage", "architecture", "describe",
            ],
            vec![Question, MarkdownSyntax],
        ),
        profile(
            "devops",
            "Deployment and configuration work",
            (8, None),
            32,
            StrategyKind::KeyValue,
            vec![
                ContentType(crate::models::ContentType::Config),
                SymbolMatch,
                ContentType(crate::models::ContentType::Code),
            ],
            (0.4, 0.6, 0.1),
            Some(vec![
                crate::models::ContentType::Config,
                crate::models::ContentType::Code,
                crate::models::ContentType::Documentation,
            ]),
            &[
                "deploy", "deployment", "config", "configuration", "env", "environment",
                "docker", "kubernetes", "k8s", "ci", "pipeline", "yaml", "toml", "helm",
                "terraform", "secret", "port",
            ],
            vec![ConfigSyntax],
        ),
        profile(
            "conversation",
            "Recall of earlier discussions and decisions",
            (6, None),
            30,
            StrategyKind::Thread,
            vec![
                ContentType(crate::models::ContentType::Conversation),
                PreferredStrategy,
            ],
            (0.6, 0.4, 0.15),
            Some(vec![
                crate::models::ContentType::Conversation,
                crate::models::ContentType::Documentation,
            ]),
            &[
                "discussed", "discussion", "conversation", "thread", "said", "meeting",
                "decided", "decision", "chat", "earlier", "mentioned",
            ],
            vec![],
        ),
    ]
}

fn builtin_default() -> AgentProfile {
    builtin_profiles()
        .into_iter()
        .find(|p| p.id == DEFAULT_PROFILE_ID)
        .unwrap_or_else(|| {
            profile(
                DEFAULT_PROFILE_ID,
                "",
                (10, None),
                40,
                StrategyKind::SemanticSimilarity,
                vec![],
                (0.5, 0.5, 0.15),
                None,
                &[],
                vec![],
            )
        })
}

/// One consistent version of every registered profile.
#[derive(Debug, Clone)]
pub struct ProfileSet {
    pub version: u64,
    default: Arc<AgentProfile>,
    profiles: BTreeMap<String, Arc<AgentProfile>>,
}

impl ProfileSet {
    pub fn get(&self, id: &str) -> Option<&Arc<AgentProfile>> {
        self.profiles.get(id)
    }

    pub fn default_profile(&self) -> &Arc<AgentProfile> {
        &self.default
    }

    /// Profiles ordered by id.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<AgentProfile>> {
        self.profiles.values()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    fn with(&self, profile: AgentProfile) -> ProfileSet {
        let profile = Arc::new(profile);
        let mut profiles = self.profiles.clone();
        let default = if profile.id == DEFAULT_PROFILE_ID {
            Arc::clone(&profile)
        } else {
            Arc::clone(&self.default)
        };
        profiles.insert(profile.id.clone(), profile);
        ProfileSet {
            version: self.version + 1,
            default,
            profiles,
        }
    }
}

/// Single-writer, many-reader store of agent profiles.
pub struct ProfileRegistry {
    cell: SnapshotCell<ProfileSet>,
}

impl ProfileRegistry {
    /// Build a registry from `profiles`, adding the built-in default
    /// profile when none is given.
    pub fn new(profiles: impl IntoIterator<Item = AgentProfile>) -> RetrievalResult<Self> {
        let mut map = BTreeMap::new();
        for p in profiles {
            p.validate()?;
            map.insert(p.id.clone(), Arc::new(p));
        }
        let default = match map.get(DEFAULT_PROFILE_ID) {
            Some(p) => Arc::clone(p),
            None => {
                let p = Arc::new(builtin_default());
                map.insert(p.id.clone(), Arc::clone(&p));
                p
            }
        };
        Ok(Self {
            cell: SnapshotCell::new(ProfileSet {
                version: 1,
                default,
                profiles: map,
            }),
        })
    }

    /// Registry holding the built-in profiles.
    pub fn with_builtins() -> Self {
        let map: BTreeMap<String, Arc<AgentProfile>> = builtin_profiles()
            .into_iter()
            .map(|p| (p.id.clone(), Arc::new(p)))
            .collect();
        let default = map
            .get(DEFAULT_PROFILE_ID)
            .cloned()
            .unwrap_or_else(|| Arc::new(builtin_default()));
        Self {
            cell: SnapshotCell::new(ProfileSet {
                version: 1,
                default,
                profiles: map,
            }),
        }
    }

    /// Look up a profile, failing with [`RetrievalError::ProfileNotFound`].
    pub fn lookup(&self, id: &str) -> RetrievalResult<Arc<AgentProfile>> {
        self.cell
            .load()
            .get(id)
            .cloned()
            .ok_or_else(|| RetrievalError::ProfileNotFound(id.to_string()))
    }

    /// Look up a profile, falling back to the default profile.
    pub fn get(&self, id: &str) -> Arc<AgentProfile> {
        let snapshot = self.cell.load();
        match snapshot.get(id) {
            Some(p) => Arc::clone(p),
            None => {
                debug!(
                    error = %RetrievalError::ProfileNotFound(id.to_string()),
                    "falling back to default profile"
                );
                Arc::clone(snapshot.default_profile())
            }
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.cell.load().get(id).is_some()
    }

    pub fn default_profile(&self) -> Arc<AgentProfile> {
        Arc::clone(self.cell.load().default_profile())
    }

    /// Insert or wholesale-replace a profile. Returns the new set version.
    pub fn upsert(&self, profile: AgentProfile) -> RetrievalResult<u64> {
        profile.validate()?;
        let next = self
            .cell
            .update(|current| Ok::<_, RetrievalError>(current.with(profile)))?;
        debug!(version = next.version, "profile set updated");
        Ok(next.version)
    }

    /// The whole current profile set.
    pub fn snapshot(&self) -> Arc<ProfileSet> {
        self.cell.load()
    }

    pub fn list(&self) -> Vec<Arc<AgentProfile>> {
        self.cell.load().iter().cloned().collect()
    }

    pub fn version(&self) -> u64 {
        self.cell.load().version
    }
}
