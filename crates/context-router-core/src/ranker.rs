//! Contextual ranking and the versioned ranking model.
//!
//! [`rank`] is a pure function of its inputs: the same candidates, query
//! text, profile, and model state always produce the same ordered output.
//!
//! ```text
//! final = retrieval_weight * merged
//!       + FEATURE_BOOST_SCALE * Σ_i activation_i * 1/(i+1) * weight(feature_i)
//! ```
//!
//! `i` is the position of the feature in the profile's priority list.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RetrievalError, RetrievalResult};
use crate::models::{CandidateResult, Chunk, Query};
use crate::profile::{AgentProfile, PriorityFeature};
use crate::retrieval::{desc, desc_opt};
use crate::snapshot::SnapshotCell;
use crate::text::term_counts;

/// Scale applied to the summed feature boosts, keeping them in the same
/// range as merged scores.
pub const FEATURE_BOOST_SCALE: f64 = 0.1;

/// Chunk length at which the brevity feature reaches zero.
pub const BREVITY_MAX_CHARS: usize = 2000;

/// One immutable version of the ranking model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingModelState {
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    /// Multiplier on the merged retrieval score.
    pub retrieval_weight: f64,
    /// Weights keyed by [`PriorityFeature::key`]. Missing keys weigh 1.0.
    #[serde(default)]
    pub feature_weights: BTreeMap<String, f64>,
}

impl RankingModelState {
    pub fn initial() -> Self {
        Self {
            version: 1,
            updated_at: Utc::now(),
            retrieval_weight: 1.0,
            feature_weights: BTreeMap::new(),
        }
    }

    pub fn weight(&self, key: &str) -> f64 {
        self.feature_weights.get(key).copied().unwrap_or(1.0)
    }

    /// A copy with the next version number, ready to be modified and published.
    pub fn successor(&self) -> Self {
        Self {
            version: self.version + 1,
            updated_at: Utc::now(),
            retrieval_weight: self.retrieval_weight,
            feature_weights: self.feature_weights.clone(),
        }
    }

    /// Reject non-finite, negative, or all-zero weights.
    pub fn validate(&self) -> RetrievalResult<()> {
        let reject = |reason: String| Err(RetrievalError::ModelPublishRejected { reason });

        if !self.retrieval_weight.is_finite() || self.retrieval_weight < 0.0 {
            return reject(format!(
                "retrieval_weight must be finite and >= 0, got {}",
                self.retrieval_weight
            ));
        }
        for (key, w) in &self.feature_weights {
            if !w.is_finite() || *w < 0.0 {
                return reject(format!("weight '{}' must be finite and >= 0, got {}", key, w));
            }
        }
        let all_zero = self.retrieval_weight == 0.0
            && self.feature_weights.values().all(|w| *w == 0.0);
        if all_zero {
            return reject("all weights are zero".to_string());
        }
        Ok(())
    }
}

impl Default for RankingModelState {
    fn default() -> Self {
        Self::initial()
    }
}

/// The active ranking model, swapped atomically on publish.
pub struct ModelHandle {
    cell: SnapshotCell<RankingModelState>,
}

impl ModelHandle {
    pub fn new(initial: RankingModelState) -> Self {
        Self {
            cell: SnapshotCell::new(initial),
        }
    }

    pub fn current(&self) -> Arc<RankingModelState> {
        self.cell.load()
    }

    pub fn version(&self) -> u64 {
        self.cell.load().version
    }

    /// Publish `candidate` as the next version.
    ///
    /// The candidate must be valid and carry exactly `current + 1`;
    /// otherwise the current version stays active.
    pub fn publish(&self, candidate: RankingModelState) -> RetrievalResult<Arc<RankingModelState>> {
        candidate.validate()?;
        self.cell.update(|current| {
            if candidate.version != current.version + 1 {
                return Err(RetrievalError::ModelPublishRejected {
                    reason: format!(
                        "expected version {}, got {}",
                        current.version + 1,
                        candidate.version
                    ),
                });
            }
            Ok(candidate)
        })
    }
}

impl Default for ModelHandle {
    fn default() -> Self {
        Self::new(RankingModelState::initial())
    }
}

/// Activation of one priority feature for one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureActivation {
    pub key: String,
    /// In `[0, 1]`.
    pub value: f64,
    /// Positional decay, `1 / (position + 1)`.
    pub decay: f64,
}

fn keyword_fraction(keywords: &[String], terms: &HashSet<String>) -> f64 {
    if keywords.is_empty() || terms.is_empty() {
        return 0.0;
    }
    let hits = keywords.iter().filter(|k| terms.contains(*k)).count();
    hits as f64 / keywords.len() as f64
}

fn label_terms(text: &str) -> HashSet<String> {
    term_counts(text).into_keys().collect()
}

fn activation(feature: PriorityFeature, chunk: &Chunk, keywords: &[String], profile: &AgentProfile) -> f64 {
    let flag = |b: bool| if b { 1.0 } else { 0.0 };
    match feature {
        PriorityFeature::ContentType(t) => flag(chunk.content_type == t),
        PriorityFeature::PreferredStrategy => flag(chunk.strategy == profile.chunking),
        PriorityFeature::StructuralBoundary => flag(chunk.structure.is_some()),
        PriorityFeature::SymbolMatch => chunk
            .structure
            .as_ref()
            .and_then(|s| s.label())
            .map_or(0.0, |label| keyword_fraction(keywords, &label_terms(label))),
        PriorityFeature::SectionMatch => chunk
            .structure
            .as_ref()
            .and_then(|s| s.section_path())
            .map_or(0.0, |path| keyword_fraction(keywords, &label_terms(&path.join(" ")))),
        PriorityFeature::Brevity => {
            let len = chunk.text.chars().count() as f64;
            1.0 - (len / BREVITY_MAX_CHARS as f64).min(1.0)
        }
    }
}

/// Activations of the profile's priority features for `chunk`, in
/// priority order.
pub fn feature_activations(
    chunk: &Chunk,
    keywords: &[String],
    profile: &AgentProfile,
) -> Vec<FeatureActivation> {
    profile
        .priority_features
        .iter()
        .enumerate()
        .map(|(i, f)| FeatureActivation {
            key: f.key(),
            value: activation(*f, chunk, keywords, profile),
            decay: 1.0 / (i as f64 + 1.0),
        })
        .collect()
}

/// Final score of one candidate.
pub fn score(
    merged: f64,
    activations: &[FeatureActivation],
    model: &RankingModelState,
) -> f64 {
    let boost: f64 = activations
        .iter()
        .map(|a| a.value * a.decay * model.weight(&a.key))
        .sum();
    model.retrieval_weight * merged + FEATURE_BOOST_SCALE * boost
}

/// Rescore, order, and truncate candidates to the profile's context window.
pub fn rank(
    mut candidates: Vec<CandidateResult>,
    query: &Query,
    profile: &AgentProfile,
    model: &RankingModelState,
) -> Vec<CandidateResult> {
    let keywords = query.keywords();
    for c in candidates.iter_mut() {
        let activations = feature_activations(&c.chunk, &keywords, profile);
        c.final_score = score(c.merged_score, &activations, model);
    }

    candidates.sort_by(|a, b| {
        desc(a.final_score, b.final_score)
            .then_with(|| desc(a.merged_score, b.merged_score))
            .then_with(|| desc_opt(a.vector_score, b.vector_score))
            .then_with(|| a.chunk.id.cmp(&b.chunk.id))
    });

    let window = &profile.context_window;
    let mut out = Vec::with_capacity(window.max_chunks.min(candidates.len()));
    let mut used_chars = 0usize;
    for c in candidates {
        if out.len() >= window.max_chunks {
            break;
        }
        let len = c.chunk.text.chars().count();
        if let Some(budget) = window.max_chars {
            if !out.is_empty() && used_chars + len > budget {
                continue;
            }
        }
        used_chars += len;
        out.push(c);
    }
    for (i, c) in out.iter_mut().enumerate() {
        c.rank = i + 1;
    }
    out
}
