//! Query → agent profile classification.
//!
//! Resolution order:
//!
//! 1. A hint naming a registered profile wins outright.
//! 2. Otherwise every profile's [`Signature`] is scored against the query:
//!    each matched keyword counts 1, each matched structural cue counts 2,
//!    and the sum is divided by [`SATURATION`] (capped at 1.0).
//! 3. A best score under `min_confidence` resolves to the default profile.
//!
//! Classification never fails and never awaits.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use std::time::Instant;

use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::error::RetrievalError;
use crate::metrics::{names, MetricsSink};
use crate::profile::{ProfileRegistry, Signature, StructuralCue, DEFAULT_PROFILE_ID};

/// Matched signal weight at which a profile scores full confidence.
pub const SATURATION: f64 = 4.0;

const KEYWORD_WEIGHT: f64 = 1.0;
const CUE_WEIGHT: f64 = 2.0;

static CODE_SYNTAX: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?m)(\bfn\s+\w+|\bdef\s+\w+\s*\(|\bfunc\s+\w+|::|\w\(\)|\{\s*$|^\s*\}|=>|->|\bimpl\s+\w+)").ok()
});
static STACK_TRACE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?m)(panicked at|Traceback \(most recent call last\)|^\s+at\s+[\w.$<>]+\(|Exception in thread|error\[E\d{4}\]|^\s+File .+, line \d+|stack ?trace)").ok()
});
static CONFIG_SYNTAX: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?m)(^\s*[\w.-]+\s*=\s*\S|\b[A-Z][A-Z0-9_]{2,}=\S*|^\s*-\s+[\w-]+:|^\s*\[[\w.-]+\]\s*$|^[\w-]+:\s*$)").ok()
});
static MARKDOWN_SYNTAX: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?m)(^#{1,6}\s+\S|```|^\s*[-*]\s+\[[ x]\])").ok());
static QUESTION: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)(^\s*(how|what|why|where|when|which|who|explain|describe|can you|could you|is there)\b|\?\s*$)").ok()
});

fn cue_regex(cue: StructuralCue) -> &'static LazyLock<Option<Regex>> {
    match cue {
        StructuralCue::CodeSyntax => &CODE_SYNTAX,
        StructuralCue::StackTrace => &STACK_TRACE,
        StructuralCue::ConfigSyntax => &CONFIG_SYNTAX,
        StructuralCue::MarkdownSyntax => &MARKDOWN_SYNTAX,
        StructuralCue::Question => &QUESTION,
    }
}

/// Whether `text` shows the structural cue.
pub fn cue_matches(cue: StructuralCue, text: &str) -> bool {
    cue_regex(cue)
        .as_ref()
        .is_some_and(|re| re.is_match(text))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationMethod {
    Hint,
    Inferred,
    Default,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub profile_id: String,
    /// In `[0, 1]`. Hints resolve with 1.0; defaults carry the best inferred score.
    pub confidence: f64,
    pub method: ClassificationMethod,
}

/// Score a signature against a query: matched weight over [`SATURATION`].
pub fn signature_score(signature: &Signature, terms: &HashSet<String>, text: &str) -> f64 {
    if signature.is_empty() {
        return 0.0;
    }
    let keyword_hits = signature
        .keywords
        .iter()
        .filter(|k| terms.contains(k.to_lowercase().as_str()))
        .count() as f64;
    let cue_hits = signature
        .cues
        .iter()
        .filter(|c| cue_matches(**c, text))
        .count() as f64;
    ((keyword_hits * KEYWORD_WEIGHT + cue_hits * CUE_WEIGHT) / SATURATION).min(1.0)
}

pub struct AgentClassifier {
    registry: Arc<ProfileRegistry>,
    min_confidence: f64,
    metrics: Arc<dyn MetricsSink>,
}

impl AgentClassifier {
    pub fn new(
        registry: Arc<ProfileRegistry>,
        min_confidence: f64,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            registry,
            min_confidence,
            metrics,
        }
    }

    pub fn min_confidence(&self) -> f64 {
        self.min_confidence
    }

    pub fn classify(&self, query: &str, hint: Option<&str>) -> Classification {
        let started = Instant::now();
        let result = self.resolve(query, hint);
        let outcome = match result.method {
            ClassificationMethod::Hint => names::CLASSIFIER_HINT,
            ClassificationMethod::Inferred => names::CLASSIFIER_INFERRED,
            ClassificationMethod::Default => names::CLASSIFIER_DEFAULT,
        };
        self.metrics.incr(outcome, 1);
        self.metrics.timing(names::CLASSIFIER_LATENCY, started.elapsed());
        result
    }

    fn resolve(&self, query: &str, hint: Option<&str>) -> Classification {
        let profiles = self.registry.snapshot();

        if let Some(hint) = hint.map(str::trim).filter(|h| !h.is_empty()) {
            if profiles.get(hint).is_some() {
                return Classification {
                    profile_id: hint.to_string(),
                    confidence: 1.0,
                    method: ClassificationMethod::Hint,
                };
            }
            debug!(hint, "agent hint does not name a profile; inferring");
        }

        let terms: HashSet<String> = crate::text::keywords(query).into_iter().collect();
        let mut best: Option<(&str, f64)> = None;
        // Profiles iterate in ascending id order, so a strict `>` keeps the lower id on ties.
        for profile in profiles.iter() {
            let score = signature_score(&profile.signature, &terms, query);
            if score > best.map_or(0.0, |(_, s)| s) {
                best = Some((profile.id.as_str(), score));
            }
        }

        match best {
            Some((id, score)) if score >= self.min_confidence => Classification {
                profile_id: id.to_string(),
                confidence: score,
                method: ClassificationMethod::Inferred,
            },
            _ => {
                let best_score = best.map_or(0.0, |(_, s)| s);
                debug!(
                    error = %RetrievalError::ClassificationUncertain { best_score },
                    "using default profile"
                );
                Classification {
                    profile_id: DEFAULT_PROFILE_ID.to_string(),
                    confidence: best_score,
                    method: ClassificationMethod::Default,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::InMemoryMetrics;

    fn classifier() -> (AgentClassifier, Arc<InMemoryMetrics>) {
        let metrics = Arc::new(InMemoryMetrics::new());
        let c = AgentClassifier::new(
            Arc::new(ProfileRegistry::with_builtins()),
            0.2,
            metrics.clone(),
        );
        (c, metrics)
    }

    #[test]
    fn cue_regexes_compile() {
        for cue in [
            StructuralCue::CodeSyntax,
            StructuralCue::StackTrace,
            StructuralCue::ConfigSyntax,
            StructuralCue::MarkdownSyntax,
            StructuralCue::Question,
        ] {
            assert!(cue_regex(cue).is_some(), "{:?} failed to compile", cue);
        }
    }

    #[test]
    fn hint_overrides_inference() {
        let (c, metrics) = classifier();
        let result = c.classify("deploy the kubernetes config", Some("documentation"));
        assert_eq!(result.profile_id, "documentation");
        assert_eq!(result.method, ClassificationMethod::Hint);
        assert_eq!(result.confidence, 1.0);
        assert_eq!(metrics.counter(names::CLASSIFIER_HINT), 1);
        assert!(metrics.distribution(names::CLASSIFIER_LATENCY).is_some());
    }

    #[test]
    fn unknown_hint_falls_through_to_inference() {
        let (c, _) = classifier();
        let result = c.classify("deploy with docker and set PORT=8080", Some("nope"));
        assert_eq!(result.profile_id, "devops");
        assert_eq!(result.method, ClassificationMethod::Inferred);
    }

    #[test]
    fn infers_code_completion() {
        let (c, _) = classifier();
        let result = c.classify("implement the parse_config function", None);
        assert_eq!(result.profile_id, "code-completion");
        assert!((result.confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn stack_trace_points_at_review() {
        let (c, _) = classifier();
        let text = "thread 'main' panicked at src/lib.rs:10:5, fix this bug";
        assert_eq!(c.classify(text, None).profile_id, "code-review");
    }

    #[test]
    fn low_signal_queries_use_default() {
        let (c, metrics) = classifier();
        let result = c.classify("bananas", None);
        assert_eq!(result.profile_id, DEFAULT_PROFILE_ID);
        assert_eq!(result.method, ClassificationMethod::Default);
        assert_eq!(metrics.counter(names::CLASSIFIER_DEFAULT), 1);
    }

    #[test]
    fn classification_is_deterministic() {
        let (c, _) = classifier();
        let a = c.classify("explain the architecture overview", None);
        let b = c.classify("explain the architecture overview", None);
        assert_eq!(a, b);
        assert_eq!(a.profile_id, "documentation");
    }

    #[test]
    fn ties_go_to_lower_profile_id() {
        let sig = Signature {
            keywords: vec!["widget".into()],
            cues: vec![],
        };
        let mut a = (*ProfileRegistry::with_builtins().get("devops")).clone();
        a.id = "b-agent".into();
        a.signature = sig.clone();
        let mut b = a.clone();
        b.id = "a-agent".into();
        let registry = Arc::new(ProfileRegistry::new(vec![a, b]).unwrap());
        let c = AgentClassifier::new(registry, 0.2, Arc::new(crate::metrics::NoopMetrics));
        assert_eq!(c.classify("widget", None).profile_id, "a-agent");
    }
}
