//! Error taxonomy for the retrieval core.
//!
//! Most variants are non-fatal: components absorb them at their boundary,
//! log them, and degrade (default profile, single-modality results, last
//! good model). Only [`RetrievalError::RetrievalUnavailable`] and
//! [`RetrievalError::MalformedQuery`] surface to callers of
//! [`ContextRouter::query`](crate::pipeline::ContextRouter::query).

use crate::models::Modality;

/// Errors raised by the retrieval core.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RetrievalError {
    #[error("classification uncertain: best score {best_score:.3} below threshold")]
    ClassificationUncertain { best_score: f64 },

    #[error("profile not found: {0}")]
    ProfileNotFound(String),

    #[error("{modality} sub-search timed out after {timeout_ms}ms")]
    SubsearchTimeout { modality: Modality, timeout_ms: u64 },

    #[error("{modality} sub-search failed: {reason}")]
    SubsearchFailed { modality: Modality, reason: String },

    #[error("retrieval unavailable (vector: {vector}; keyword: {keyword})")]
    RetrievalUnavailable { vector: String, keyword: String },

    #[error("model publish rejected: {reason}")]
    ModelPublishRejected { reason: String },

    #[error("invalid profile: {reason}")]
    InvalidProfile { reason: String },

    #[error("malformed query: {0}")]
    MalformedQuery(String),
}

impl RetrievalError {
    /// Whether this error fails the whole query rather than degrading it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RetrievalError::RetrievalUnavailable { .. } | RetrievalError::MalformedQuery(_)
        )
    }
}

pub type RetrievalResult<T> = Result<T, RetrievalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unavailable_and_malformed_are_fatal() {
        assert!(RetrievalError::RetrievalUnavailable {
            vector: "timeout".into(),
            keyword: "timeout".into(),
        }
        .is_fatal());
        assert!(RetrievalError::MalformedQuery("empty".into()).is_fatal());
        assert!(!RetrievalError::ProfileNotFound("x".into()).is_fatal());
        assert!(!RetrievalError::SubsearchTimeout {
            modality: Modality::Keyword,
            timeout_ms: 10,
        }
        .is_fatal());
        assert!(!RetrievalError::ModelPublishRejected {
            reason: "zero".into()
        }
        .is_fatal());
    }

    #[test]
    fn display_names_the_modality() {
        let err = RetrievalError::SubsearchTimeout {
            modality: Modality::Vector,
            timeout_ms: 150,
        };
        assert_eq!(err.to_string(), "vector sub-search timed out after 150ms");
    }
}
