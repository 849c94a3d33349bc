//! Keyword extraction shared by the classifier, stores, and chunkers.
//!
//! Tokens are runs of alphanumerics and underscores. Identifiers are kept
//! whole and also split into their snake_case / camelCase parts, so that
//! `parseConfig` matches both `parseconfig` and `config`.

use std::collections::{HashMap, HashSet};

const STOPWORDS: &[&str] = &[
    "a", "about", "an", "and", "are", "as", "at", "be", "by", "can", "do", "does", "for", "from",
    "how", "i", "in", "into", "is", "it", "me", "my", "of", "on", "or", "should", "that", "the",
    "this", "to", "was", "we", "what", "when", "where", "which", "why", "with", "you",
];

fn is_stopword(term: &str) -> bool {
    STOPWORDS.binary_search(&term).is_ok()
}

/// Split text into lowercase alphanumeric/underscore tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    raw_tokens(text).map(|t| t.to_lowercase()).collect()
}

fn raw_tokens(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
}

/// Normalized, deduplicated keyword terms in first-seen order.
///
/// Stopwords and single characters are dropped.
pub fn keywords(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let mut push = |term: String| {
        if term.chars().count() > 1 && !is_stopword(&term) && seen.insert(term.clone()) {
            out.push(term);
        }
    };

    for raw in raw_tokens(text) {
        push(raw.to_lowercase());
        let parts = split_identifier(raw);
        if parts.len() > 1 {
            for part in parts {
                push(part);
            }
        }
    }
    out
}

/// Split an identifier on underscores and lower→upper case transitions.
pub fn split_identifier(raw: &str) -> Vec<String> {
    let mut parts = Vec::new();
    for piece in raw.split('_').filter(|p| !p.is_empty()) {
        let mut current = String::new();
        let mut prev_lower = false;
        for c in piece.chars() {
            if c.is_uppercase() && prev_lower && !current.is_empty() {
                parts.push(current.to_lowercase());
                current.clear();
            }
            prev_lower = c.is_lowercase() || c.is_ascii_digit();
            current.push(c);
        }
        if !current.is_empty() {
            parts.push(current.to_lowercase());
        }
    }
    parts
}

/// Occurrence counts of lowercase tokens and, for compound identifiers,
/// their parts. Stopwords are kept; callers match against query keywords.
pub fn term_counts(text: &str) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for raw in raw_tokens(text) {
        *counts.entry(raw.to_lowercase()).or_insert(0) += 1;
        let parts = split_identifier(raw);
        if parts.len() > 1 {
            for part in parts {
                *counts.entry(part).or_insert(0) += 1;
            }
        }
    }
    counts
}

/// Set of lowercase tokens, for overlap measures.
pub fn term_set(text: &str) -> HashSet<String> {
    tokenize(text).into_iter().collect()
}

/// Jaccard similarity of two term sets; `0.0` when both are empty.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}
