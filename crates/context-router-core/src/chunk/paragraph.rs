//! `SemanticSimilarity`: the fallback strategy.
//!
//! Text is split on blank lines. Adjacent paragraphs are merged while the
//! term-set Jaccard similarity of each neighbouring pair is at least
//! `threshold` and the merged text stays within `max_chars`.

use std::collections::HashSet;

use super::Piece;
use crate::text::{jaccard, term_set};

pub(super) fn split(text: &str, threshold: f64, max_chars: usize) -> Vec<Piece> {
    let mut pieces = Vec::new();
    let mut buf = String::new();
    let mut last_terms: HashSet<String> = HashSet::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }
        let terms = term_set(trimmed);

        if !buf.is_empty() {
            let fits = buf.len() + 2 + trimmed.len() <= max_chars;
            if fits && jaccard(&last_terms, &terms) >= threshold {
                buf.push_str("\n\n");
                buf.push_str(trimmed);
                last_terms = terms;
                continue;
            }
            pieces.push(Piece::new(std::mem::take(&mut buf), None));
        }
        buf.push_str(trimmed);
        last_terms = terms;
    }

    if !buf.is_empty() {
        pieces.push(Piece::new(buf, None));
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn similar_neighbours_merge() {
        let text = "The cache stores entries.\n\nThe cache evicts old entries.\n\nTaxes are due in April.";
        let pieces = split(text, 0.2, 4000);
        assert_eq!(pieces.len(), 2);
        assert!(pieces[0].text.contains("evicts"));
        assert_eq!(pieces[1].text, "Taxes are due in April.");
    }

    #[test]
    fn merge_respects_max_chars() {
        let text = "alpha beta gamma\n\nalpha beta gamma\n\nalpha beta gamma";
        let pieces = split(text, 0.2, 20);
        assert_eq!(pieces.len(), 3);
    }

    #[test]
    fn threshold_above_one_never_merges() {
        let text = "same words\n\nsame words";
        assert_eq!(split(text, 1.1, 4000).len(), 2);
        assert_eq!(split(text, 1.0, 4000).len(), 1);
    }
}
