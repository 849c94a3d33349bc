//! `HierarchicalSection`: markdown split at ATX headings.
//!
//! Each section records the full heading path from the document root, so
//! `## Install` under `# Guide` carries `["Guide", "Install"]`. Headings
//! inside fenced code blocks are ignored, as are headings deeper than
//! `max_depth`.

use std::sync::LazyLock;

use regex::Regex;

use super::Piece;
use crate::models::ChunkStructure;

static ATX_HEADING: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(#{1,6})\s+(.+?)\s*#*\s*$").ok());

fn is_fence(line: &str) -> bool {
    let t = line.trim_start();
    t.starts_with("```") || t.starts_with("~~~")
}

/// Lines of `text` that are not inside fenced code blocks.
pub(crate) fn outside_fences(text: &str) -> impl Iterator<Item = &str> {
    let mut in_fence = false;
    text.lines().filter(move |line| {
        if is_fence(line) {
            in_fence = !in_fence;
            return false;
        }
        !in_fence
    })
}

fn heading(line: &str, max_depth: usize) -> Option<(usize, String)> {
    let caps = ATX_HEADING.as_ref()?.captures(line)?;
    let level = caps.get(1)?.as_str().len();
    if level > max_depth {
        return None;
    }
    Some((level, caps.get(2)?.as_str().to_string()))
}

struct Section {
    lines: Vec<String>,
    path: Vec<String>,
    level: usize,
    has_body: bool,
}

impl Section {
    fn into_piece(self) -> Option<Piece> {
        if !self.has_body {
            return None;
        }
        let structure = if self.path.is_empty() {
            None
        } else {
            Some(ChunkStructure::Section {
                path: self.path,
                level: self.level,
            })
        };
        Some(Piece::new(self.lines.join("\n"), structure))
    }
}

pub(super) fn split(text: &str, max_depth: usize) -> Vec<Piece> {
    let max_depth = max_depth.clamp(1, 6);
    let mut pieces = Vec::new();
    let mut stack: Vec<(usize, String)> = Vec::new();
    let mut current = Section {
        lines: Vec::new(),
        path: Vec::new(),
        level: 0,
        has_body: false,
    };
    let mut in_fence = false;

    for line in text.lines() {
        if is_fence(line) {
            in_fence = !in_fence;
        } else if !in_fence {
            if let Some((level, title)) = heading(line, max_depth) {
                while stack.last().is_some_and(|(l, _)| *l >= level) {
                    stack.pop();
                }
                stack.push((level, title));
                let next = Section {
                    lines: vec![line.to_string()],
                    path: stack.iter().map(|(_, t)| t.clone()).collect(),
                    level,
                    has_body: false,
                };
                if let Some(piece) = std::mem::replace(&mut current, next).into_piece() {
                    pieces.push(piece);
                }
                continue;
            }
        }
        if !line.trim().is_empty() {
            current.has_body = true;
        }
        current.lines.push(line.to_string());
    }
    if let Some(piece) = current.into_piece() {
        pieces.push(piece);
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(pieces: &[Piece]) -> Vec<Vec<String>> {
        pieces
            .iter()
            .map(|p| {
                p.structure
                    .as_ref()
                    .and_then(|s| s.section_path())
                    .map(|s| s.to_vec())
                    .unwrap_or_default()
            })
            .collect()
    }

    #[test]
    fn sections_carry_heading_path() {
        let doc = "Intro text.\n\n# Guide\n\nWelcome.\n\n## Install\n\nRun it.\n\n### Linux\n\napt.\n\n## Usage\n\nCall it.\n";
        let pieces = split(doc, 6);
        assert_eq!(
            paths(&pieces),
            vec![
                vec![],
                vec!["Guide".to_string()],
                vec!["Guide".to_string(), "Install".to_string()],
                vec!["Guide".to_string(), "Install".to_string(), "Linux".to_string()],
                vec!["Guide".to_string(), "Usage".to_string()],
            ]
        );
        assert!(pieces[2].text.starts_with("## Install"));
        assert!(pieces[2].text.contains("Run it."));
    }

    #[test]
    fn headings_in_fences_are_ignored() {
        let doc = "# Script\n\n```sh\n# not a heading\necho hi\n```\n";
        let pieces = split(doc, 6);
        assert_eq!(pieces.len(), 1);
        assert!(pieces[0].text.contains("# not a heading"));
    }

    #[test]
    fn heading_only_sections_are_dropped() {
        let doc = "# A\n## B\nbody\n";
        let pieces = split(doc, 6);
        assert_eq!(pieces.len(), 1);
        assert_eq!(paths(&pieces), vec![vec!["A".to_string(), "B".to_string()]]);
    }

    #[test]
    fn deep_headings_stay_in_parent_when_over_max_depth() {
        let doc = "# A\ntext\n### Deep\nmore\n";
        let pieces = split(doc, 2);
        assert_eq!(pieces.len(), 1);
        assert!(pieces[0].text.contains("### Deep"));
    }
}
