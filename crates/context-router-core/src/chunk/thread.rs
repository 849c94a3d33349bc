//! `Thread`: conversation transcripts as sliding windows of turns.
//!
//! A turn starts at a `Speaker: text` line (optionally prefixed by a
//! `[timestamp]`); continuation lines belong to the current turn. Windows
//! hold `window` turns and consecutive windows share `overlap` turns.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use super::Piece;
use crate::models::ChunkStructure;

static TURN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^(?:\[[^\]]{1,40}\]\s*)?(?P<speaker>[A-Z][\w .'-]{0,31}?|[a-z][\w-]{0,31}?)\s*:\s+\S").ok()
});

fn speaker(line: &str) -> Option<&str> {
    TURN.as_ref()?
        .captures(line)?
        .name("speaker")
        .map(|m| m.as_str().trim())
}

/// Heuristic used by the router: turn lines from at least two speakers,
/// at least one of whom speaks twice, covering a third of the lines.
pub(crate) fn looks_like_conversation(lines: &[&str]) -> bool {
    let speakers: Vec<&str> = lines.iter().filter_map(|l| speaker(l)).collect();
    let distinct: HashSet<&str> = speakers.iter().copied().collect();
    distinct.len() >= 2 && speakers.len() > distinct.len() && speakers.len() * 3 >= lines.len()
}

struct Turn {
    speaker: String,
    text: String,
}

fn turns(text: &str) -> Vec<Turn> {
    let mut out: Vec<Turn> = Vec::new();
    for line in text.lines() {
        match speaker(line) {
            Some(name) => out.push(Turn {
                speaker: name.to_string(),
                text: line.trim_end().to_string(),
            }),
            None => match out.last_mut() {
                Some(turn) => {
                    turn.text.push('\n');
                    turn.text.push_str(line.trim_end());
                }
                None if !line.trim().is_empty() => out.push(Turn {
                    speaker: String::new(),
                    text: line.trim_end().to_string(),
                }),
                None => {}
            },
        }
    }
    out
}

pub(super) fn split(text: &str, window: usize, overlap: usize) -> Vec<Piece> {
    let window = window.max(1);
    let overlap = overlap.min(window - 1);
    let step = window - overlap;
    let turns = turns(text);

    let mut pieces = Vec::new();
    let mut start = 0;
    while start < turns.len() {
        let end = (start + window).min(turns.len());
        let slice = &turns[start..end];

        let mut speakers: Vec<String> = Vec::new();
        for t in slice {
            if !t.speaker.is_empty() && !speakers.contains(&t.speaker) {
                speakers.push(t.speaker.clone());
            }
        }
        let body = slice
            .iter()
            .map(|t| t.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        pieces.push(Piece::new(
            body,
            Some(ChunkStructure::Turns {
                first: start,
                last: end - 1,
                speakers,
            }),
        ));

        if end == turns.len() {
            break;
        }
        start += step;
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transcript(n: usize) -> String {
        (0..n)
            .map(|i| {
                let who = if i % 2 == 0 { "Alice" } else { "Bob" };
                format!("{}: message {}", who, i)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn ranges(pieces: &[Piece]) -> Vec<(usize, usize)> {
        pieces
            .iter()
            .map(|p| match &p.structure {
                Some(ChunkStructure::Turns { first, last, .. }) => (*first, *last),
                other => panic!("unexpected {:?}", other),
            })
            .collect()
    }

    #[test]
    fn sliding_windows_share_overlap() {
        let pieces = split(&transcript(10), 4, 2);
        assert_eq!(ranges(&pieces), vec![(0, 3), (2, 5), (4, 7), (6, 9)]);
        assert!(pieces[1].text.starts_with("Alice: message 2"));
    }

    #[test]
    fn short_thread_is_one_window() {
        let pieces = split(&transcript(3), 6, 2);
        assert_eq!(ranges(&pieces), vec![(0, 2)]);
        match &pieces[0].structure {
            Some(ChunkStructure::Turns { speakers, .. }) => {
                assert_eq!(speakers, &vec!["Alice".to_string(), "Bob".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn continuation_lines_stay_with_turn() {
        let text = "User: here is the error\n  at main.rs:3\nAssistant: add a semicolon";
        let pieces = split(text, 1, 0);
        assert_eq!(pieces.len(), 2);
        assert!(pieces[0].text.contains("at main.rs:3"));
    }

    #[test]
    fn detects_conversation_lines() {
        let lines = ["[10:02] alice: hi", "bob: hello there", "alice: ok"];
        assert!(looks_like_conversation(&lines));
        let prose = ["This is prose.", "Note: just one label"];
        assert!(!looks_like_conversation(&prose));
        let yaml = ["name: api", "image: nginx", "port: 8080"];
        assert!(!looks_like_conversation(&yaml));
    }
}
