//! `KeyValue`: configuration split into one chunk per top-level entry.
//!
//! | Format | Entry |
//! |--------|-------|
//! | TOML | a `[table]` / `[[array]]` section, or a top-level `key = value` |
//! | YAML | a column-0 key with its indented block |
//! | env | a `KEY=VALUE` line |
//! | JSON | a top-level object member |
//!
//! Comment lines directly above an entry belong to it.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::Piece;
use crate::models::ChunkStructure;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigFormat {
    Toml,
    Yaml,
    Env,
    Json,
}

impl ConfigFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "toml" | "ini" | "cfg" | "conf" => Some(ConfigFormat::Toml),
            "yaml" | "yml" => Some(ConfigFormat::Yaml),
            "env" => Some(ConfigFormat::Env),
            "json" => Some(ConfigFormat::Json),
            _ => None,
        }
    }

    /// Guess the format of config text with no usable extension.
    pub fn sniff(text: &str) -> Self {
        let trimmed = text.trim_start();
        if trimmed.starts_with('{') {
            return ConfigFormat::Json;
        }
        let mut env = 0;
        let mut toml = 0;
        let mut yaml = 0;
        for line in text.lines().map(str::trim_end) {
            if matches(&ENV_ENTRY, line) {
                env += 1;
            } else if matches(&TOML_TABLE, line) || matches(&TOML_KEY, line) {
                toml += 1;
            } else if matches(&YAML_KEY, line) {
                yaml += 1;
            }
        }
        if env > 0 && env >= toml && env >= yaml {
            ConfigFormat::Env
        } else if toml >= yaml && toml > 0 {
            ConfigFormat::Toml
        } else {
            ConfigFormat::Yaml
        }
    }
}

static TOML_TABLE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\[\[?\s*(?P<key>[^\]]+?)\s*\]\]?\s*(?:#.*)?$").ok());
static TOML_KEY: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"^(?P<key>[A-Za-z0-9_.-]+|"[^"]+")\s*=\s*"#).ok());
static YAML_KEY: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"^(?P<key>[A-Za-z0-9_.-]+|"[^"]+"|'[^']+')\s*:(?:\s|$)"#).ok());
static ENV_ENTRY: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(?:export\s+)?(?P<key>[A-Z_][A-Z0-9_]*)=").ok());

fn matches(re: &LazyLock<Option<Regex>>, line: &str) -> bool {
    re.as_ref().is_some_and(|re| re.is_match(line))
}

fn key_of(re: &LazyLock<Option<Regex>>, line: &str) -> Option<String> {
    let caps = re.as_ref()?.captures(line)?;
    let key = caps.name("key")?.as_str();
    Some(key.trim_matches(|c| c == '"' || c == '\'').to_string())
}

fn is_comment(line: &str) -> bool {
    let t = line.trim_start();
    t.starts_with('#') || t.starts_with(';') || t.starts_with("//")
}

struct Entry {
    key: String,
    lines: Vec<String>,
}

/// Line-oriented splitter shared by TOML, YAML, and env.
///
/// `start_key` returns the key when a line opens a new entry. Lines that
/// open nothing continue the current entry; comments are held back so
/// they attach to the entry below them.
fn split_lines<F>(text: &str, start_key: F) -> Vec<Piece>
where
    F: Fn(&str, Option<&Entry>) -> Option<String>,
{
    let mut entries: Vec<Entry> = Vec::new();
    let mut pending: Vec<String> = Vec::new();
    let mut preamble: Vec<String> = Vec::new();

    for line in text.lines().map(str::trim_end) {
        if line.trim() == "---" {
            continue;
        }
        if is_comment(line) || line.trim().is_empty() {
            if line.trim().is_empty() {
                // A blank line detaches held comments from what follows.
                if let Some(entry) = entries.last_mut() {
                    entry.lines.append(&mut pending);
                } else {
                    preamble.append(&mut pending);
                }
            } else {
                pending.push(line.to_string());
            }
            continue;
        }
        if let Some(key) = start_key(line, entries.last()) {
            let mut lines = if entries.is_empty() {
                std::mem::take(&mut preamble)
            } else {
                Vec::new()
            };
            lines.append(&mut pending);
            lines.push(line.to_string());
            entries.push(Entry { key, lines });
        } else if let Some(entry) = entries.last_mut() {
            entry.lines.append(&mut pending);
            entry.lines.push(line.to_string());
        } else {
            preamble.append(&mut pending);
            preamble.push(line.to_string());
        }
    }
    if let Some(entry) = entries.last_mut() {
        entry.lines.append(&mut pending);
    } else {
        preamble.append(&mut pending);
    }

    if entries.is_empty() {
        let body = preamble.join("\n");
        return if body.trim().is_empty() {
            Vec::new()
        } else {
            vec![Piece::new(body, None)]
        };
    }
    entries
        .into_iter()
        .map(|e| {
            Piece::new(
                e.lines.join("\n"),
                Some(ChunkStructure::Entry { key: e.key }),
            )
        })
        .collect()
}

fn split_toml(text: &str) -> Vec<Piece> {
    split_lines(text, |line, current| {
        if let Some(key) = key_of(&TOML_TABLE, line) {
            return Some(key);
        }
        // Inside a table, keys belong to the table.
        let in_table =
            current.is_some_and(|e| e.lines.iter().any(|l| matches(&TOML_TABLE, l)));
        if in_table {
            None
        } else {
            key_of(&TOML_KEY, line)
        }
    })
}

fn split_yaml(text: &str) -> Vec<Piece> {
    split_lines(text, |line, _| key_of(&YAML_KEY, line))
}

fn split_env(text: &str) -> Vec<Piece> {
    split_lines(text, |line, _| key_of(&ENV_ENTRY, line))
}

fn split_json(text: &str) -> Vec<Piece> {
    let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(text)
    else {
        return vec![Piece::new(text, None)];
    };
    map.into_iter()
        .map(|(key, value)| {
            let rendered =
                serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
            let body = format!("{}: {}", serde_json::Value::String(key.clone()), rendered);
            Piece::new(body, Some(ChunkStructure::Entry { key }))
        })
        .collect()
}

pub(super) fn split(text: &str, format: ConfigFormat) -> Vec<Piece> {
    match format {
        ConfigFormat::Toml => split_toml(text),
        ConfigFormat::Yaml => split_yaml(text),
        ConfigFormat::Env => split_env(text),
        ConfigFormat::Json => split_json(text),
    }
}
