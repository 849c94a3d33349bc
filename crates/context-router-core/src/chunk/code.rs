//! `SemanticFunction`: code split at function and type declarations.
//!
//! Declarations are detected by line-start regexes, one set per language.
//! Comments, doc comments, attributes, and decorators directly above a
//! declaration belong to it. Lines before the first declaration (imports,
//! module docs) attach to the first unit.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{paragraph, Piece, DEFAULT_SIMILARITY_THRESHOLD};
use crate::models::ChunkStructure;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Rust,
    Python,
    JavaScript,
    Go,
    Java,
    C,
    Generic,
}

impl Language {
    pub fn from_extension(ext: &str) -> Option<Self> {
        let lang = match ext {
            "rs" => Language::Rust,
            "py" | "pyi" => Language::Python,
            "js" | "jsx" | "mjs" | "cjs" | "ts" | "tsx" => Language::JavaScript,
            "go" => Language::Go,
            "java" | "kt" | "kts" | "cs" | "scala" => Language::Java,
            "c" | "h" | "cc" | "cpp" | "cxx" | "hpp" => Language::C,
            "rb" | "php" | "swift" | "lua" | "sh" | "zig" => Language::Generic,
            _ => return None,
        };
        Some(lang)
    }

    fn declarations(&self) -> &'static [&'static LazyLock<Option<Regex>>] {
        match self {
            Language::Rust => &RUST,
            Language::Python => &PYTHON,
            Language::JavaScript => &JAVASCRIPT,
            Language::Go => &GO,
            Language::Java => &JVM,
            Language::C => &C,
            Language::Generic => &GENERIC,
        }
    }
}

macro_rules! decl {
    ($name:ident, $re:expr) => {
        static $name: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new($re).ok());
    };
}

decl!(
    RUST_DECL,
    r#"^(?:pub(?:\([^)]*\))?\s+)?(?:(?:async|const|unsafe|extern\s+"[^"]*")\s+)*(?P<kind>fn|struct|enum|trait|impl|mod|type|union|macro_rules!)(?:<[^>]*>)?\s+(?P<name>[A-Za-z_][\w:]*(?:<[^>]*>)?(?:\s+for\s+[A-Za-z_][\w:]*)?)"#
);
decl!(
    PYTHON_DECL,
    r"^(?:async\s+)?(?P<kind>def|class)\s+(?P<name>[A-Za-z_]\w*)"
);
decl!(
    JS_DECL,
    r"^(?:export\s+)?(?:default\s+)?(?:declare\s+)?(?:abstract\s+)?(?:async\s+)?(?P<kind>function\*?|class|interface|enum|type)\s+(?P<name>[A-Za-z_$][\w$]*)"
);
decl!(
    JS_ARROW,
    r"^(?:export\s+)?(?:const|let|var)\s+(?P<name>[A-Za-z_$][\w$]*)\s*(?::[^=]+)?=\s*(?:async\s+)?(?:function\b|\([^)]*\)\s*(?::\s*[^=]+)?=>|[A-Za-z_$][\w$]*\s*=>)"
);
decl!(
    GO_FUNC,
    r"^(?P<kind>func)\s+(?:\([^)]*\)\s*)?(?P<name>[A-Za-z_]\w*)"
);
decl!(
    GO_TYPE,
    r"^type\s+(?P<name>[A-Za-z_]\w*)\s+(?P<kind>struct|interface)"
);
decl!(
    JVM_TYPE,
    r"^\s{0,4}(?:@\w+\s+)*(?:(?:public|private|protected|internal|static|final|abstract|sealed|open|data|override|partial|async|virtual)\s+)*(?P<kind>class|interface|enum|record|object|fun|struct)\s+(?P<name>[A-Za-z_]\w*)"
);
decl!(
    JVM_METHOD,
    r"^(?:    |\t)(?:(?:public|private|protected|internal|static|final|abstract|synchronized|override|async|virtual)\s+)+(?:[\w<>\[\],.?]+\s+)?(?P<name>[A-Za-z_]\w*)\s*\([^;]*$"
);
decl!(
    C_TYPE,
    r"^(?:typedef\s+)?(?P<kind>struct|class|union|enum|namespace)\s+(?P<name>[A-Za-z_]\w*)[^;]*$"
);
decl!(
    C_FUNC,
    r"^(?:static\s+|inline\s+|extern\s+|const\s+|unsigned\s+|signed\s+)*[A-Za-z_][\w:<>,\*&\s]*?[\s\*&]+(?P<name>[A-Za-z_][\w:~]*)\s*\([^;]*$"
);
decl!(
    GENERIC_DECL,
    r"^(?:(?:pub|export|async|public|private|static)\s+)*(?P<kind>fn|def|func|function|class|struct|interface|trait|impl|module)\s+(?P<name>[A-Za-z_$][\w$]*)"
);

static RUST: [&LazyLock<Option<Regex>>; 1] = [&RUST_DECL];
static PYTHON: [&LazyLock<Option<Regex>>; 1] = [&PYTHON_DECL];
static JAVASCRIPT: [&LazyLock<Option<Regex>>; 2] = [&JS_DECL, &JS_ARROW];
static GO: [&LazyLock<Option<Regex>>; 2] = [&GO_FUNC, &GO_TYPE];
static JVM: [&LazyLock<Option<Regex>>; 2] = [&JVM_TYPE, &JVM_METHOD];
static C: [&LazyLock<Option<Regex>>; 2] = [&C_TYPE, &C_FUNC];
static GENERIC: [&LazyLock<Option<Regex>>; 1] = [&GENERIC_DECL];

const ATTACHED_PREFIXES: &[&str] = &["///", "//", "/*", "*", "#[", "#", "@", "--"];

#[derive(Debug, Clone, PartialEq)]
struct Declaration {
    line: usize,
    kind: String,
    name: String,
}

fn declaration(language: Language, line: &str) -> Option<Declaration> {
    for re in language.declarations() {
        let Some(re) = (*re).as_ref() else { continue };
        if let Some(caps) = re.captures(line) {
            let name = caps
                .name("name")
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default();
            let kind = caps
                .name("kind")
                .map(|m| m.as_str().trim_end_matches('!').to_string())
                .unwrap_or_else(|| match language {
                    Language::Java => "method".to_string(),
                    _ => "function".to_string(),
                });
            return Some(Declaration { line: 0, kind, name });
        }
    }
    None
}

fn declarations(language: Language, lines: &[&str]) -> Vec<Declaration> {
    lines
        .iter()
        .enumerate()
        .filter_map(|(i, line)| {
            declaration(language, line).map(|mut d| {
                d.line = i;
                d
            })
        })
        .collect()
}

/// Whether `text` contains at least one declaration for `language`.
pub(crate) fn has_declarations(language: Language, text: &str) -> bool {
    text.lines().any(|l| declaration(language, l).is_some())
}

/// Walk back from a declaration over directly attached comment lines.
fn unit_start(lines: &[&str], decl_line: usize, floor: usize) -> usize {
    let mut start = decl_line;
    while start > floor {
        let prev = lines[start - 1].trim_start();
        if prev.is_empty() || !ATTACHED_PREFIXES.iter().any(|p| prev.starts_with(p)) {
            break;
        }
        start -= 1;
    }
    start
}

pub(super) fn split(text: &str, language: Language, max_chars: usize) -> Vec<Piece> {
    let lines: Vec<&str> = text.lines().collect();
    let decls = declarations(language, &lines);
    if decls.is_empty() {
        return paragraph::split(text, DEFAULT_SIMILARITY_THRESHOLD, max_chars);
    }

    let mut starts = Vec::with_capacity(decls.len());
    let mut floor = 0;
    for (i, d) in decls.iter().enumerate() {
        let start = if i == 0 { 0 } else { unit_start(&lines, d.line, floor) };
        starts.push(start);
        floor = d.line + 1;
    }

    decls
        .into_iter()
        .enumerate()
        .filter_map(|(i, d)| {
            let start = starts[i];
            let end = starts.get(i + 1).copied().unwrap_or(lines.len());
            let mut last = end;
            while last > start && lines[last - 1].trim().is_empty() {
                last -= 1;
            }
            if last == start {
                return None;
            }
            let body = lines[start..last].join("\n");
            Some(Piece::new(
                body,
                Some(ChunkStructure::Symbol {
                    symbol_kind: d.kind,
                    name: d.name,
                    start_line: d.line + 1,
                    end_line: last,
                }),
            ))
        })
        .collect()
}
