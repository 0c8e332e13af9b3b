use std::path::PathBuf;
use std::sync::OnceLock;

use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::chunker::comment_ranges;

/// Kind of declaration the extractor hunts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Struct,
    Class,
    Enum,
    Function,
}

impl TargetKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "struct" => Some(Self::Struct),
            "class" => Some(Self::Class),
            "enum" => Some(Self::Enum),
            "function" => Some(Self::Function),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Struct => "struct",
            Self::Class => "class",
            Self::Enum => "enum",
            Self::Function => "function",
        }
    }
}

/// A fully reconstructed declaration.
#[derive(Debug, Clone, Serialize)]
pub struct DefinitionResult {
    pub entity_type: TargetKind,
    pub entity_name: String,
    pub file_path: String,
    /// 1-based line of the declaration.
    pub line_start: u32,
    /// 1-based line of the closing brace (equal to `line_start` for pure
    /// declarations).
    pub line_end: u32,
    pub definition_text: String,
    pub members: Vec<String>,
    pub match_quality: f32,
    /// Byte offsets of `definition_text` within the file, used for
    /// overlap deduplication against semantic chunks.
    pub char_start: u64,
    pub char_end: u64,
}

// ---------------------------------------------------------------------------
// Fuzzy name matching
// ---------------------------------------------------------------------------

/// Strip a UE convention prefix (`F`/`U`/`A`/`I`/`E`) when the following
/// character is uppercase: `FHitResult` → `HitResult`, `Frame` → `Frame`.
pub fn strip_ue_prefix(name: &str) -> &str {
    let mut chars = name.chars();
    match (chars.next(), chars.next()) {
        (Some(p), Some(second)) if "FUAIE".contains(p) && second.is_ascii_uppercase() => {
            &name[1..]
        }
        _ => name,
    }
}

/// Tiered similarity between a queried name and a candidate declaration
/// name, taking the best applicable tier. 1.0 is an exact match; anything
/// below 0.60 is treated as no match.
pub fn match_score(query: &str, candidate: &str) -> f32 {
    if query.is_empty() || candidate.is_empty() {
        return 0.0;
    }
    if query == candidate {
        return 1.0;
    }
    let mut best = 0.0f32;
    if query.eq_ignore_ascii_case(candidate) {
        best = 0.95;
    }

    let qs = strip_ue_prefix(query);
    let cs = strip_ue_prefix(candidate);
    let q_stripped = qs.len() != query.len();
    let c_stripped = cs.len() != candidate.len();

    if q_stripped && c_stripped && qs.eq_ignore_ascii_case(cs) {
        best = best.max(0.90);
    }
    if !q_stripped && c_stripped && query.eq_ignore_ascii_case(cs) {
        best = best.max(0.88);
    }
    if q_stripped && !c_stripped && qs.eq_ignore_ascii_case(candidate) {
        best = best.max(0.85);
    }

    let ql = qs.to_lowercase();
    let cl = cs.to_lowercase();
    if best < 0.75 && (cl.contains(&ql) || ql.contains(&cl)) {
        best = 0.75;
    }
    let q_orig = query.to_lowercase();
    let c_orig = candidate.to_lowercase();
    if best < 0.70 && (c_orig.contains(&q_orig) || q_orig.contains(&c_orig)) {
        best = 0.70;
    }
    if best < 0.65 && strsim::levenshtein(&ql, &cl) <= 2 {
        best = 0.65;
    }
    if best < 0.60 && strsim::levenshtein(&q_orig, &c_orig) <= 2 {
        best = 0.60;
    }
    best
}

const MIN_MATCH_QUALITY: f32 = 0.60;

// ---------------------------------------------------------------------------
// Lexeme-aware scanning
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
enum Lex {
    Code,
    LineComment,
    BlockComment,
    Str,
    Char,
    /// Raw string literal `R"delim(...)delim"`.
    Raw,
}

/// Streaming lexer that tracks whether the cursor sits inside a comment or
/// a string/char/raw-string literal. Drives both the brace matcher and
/// member extraction.
struct Lexer<'a> {
    bytes: &'a [u8],
    pos: usize,
    state: Lex,
    raw_delim: Vec<u8>,
}

impl<'a> Lexer<'a> {
    fn new(text: &'a str, pos: usize) -> Self {
        Self {
            bytes: text.as_bytes(),
            pos,
            state: Lex::Code,
            raw_delim: Vec::new(),
        }
    }

    /// Advance one step. Returns the byte at the current position when it
    /// is plain code, `None` otherwise; `pos` always moves forward.
    fn next_code_byte(&mut self) -> Option<(usize, u8)> {
        let len = self.bytes.len();
        while self.pos < len {
            let b = self.bytes[self.pos];
            match self.state {
                Lex::LineComment => {
                    if b == b'\n' {
                        self.state = Lex::Code;
                    }
                    self.pos += 1;
                }
                Lex::BlockComment => {
                    if b == b'*' && self.peek(1) == Some(b'/') {
                        self.state = Lex::Code;
                        self.pos += 2;
                    } else {
                        self.pos += 1;
                    }
                }
                Lex::Str => {
                    if b == b'\\' {
                        self.pos += 2;
                    } else {
                        if b == b'"' {
                            self.state = Lex::Code;
                        }
                        self.pos += 1;
                    }
                }
                Lex::Char => {
                    if b == b'\\' {
                        self.pos += 2;
                    } else {
                        if b == b'\'' {
                            self.state = Lex::Code;
                        }
                        self.pos += 1;
                    }
                }
                Lex::Raw => {
                    // Close on )delim"
                    if b == b')' && self.raw_closes_here() {
                        self.pos += 2 + self.raw_delim.len();
                        self.state = Lex::Code;
                    } else {
                        self.pos += 1;
                    }
                }
                Lex::Code => {
                    match b {
                        b'/' if self.peek(1) == Some(b'/') => {
                            self.state = Lex::LineComment;
                            self.pos += 2;
                        }
                        b'/' if self.peek(1) == Some(b'*') => {
                            self.state = Lex::BlockComment;
                            self.pos += 2;
                        }
                        b'"' if self.is_raw_string_open() => {
                            // R"delim( — capture the delimiter.
                            let delim_start = self.pos + 1;
                            let mut end = delim_start;
                            while end < len && self.bytes[end] != b'(' && end - delim_start < 16 {
                                end += 1;
                            }
                            self.raw_delim = self.bytes[delim_start..end].to_vec();
                            self.state = Lex::Raw;
                            self.pos = (end + 1).min(len);
                        }
                        b'"' => {
                            self.state = Lex::Str;
                            self.pos += 1;
                        }
                        b'\'' => {
                            self.state = Lex::Char;
                            self.pos += 1;
                        }
                        _ => {
                            let at = self.pos;
                            self.pos += 1;
                            return Some((at, b));
                        }
                    }
                }
            }
        }
        None
    }

    fn peek(&self, ahead: usize) -> Option<u8> {
        self.bytes.get(self.pos + ahead).copied()
    }

    fn is_raw_string_open(&self) -> bool {
        if self.pos == 0 || self.bytes[self.pos - 1] != b'R' {
            return false;
        }
        // `FOR"x"` is an identifier followed by a plain string, not R"".
        self.pos < 2 || {
            let before = self.bytes[self.pos - 2];
            !before.is_ascii_alphanumeric() && before != b'_'
        }
    }

    fn raw_closes_here(&self) -> bool {
        let d = &self.raw_delim;
        let start = self.pos + 1;
        let end = start + d.len();
        self.bytes.get(start..end) == Some(d.as_slice())
            && self.bytes.get(end) == Some(&b'"')
    }
}

/// Walk forward from the `{` at `open`, counting depth while ignoring
/// braces inside comments and string/char/raw-string literals. Returns the
/// byte index of the matching `}`, or `None` for unbalanced input.
pub fn match_braces(text: &str, open: usize) -> Option<usize> {
    debug_assert_eq!(text.as_bytes().get(open), Some(&b'{'));
    let mut lexer = Lexer::new(text, open);
    let mut depth = 0i32;
    while let Some((at, b)) = lexer.next_code_byte() {
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(at);
                }
            }
            _ => {}
        }
    }
    None
}

/// What terminated the search for a declaration body.
enum BodySearch {
    /// Index of the opening `{`.
    Open(usize),
    /// Index of a `;` at paren depth 0 — a pure declaration.
    Terminator(usize),
    Exhausted,
}

/// Scan from `from` for the body `{` of a declaration, skipping comments,
/// literals and balanced parens (parameter lists, constructor
/// initialisers). `start_depth` is 1 when `from` sits on an already-open
/// `(`.
fn find_body_open(text: &str, from: usize, start_depth: i32) -> BodySearch {
    let mut lexer = Lexer::new(text, from);
    let mut parens = start_depth;
    while let Some((at, b)) = lexer.next_code_byte() {
        match b {
            b'(' | b'[' => parens += 1,
            b')' | b']' => parens -= 1,
            b'{' if parens <= 0 => return BodySearch::Open(at),
            b';' if parens <= 0 => return BodySearch::Terminator(at),
            _ => {}
        }
    }
    BodySearch::Exhausted
}

fn line_of(text: &str, idx: usize) -> u32 {
    text.as_bytes()[..idx.min(text.len())]
        .iter()
        .filter(|&&b| b == b'\n')
        .count() as u32
        + 1
}

// ---------------------------------------------------------------------------
// Declaration scanning
// ---------------------------------------------------------------------------

fn struct_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?m)^[ \t]*(?:template\s*<[^>]*>\s*)?struct\s+(?:[A-Z0-9_]+_API\s+)?(?:alignas\([^)]*\)\s*)?([A-Za-z_]\w*)",
        )
        .unwrap()
    })
}

fn class_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?m)^[ \t]*(?:template\s*<[^>]*>\s*)?class\s+(?:[A-Z0-9_]+_API\s+)?(?:alignas\([^)]*\)\s*)?([A-Za-z_]\w*)",
        )
        .unwrap()
    })
}

fn enum_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?m)^[ \t]*(?:template\s*<[^>]*>\s*)?enum(?:\s+class|\s+struct)?\s+(?:[A-Z0-9_]+_API\s+)?([A-Za-z_]\w*)",
        )
        .unwrap()
    })
}

fn function_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?m)^[ \t]*(?:template\s*<[^>]*>\s*)?(?:static\s+|virtual\s+|inline\s+|constexpr\s+|explicit\s+|FORCEINLINE\s+)*(?:[\w:<>,\*&]+[ \t]+)+(?:[A-Za-z_]\w*::)?([A-Za-z_]\w*)\s*\(",
        )
        .unwrap()
    })
}

/// Statement keywords that the function regex can false-positive on.
const NON_DECL_KEYWORDS: &[&str] = &[
    "return", "if", "while", "for", "switch", "else", "case", "new", "delete", "sizeof", "throw",
];

/// Extract matching definitions from one file's text. Pure function; used
/// directly by tests and wrapped by [`extract_definition`] for on-disk
/// trees.
pub fn extract_from_source(
    source: &str,
    path_label: &str,
    kind: TargetKind,
    name: &str,
    fuzzy: bool,
) -> Vec<DefinitionResult> {
    let comments = comment_ranges(source);
    let in_comment = |pos: usize| comments.iter().any(|&(s, e)| pos >= s && pos < e);

    let re = match kind {
        TargetKind::Struct => struct_re(),
        TargetKind::Class => class_re(),
        TargetKind::Enum => enum_re(),
        TargetKind::Function => function_re(),
    };

    let mut results = Vec::new();
    for cap in re.captures_iter(source) {
        let whole = cap.get(0).expect("group 0");
        if in_comment(whole.start()) {
            continue;
        }
        let cand = cap.get(1).expect("name group");
        let quality = if fuzzy {
            match_score(name, cand.as_str())
        } else if cand.as_str() == name {
            1.0
        } else {
            0.0
        };
        if quality < MIN_MATCH_QUALITY {
            continue;
        }
        if kind == TargetKind::Function {
            let first_word = whole
                .as_str()
                .trim_start()
                .split([' ', '\t'])
                .next()
                .unwrap_or("");
            if NON_DECL_KEYWORDS.contains(&first_word) {
                continue;
            }
        }

        let decl_start = whole.start();
        match kind {
            TargetKind::Function => {
                // The match ends just past '('; restart the scan on it so
                // the parameter list is balanced away.
                match find_body_open(source, whole.end(), 1) {
                    BodySearch::Open(open) => match match_braces(source, open) {
                        Some(close) => results.push(build_result(
                            source,
                            path_label,
                            kind,
                            cand.as_str(),
                            quality,
                            decl_start,
                            Some((open, close)),
                        )),
                        None => {
                            warn!(
                                "unbalanced braces after {} in {path_label}; skipping",
                                cand.as_str()
                            );
                        }
                    },
                    BodySearch::Terminator(semi) => {
                        // Pure declaration: no body within reach.
                        results.push(build_result(
                            source,
                            path_label,
                            kind,
                            cand.as_str(),
                            quality,
                            decl_start,
                            Some((semi, semi)),
                        ));
                    }
                    BodySearch::Exhausted => {}
                }
            }
            _ => match find_body_open(source, whole.end(), 0) {
                BodySearch::Open(open) => match match_braces(source, open) {
                    Some(close) => results.push(build_result(
                        source,
                        path_label,
                        kind,
                        cand.as_str(),
                        quality,
                        decl_start,
                        Some((open, close)),
                    )),
                    None => {
                        warn!(
                            "unbalanced braces in {} for {}; skipping",
                            path_label,
                            cand.as_str()
                        );
                    }
                },
                // Forward declaration — not a definition.
                BodySearch::Terminator(_) | BodySearch::Exhausted => {}
            },
        }
    }
    results
}

fn build_result(
    source: &str,
    path_label: &str,
    kind: TargetKind,
    entity_name: &str,
    quality: f32,
    decl_start: usize,
    body: Option<(usize, usize)>,
) -> DefinitionResult {
    let (open, close) = body.expect("definitions carry a body range");
    let pure_declaration = open == close;
    let end = (close + 1).min(source.len());
    let definition_text = source[decl_start..end].to_string();
    let line_start = line_of(source, decl_start);
    let line_end = if pure_declaration {
        line_start
    } else {
        line_of(source, close)
    };
    let members = if pure_declaration {
        Vec::new()
    } else {
        match kind {
            TargetKind::Struct | TargetKind::Class => extract_members(source, open, close),
            TargetKind::Enum => extract_enumerators(source, open, close),
            TargetKind::Function => Vec::new(),
        }
    };
    DefinitionResult {
        entity_type: kind,
        entity_name: entity_name.to_string(),
        file_path: path_label.to_string(),
        line_start,
        line_end,
        definition_text,
        members,
        match_quality: quality,
        char_start: decl_start as u64,
        char_end: end as u64,
    }
}

/// Rebuild the body text at brace depth 1 only, nested blocks elided.
fn depth_one_text(source: &str, open: usize, close: usize) -> String {
    let mut lexer = Lexer::new(source, open + 1);
    let mut depth = 1i32;
    let mut out = String::with_capacity(close.saturating_sub(open));
    while let Some((at, b)) = lexer.next_code_byte() {
        if at >= close {
            break;
        }
        match b {
            b'{' => {
                depth += 1;
            }
            b'}' => {
                depth -= 1;
                if depth == 1 {
                    // Re-synchronise statements after a nested block.
                    out.push(';');
                }
            }
            _ if depth == 1 => out.push(b as char),
            _ => {}
        }
    }
    out
}

fn member_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?m)^\s*(?:UPROPERTY\s*\([^)]*\)\s*)?([A-Za-z_][\w:<>,\s\*&]*?)\s+([A-Za-z_]\w*)\s*[=;(]",
        )
        .unwrap()
    })
}

const MEMBER_SKIP_KEYWORDS: &[&str] = &[
    "public", "private", "protected", "friend", "using", "typedef", "return", "if", "for",
    "while", "switch", "case", "template",
];

/// `TYPE NAME` strings for fields and methods declared at brace depth 1.
fn extract_members(source: &str, open: usize, close: usize) -> Vec<String> {
    let body = depth_one_text(source, open, close);
    let mut members = Vec::new();
    for cap in member_re().captures_iter(&body) {
        let ty = normalize_ws(&cap[1]);
        let name = &cap[2];
        let first = ty.split_whitespace().next().unwrap_or("");
        if MEMBER_SKIP_KEYWORDS.contains(&first) {
            continue;
        }
        members.push(format!("{ty} {name}"));
    }
    members
}

/// Enumerator identifiers at depth 1, up to `,` or `=`.
fn extract_enumerators(source: &str, open: usize, close: usize) -> Vec<String> {
    let body = depth_one_text(source, open, close);
    let mut out = Vec::new();
    for segment in body.split(',') {
        let segment = segment.split('=').next().unwrap_or("");
        let ident = segment.trim();
        if !ident.is_empty()
            && ident
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
            && ident.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        {
            out.push(ident.to_string());
        }
    }
    out
}

fn normalize_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ---------------------------------------------------------------------------
// File-level entry point
// ---------------------------------------------------------------------------

/// Recover complete definitions of `name` across the candidate files,
/// best match first. Exact matching is tried first when `fuzzy` is off,
/// with an automatic fuzzy fallback when it finds nothing. A malformed
/// file never fails the query; it is logged and skipped.
pub fn extract_definition(
    paths: &[PathBuf],
    kind: TargetKind,
    name: &str,
    fuzzy: bool,
) -> Vec<DefinitionResult> {
    let scan = |use_fuzzy: bool| -> Vec<DefinitionResult> {
        let mut found: Vec<DefinitionResult> = paths
            .par_iter()
            .flat_map(|path| {
                let label = path.to_string_lossy().replace('\\', "/");
                match std::fs::read_to_string(path) {
                    Ok(text) => extract_from_source(&text, &label, kind, name, use_fuzzy),
                    Err(e) => {
                        warn!("cannot read {label}: {e}");
                        Vec::new()
                    }
                }
            })
            .collect();
        sort_results(&mut found);
        found
    };

    let exact_first = scan(fuzzy);
    if !exact_first.is_empty() || fuzzy {
        return exact_first;
    }
    // Exact matching found nothing; fall back to fuzzy automatically.
    scan(true)
}

fn sort_results(results: &mut [DefinitionResult]) {
    results.sort_by(|a, b| {
        b.match_quality
            .partial_cmp(&a.match_quality)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.file_path.len().cmp(&b.file_path.len()))
            .then_with(|| a.file_path.cmp(&b.file_path))
            .then_with(|| a.line_start.cmp(&b.line_start))
    });
}
