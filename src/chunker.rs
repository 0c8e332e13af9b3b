use std::sync::OnceLock;

use regex::Regex;

use crate::config::ChunkingConfig;

/// Byte range of one chunk within the original decoded file text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub start: usize,
    pub end: usize,
}

impl ChunkSpan {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

fn hard_boundary_res() -> &'static [Regex; 4] {
    static RES: OnceLock<[Regex; 4]> = OnceLock::new();
    RES.get_or_init(|| {
        [
            // Type and namespace declarations.
            Regex::new(
                r"(?m)^\s*(?:template\s*<[^>]*>\s*)?(?:class|struct|enum(?:\s+class)?|namespace)\s+\w",
            )
            .unwrap(),
            // UE reflection macros open a new logical region.
            Regex::new(r"(?m)^\s*(?:UCLASS|USTRUCT|UENUM|UFUNCTION|UPROPERTY|UINTERFACE|UDELEGATE)\s*\(")
                .unwrap(),
            // Top-level braces at column 0: function body openers and closers.
            Regex::new(r"(?m)^[{}]").unwrap(),
            // Signature line of a top-level function definition whose brace
            // sits on the following line.
            Regex::new(r"(?m)^[A-Za-z_][^\n;={]*\([^\n;]*\)\s*(?:const)?\s*$").unwrap(),
        ]
    })
}

fn blank_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n[ \t]*\n").unwrap())
}

/// Split `text` into ordered, overlapping spans.
///
/// Structure-aware mode targets `chunk_size` chars and prefers, in order:
/// hard C++ boundaries (declarations, UE macros, top-level braces), blank
/// lines, sentence ends, any line break, and finally the raw character
/// offset. Boundaries inside comment sequences are never used. The
/// character-only fallback produces fixed windows of `fallback_chunk_size`.
pub fn chunk_spans(text: &str, cfg: &ChunkingConfig) -> Vec<ChunkSpan> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    if !cfg.structure_aware {
        return window_spans(text, cfg.fallback_chunk_size, cfg.chunk_overlap);
    }
    structured_spans(text, cfg.chunk_size, cfg.chunk_overlap)
}

fn window_spans(text: &str, size: usize, overlap: usize) -> Vec<ChunkSpan> {
    let len = text.len();
    let mut spans = Vec::new();
    let mut start = 0usize;
    loop {
        let end = floor_char(text, (start + size).min(len));
        spans.push(ChunkSpan { start, end });
        if end >= len {
            break;
        }
        let next = floor_char(text, end.saturating_sub(overlap));
        start = if next > start { next } else { end };
    }
    spans
}

fn structured_spans(text: &str, chunk_size: usize, overlap: usize) -> Vec<ChunkSpan> {
    let len = text.len();
    if len <= chunk_size {
        return vec![ChunkSpan { start: 0, end: len }];
    }

    let comments = comment_ranges(text);
    let in_comment = |pos: usize| comments.iter().any(|&(s, e)| pos > s && pos < e);

    // All hard boundaries up front, comment-interior ones discarded.
    let mut hard: Vec<usize> = Vec::new();
    for re in hard_boundary_res().iter() {
        for m in re.find_iter(text) {
            if !in_comment(m.start()) {
                hard.push(m.start());
            }
        }
    }
    hard.sort_unstable();
    hard.dedup();

    // Blank-line boundaries: the offset just past the blank region.
    let blanks: Vec<usize> = blank_line_re()
        .find_iter(text)
        .map(|m| m.end())
        .filter(|&pos| !in_comment(pos))
        .collect();

    let mut spans = Vec::new();
    let mut pos = 0usize;
    while pos < len {
        let target = pos + chunk_size;
        if target >= len {
            spans.push(ChunkSpan { start: pos, end: len });
            break;
        }
        // Only accept boundaries in the back half of the window so chunks
        // stay near the target size.
        let lo = pos + chunk_size / 2;
        let end = pick_in_range(&hard, lo, target)
            .or_else(|| pick_in_range(&blanks, lo, target))
            .or_else(|| sentence_end(text, lo, target).filter(|&p| !in_comment(p)))
            .or_else(|| last_newline(text, lo, target).filter(|&p| !in_comment(p)))
            .unwrap_or_else(|| {
                let raw = floor_char(text, target);
                // A raw cut may not land mid-comment; snap to the nearer edge.
                match comments.iter().find(|&&(s, e)| raw > s && raw < e) {
                    Some(&(s, _)) if s > lo => s,
                    Some(&(_, e)) => e.min(len),
                    None => raw,
                }
            });

        spans.push(ChunkSpan { start: pos, end });
        let next = floor_char(text, end.saturating_sub(overlap));
        pos = if next > pos { next } else { end };
    }
    spans
}

/// Largest boundary b with lo < b <= hi.
fn pick_in_range(sorted: &[usize], lo: usize, hi: usize) -> Option<usize> {
    let idx = sorted.partition_point(|&b| b <= hi);
    if idx == 0 {
        return None;
    }
    let b = sorted[idx - 1];
    (b > lo).then_some(b)
}

fn sentence_end(text: &str, lo: usize, hi: usize) -> Option<usize> {
    let window = text.get(lo..hi)?;
    for pat in [". ", ".\n", "! ", "? "] {
        if let Some(rel) = window.rfind(pat) {
            return Some(lo + rel + pat.len());
        }
    }
    None
}

fn last_newline(text: &str, lo: usize, hi: usize) -> Option<usize> {
    let window = text.get(lo..hi)?;
    window.rfind('\n').map(|rel| lo + rel + 1)
}

/// Byte ranges of comment sequences: block comments plus contiguous runs of
/// `//` lines. String and char literals are honoured so a quoted `/*` does
/// not open a region.
pub(crate) fn comment_ranges(text: &str) -> Vec<(usize, usize)> {
    let bytes = text.as_bytes();
    let len = bytes.len();
    let mut ranges = Vec::new();
    let mut i = 0usize;
    while i < len {
        match bytes[i] {
            b'"' => i = skip_string(bytes, i),
            b'\'' => i = skip_char_literal(bytes, i),
            b'/' if i + 1 < len && bytes[i + 1] == b'*' => {
                let start = i;
                i += 2;
                while i + 1 < len && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i = (i + 2).min(len);
                ranges.push((start, i));
            }
            b'/' if i + 1 < len && bytes[i + 1] == b'/' => {
                let start = i;
                // Swallow a run of consecutive //-lines as one region.
                loop {
                    while i < len && bytes[i] != b'\n' {
                        i += 1;
                    }
                    let mut j = i + 1;
                    while j < len && (bytes[j] == b' ' || bytes[j] == b'\t') {
                        j += 1;
                    }
                    if j + 1 < len && bytes[j] == b'/' && bytes[j + 1] == b'/' {
                        i = j;
                    } else {
                        break;
                    }
                }
                ranges.push((start, i.min(len)));
            }
            _ => i += 1,
        }
    }
    ranges
}

fn skip_string(bytes: &[u8], mut i: usize) -> usize {
    i += 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return i + 1,
            _ => i += 1,
        }
    }
    i
}

fn skip_char_literal(bytes: &[u8], mut i: usize) -> usize {
    i += 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'\'' => return i + 1,
            _ => i += 1,
        }
    }
    i
}

fn floor_char(text: &str, mut i: usize) -> usize {
    if i >= text.len() {
        return text.len();
    }
    while i > 0 && !text.is_char_boundary(i) {
        i -= 1;
    }
    i
}
