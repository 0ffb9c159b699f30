//! SEARCH/REPLACE block parsing and application.
//!
//! A diff document is a sequence of blocks:
//!
//! ```text
//! <<<<<<< SEARCH        (or --- SEARCH)
//! original lines
//! =======
//! replacement lines
//! >>>>>>> REPLACE       (or +++ REPLACE)
//! ```
//!
//! Each SEARCH text is resolved to a byte range of the original content (exact match first,
//! then a line-trimmed match, then a first/last-line anchor match), and the final content is
//! assembled by splicing every replacement into the original at its absolute position.

use std::fmt;

/// Characters that open a marker line. A line in idle state that starts with one of these
/// but is not a well-formed marker is rejected as garbled.
const MARKER_PREFIXES: [char; 5] = ['-', '<', '=', '+', '>'];
const SEARCH_FENCES: [char; 2] = ['-', '<'];
const REPLACE_FENCES: [char; 2] = ['+', '>'];
const MIN_FENCE_LEN: usize = 3;
const MIN_ANCHOR_LINES: usize = 3;
const SEARCH_EXCERPT_CHARS: usize = 200;

// ═══════════════════════════════════════════════════════════════════════════
//  ERRORS
// ═══════════════════════════════════════════════════════════════════════════

/// Why a diff document could not be applied. Line numbers are 1-based and refer to the
/// marker-normalized document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffError {
    UnterminatedSearch,
    UnterminatedReplace,
    NestedBlock { line: usize },
    SeparatorWithoutSearch { line: usize },
    ReplaceWithoutSearch { line: usize },
    MisplacedMarker { line: usize, text: String },
    EmptySearch,
    NoMatch { excerpt: String },
    NoBlocks,
    OverlappingBlocks,
}

impl fmt::Display for DiffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiffError::UnterminatedSearch => write!(
                f,
                "Unterminated SEARCH block: missing middle marker '=======' and/or REPLACE block."
            ),
            DiffError::UnterminatedReplace => write!(
                f,
                "Unterminated REPLACE block at end of diff: REPLACE must contain content and be closed with '>>>>>>> REPLACE'."
            ),
            DiffError::NestedBlock { line } => write!(
                f,
                "Malformed diff (line {}): found SEARCH block start while previous block not closed. Ensure '<<<<<<< SEARCH' and '=======' / '>>>>>>> REPLACE' markers are used correctly.",
                line
            ),
            DiffError::SeparatorWithoutSearch { line } => write!(
                f,
                "Malformed diff (line {}): found middle marker '=======' but no open SEARCH block. Missing '<<<<<<< SEARCH' before '======='.",
                line
            ),
            DiffError::ReplaceWithoutSearch { line } => write!(
                f,
                "Malformed diff (line {}): found REPLACE end marker without an open REPLACE block. Ensure '=======' precedes '>>>>>>> REPLACE'.",
                line
            ),
            DiffError::MisplacedMarker { line, text } => write!(
                f,
                "Malformed marker or misplaced content (line {}): '{}'. Expected markers are '<<<<<<< SEARCH', '=======', '>>>>>>> REPLACE'.",
                line, text
            ),
            DiffError::EmptySearch => write!(
                f,
                "Empty SEARCH block on non-empty original content: SEARCH block must contain text to match in the original content."
            ),
            DiffError::NoMatch { excerpt } => write!(
                f,
                "SEARCH block not found in original content. Excerpt: {}",
                excerpt
            ),
            DiffError::NoBlocks => write!(
                f,
                "Malformed or empty diff provided; no valid SEARCH/REPLACE blocks found."
            ),
            DiffError::OverlappingBlocks => write!(
                f,
                "Two SEARCH blocks matched overlapping regions of the original content. Merge them into one block."
            ),
        }
    }
}

impl std::error::Error for DiffError {}

// ═══════════════════════════════════════════════════════════════════════════
//  MARKERS
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    SearchStart,
    Separator,
    ReplaceEnd,
}

/// Strip a leading run of one fence character (at least three of them).
fn strip_fence<'a>(text: &'a str, fences: &[char]) -> Option<&'a str> {
    let first = text.chars().next()?;
    if !fences.contains(&first) {
        return None;
    }
    let run = text.chars().take_while(|c| *c == first).count();
    if run < MIN_FENCE_LEN {
        return None;
    }
    // Fence characters are ASCII, so the char count is the byte length.
    Some(&text[run..])
}

/// Returns what follows `<fence> KEYWORD [>]`, or None if the line doesn't open that way.
fn keyword_marker_tail<'a>(text: &'a str, fences: &[char], keyword: &str) -> Option<&'a str> {
    let rest = strip_fence(text, fences)?;
    let rest = rest.trim_start().strip_prefix(keyword)?;
    Some(rest.trim_start().strip_prefix('>').unwrap_or(rest))
}

fn classify_marker(line: &str) -> Option<Marker> {
    let trimmed = line.trim();
    if trimmed.len() >= MIN_FENCE_LEN && trimmed.chars().all(|c| c == '=') {
        return Some(Marker::Separator);
    }
    if let Some(tail) = keyword_marker_tail(trimmed, &SEARCH_FENCES, "SEARCH") {
        if tail.trim().is_empty() {
            return Some(Marker::SearchStart);
        }
    }
    if let Some(tail) = keyword_marker_tail(trimmed, &REPLACE_FENCES, "REPLACE") {
        if tail.trim().is_empty() {
            return Some(Marker::ReplaceEnd);
        }
    }
    None
}

fn starts_with_marker_prefix(line: &str) -> bool {
    line.chars()
        .next()
        .map(|c| MARKER_PREFIXES.contains(&c))
        .unwrap_or(false)
}

/// Split `<<<<<<< SEARCHcode` into the marker and the code that was glued onto it.
fn split_glued_search_start(line: &str) -> Option<(&str, &str)> {
    let body = line.trim_start();
    let tail = keyword_marker_tail(body, &SEARCH_FENCES, "SEARCH")?;
    let first = tail.chars().next()?;
    if first.is_whitespace() {
        return None;
    }
    let split_at = line.len() - tail.len();
    Some((&line[..split_at], tail))
}

/// Split `code=======` into the code and the separator.
fn split_glued_separator(line: &str) -> Option<(&str, &str)> {
    let body = line.trim_end();
    let run = body.chars().rev().take_while(|c| *c == '=').count();
    if run < MIN_FENCE_LEN {
        return None;
    }
    let before = &body[..body.len() - run];
    let last = before.chars().last()?;
    if last.is_whitespace() {
        return None;
    }
    Some((before, &body[before.len()..]))
}

/// Split `code>>>>>>> REPLACE` into the code and the end marker.
fn split_glued_replace_end(line: &str) -> Option<(&str, &str)> {
    let body = line.trim_end();
    let without_decoration = body.strip_suffix('>').unwrap_or(body);
    let before_keyword = without_decoration.strip_suffix("REPLACE")?.trim_end();
    let fence = before_keyword.chars().last()?;
    if !REPLACE_FENCES.contains(&fence) {
        return None;
    }
    let run = before_keyword
        .chars()
        .rev()
        .take_while(|c| *c == fence)
        .count();
    if run < MIN_FENCE_LEN {
        return None;
    }
    let code = &before_keyword[..before_keyword.len() - run];
    let last = code.chars().last()?;
    if last.is_whitespace() {
        return None;
    }
    Some((code, &body[code.len()..]))
}

/// Put every marker on its own line. Models regularly glue markers onto adjacent code when
/// they drop a newline.
pub fn normalize_markers(diff: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for line in diff.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if classify_marker(line).is_some() {
            out.push(line);
            continue;
        }
        if let Some((marker, code)) = split_glued_search_start(line) {
            out.push(marker);
            out.push(code);
        } else if let Some((code, marker)) = split_glued_separator(line) {
            out.push(code);
            out.push(marker);
        } else if let Some((code, marker)) = split_glued_replace_end(line) {
            out.push(code);
            out.push(marker);
        } else {
            out.push(line);
        }
    }
    out.join("\n")
}

// ═══════════════════════════════════════════════════════════════════════════
//  MATCHING
// ═══════════════════════════════════════════════════════════════════════════

/// How a resolved range ends, which decides whether the replacement carries a line break.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RangeEnd {
    /// The range consumed a line break.
    LineBreak,
    /// The range runs to the end of a file that has no trailing line break.
    Eof,
    /// The range stops inside a line.
    MidLine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MatchRange {
    start: usize,
    end: usize,
    ending: RangeEnd,
}

struct LineSpan<'a> {
    start: usize,
    end: usize,
    text: &'a str,
    has_break: bool,
}

fn line_spans(content: &str) -> Vec<LineSpan<'_>> {
    let mut spans = Vec::new();
    let mut offset = 0usize;
    for piece in content.split_inclusive('\n') {
        let has_break = piece.ends_with('\n');
        let text = piece.trim_end_matches('\n').trim_end_matches('\r');
        spans.push(LineSpan {
            start: offset,
            end: offset + piece.len(),
            text,
            has_break,
        });
        offset += piece.len();
    }
    spans
}

fn first_line_at_or_after(spans: &[LineSpan<'_>], cursor: usize) -> usize {
    spans
        .iter()
        .position(|span| span.start >= cursor)
        .unwrap_or(spans.len())
}

fn range_over_lines(spans: &[LineSpan<'_>], first: usize, count: usize) -> MatchRange {
    let last = &spans[first + count - 1];
    MatchRange {
        start: spans[first].start,
        end: last.end,
        ending: if last.has_break {
            RangeEnd::LineBreak
        } else {
            RangeEnd::Eof
        },
    }
}

/// Extend an exact substring match over the line break that follows it.
fn settle_exact_range(content: &str, start: usize, end: usize) -> MatchRange {
    let rest = &content[end..];
    if rest.starts_with("\r\n") {
        return MatchRange {
            start,
            end: end + 2,
            ending: RangeEnd::LineBreak,
        };
    }
    if rest.starts_with('\n') {
        return MatchRange {
            start,
            end: end + 1,
            ending: RangeEnd::LineBreak,
        };
    }
    let ending = if end > start && content[start..end].ends_with('\n') {
        RangeEnd::LineBreak
    } else if end == content.len() {
        RangeEnd::Eof
    } else {
        RangeEnd::MidLine
    };
    MatchRange { start, end, ending }
}

fn exact_match(content: &str, search: &str, from: usize) -> Option<MatchRange> {
    let idx = content.get(from..)?.find(search)?;
    let start = from + idx;
    Some(settle_exact_range(content, start, start + search.len()))
}

fn fuzzy_search_lines(search_lines: &[String]) -> &[String] {
    match search_lines.split_last() {
        Some((last, rest)) if last.trim().is_empty() && !rest.is_empty() => rest,
        _ => search_lines,
    }
}

fn line_trimmed_match(content: &str, search_lines: &[String], cursor: usize) -> Option<MatchRange> {
    let search_lines = fuzzy_search_lines(search_lines);
    let spans = line_spans(content);
    let count = search_lines.len();
    if count == 0 || count > spans.len() {
        return None;
    }
    let first = first_line_at_or_after(&spans, cursor);
    (first..=spans.len() - count)
        .find(|&i| {
            search_lines
                .iter()
                .enumerate()
                .all(|(j, line)| spans[i + j].text.trim() == line.trim())
        })
        .map(|i| range_over_lines(&spans, i, count))
}

fn block_anchor_match(content: &str, search_lines: &[String], cursor: usize) -> Option<MatchRange> {
    let search_lines = fuzzy_search_lines(search_lines);
    let count = search_lines.len();
    if count < MIN_ANCHOR_LINES {
        return None;
    }
    let spans = line_spans(content);
    if count > spans.len() {
        return None;
    }
    let first_anchor = search_lines[0].trim();
    let last_anchor = search_lines[count - 1].trim();
    let first = first_line_at_or_after(&spans, cursor);
    (first..=spans.len() - count)
        .find(|&i| {
            spans[i].text.trim() == first_anchor && spans[i + count - 1].text.trim() == last_anchor
        })
        .map(|i| range_over_lines(&spans, i, count))
}

fn search_excerpt(search: &str) -> String {
    if search.chars().count() > SEARCH_EXCERPT_CHARS {
        let head: String = search.chars().take(SEARCH_EXCERPT_CHARS).collect();
        format!("{}...", head)
    } else {
        search.to_string()
    }
}

/// Resolve SEARCH lines against the original, anchored at `cursor`. Falls back to an
/// unanchored exact search; a match found that way may start before the cursor.
fn resolve_search(
    original: &str,
    search_lines: &[String],
    cursor: usize,
) -> Result<MatchRange, DiffError> {
    // A lone blank line joins to nothing and would match anywhere.
    if search_lines.join("\n").is_empty() {
        if original.is_empty() {
            return Ok(MatchRange {
                start: 0,
                end: 0,
                ending: RangeEnd::LineBreak,
            });
        }
        return Err(DiffError::EmptySearch);
    }

    let search = search_lines.join("\n");
    exact_match(original, &search, cursor)
        .or_else(|| line_trimmed_match(original, search_lines, cursor))
        .or_else(|| block_anchor_match(original, search_lines, cursor))
        .or_else(|| exact_match(original, &search, 0))
        .ok_or_else(|| DiffError::NoMatch {
            excerpt: search_excerpt(&search),
        })
}

fn replacement_text(lines: &[String], ending: RangeEnd, newline: &str) -> String {
    if lines.is_empty() {
        return String::new();
    }
    let mut text = lines.join(newline);
    if ending == RangeEnd::LineBreak {
        text.push_str(newline);
    }
    text
}

// ═══════════════════════════════════════════════════════════════════════════
//  SCANNER
// ═══════════════════════════════════════════════════════════════════════════

/// A SEARCH block whose range has been resolved and that is now collecting REPLACE lines.
#[derive(Debug, Clone)]
struct ResolvedSearch {
    range: MatchRange,
    out_of_order: bool,
}

#[derive(Debug, Clone)]
enum ScanState {
    Idle,
    InSearch { lines: Vec<String> },
    InReplace { search: ResolvedSearch, lines: Vec<String> },
}

#[derive(Debug, Clone)]
struct Replacement {
    start: usize,
    end: usize,
    text: String,
}

/// Everything the scanner accumulates besides its state.
struct Assembly<'a> {
    original: &'a str,
    newline: &'static str,
    cursor: usize,
    preview: String,
    replacements: Vec<Replacement>,
    saw_block: bool,
}

impl<'a> Assembly<'a> {
    fn new(original: &'a str) -> Self {
        Self {
            original,
            newline: if original.contains("\r\n") { "\r\n" } else { "\n" },
            cursor: 0,
            preview: String::new(),
            replacements: Vec::new(),
            saw_block: false,
        }
    }

    fn open_replace(&mut self, search_lines: &[String]) -> Result<ResolvedSearch, DiffError> {
        let range = resolve_search(self.original, search_lines, self.cursor)?;
        let out_of_order = range.start < self.cursor;
        if !out_of_order {
            self.preview
                .push_str(&self.original[self.cursor..range.start]);
        }
        Ok(ResolvedSearch {
            range,
            out_of_order,
        })
    }

    fn commit(&mut self, search: &ResolvedSearch, replace_lines: &[String]) {
        let text = replacement_text(replace_lines, search.range.ending, self.newline);
        if !search.out_of_order {
            self.cursor = search.range.end;
            self.preview.push_str(&text);
        }
        self.replacements.push(Replacement {
            start: search.range.start,
            end: search.range.end,
            text,
        });
    }

    fn splice(mut self) -> Result<String, DiffError> {
        self.replacements.sort_by_key(|r| (r.start, r.end));
        let mut out = String::with_capacity(self.original.len());
        let mut pos = 0usize;
        for replacement in &self.replacements {
            if replacement.start < pos {
                return Err(DiffError::OverlappingBlocks);
            }
            out.push_str(&self.original[pos..replacement.start]);
            out.push_str(&replacement.text);
            pos = replacement.end;
        }
        out.push_str(&self.original[pos..]);
        Ok(out)
    }
}

impl ScanState {
    /// Consume one diff line and return the next state.
    fn step(
        self,
        line: &str,
        line_no: usize,
        assembly: &mut Assembly<'_>,
    ) -> Result<ScanState, DiffError> {
        match (self, classify_marker(line)) {
            (ScanState::Idle, Some(Marker::SearchStart)) => {
                assembly.saw_block = true;
                Ok(ScanState::InSearch { lines: Vec::new() })
            }
            (_, Some(Marker::SearchStart)) => Err(DiffError::NestedBlock { line: line_no }),

            (ScanState::InSearch { lines }, Some(Marker::Separator)) => {
                let search = assembly.open_replace(&lines)?;
                Ok(ScanState::InReplace {
                    search,
                    lines: Vec::new(),
                })
            }
            (_, Some(Marker::Separator)) => {
                Err(DiffError::SeparatorWithoutSearch { line: line_no })
            }

            (ScanState::InReplace { search, lines }, Some(Marker::ReplaceEnd)) => {
                assembly.commit(&search, &lines);
                Ok(ScanState::Idle)
            }
            (_, Some(Marker::ReplaceEnd)) => Err(DiffError::ReplaceWithoutSearch { line: line_no }),

            (ScanState::InSearch { mut lines }, None) => {
                lines.push(line.to_string());
                Ok(ScanState::InSearch { lines })
            }
            (ScanState::InReplace { search, mut lines }, None) => {
                lines.push(line.to_string());
                Ok(ScanState::InReplace { search, lines })
            }
            (ScanState::Idle, None) => {
                if starts_with_marker_prefix(line) {
                    Err(DiffError::MisplacedMarker {
                        line: line_no,
                        text: line.to_string(),
                    })
                } else {
                    Ok(ScanState::Idle)
                }
            }
        }
    }
}

/// Apply a SEARCH/REPLACE diff document to `original`.
///
/// With `is_final` the replacements are spliced into the original by absolute position and
/// truncated trailing blocks are validated. Without it, the cursor-ordered preview is
/// returned (for incremental display while a response is still streaming).
pub fn apply_diff_to_content(
    diff: &str,
    original: &str,
    is_final: bool,
) -> Result<String, DiffError> {
    let normalized = normalize_markers(diff);
    let mut lines: Vec<&str> = normalized.split('\n').collect();

    // A stream cut mid-marker leaves a garbled marker on the last line.
    if let Some(last) = lines.last() {
        if starts_with_marker_prefix(last) && classify_marker(last).is_none() {
            lines.pop();
        }
    }

    let mut assembly = Assembly::new(original);
    let mut state = ScanState::Idle;
    for (idx, line) in lines.iter().enumerate() {
        state = state.step(line, idx + 1, &mut assembly)?;
    }

    if !normalized.trim().is_empty() && !assembly.saw_block {
        return Err(DiffError::NoBlocks);
    }

    if !is_final {
        if let ScanState::InReplace { search, lines } = &state {
            if !search.out_of_order {
                for line in lines {
                    assembly.preview.push_str(line);
                    assembly.preview.push('\n');
                }
            }
        }
        return Ok(assembly.preview);
    }

    match state {
        ScanState::Idle => {}
        ScanState::InSearch { .. } => return Err(DiffError::UnterminatedSearch),
        ScanState::InReplace { search, lines } => {
            if lines.is_empty() {
                return Err(DiffError::UnterminatedReplace);
            }
            assembly.commit(&search, &lines);
        }
    }

    assembly.splice()
}
