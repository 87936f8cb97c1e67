//! Lexical traversal and the split/strip primitives.
//!
//! The traverser walks a span byte by byte, tracking a stack of open
//! brackets, strings and comments. Everything above it — statement
//! splitting, record parsing, operator precedence — is built from
//! [`split`] and [`strip`], which only act at the top nesting level.

use crate::error::{ParseError, ParseErrorKind, ParseResult};
use crate::source::Span;

const LINE_COMMENT: u8 = b'#';
const STRING: u8 = b'"';
const BACKTICK: u8 = b'`';
const TRIPLE_STRING: u8 = b'3';
const BLOCK_COMMENT: u8 = b'/';

fn open_of(close: u8) -> u8 {
    match close {
        b')' => b'(',
        b']' => b'[',
        b'}' => b'{',
        _ => unreachable!(),
    }
}

/// One content position: a byte index that survives comment stripping,
/// plus a summary of the scanner state right after the byte.
#[derive(Clone, Copy, Debug)]
pub struct Visit {
    pub idx: usize,
    /// Number of open constructs.
    pub state_len: usize,
    /// The outermost open construct marker, if any.
    pub state_first: Option<u8>,
    /// The innermost open construct marker, if any.
    pub state_last: Option<u8>,
}

impl Visit {
    pub fn top_level(&self) -> bool {
        self.state_len == 0
    }

    /// The state is exactly one open `marker`.
    pub fn state_is(&self, marker: u8) -> bool {
        self.state_len == 1 && self.state_last == Some(marker)
    }
}

/// Iterator over content positions of a span.
pub struct Traversal<'a> {
    bytes: &'a [u8],
    span: &'a Span,
    idx: usize,
    state: Vec<u8>,
    pending: [Option<Visit>; 2],
    failed: bool,
}

impl<'a> Traversal<'a> {
    pub fn new(span: &'a Span) -> Traversal<'a> {
        Traversal {
            bytes: span.text().as_bytes(),
            span,
            idx: 0,
            state: Vec::new(),
            pending: [None, None],
            failed: false,
        }
    }

    /// True when the traversal consumed the whole span with a clean state.
    pub fn finished_whole(&self) -> bool {
        !self.failed && self.idx >= self.bytes.len() && self.state.is_empty()
    }

    fn visit(&self, idx: usize) -> Visit {
        Visit {
            idx,
            state_len: self.state.len(),
            state_first: self.state.first().copied(),
            state_last: self.state.last().copied(),
        }
    }

    fn error(&mut self, kind: ParseErrorKind, at: usize, message: &str) -> ParseError {
        self.failed = true;
        ParseError::new(kind, self.span.slice(at, (at + 1).min(self.bytes.len())), message)
    }
}

impl<'a> Iterator for Traversal<'a> {
    type Item = ParseResult<Visit>;

    fn next(&mut self) -> Option<ParseResult<Visit>> {
        if let Some(v) = self.pending[0].take() {
            self.pending[0] = self.pending[1].take();
            return Some(Ok(v));
        }
        if self.failed {
            return None;
        }
        loop {
            if self.idx >= self.bytes.len() {
                return None;
            }
            let i = self.idx;
            let c = self.bytes[i];
            let c2 = self.bytes.get(i..i + 2);
            let c3 = self.bytes.get(i..i + 3);
            match self.state.last().copied() {
                Some(LINE_COMMENT) => {
                    self.idx += 1;
                    if c == b'\n' {
                        self.state.pop();
                        return Some(Ok(self.visit(i)));
                    }
                    // Comment bytes are invisible to the compiler.
                }
                Some(STRING) => {
                    if c == b'\n' {
                        return Some(Err(self.error(
                            ParseErrorKind::EolInString,
                            i,
                            "End of line in string.",
                        )));
                    }
                    if c == b'"' {
                        self.state.pop();
                    }
                    self.idx += 1;
                    return Some(Ok(self.visit(i)));
                }
                Some(BACKTICK) => {
                    if c == b'`' {
                        self.state.pop();
                    }
                    self.idx += 1;
                    return Some(Ok(self.visit(i)));
                }
                Some(TRIPLE_STRING) => {
                    if c3 == Some(b"\"\"\"") {
                        self.state.pop();
                        self.idx += 3;
                        self.pending = [Some(self.visit(i + 1)), Some(self.visit(i + 2))];
                        return Some(Ok(self.visit(i)));
                    }
                    self.idx += 1;
                    return Some(Ok(self.visit(i)));
                }
                Some(BLOCK_COMMENT) => {
                    if c2 == Some(b"*/") {
                        self.state.pop();
                        self.idx += 2;
                    } else {
                        self.idx += 1;
                    }
                }
                _ => {
                    if c == b'#' {
                        self.state.push(LINE_COMMENT);
                        self.idx += 1;
                    } else if c3 == Some(b"\"\"\"") {
                        self.state.push(TRIPLE_STRING);
                        self.idx += 3;
                        self.pending = [Some(self.visit(i + 1)), Some(self.visit(i + 2))];
                        return Some(Ok(self.visit(i)));
                    } else if c == b'"' {
                        self.state.push(STRING);
                        self.idx += 1;
                        return Some(Ok(self.visit(i)));
                    } else if c == b'`' {
                        self.state.push(BACKTICK);
                        self.idx += 1;
                        return Some(Ok(self.visit(i)));
                    } else if c2 == Some(b"/*") {
                        self.state.push(BLOCK_COMMENT);
                        self.idx += 2;
                    } else if matches!(c, b'(' | b'[' | b'{') {
                        self.state.push(c);
                        self.idx += 1;
                        return Some(Ok(self.visit(i)));
                    } else if matches!(c, b')' | b']' | b'}') {
                        if self.state.last() == Some(&open_of(c)) {
                            self.state.pop();
                            self.idx += 1;
                            return Some(Ok(self.visit(i)));
                        }
                        return Some(Err(self.error(
                            ParseErrorKind::Unmatched,
                            i,
                            "Parenthesis matches nothing.",
                        )));
                    } else {
                        self.idx += 1;
                        return Some(Ok(self.visit(i)));
                    }
                }
            }
        }
    }
}

/// Rewrites the program with comments removed, preserving everything the
/// traverser yields. The result becomes the backing buffer for all spans.
pub fn remove_comments(text: &str) -> ParseResult<String> {
    let span = Span::new(text.to_string());
    let bytes = text.as_bytes();
    let mut kept = Vec::with_capacity(bytes.len());
    let mut traversal = Traversal::new(&span);
    while let Some(visit) = traversal.next() {
        kept.push(bytes[visit?.idx]);
    }
    Ok(String::from_utf8(kept).expect("comment removal preserves UTF-8"))
}

/// A span is whole when traversal succeeds and ends with an empty
/// bracket/string/comment state. The fundamental predicate of parsing.
pub fn is_whole(span: &Span) -> bool {
    let mut traversal = Traversal::new(span);
    for visit in &mut traversal {
        if visit.is_err() {
            return false;
        }
    }
    traversal.finished_whole()
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Splits on `separator` at the top nesting level, outside strings and
/// comments. Returned parts are raw (not stripped).
///
/// Two disambiguation rules apply at every match position:
/// - a match adjacent to a `|` does not split, so `||` is never torn apart;
/// - a separator that starts or ends with a word character only splits at
///   word boundaries (`in`, `is`, `distinct`, ...).
pub fn split_raw(span: &Span, separator: &str) -> ParseResult<Vec<Span>> {
    let bytes = span.text().as_bytes();
    let sep = separator.as_bytes();
    let l = sep.len();
    let mut parts = Vec::new();
    let mut part_start = 0usize;
    let mut traversal = Traversal::new(span);
    while let Some(visit) = traversal.next() {
        let visit = visit?;
        let idx = visit.idx;
        if !visit.top_level() || bytes.get(idx..idx + l) != Some(sep) {
            continue;
        }
        if bytes.get(idx + l) == Some(&b'|') || (idx > 0 && bytes[idx - 1] == b'|') {
            continue;
        }
        if is_word_byte(sep[0]) && idx > 0 && is_word_byte(bytes[idx - 1]) {
            continue;
        }
        if is_word_byte(sep[l - 1])
            && bytes.get(idx + l).copied().map_or(false, is_word_byte)
        {
            continue;
        }
        parts.push(span.slice(part_start, idx));
        let mut last = idx;
        for _ in 0..l - 1 {
            if let Some(Ok(v)) = traversal.next() {
                last = v.idx;
            }
        }
        part_start = last + 1;
    }
    parts.push(span.slice(part_start, span.len()));
    Ok(parts)
}

/// Removes outer whitespace and unwraps redundant outer parentheses.
pub fn strip(span: &Span) -> Span {
    let mut s = span.clone();
    loop {
        s = s.trim();
        let text = s.text();
        if text.len() >= 2
            && text.starts_with('(')
            && text.ends_with(')')
            && is_whole(&s.slice(1, s.len() - 1))
        {
            s = s.slice(1, s.len() - 1);
        } else {
            return s;
        }
    }
}

/// `split_raw` followed by stripping of every part.
pub fn split(span: &Span, separator: &str) -> ParseResult<Vec<Span>> {
    Ok(split_raw(span, separator)?.iter().map(strip).collect())
}

/// Splits in exactly two parts or fails.
pub fn split_in_two(span: &Span, separator: &str) -> ParseResult<(Span, Span)> {
    let parts = split(span, separator)?;
    if parts.len() != 2 {
        return Err(ParseError::syntax(
            span.clone(),
            format!("I expected string to be split by >>{separator}<< in two."),
        ));
    }
    let mut it = parts.into_iter();
    Ok((it.next().unwrap(), it.next().unwrap()))
}

/// Splits in one or two parts: `Ok(None)` when the separator is absent.
pub fn split_in_one_or_two(span: &Span, separator: &str) -> ParseResult<Option<(Span, Span)>> {
    let parts = split(span, separator)?;
    match parts.len() {
        1 => Ok(None),
        2 => {
            let mut it = parts.into_iter();
            Ok(Some((it.next().unwrap(), it.next().unwrap())))
        }
        _ => Err(ParseError::syntax(
            span.clone(),
            format!("String should have been split by >>{separator}<< in 1 or 2 pieces."),
        )),
    }
}

/// Splits every span by the separator and flattens the result.
pub fn split_many(spans: &[Span], separator: &str) -> ParseResult<Vec<Span>> {
    let mut result = Vec::new();
    for s in spans {
        result.extend(split(s, separator)?);
    }
    Ok(result)
}

/// Whitespace splitting that respects strings and parentheses. Only
/// non-empty parts are returned.
pub fn split_on_whitespace(span: &Span) -> ParseResult<Vec<Span>> {
    let mut parts = vec![span.clone()];
    for sep in [" ", "\n", "\t"] {
        parts = split_many(&parts, sep)?;
    }
    Ok(parts.into_iter().filter(|p| !p.is_empty()).collect())
}
