//! Shared source buffers and heritage spans.
//!
//! Every AST node, error and JSON export points back into the program text
//! via a [`Span`]: a `(buffer, start, end)` view into an immutable shared
//! buffer. Comments are stripped before parsing, so spans always refer to
//! the comment-free text.

use std::fmt;
use std::sync::Arc;

/// An immutable view into a shared text buffer.
///
/// Invariant: `start <= end <= buffer.len()`, both on UTF-8 boundaries.
#[derive(Clone)]
pub struct Span {
    buffer: Arc<str>,
    start: usize,
    end: usize,
}

impl Span {
    /// A span covering a whole, freshly allocated buffer. Used both for
    /// top-level program text and for synthesized AST fragments.
    pub fn new(text: impl Into<Arc<str>>) -> Span {
        let buffer = text.into();
        let end = buffer.len();
        Span { buffer, start: 0, end }
    }

    pub fn text(&self) -> &str {
        &self.buffer[self.start..self.end]
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Offset of this span within the backing buffer.
    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Sub-span; `start` and `end` are byte offsets relative to this span.
    pub fn slice(&self, start: usize, end: usize) -> Span {
        let end = end.min(self.len());
        let start = start.min(end);
        Span {
            buffer: self.buffer.clone(),
            start: self.start + start,
            end: self.start + end,
        }
    }

    /// An empty span at the given relative offset.
    pub fn point(&self, at: usize) -> Span {
        self.slice(at, at)
    }

    /// The text before, inside and after the span, each trimmed to at most
    /// `limit` characters next to the span.
    pub fn pieces(&self, limit: usize) -> (String, String, String) {
        let before = &self.buffer[..self.start];
        let after = &self.buffer[self.end..];
        let before = if before.len() > limit {
            let mut cut = before.len() - limit;
            while !before.is_char_boundary(cut) {
                cut += 1;
            }
            &before[cut..]
        } else {
            before
        };
        let after = if after.len() > limit {
            let mut cut = limit;
            while !after.is_char_boundary(cut) {
                cut -= 1;
            }
            &after[..cut]
        } else {
            after
        };
        (before.to_string(), self.text().to_string(), after.to_string())
    }

    /// Strips leading and trailing whitespace, narrowing the span.
    pub fn trim(&self) -> Span {
        let text = self.text();
        let trimmed = text.trim_start();
        let lead = text.len() - trimmed.len();
        let trimmed = trimmed.trim_end();
        self.slice(lead, lead + trimmed.len())
    }

    pub fn starts_with(&self, prefix: &str) -> bool {
        self.text().starts_with(prefix)
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text())
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Span({:?})", self.text())
    }
}

// Spans compare by content: AST equality must not depend on where a node
// was parsed from, and synthesized nodes compare equal to parsed ones.
impl PartialEq for Span {
    fn eq(&self, other: &Span) -> bool {
        self.text() == other.text()
    }
}

impl Eq for Span {}

impl From<&str> for Span {
    fn from(s: &str) -> Span {
        Span::new(s.to_string())
    }
}

impl From<String> for Span {
    fn from(s: String) -> Span {
        Span::new(s)
    }
}
