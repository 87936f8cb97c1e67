//! Error taxonomy of the compiler.
//!
//! Parsing primitives return `Result<T, ParseError>`; the rest of the
//! pipeline returns `Result<T, CompileError>`. The first error aborts
//! compilation of the current file, there is no local recovery.

use thiserror::Error;

use crate::source::Span;

/// How many characters of context to show around an offending span.
const CONTEXT_CHARS: usize = 300;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// A closing bracket with an empty or mismatching stack.
    Unmatched,
    /// A newline inside a single-line string.
    EolInString,
    /// Any other malformed construct.
    Syntax,
}

/// A parsing error with the exact source span it refers to.
#[derive(Clone, Debug)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub span: Span,
    pub message: String,
}

impl ParseError {
    pub fn new(kind: ParseErrorKind, span: Span, message: impl Into<String>) -> ParseError {
        ParseError { kind, span, message: message.into() }
    }

    pub fn syntax(span: Span, message: impl Into<String>) -> ParseError {
        ParseError::new(ParseErrorKind::Syntax, span, message)
    }

    /// The offending substring highlighted within up to 300 characters of
    /// surrounding context.
    pub fn snippet(&self) -> String {
        let (before, mut error, after) = self.span.pieces(CONTEXT_CHARS);
        if error.is_empty() {
            error = "<EMPTY>".to_string();
        }
        format!("{before}>>{error}<<{after}")
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n{}", self.message, self.snippet())
    }
}

impl std::error::Error for ParseError {}

#[derive(Error, Debug)]
pub enum CompileError {
    #[error("Parsing:\n{0}")]
    Parse(#[from] ParseError),

    #[error("Import error: {message}\nImport chain: {}", chain.join(" -> "))]
    Import { message: String, chain: Vec<String> },

    #[error("Compiling:\n{rule_text}\n{message}")]
    Rule { message: String, rule_text: String },

    #[error("Functor error in {functor}: {message}")]
    Functor { functor: String, message: String },

    #[error("Dialect error: {0}")]
    Dialect(String),
}

impl CompileError {
    /// The standard shape for errors that carry the offending rule text.
    pub fn rule(message: impl Into<String>, rule_text: impl ToString) -> CompileError {
        CompileError::Rule { message: message.into(), rule_text: rule_text.to_string() }
    }
}

pub type Result<T> = std::result::Result<T, CompileError>;
pub type ParseResult<T> = std::result::Result<T, ParseError>;
