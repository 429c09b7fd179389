use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    api::{MatcherId, ParsingResult},
    peg::{InputBuffer, EOI},
};

/// Mistakes in the grammar itself; these abort a run instead of being
/// collected as parse errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GrammarError {
    #[error("placeholder {0} was never set")]
    UnresolvedPlaceholder(String),
    #[error("placeholder {0} resolves to itself")]
    PlaceholderCycle(String),
    #[error("placeholder {0} already set")]
    PlaceholderAlreadySet(String),
    #[error("{0} is not a placeholder")]
    NotAPlaceholder(String),
    #[error("invalid code point U+{0:04X}")]
    InvalidCodePoint(u32),
    #[error("invalid range {0}")]
    InvalidRange(String),
    #[error("{0} iteration matched empty input; the inner rule must always consume")]
    EmptyLoop(String),
    #[error("{0}")]
    IllegalAction(String),
    #[error("no variable frame for {0}")]
    NoVariableFrame(String),
    #[error("variable {0} holds a value of another type")]
    VariableType(String),
}

/// Returned from an action to record a parse error and fail the match
/// without aborting the run.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ActionFailure {
    pub message: String,
}

impl ActionFailure {
    pub fn new(message: impl Into<String>) -> Self {
        ActionFailure {
            message: message.into(),
        }
    }
}

/// Attached once to errors escaping the match protocol.
#[derive(Debug, Error, Clone)]
#[error("error at {path}, input index {index}")]
pub struct MatchLocation {
    pub path: MatcherPath,
    pub index: usize,
}

/// Raised when the recovering runner exceeds its time budget.
#[derive(Debug, Error, Clone, Copy)]
#[error("recovery timed out after {elapsed_ms}ms")]
pub struct RecoveryTimeout {
    pub elapsed_ms: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PathElement {
    pub matcher: MatcherId,
    pub label: String,
    pub start_index: usize,
    pub level: usize,
}

/// The chain of active matchers from the root down to some matcher, each
/// with the input index where it started.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct MatcherPath {
    pub elements: Vec<PathElement>,
}

impl MatcherPath {
    pub fn last(&self) -> Option<&PathElement> {
        self.elements.last()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn labels(&self) -> Vec<&str> {
        self.elements.iter().map(|e| e.label.as_str()).collect()
    }
}

impl Display for MatcherPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.labels().join("/"))
    }
}

/// A problem with the input. Offsets refer to the text supplied by the
/// caller, even when the parse ran over a buffer with injected markers.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ParseError {
    InvalidInput {
        start_index: usize,
        end_index: usize,
        failed_matchers: Vec<MatcherPath>,
        message: Option<String>,
    },
    Action {
        index: usize,
        message: String,
        path: MatcherPath,
    },
    Basic {
        index: usize,
        message: String,
    },
}

impl ParseError {
    pub fn start_index(&self) -> usize {
        match self {
            ParseError::InvalidInput { start_index, .. } => *start_index,
            ParseError::Action { index, .. } | ParseError::Basic { index, .. } => *index,
        }
    }

    pub fn end_index(&self) -> usize {
        match self {
            ParseError::InvalidInput { end_index, .. } => *end_index,
            ParseError::Action { index, .. } | ParseError::Basic { index, .. } => *index + 1,
        }
    }

    /// Labels of the matchers that would have accepted the input, in
    /// discovery order and without duplicates.
    pub fn expected_labels(&self) -> Vec<String> {
        let mut r: Vec<String> = vec![];
        if let ParseError::InvalidInput {
            failed_matchers, ..
        } = self
        {
            for p in failed_matchers {
                if let Some(e) = p.last() {
                    if !r.contains(&e.label) {
                        r.push(e.label.clone());
                    }
                }
            }
        }
        r
    }
}

fn quote_char(c: char) -> String {
    if c == EOI {
        "EOI".to_string()
    } else {
        format!("'{}'", c.escape_default())
    }
}

fn join_expected(labels: &[String]) -> String {
    match labels {
        [] => String::new(),
        [one] => one.clone(),
        [init @ .., last] => format!("{} or {}", init.join(", "), last),
    }
}

/// Renders an error in the classic form:
///
/// ```text
/// Invalid input 'x', expected 'b' (line 1, pos 2):
/// axc
///  ^
/// ```
pub fn format_parse_error(error: &ParseError, source: &dyn InputBuffer) -> String {
    let start = error.start_index();
    let end = error.end_index().max(start + 1);
    let mut msg = match error {
        ParseError::InvalidInput { message, .. } => {
            if let Some(m) = message {
                m.clone()
            } else {
                let found = if end - start == 1 || start >= source.len() {
                    quote_char(source.char_at(start))
                } else {
                    format!("\"{}\"", source.extract(start, end).escape_default())
                };
                let expected = error.expected_labels();
                if expected.is_empty() {
                    format!("Invalid input {}", found)
                } else {
                    format!(
                        "Invalid input {}, expected {}",
                        found,
                        join_expected(&expected)
                    )
                }
            }
        }
        ParseError::Action { message, .. } | ParseError::Basic { message, .. } => message.clone(),
    };

    let pos = source.position(start);
    msg.push_str(&format!(" (line {}, pos {}):\n", pos.line, pos.column));
    let line = source.extract_line(pos.line);
    msg.push_str(&line);
    msg.push('\n');
    let line_len = line.chars().count();
    let carets = if source.position(end - 1).line == pos.line {
        (end - start).min(line_len.saturating_sub(pos.column - 1)).max(1)
    } else {
        1
    };
    msg.push_str(&" ".repeat(pos.column - 1));
    msg.push_str(&"^".repeat(carets));
    msg.push('\n');
    msg
}

/// Failure of a whole runner invocation.
pub enum RunError<V> {
    /// The recovering runner ran out of time. The partial result is the
    /// outcome of the last completed pass.
    Timeout {
        elapsed_ms: u64,
        last_result: Box<ParsingResult<V>>,
    },
    /// A grammar definition error, an action error, or a panic.
    Fatal(anyhow::Error),
}

impl<V> RunError<V> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RunError::Timeout { .. })
    }

    pub fn into_fatal(self) -> Option<anyhow::Error> {
        match self {
            RunError::Fatal(e) => Some(e),
            RunError::Timeout { .. } => None,
        }
    }
}

impl<V> From<anyhow::Error> for RunError<V> {
    fn from(e: anyhow::Error) -> Self {
        RunError::Fatal(e)
    }
}

impl<V> Display for RunError<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunError::Timeout { elapsed_ms, .. } => {
                write!(f, "parse timed out after {}ms", elapsed_ms)
            }
            RunError::Fatal(e) => write!(f, "{:#}", e),
        }
    }
}

impl<V> fmt::Debug for RunError<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunError::Timeout { elapsed_ms, .. } => f
                .debug_struct("Timeout")
                .field("elapsed_ms", elapsed_ms)
                .finish_non_exhaustive(),
            RunError::Fatal(e) => f.debug_tuple("Fatal").field(e).finish(),
        }
    }
}

impl<V> std::error::Error for RunError<V> {}
