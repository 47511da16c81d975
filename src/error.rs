//! The closed set of error kinds this crate can produce, and the position
//! information attached to the ones the specification marks as
//! position-tagged.

use crate::codemap::FileMap;
use std::sync::Arc;

/// A reference to where, in the template source, an error occurred.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Position {
    /// The name of the part (or fragment) the error occurred in.
    pub part: String,
    /// The 1-indexed line number.
    pub line: usize,
    /// The 1-indexed column number.
    pub column: usize,
    /// A short excerpt of the source around the error, for display.
    pub excerpt: String,
}

impl Position {
    /// Builds a position from a part name, its source, and a byte offset
    /// within that source.
    pub fn new(part: &str, source: &str, offset: usize) -> Self {
        let map = FileMap::new(source);
        let lc = map.find_line_col(offset.min(source.len()));
        let start = offset.saturating_sub(20).min(source.len());
        let mut end = (offset + 20).min(source.len());
        while !source.is_char_boundary(end) {
            end -= 1;
        }
        let mut start_b = start;
        while !source.is_char_boundary(start_b) {
            start_b += 1;
        }
        Self {
            part: part.to_string(),
            line: lc.line,
            column: lc.column,
            excerpt: source[start_b..end].to_string(),
        }
    }
}

impl core::fmt::Display for Position {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{}:{}:{} (near {:?})",
            self.part, self.line, self.column, self.excerpt
        )
    }
}

/// The closed set of error kinds this crate can produce.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    /// Malformed expression or directive syntax.
    #[error("template syntax error at {0}: {1}")]
    TemplateSyntax(Position, String),
    /// An opening directive had no matching close, or vice versa.
    #[error("unmatched directive at {0}: {1}")]
    UnmatchedDirective(Position, String),
    /// A variable was missing in strict mode.
    #[error("missing variable {1:?} at {0}")]
    MissingVariable(Position, String),
    /// A function name did not resolve against the registry.
    #[error("missing function {1:?} at {0}")]
    MissingFunction(Position, String),
    /// A function was called with the wrong number of arguments.
    #[error("function {1:?} expects {2}..={3} arguments, got {4} at {0}")]
    ArityMismatch(Position, String, usize, usize, usize),
    /// An `{{include}}` referenced a fragment that was not registered.
    #[error("missing fragment {1:?} at {0}")]
    MissingFragment(Position, String),
    /// An `{{include}}` chain referenced itself.
    #[error("circular include of {1:?} at {0}")]
    CircularInclude(Position, String),
    /// Fragment nesting exceeded `max_include_depth`.
    #[error("include depth exceeded at {0}")]
    IncludeDepthExceeded(Position),
    /// Two operands could not be combined under an operator.
    #[error("type mismatch in {1} at {0}")]
    TypeMismatch(Position, String),
    /// An arithmetic operator attempted division by zero.
    #[error("division by zero at {0}")]
    DivisionByZero(Position),
    /// A list or string index was out of range in strict mode.
    #[error("index out of range at {0}")]
    IndexOutOfRange(Position),
    /// The input container or an XML part could not be parsed.
    #[error("could not parse document: {0}")]
    DocumentParse(String),
    /// A render or preparation was cancelled via the external signal.
    #[error("operation cancelled")]
    Cancelled,
    /// An invariant was violated; this should never be observed.
    #[error("internal error: {0}")]
    Internal(String),
}

/// The crate-wide result alias.
pub type Result<T, E = Error> = core::result::Result<T, E>;

impl From<std::fmt::Error> for Error {
    fn from(err: std::fmt::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

/// A shared, cheaply-cloneable error, used where an `Arc<Error>` needs to be
/// handed to more than one waiter on a single-flight preparation.
pub type SharedError = Arc<Error>;
