//! Error types for the transport layer

use thiserror::Error;

use crate::encoding::Encoding;

/// The operation a cancellation interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Reading and assembling the record tree
    Read,
    /// Assembling line text from flattened records
    Construct,
    /// Writing encoded bytes to the sink
    Write,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Read => write!(f, "read"),
            Phase::Construct => write!(f, "construction"),
            Phase::Write => write!(f, "write"),
        }
    }
}

/// What was wrong with a line that could not be read or parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseErrorKind {
    /// The leading level is missing or not a non-negative integer
    #[error("level is missing or not a number")]
    MalformedLevel,

    /// An xref token does not have the `@ID@` shape
    #[error("malformed cross-reference identifier")]
    MalformedXref,

    /// Nothing follows the level (and xref)
    #[error("line has no tag")]
    MissingTag,

    /// The first line of a stream is not at level 0
    #[error("line has no parent at the preceding level")]
    OrphanedLine,

    /// The level is more than one deeper than the open chain
    #[error("level jumps to {found}, at most {expected_max} is allowed here")]
    LevelJump { expected_max: u32, found: u32 },

    /// A CONT or CONC line at level 0
    #[error("continuation line has no value to extend")]
    OrphanedContinuation,

    /// The stream ends in the middle of a multi-byte character
    #[error("truncated multi-byte character")]
    TruncatedCharacter,

    /// A byte sequence is not valid in the detected encoding
    #[error("byte sequence is not valid {0}")]
    MalformedCharacter(Encoding),
}

/// The primary error type for all operations in this crate.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The underlying stream failed, or is too short to detect an encoding.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A declared character set is unknown or contradicts the byte layout.
    #[error("unsupported encoding: declared {declared:?} cannot be read as {detected}")]
    UnsupportedEncoding { declared: String, detected: Encoding },

    /// A line could not be decoded or does not fit the record structure.
    #[error("parse error at line {line}: {kind} ({content:?})")]
    Parse {
        line: usize,
        content: String,
        kind: ParseErrorKind,
    },

    /// An observer requested cancellation. Not a defect.
    #[error("{0} cancelled")]
    Cancelled(Phase),

    /// A configuration value was rejected before any I/O started.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The fixed part of a line (level, xref, tag) alone exceeds the width.
    #[error("line {prefix:?} cannot fit within {width} characters")]
    LineTooLong { prefix: String, width: usize },
}

impl TransportError {
    pub(crate) fn parse(line: usize, content: impl Into<String>, kind: ParseErrorKind) -> Self {
        TransportError::Parse {
            line,
            content: content.into(),
            kind,
        }
    }

    /// True for a voluntary cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransportError::Cancelled(_))
    }
}

/// A convenience `Result` type alias using the crate's `TransportError` type.
pub type Result<T> = std::result::Result<T, TransportError>;
