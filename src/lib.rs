//! # gedcom-transport
//!
//! Byte-level transport for GEDCOM files: character encoding detection,
//! line splitting, record tree assembly and the reverse path back to bytes.
//!
//! ## Reading
//!
//! A GEDCOM stream is read in two stages:
//!
//! 1. The first four bytes give a provisional encoding (byte-order mark,
//!    zero-byte pattern of UTF-16, or single-byte ASCII).
//! 2. The header's `1 CHAR` value confirms or refines it. `ANSEL` and
//!    `UTF-8` only refine a single-byte stream; a declaration that
//!    contradicts the detected width is rejected.
//!
//! ```text
//! 0 HEAD
//! 1 CHAR ANSEL
//! 0 @I1@ INDI
//! 1 NAME Ren\xE2e /Descartes/
//! 0 TRLR
//! ```
//!
//! Lines are then parsed as `LEVEL [@XREF@] TAG [VALUE]` and nested by level.
//! `CONT` lines join their parent's value with a line break, `CONC` lines
//! join it directly.
//!
//! ## Writing
//!
//! The [`Encoder`] flattens a tree back into lines, splitting values on
//! embedded line breaks (`CONT`) and at the maximum line width (`CONC`),
//! then writes them in the target encoding with the chosen terminator.
//!
//! ## Progress and Cancellation
//!
//! Both directions report progress every N lines to registered observers
//! and poll a [`CancelFlag`] between lines. A cancelled write never hands
//! its pending buffer to the sink.

pub mod ansel;
pub mod decoder;
pub mod encoder;
pub mod encoding;
pub mod error;
pub mod progress;
pub mod reader;
pub mod record;

pub use decoder::{Decoder, Document, TreeBuilder};
pub use encoder::{Encoder, WriteSummary, DEFAULT_MAX_LINE_WIDTH, MIN_LINE_WIDTH};
pub use encoding::{
    confirm_or_reject, detect_provisional, CharWidth, Detection, Encoding, LineTerminator, RawChunk,
};
pub use error::{ParseErrorKind, Phase, Result, TransportError};
pub use progress::{
    CancelFlag, ConstructProgressEvent, FileProgressEvent, NotificationRate, ObserverId, Observers,
};
pub use reader::LineReader;
pub use record::{GedcomLine, RecordNode};
