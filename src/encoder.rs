//! GEDCOM encoder: flattened records to bytes

use std::fs::File;
use std::io::Write;
use std::path::Path;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use log::{info, trace, warn};

use crate::ansel;
use crate::decoder::Document;
use crate::encoding::{Encoding, LineTerminator};
use crate::error::{Phase, Result, TransportError};
use crate::progress::{
    CancelFlag, ConstructProgressEvent, FileProgressEvent, NotificationRate, ObserverId, Observers,
};
use crate::record::{GedcomLine, RecordNode, CONC, CONT};

/// Conventional maximum line length, level and tag included
pub const DEFAULT_MAX_LINE_WIDTH: usize = 255;

/// Narrowest width that still leaves room for a continuation value
pub const MIN_LINE_WIDTH: usize = 16;

/// Totals for a completed write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteSummary {
    pub lines_written: usize,
    pub bytes_written: u64,
}

/// Encodes flattened records into GEDCOM bytes
#[derive(Debug)]
pub struct Encoder {
    encoding: Encoding,
    terminator: LineTerminator,
    max_line_width: usize,
    write_bom: bool,
    construction_rate: NotificationRate,
    write_rate: NotificationRate,
    construct_observers: Observers<ConstructProgressEvent>,
    file_observers: Observers<FileProgressEvent>,
    cancel: CancelFlag,
}

impl Encoder {
    /// Create a new encoder writing ASCII with CRLF terminators
    pub fn new() -> Self {
        Self {
            encoding: Encoding::Ascii,
            terminator: LineTerminator::default(),
            max_line_width: DEFAULT_MAX_LINE_WIDTH,
            write_bom: false,
            construction_rate: NotificationRate::default(),
            write_rate: NotificationRate::default(),
            construct_observers: Observers::new(),
            file_observers: Observers::new(),
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_terminator(mut self, terminator: LineTerminator) -> Self {
        self.terminator = terminator;
        self
    }

    /// Start UTF-8 and UTF-16 output with a byte-order mark
    pub fn with_byte_order_mark(mut self, write_bom: bool) -> Self {
        self.write_bom = write_bom;
        self
    }

    pub fn with_max_line_width(mut self, width: usize) -> Result<Self> {
        self.set_max_line_width(width)?;
        Ok(self)
    }

    pub fn set_max_line_width(&mut self, width: usize) -> Result<()> {
        if width < MIN_LINE_WIDTH {
            return Err(TransportError::InvalidConfig(format!(
                "maximum line width must be at least {}, got {}",
                MIN_LINE_WIDTH, width
            )));
        }
        self.max_line_width = width;
        Ok(())
    }

    pub fn with_construction_notification_rate(mut self, rate: usize) -> Result<Self> {
        self.set_construction_notification_rate(rate)?;
        Ok(self)
    }

    pub fn set_construction_notification_rate(&mut self, rate: usize) -> Result<()> {
        self.construction_rate = NotificationRate::new(rate)?;
        Ok(())
    }

    pub fn with_write_notification_rate(mut self, rate: usize) -> Result<Self> {
        self.set_write_notification_rate(rate)?;
        Ok(self)
    }

    pub fn set_write_notification_rate(&mut self, rate: usize) -> Result<()> {
        self.write_rate = NotificationRate::new(rate)?;
        Ok(())
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn terminator(&self) -> LineTerminator {
        self.terminator
    }

    pub fn max_line_width(&self) -> usize {
        self.max_line_width
    }

    pub fn register_construct_observer<F>(&mut self, observer: F) -> ObserverId
    where
        F: FnMut(&ConstructProgressEvent) + 'static,
    {
        self.construct_observers.register(observer)
    }

    pub fn unregister_construct_observer(&mut self, id: ObserverId) -> bool {
        self.construct_observers.unregister(id)
    }

    pub fn register_file_observer<F>(&mut self, observer: F) -> ObserverId
    where
        F: FnMut(&FileProgressEvent) + 'static,
    {
        self.file_observers.register(observer)
    }

    pub fn unregister_file_observer(&mut self, id: ObserverId) -> bool {
        self.file_observers.unregister(id)
    }

    /// Handle for requesting cancellation, typically from an observer
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Split one record line into a base line plus CONT/CONC lines.
    ///
    /// Every embedded line break (CR, LF or CRLF) starts a CONT line. Any piece still longer
    /// than the maximum width is cut into CONC lines, never between a
    /// character and the combining marks that follow it.
    pub fn split_line(&self, line: &GedcomLine) -> Result<Vec<String>> {
        let mut head = line.level.to_string();
        if let Some(xref) = &line.xref {
            head.push(' ');
            head.push_str(xref);
        }
        head.push(' ');
        head.push_str(&line.tag);

        let child = line.level + 1;
        let cont = format!("{} {}", child, CONT);
        let conc = format!("{} {}", child, CONC);

        let mut out = Vec::new();
        let value = line.value.as_deref().unwrap_or("");
        let mut segments = split_breaks(value).into_iter();
        let first = segments.next().unwrap_or("");
        self.split_segment(&head, first, &conc, &mut out)?;
        for segment in segments {
            self.split_segment(&cont, segment, &conc, &mut out)?;
        }

        if out.len() > 1 {
            trace!("Split {} {} into {} lines", line.level, line.tag, out.len());
        }
        Ok(out)
    }

    fn split_segment(&self, prefix: &str, segment: &str, conc: &str, out: &mut Vec<String>) -> Result<()> {
        let too_long = |prefix: &str| TransportError::LineTooLong {
            prefix: prefix.to_string(),
            width: self.max_line_width,
        };

        if prefix.chars().count() > self.max_line_width {
            return Err(too_long(prefix));
        }
        if segment.is_empty() {
            out.push(prefix.to_string());
            return Ok(());
        }

        let mut current = prefix;
        let mut rest = segment;
        loop {
            let budget = self.max_line_width.saturating_sub(current.chars().count() + 1);
            if rest.chars().count() <= budget {
                out.push(format!("{} {}", current, rest));
                return Ok(());
            }

            let cut = safe_boundary(rest, budget);
            if cut == 0 {
                if current == conc {
                    return Err(too_long(conc));
                }
                out.push(current.to_string());
            } else {
                out.push(format!("{} {}", current, &rest[..cut]));
                rest = &rest[cut..];
            }
            current = conc;
        }
    }

    /// Turn flattened records into line text, reporting construction progress.
    pub fn construct<'l, I>(&mut self, records: I) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = &'l GedcomLine>,
    {
        let mut lines = Vec::new();
        for record in records {
            for text in self.split_line(record)? {
                lines.push(text);
                if self.construction_rate.is_due(lines.len()) {
                    self.construct_observers.notify(&ConstructProgressEvent {
                        lines_processed: lines.len(),
                        complete: false,
                    });
                }
                if self.cancel.is_cancelled() {
                    return Err(TransportError::Cancelled(Phase::Construct));
                }
            }
        }
        self.construct_observers.notify(&ConstructProgressEvent {
            lines_processed: lines.len(),
            complete: true,
        });
        Ok(lines)
    }

    /// Encode flattened records and write them to `sink`.
    pub fn encode_records<'l, I, W>(&mut self, records: I, sink: W) -> Result<WriteSummary>
    where
        I: IntoIterator<Item = &'l GedcomLine>,
        W: Write,
    {
        self.cancel.reset();
        let lines = self.construct(records)?;
        self.write_lines(&lines, sink)
    }

    /// Encode every record under `root`, the root itself excluded.
    pub fn encode_tree<W: Write>(&mut self, root: &RecordNode, sink: W) -> Result<WriteSummary> {
        let flat = root.flatten();
        self.encode_records(&flat, sink)
    }

    /// Encode a decoded document's record tree
    pub fn encode_document<W: Write>(&mut self, document: &Document, sink: W) -> Result<WriteSummary> {
        self.encode_tree(&document.root, sink)
    }

    /// Write already-formed lines without splitting them.
    pub fn encode_lines<S: AsRef<str>, W: Write>(&mut self, lines: &[S], sink: W) -> Result<WriteSummary> {
        self.cancel.reset();
        self.write_lines(lines, sink)
    }

    pub fn encode_to_vec<'l, I>(&mut self, records: I) -> Result<Vec<u8>>
    where
        I: IntoIterator<Item = &'l GedcomLine>,
    {
        let mut out = Vec::new();
        self.encode_records(records, &mut out)?;
        Ok(out)
    }

    pub fn encode_to_file<'l, I>(&mut self, records: I, path: impl AsRef<Path>) -> Result<WriteSummary>
    where
        I: IntoIterator<Item = &'l GedcomLine>,
    {
        let path = path.as_ref();
        info!("Writing GEDCOM file: {}", path.display());
        let file = File::create(path)?;
        self.encode_records(records, file)
    }

    /// Encoded bytes are buffered and handed to the sink at each notification
    /// point. On cancellation the unflushed buffer is dropped.
    fn write_lines<S: AsRef<str>, W: Write>(&mut self, lines: &[S], mut sink: W) -> Result<WriteSummary> {
        let mut buffer = Vec::new();
        let mut summary = WriteSummary::default();
        if self.write_bom {
            buffer.extend_from_slice(self.encoding.bom());
        }

        for line in lines {
            self.encode_text_into(line.as_ref(), &mut buffer);
            self.encode_text_into(self.terminator.as_str(), &mut buffer);
            summary.lines_written += 1;

            if self.write_rate.is_due(summary.lines_written) {
                sink.write_all(&buffer)?;
                summary.bytes_written += buffer.len() as u64;
                buffer.clear();
                self.file_observers.notify(&FileProgressEvent {
                    lines_processed: summary.lines_written,
                    bytes_processed: summary.bytes_written,
                    complete: false,
                });
            }
            if self.cancel.is_cancelled() {
                return Err(TransportError::Cancelled(Phase::Write));
            }
        }

        sink.write_all(&buffer)?;
        sink.flush()?;
        summary.bytes_written += buffer.len() as u64;
        self.file_observers.notify(&FileProgressEvent {
            lines_processed: summary.lines_written,
            bytes_processed: summary.bytes_written,
            complete: true,
        });

        info!(
            "Wrote {} lines, {} bytes as {}",
            summary.lines_written, summary.bytes_written, self.encoding
        );
        Ok(summary)
    }

    /// Encode text in the target encoding
    pub fn encode_text(&self, text: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(text.len());
        self.encode_text_into(text, &mut out);
        out
    }

    fn encode_text_into(&self, text: &str, out: &mut Vec<u8>) {
        match self.encoding {
            Encoding::Utf8 => out.extend_from_slice(text.as_bytes()),
            Encoding::Ansel => out.extend(ansel::encode_str(text)),
            Encoding::Ascii => encode_single_byte(text, out),
            Encoding::Utf16Be => encode_utf16::<BigEndian>(text, out),
            Encoding::Utf16Le => encode_utf16::<LittleEndian>(text, out),
        }
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_single_byte(text: &str, out: &mut Vec<u8>) {
    let codec = encoding_rs::WINDOWS_1252;
    let (bytes, _, had_errors) = codec.encode(text);
    if !had_errors {
        out.extend_from_slice(&bytes);
        return;
    }

    let mut buf = [0u8; 4];
    for ch in text.chars() {
        let (bytes, _, had_errors) = codec.encode(ch.encode_utf8(&mut buf));
        if had_errors {
            warn!("Character {:?} (U+{:04X}) has no ANSI form", ch, u32::from(ch));
            out.push(b'?');
        } else {
            out.extend_from_slice(&bytes);
        }
    }
}

fn encode_utf16<B: ByteOrder>(text: &str, out: &mut Vec<u8>) {
    let mut unit = [0u8; 2];
    for code in text.encode_utf16() {
        B::write_u16(&mut unit, code);
        out.extend_from_slice(&unit);
    }
}

/// Pieces of `value` between line breaks. CRLF counts as one break.
fn split_breaks(value: &str) -> Vec<&str> {
    let bytes = value.as_bytes();
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\r' => {
                pieces.push(&value[start..i]);
                i += if bytes.get(i + 1) == Some(&b'\n') { 2 } else { 1 };
                start = i;
            }
            b'\n' => {
                pieces.push(&value[start..i]);
                i += 1;
                start = i;
            }
            _ => i += 1,
        }
    }
    pieces.push(&value[start..]);
    pieces
}

fn is_combining(ch: char) -> bool {
    matches!(ch, '\u{0300}'..='\u{036F}' | '\u{1AB0}'..='\u{1AFF}' | '\u{1DC0}'..='\u{1DFF}' | '\u{20D0}'..='\u{20FF}' | '\u{FE20}'..='\u{FE2F}')
        || ansel::is_combining_mark(ch)
}

/// Byte offset after at most `max_chars` characters of `text`, moved back so
/// that a combining mark is never separated from its base.
fn safe_boundary(text: &str, max_chars: usize) -> usize {
    let Some((cut, _)) = text.char_indices().nth(max_chars) else {
        return text.len();
    };
    let mut boundary = cut;
    while boundary > 0 && text[boundary..].chars().next().is_some_and(is_combining) {
        boundary = text[..boundary].char_indices().next_back().map_or(0, |(i, _)| i);
    }
    if boundary == 0 {
        cut
    } else {
        boundary
    }
}
