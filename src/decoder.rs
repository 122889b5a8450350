//! GEDCOM decoder: bytes to a record tree

use std::fs::File;
use std::io::Read;
use std::path::Path;

use log::{debug, info};

use crate::encoding::{Encoding, LineTerminator};
use crate::error::{ParseErrorKind, Phase, Result, TransportError};
use crate::progress::{CancelFlag, FileProgressEvent, NotificationRate, ObserverId, Observers};
use crate::reader::LineReader;
use crate::record::{GedcomLine, RecordNode, CONT};

/// Assembles a record tree from leveled lines.
///
/// Holds the chain of open nodes, root first. The node at stack index `i`
/// is at level `i - 1`; a closed node is moved into its parent's children.
#[derive(Debug)]
pub struct TreeBuilder {
    stack: Vec<RecordNode>,
}

impl TreeBuilder {
    pub fn new() -> Self {
        Self {
            stack: vec![RecordNode::root()],
        }
    }

    /// Level of the deepest open node, -1 when only the root is open
    pub fn depth(&self) -> i32 {
        self.stack.len() as i32 - 2
    }

    /// Attach a line, or merge it into its parent's value for CONT and CONC.
    pub fn push(&mut self, line: GedcomLine, line_number: usize) -> Result<()> {
        let level = line.level as usize;
        let max_level = self.stack.len() - 1;

        if level > max_level {
            let kind = if max_level == 0 {
                ParseErrorKind::OrphanedLine
            } else {
                ParseErrorKind::LevelJump {
                    expected_max: max_level as u32,
                    found: line.level,
                }
            };
            return Err(TransportError::parse(line_number, line.to_string(), kind));
        }

        self.close_to(level);

        if line.is_continuation() {
            let line_break = line.tag == CONT;
            return match self.stack.last_mut() {
                Some(parent) if !parent.is_root() => {
                    parent.append_continuation(line.value.as_deref(), line_break);
                    Ok(())
                }
                _ => Err(TransportError::parse(
                    line_number,
                    line.to_string(),
                    ParseErrorKind::OrphanedContinuation,
                )),
            };
        }

        self.stack.push(RecordNode::from_line(line));
        Ok(())
    }

    /// Close open nodes until the deepest one sits at `level - 1`
    fn close_to(&mut self, level: usize) {
        while self.stack.len() > level + 1 {
            let Some(node) = self.stack.pop() else { break };
            match self.stack.last_mut() {
                Some(parent) => parent.children.push(node),
                None => {
                    self.stack.push(node);
                    break;
                }
            }
        }
    }

    /// Close every open node and return the root.
    ///
    /// Lines do not have to close: the tree is complete at whatever depth remains.
    pub fn finish(mut self) -> RecordNode {
        self.close_to(0);
        self.stack.pop().unwrap_or_else(RecordNode::root)
    }
}

impl Default for TreeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A decoded GEDCOM stream
#[derive(Debug, Clone)]
pub struct Document {
    /// Encoding after the header's character set was reconciled
    pub encoding: Encoding,
    /// Whether the stream started with a byte-order mark
    pub had_bom: bool,
    /// The first line terminator in the stream
    pub terminator: Option<LineTerminator>,
    /// Number of physical lines read
    pub lines_read: usize,
    /// The synthetic root; its children are the level 0 records
    pub root: RecordNode,
}

impl Document {
    pub fn records(&self) -> &[RecordNode] {
        &self.root.children
    }

    pub fn header(&self) -> Option<&RecordNode> {
        self.root.find_child("HEAD")
    }

    /// Value of `1 CHAR` under the header
    pub fn declared_charset(&self) -> Option<&str> {
        self.header()?.find_child("CHAR")?.value.as_deref()
    }

    /// Point the header's `1 CHAR` line at `encoding`, adding it if missing.
    ///
    /// Returns false when the document has no header.
    pub fn set_declared_charset(&mut self, encoding: Encoding) -> bool {
        let Some(head) = self.root.children.iter_mut().find(|c| c.tag == "HEAD") else {
            return false;
        };
        let name = encoding.gedcom_name().to_string();
        match head.children.iter_mut().find(|c| c.tag == "CHAR") {
            Some(char_node) => char_node.value = Some(name),
            None => head
                .children
                .push(RecordNode::from_line(GedcomLine::new(1, "CHAR").with_value(name))),
        }
        true
    }
}

/// Decodes GEDCOM byte streams into record trees
#[derive(Debug)]
pub struct Decoder {
    read_rate: NotificationRate,
    file_observers: Observers<FileProgressEvent>,
    cancel: CancelFlag,
}

impl Decoder {
    /// Create a new decoder
    pub fn new() -> Self {
        Self {
            read_rate: NotificationRate::default(),
            file_observers: Observers::new(),
            cancel: CancelFlag::new(),
        }
    }

    /// Notify file observers every `rate` lines. Zero is rejected.
    pub fn with_read_notification_rate(mut self, rate: usize) -> Result<Self> {
        self.set_read_notification_rate(rate)?;
        Ok(self)
    }

    pub fn set_read_notification_rate(&mut self, rate: usize) -> Result<()> {
        self.read_rate = NotificationRate::new(rate)?;
        Ok(())
    }

    pub fn read_notification_rate(&self) -> usize {
        self.read_rate.get()
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

    /// Decode a GEDCOM file from disk
    pub fn decode_file(&mut self, path: impl AsRef<Path>) -> Result<Document> {
        let path = path.as_ref();
        info!("Opening GEDCOM file: {}", path.display());
        let file = File::open(path)?;
        self.decode_reader(file)
    }

    /// Decode GEDCOM data held in memory
    pub fn decode_bytes(&mut self, bytes: &[u8]) -> Result<Document> {
        self.decode_reader(bytes)
    }

    /// Decode a GEDCOM stream.
    ///
    /// The header is read first in the detected encoding. Once its `CHAR` line
    /// (or the end of the header) is reached the encoding is confirmed and the
    /// header lines are decoded again before the tree is built.
    pub fn decode_reader<R: Read>(&mut self, source: R) -> Result<Document> {
        self.cancel.reset();
        let cancel = self.cancel.clone();

        let mut reader =
            LineReader::with_observers(source, Some(&mut self.file_observers), self.read_rate)?.retaining_prefix();

        let declared = scan_header(&mut reader, &cancel)?;
        let prefix = reader.confirm_encoding(declared.as_deref())?;
        let mut builder = TreeBuilder::new();

        for (i, text) in prefix.iter().enumerate() {
            consume_line(&mut builder, text, i + 1)?;
        }

        while let Some(text) = reader.next_line()? {
            check_cancelled(&cancel)?;
            consume_line(&mut builder, &text, reader.lines_read())?;
        }

        let root = builder.finish();
        info!(
            "Decoded {} records from {} lines ({})",
            root.children.len(),
            reader.lines_read(),
            reader.encoding()
        );

        Ok(Document {
            encoding: reader.encoding(),
            had_bom: reader.detection().has_bom(),
            terminator: reader.terminator(),
            lines_read: reader.lines_read(),
            root,
        })
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Read lines up to the header's `CHAR` line or the end of the header.
fn scan_header<R: Read>(reader: &mut LineReader<'_, R>, cancel: &CancelFlag) -> Result<Option<String>> {
    let mut in_head = false;
    let mut records_seen = 0;

    while let Some(text) = reader.next_line()? {
        check_cancelled(cancel)?;
        let Ok(line) = GedcomLine::parse(&text, reader.lines_read()) else {
            continue;
        };
        if line.level == 0 {
            records_seen += 1;
            if records_seen > 1 {
                break;
            }
            in_head = line.tag == "HEAD";
        } else if in_head && line.level == 1 && line.tag == "CHAR" {
            debug!("Header declares character set {:?}", line.value);
            return Ok(line.value);
        }
    }
    Ok(None)
}

fn consume_line(builder: &mut TreeBuilder, text: &str, line_number: usize) -> Result<()> {
    if text.trim().is_empty() {
        debug!("Skipping blank line {}", line_number);
        return Ok(());
    }
    let line = GedcomLine::parse(text, line_number)?;
    builder.push(line, line_number)
}

fn check_cancelled(cancel: &CancelFlag) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(TransportError::Cancelled(Phase::Read));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn build(lines: &[&str]) -> Result<RecordNode> {
        let mut builder = TreeBuilder::new();
        for (i, text) in lines.iter().enumerate() {
            builder.push(GedcomLine::parse(text, i + 1)?, i + 1)?;
        }
        Ok(builder.finish())
    }

    #[test]
    fn test_level_stack() {
        let root = build(&["0 A", "1 B", "2 C", "1 D", "2 E", "3 F"]).unwrap();
        let a = &root.children[0];
        assert_eq!(a.tag, "A");
        assert_eq!(a.children.len(), 2);

        let b = &a.children[0];
        assert_eq!(b.tag, "B");
        assert_eq!(b.children[0].tag, "C");

        let d = &a.children[1];
        assert_eq!(d.tag, "D");
        let e = &d.children[0];
        assert_eq!(e.tag, "E");
        assert_eq!(e.children[0].tag, "F");
        assert_eq!(e.children[0].level, 3);
    }

    #[test]
    fn test_depth_follows_open_chain() {
        let mut builder = TreeBuilder::new();
        assert_eq!(builder.depth(), -1);
        let steps = [("0 HEAD", 0), ("1 GEDC", 1), ("2 VERS 5.5.1", 2), ("2 CONC x", 1), ("0 TRLR", 0)];
        for (i, (text, depth)) in steps.iter().enumerate() {
            builder.push(GedcomLine::parse(text, i + 1).unwrap(), i + 1).unwrap();
            assert_eq!(builder.depth(), *depth, "after {:?}", text);
        }
    }

    #[test]
    fn test_level_jump_is_error() {
        let err = build(&["0 HEAD", "2 VERS 5.5.1"]).unwrap_err();
        match err {
            TransportError::Parse { line, kind, .. } => {
                assert_eq!(line, 2);
                assert_eq!(kind, ParseErrorKind::LevelJump { expected_max: 1, found: 2 });
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_orphaned_first_line() {
        assert!(matches!(
            build(&["1 NAME John"]),
            Err(TransportError::Parse { kind: ParseErrorKind::OrphanedLine, .. })
        ));
    }

    #[test]
    fn test_continuations_merge_into_parent() {
        let root = build(&[
            "0 @N1@ NOTE First line",
            "1 CONC  continues",
            "1 CONT second line",
            "1 CONT",
            "1 CONT fourth",
        ])
        .unwrap();
        let note = &root.children[0];
        assert!(note.children.is_empty());
        assert_eq!(note.value.as_deref(), Some("First line continues\nsecond line\n\nfourth"));
    }

    #[test]
    fn test_continuation_after_deeper_node() {
        let root = build(&["0 @I1@ INDI", "1 NOTE a", "2 SOUR @S1@", "3 PAGE 4", "2 CONT b"]).unwrap();
        let note = &root.children[0].children[0];
        assert_eq!(note.value.as_deref(), Some("a\nb"));
        assert_eq!(note.children.len(), 1);
        assert_eq!(note.children[0].children[0].tag, "PAGE");
    }

    #[test]
    fn test_level_zero_continuation_is_error() {
        assert!(matches!(
            build(&["0 HEAD", "0 CONT x"]),
            Err(TransportError::Parse { kind: ParseErrorKind::OrphanedContinuation, .. })
        ));
    }

    #[test]
    fn test_unclosed_tree_is_complete() {
        let root = build(&["0 HEAD", "1 SOUR x", "2 VERS 1"]).unwrap();
        assert_eq!(root.descendant_count(), 3);
    }

    #[test]
    fn test_decode_bytes_with_declared_ansel() {
        let mut data = b"0 HEAD\r\n1 CHAR ANSEL\r\n0 @I1@ INDI\r\n1 NAME Ren".to_vec();
        data.extend_from_slice(&[0xE2, b'e']);
        data.extend_from_slice(b" /Descartes/\r\n0 TRLR\r\n");

        let doc = Decoder::new().decode_bytes(&data).unwrap();
        assert_eq!(doc.encoding, Encoding::Ansel);
        assert_eq!(doc.terminator, Some(LineTerminator::CrLf));
        assert_eq!(doc.declared_charset(), Some("ANSEL"));
        assert_eq!(doc.records().len(), 3);
        let name = doc.records()[1].find_child("NAME").unwrap();
        assert_eq!(name.value.as_deref(), Some("René /Descartes/"));
    }

    #[test]
    fn test_decode_utf8_without_bom() {
        let text = "0 HEAD\n1 CHAR UTF-8\n0 @I1@ INDI\n1 NAME Cleo /N\u{00F4}rden/\n0 TRLR\n";
        let doc = Decoder::new().decode_bytes(text.as_bytes()).unwrap();
        assert_eq!(doc.encoding, Encoding::Utf8);
        assert!(!doc.had_bom);
        assert_eq!(
            doc.records()[1].find_child("NAME").unwrap().value.as_deref(),
            Some("Cleo /N\u{00F4}rden/")
        );
    }

    #[test]
    fn test_set_declared_charset() {
        let mut doc = Decoder::new().decode_bytes(b"0 HEAD\n1 SOUR x\n0 TRLR\n").unwrap();
        assert_eq!(doc.declared_charset(), None);
        assert!(doc.set_declared_charset(Encoding::Utf16Le));
        assert_eq!(doc.declared_charset(), Some("UNICODE"));
        assert!(doc.set_declared_charset(Encoding::Ansel));
        assert_eq!(doc.declared_charset(), Some("ANSEL"));
        assert_eq!(doc.header().unwrap().children_with_tag("CHAR").count(), 1);

        let mut headless = Decoder::new().decode_bytes(b"0 TRLR\n").unwrap();
        assert!(!headless.set_declared_charset(Encoding::Utf8));
    }

    #[test]
    fn test_decode_without_char_keeps_provisional() {
        let doc = Decoder::new().decode_bytes(b"0 HEAD\n1 SOUR x\n0 TRLR\n").unwrap();
        assert_eq!(doc.encoding, Encoding::Ascii);
        assert_eq!(doc.lines_read, 3);
    }

    #[test]
    fn test_declared_charset_contradicting_width() {
        let data: Vec<u8> = "0 HEAD\n1 CHAR ANSEL\n".encode_utf16().flat_map(|u| u.to_be_bytes()).collect();
        assert!(matches!(
            Decoder::new().decode_bytes(&data),
            Err(TransportError::UnsupportedEncoding { .. })
        ));
    }

    #[test]
    fn test_blank_lines_are_skipped() {
        let doc = Decoder::new().decode_bytes(b"\n\n\n\n").unwrap();
        assert!(doc.records().is_empty());
        assert_eq!(doc.lines_read, 4);
    }

    #[test]
    fn test_zero_read_rate_rejected() {
        assert!(matches!(
            Decoder::new().with_read_notification_rate(0),
            Err(TransportError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_cancel_from_observer() {
        let mut decoder = Decoder::new().with_read_notification_rate(1).unwrap();
        let flag = decoder.cancel_flag();
        let seen = Rc::new(Cell::new(0));
        let counter = Rc::clone(&seen);
        let id = decoder.register_file_observer(move |e| {
            counter.set(counter.get() + 1);
            if e.lines_processed == 2 {
                flag.cancel();
            }
        });

        let data = b"0 HEAD\n1 SOUR x\n1 CHAR ASCII\n0 @I1@ INDI\n0 TRLR\n";
        let err = decoder.decode_bytes(data).unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(seen.get(), 2);

        // The flag is cleared when the next operation starts
        assert!(decoder.unregister_file_observer(id));
        let doc = decoder.decode_bytes(data).unwrap();
        assert_eq!(doc.records().len(), 3);
        assert_eq!(seen.get(), 2);
    }
}
