//! Line reader: bytes in a detected encoding to logical text lines

use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Read};

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use log::{debug, info};

use crate::ansel;
use crate::encoding::{
    confirm_or_reject, detect_provisional, CharWidth, Codec, Detection, Encoding, LineTerminator, RawChunk,
};
use crate::error::{ParseErrorKind, Result, TransportError};
use crate::progress::{FileProgressEvent, NotificationRate, Observers};

const CR: u16 = 0x0D;
const LF: u16 = 0x0A;

/// One code unit: a byte, or a UTF-16 unit with its original bytes
#[derive(Debug, Clone, Copy)]
struct Unit {
    value: u16,
    bytes: [u8; 2],
    len: usize,
}

impl Unit {
    fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

/// Produces decoded lines from a byte source.
///
/// CR, LF and CRLF all end a line. A terminator with nothing before it yields
/// an empty line, but an empty fragment at end of stream yields nothing.
pub struct LineReader<'a, R> {
    source: BufReader<R>,
    detection: Detection,
    encoding: Encoding,
    replay: VecDeque<u8>,
    peeked: Option<Unit>,
    lines_read: usize,
    bytes_consumed: u64,
    terminator: Option<LineTerminator>,
    retained: Option<Vec<Vec<u8>>>,
    rate: NotificationRate,
    observers: Option<&'a mut Observers<FileProgressEvent>>,
    exhausted: bool,
    completed: bool,
}

impl<'a, R: Read> LineReader<'a, R> {
    /// Open a reader, detecting the encoding from the first bytes.
    pub fn new(source: R) -> Result<Self> {
        Self::with_observers(source, None, NotificationRate::default())
    }

    /// Open a reader that reports progress every `rate` lines.
    pub fn with_observers(
        source: R,
        observers: Option<&'a mut Observers<FileProgressEvent>>,
        rate: NotificationRate,
    ) -> Result<Self> {
        let mut source = BufReader::new(source);
        let (chunk, consumed) = RawChunk::read_from(&mut source)?;
        let detection = detect_provisional(&chunk);

        let replay: VecDeque<u8> = consumed[detection.bom_len..].iter().copied().collect();
        info!("Reading GEDCOM stream as {} (provisional)", detection.encoding);

        Ok(Self {
            source,
            detection,
            encoding: detection.encoding,
            replay,
            peeked: None,
            lines_read: 0,
            bytes_consumed: detection.bom_len as u64,
            terminator: None,
            retained: None,
            rate,
            observers,
            exhausted: false,
            completed: false,
        })
    }

    /// Keep the raw bytes of every line until [`confirm_encoding`](Self::confirm_encoding)
    /// so they can be decoded again.
    pub fn retaining_prefix(mut self) -> Self {
        self.retained = Some(Vec::new());
        self
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn detection(&self) -> Detection {
        self.detection
    }

    /// The first terminator seen, once one has been seen
    pub fn terminator(&self) -> Option<LineTerminator> {
        self.terminator
    }

    pub fn lines_read(&self) -> usize {
        self.lines_read
    }

    pub fn bytes_consumed(&self) -> u64 {
        self.bytes_consumed
    }

    /// Settle the encoding against the header's declared character set.
    ///
    /// Returns the retained prefix lines decoded again in the confirmed
    /// encoding, and stops retaining.
    pub fn confirm_encoding(&mut self, declared: Option<&str>) -> Result<Vec<String>> {
        let confirmed = confirm_or_reject(self.detection, declared)?;
        if confirmed != self.encoding {
            info!("Switching from {} to declared {}", self.encoding, confirmed);
        }
        self.encoding = confirmed;

        let retained = self.retained.take().unwrap_or_default();
        retained
            .iter()
            .enumerate()
            .map(|(i, raw)| self.decode(raw, i + 1))
            .collect()
    }

    /// Read the next logical line, or `None` at end of stream.
    pub fn next_line(&mut self) -> Result<Option<String>> {
        let Some(raw) = self.next_raw_line()? else {
            if !self.completed {
                self.completed = true;
                debug!("End of stream after {} lines, {} bytes", self.lines_read, self.bytes_consumed);
                self.notify(true);
            }
            return Ok(None);
        };

        self.lines_read += 1;
        let text = self.decode(&raw, self.lines_read)?;
        if let Some(retained) = &mut self.retained {
            retained.push(raw);
        }
        if self.rate.is_due(self.lines_read) {
            self.notify(false);
        }
        Ok(Some(text))
    }

    fn notify(&mut self, complete: bool) {
        let event = FileProgressEvent {
            lines_processed: self.lines_read,
            bytes_processed: self.bytes_consumed,
            complete,
        };
        if let Some(observers) = self.observers.as_deref_mut() {
            observers.notify(&event);
        }
    }

    fn decode(&self, raw: &[u8], line: usize) -> Result<String> {
        match self.encoding.codec() {
            Codec::Ansel => Ok(ansel::decode_line(raw)),
            Codec::Standard(codec) if self.encoding == Encoding::Ascii => {
                Ok(codec.decode_without_bom_handling(raw).0.into_owned())
            }
            Codec::Standard(codec) => codec
                .decode_without_bom_handling_and_without_replacement(raw)
                .map(|text| text.into_owned())
                .ok_or_else(|| {
                    let kind = match self.encoding {
                        Encoding::Utf16Be | Encoding::Utf16Le => ParseErrorKind::TruncatedCharacter,
                        other => ParseErrorKind::MalformedCharacter(other),
                    };
                    let lossy = codec.decode_without_bom_handling(raw).0.into_owned();
                    TransportError::parse(line, lossy, kind)
                }),
        }
    }

    fn next_raw_line(&mut self) -> Result<Option<Vec<u8>>> {
        let mut raw = Vec::new();
        loop {
            let Some(unit) = self.next_unit()? else {
                return Ok(if raw.is_empty() { None } else { Some(raw) });
            };
            match unit.value {
                CR => {
                    let style = match self.next_unit()? {
                        Some(next) if next.value == LF => LineTerminator::CrLf,
                        Some(next) => {
                            // counted again when the next line takes it
                            self.bytes_consumed -= next.len as u64;
                            self.peeked = Some(next);
                            LineTerminator::Cr
                        }
                        None => LineTerminator::Cr,
                    };
                    self.terminator.get_or_insert(style);
                    return Ok(Some(raw));
                }
                LF => {
                    self.terminator.get_or_insert(LineTerminator::Lf);
                    return Ok(Some(raw));
                }
                _ => raw.extend_from_slice(unit.as_bytes()),
            }
        }
    }

    fn next_unit(&mut self) -> Result<Option<Unit>> {
        if let Some(unit) = self.peeked.take() {
            self.bytes_consumed += unit.len as u64;
            return Ok(Some(unit));
        }
        let Some(first) = self.next_byte()? else {
            return Ok(None);
        };

        if self.encoding.bytes_per_char() != CharWidth::Fixed(2) {
            return Ok(Some(Unit {
                value: u16::from(first),
                bytes: [first, 0],
                len: 1,
            }));
        }

        let Some(second) = self.next_byte()? else {
            return Err(TransportError::parse(
                self.lines_read + 1,
                format!("{:#04x}", first),
                ParseErrorKind::TruncatedCharacter,
            ));
        };
        let bytes = [first, second];
        let value = match self.encoding {
            Encoding::Utf16Le => LittleEndian::read_u16(&bytes),
            _ => BigEndian::read_u16(&bytes),
        };
        Ok(Some(Unit { value, bytes, len: 2 }))
    }

    fn next_byte(&mut self) -> Result<Option<u8>> {
        if self.exhausted {
            return Ok(None);
        }
        let byte = match self.replay.pop_front() {
            Some(byte) => byte,
            None => loop {
                match self.source.fill_buf() {
                    Ok([]) => {
                        self.exhausted = true;
                        return Ok(None);
                    }
                    Ok(buf) => {
                        let byte = buf[0];
                        self.source.consume(1);
                        break byte;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            },
        };
        self.bytes_consumed += 1;
        Ok(Some(byte))
    }
}

impl<R: Read> Iterator for LineReader<'_, R> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_line().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(bytes: &[u8]) -> Vec<String> {
        LineReader::new(bytes).unwrap().collect::<Result<Vec<_>>>().unwrap()
    }

    #[test]
    fn test_terminators_are_equivalent() {
        let inputs: [&[u8]; 3] = [b"0 H\r\no", b"0 H\ro", b"0 H\no"];
        for data in inputs {
            assert_eq!(lines(data), vec!["0 H", "o"], "input {:?}", data);
        }
    }

    #[test]
    fn test_first_terminator_is_recorded() {
        let mut reader = LineReader::new(&b"0 HEAD\r\n1 CHAR ASCII\n"[..]).unwrap();
        assert_eq!(reader.terminator(), None);
        reader.next_line().unwrap();
        assert_eq!(reader.terminator(), Some(LineTerminator::CrLf));
        reader.next_line().unwrap();
        assert_eq!(reader.terminator(), Some(LineTerminator::CrLf));
    }

    #[test]
    fn test_empty_lines_are_kept() {
        assert_eq!(lines(b"\n\n\n\n"), vec!["", "", "", ""]);
        assert_eq!(lines(b"0 HEAD\n\n0 TRLR\n"), vec!["0 HEAD", "", "0 TRLR"]);
    }

    #[test]
    fn test_trailer_without_terminator() {
        assert_eq!(lines(b"0 TRLR"), vec!["0 TRLR"]);
    }

    #[test]
    fn test_empty_source_is_io_error() {
        assert!(matches!(LineReader::new(&b""[..]), Err(TransportError::Io(_))));
    }

    #[test]
    fn test_ansel_single_line() {
        let mut reader = LineReader::new(&[0x30, 0x20, 0x48, 0x65, 0xA1, 0xA1, 0x6F][..]).unwrap();
        reader.confirm_encoding(Some("ANSEL")).unwrap();
        assert_eq!(reader.next_line().unwrap().as_deref(), Some("0 He\u{0141}\u{0141}o"));
    }

    #[test]
    fn test_unicode_big_endian() {
        let data = [
            0x00, 0x30, 0x00, 0x20, 0x00, 0x48, 0x00, 0x45, 0x00, 0x41, 0x00, 0x44, 0x00, 0x0d, 0x00, 0x0a, 0x00, 0x31,
            0x00, 0x20, 0x00, 0x43, 0x00, 0x48, 0x00, 0x41, 0x00, 0x52,
        ];
        let reader = LineReader::new(&data[..]).unwrap();
        assert_eq!(reader.encoding(), Encoding::Utf16Be);
        assert_eq!(lines(&data), vec!["0 HEAD", "1 CHAR"]);
    }

    #[test]
    fn test_unicode_little_endian_cr_only() {
        let data = [
            0x30, 0x00, 0x20, 0x00, 0x48, 0x00, 0x45, 0x00, 0x41, 0x00, 0x44, 0x00, 0x0d, 0x00, 0x31, 0x00, 0x20, 0x00,
            0x43, 0x00, 0x48, 0x00, 0x41, 0x00, 0x52, 0x00,
        ];
        assert_eq!(lines(&data), vec!["0 HEAD", "1 CHAR"]);
    }

    #[test]
    fn test_bom_is_not_emitted() {
        let mut data = vec![0xEF, 0xBB, 0xBF];
        data.extend_from_slice("0 HEAD\n1 NAME John /Gr\u{00FC}ber/\n".as_bytes());
        let mut reader = LineReader::new(&data[..]).unwrap();
        assert!(reader.detection().has_bom());
        assert_eq!(reader.next_line().unwrap().as_deref(), Some("0 HEAD"));
        assert_eq!(reader.next_line().unwrap().as_deref(), Some("1 NAME John /Gr\u{00FC}ber/"));
        assert_eq!(reader.next_line().unwrap(), None);
        assert_eq!(reader.bytes_consumed(), data.len() as u64);
    }

    #[test]
    fn test_odd_byte_count_in_utf16_is_truncation() {
        let data = [0x00, 0x30, 0x00, 0x20, 0x00];
        let mut reader = LineReader::new(&data[..]).unwrap();
        let err = reader.next_line().unwrap_err();
        assert!(matches!(
            err,
            TransportError::Parse { kind: ParseErrorKind::TruncatedCharacter, .. }
        ));
    }

    #[test]
    fn test_lone_surrogate_is_truncation() {
        // "0 " then a high surrogate with no low half
        let data = [0x00, 0x30, 0x00, 0x20, 0xD8, 0x3D, 0x00, 0x0A];
        let mut reader = LineReader::new(&data[..]).unwrap();
        assert!(matches!(
            reader.next_line(),
            Err(TransportError::Parse { line: 1, kind: ParseErrorKind::TruncatedCharacter, .. })
        ));
    }

    #[test]
    fn test_progress_every_line_plus_completion() {
        let mut observers = Observers::new();
        let events = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let sink = std::rc::Rc::clone(&events);
        observers.register(move |e: &FileProgressEvent| sink.borrow_mut().push(*e));

        let data = b"0 HEAD\n1 CHAR ASCII\n0 TRLR\n";
        let rate = NotificationRate::new(1).unwrap();
        let reader = LineReader::with_observers(&data[..], Some(&mut observers), rate).unwrap();
        let read: Vec<String> = reader.collect::<Result<_>>().unwrap();
        assert_eq!(read.len(), 3);

        let events = events.borrow();
        assert_eq!(events.len(), 4);
        assert_eq!(events[0].lines_processed, 1);
        assert_eq!(events[0].bytes_processed, 7);
        assert!(events[3].complete);
        assert_eq!(events[3].bytes_processed, data.len() as u64);
    }

    #[test]
    fn test_cr_lookahead_not_counted_early() {
        let mut observers = Observers::new();
        let events = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let sink = std::rc::Rc::clone(&events);
        observers.register(move |e: &FileProgressEvent| sink.borrow_mut().push(e.bytes_processed));

        let data = b"0 HEAD\r1 CHAR ASCII\r0 TRLR\r";
        let rate = NotificationRate::new(1).unwrap();
        let mut reader = LineReader::with_observers(&data[..], Some(&mut observers), rate).unwrap();
        while reader.next_line().unwrap().is_some() {}
        assert_eq!(reader.bytes_consumed(), data.len() as u64);
        drop(reader);

        assert_eq!(*events.borrow(), vec![7, 20, 27, 27]);
    }

    #[test]
    fn test_utf8_cut_inside_character() {
        let mut reader = LineReader::new(&b"0 NOTE caf\xC3"[..]).unwrap();
        reader.confirm_encoding(Some("UTF-8")).unwrap();
        match reader.next_line() {
            Err(TransportError::Parse { line, kind, .. }) => {
                assert_eq!(line, 1);
                assert_eq!(kind, ParseErrorKind::MalformedCharacter(Encoding::Utf8));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_confirm_redecodes_retained_prefix() {
        let mut data = b"0 HEAD\n1 NOTE ".to_vec();
        data.extend_from_slice(&[0xE2, b'e']);
        data.extend_from_slice(b"\n1 CHAR ANSEL\n");

        let mut reader = LineReader::new(&data[..]).unwrap().retaining_prefix();
        let provisional: Vec<String> = (0..3).map(|_| reader.next_line().unwrap().unwrap()).collect();
        assert_eq!(provisional[1], "1 NOTE \u{00E2}e");

        let redecoded = reader.confirm_encoding(Some("ANSEL")).unwrap();
        assert_eq!(reader.encoding(), Encoding::Ansel);
        assert_eq!(redecoded, vec!["0 HEAD", "1 NOTE é", "1 CHAR ANSEL"]);
    }
}
