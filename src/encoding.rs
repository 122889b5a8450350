//! Encoding detection and line terminators

use std::io::{self, Read};

use log::debug;

use crate::error::{Result, TransportError};

/// Number of leading bytes needed to classify a stream
pub const DETECTION_PREFIX_LEN: usize = 4;

const UTF8_BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];
const UTF16_BE_BOM: [u8; 2] = [0xFE, 0xFF];
const UTF16_LE_BOM: [u8; 2] = [0xFF, 0xFE];

/// The closed set of byte encodings a GEDCOM stream can use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    /// ASCII, read as the ANSI (Windows-1252) superset for the high half
    Ascii,
    /// ANSEL (Z39.47) with GEDCOM extensions
    Ansel,
    /// UTF-8, with or without a byte-order mark
    Utf8,
    /// UTF-16 big-endian
    Utf16Be,
    /// UTF-16 little-endian
    Utf16Le,
}

/// How many bytes one character occupies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharWidth {
    Fixed(usize),
    Variable,
}

/// The codec that turns a raw line into text
#[derive(Debug, Clone, Copy)]
pub enum Codec {
    /// Delegated to `encoding_rs`
    Standard(&'static encoding_rs::Encoding),
    /// The ANSEL codec in [`crate::ansel`]
    Ansel,
}

impl Encoding {
    /// Width of one character. Fixed widths are also the width of the code
    /// unit a line terminator is read and written in.
    pub fn bytes_per_char(self) -> CharWidth {
        match self {
            Encoding::Ascii | Encoding::Ansel => CharWidth::Fixed(1),
            Encoding::Utf8 => CharWidth::Variable,
            Encoding::Utf16Be | Encoding::Utf16Le => CharWidth::Fixed(2),
        }
    }

    pub fn codec(self) -> Codec {
        match self {
            Encoding::Ascii => Codec::Standard(encoding_rs::WINDOWS_1252),
            Encoding::Ansel => Codec::Ansel,
            Encoding::Utf8 => Codec::Standard(encoding_rs::UTF_8),
            Encoding::Utf16Be => Codec::Standard(encoding_rs::UTF_16BE),
            Encoding::Utf16Le => Codec::Standard(encoding_rs::UTF_16LE),
        }
    }

    /// The byte-order mark for this encoding, if it has one
    pub fn bom(self) -> &'static [u8] {
        match self {
            Encoding::Utf8 => &UTF8_BOM,
            Encoding::Utf16Be => &UTF16_BE_BOM,
            Encoding::Utf16Le => &UTF16_LE_BOM,
            Encoding::Ascii | Encoding::Ansel => &[],
        }
    }

    /// The value written on the `1 CHAR` header line
    pub fn gedcom_name(self) -> &'static str {
        match self {
            Encoding::Ascii => "ASCII",
            Encoding::Ansel => "ANSEL",
            Encoding::Utf8 => "UTF-8",
            Encoding::Utf16Be | Encoding::Utf16Le => "UNICODE",
        }
    }

    /// Whether ASCII text reads identically in this encoding
    fn is_single_byte_compatible(self) -> bool {
        matches!(self, Encoding::Ascii | Encoding::Ansel | Encoding::Utf8)
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Encoding::Ascii => "ASCII",
            Encoding::Ansel => "ANSEL",
            Encoding::Utf8 => "UTF-8",
            Encoding::Utf16Be => "UTF-16BE",
            Encoding::Utf16Le => "UTF-16LE",
        };
        f.write_str(name)
    }
}

/// Line terminator style
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineTerminator {
    Cr,
    Lf,
    #[default]
    CrLf,
}

impl LineTerminator {
    pub fn as_str(self) -> &'static str {
        match self {
            LineTerminator::Cr => "\r",
            LineTerminator::Lf => "\n",
            LineTerminator::CrLf => "\r\n",
        }
    }
}

/// The first bytes of a source stream, captured once for detection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChunk {
    bytes: Vec<u8>,
}

impl RawChunk {
    /// Capture the detection prefix from `bytes`.
    ///
    /// Fails with an `UnexpectedEof` I/O error when fewer than
    /// [`DETECTION_PREFIX_LEN`] bytes are available.
    pub fn new(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < DETECTION_PREFIX_LEN {
            return Err(too_short(bytes.len()));
        }
        Ok(Self {
            bytes: bytes[..DETECTION_PREFIX_LEN].to_vec(),
        })
    }

    /// Read the detection prefix from a stream.
    ///
    /// Returns the chunk and every byte consumed, so the caller can replay them.
    pub fn read_from<R: Read>(source: &mut R) -> Result<(Self, Vec<u8>)> {
        let mut consumed = vec![0u8; DETECTION_PREFIX_LEN];
        let mut filled = 0;
        while filled < DETECTION_PREFIX_LEN {
            match source.read(&mut consumed[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        consumed.truncate(filled);
        let chunk = Self::new(&consumed)?;
        Ok((chunk, consumed))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Big-endian value of the first `n` bytes (1..=4)
    pub fn first_n_bytes(&self, n: usize) -> u32 {
        self.bytes
            .iter()
            .take(n.min(DETECTION_PREFIX_LEN))
            .fold(0u32, |acc, &b| (acc << 8) | u32::from(b))
    }
}

fn too_short(len: usize) -> TransportError {
    TransportError::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!(
            "stream has {} bytes, at least {} are needed to detect the encoding",
            len, DETECTION_PREFIX_LEN
        ),
    ))
}

/// Outcome of byte-level detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detection {
    pub encoding: Encoding,
    /// Length of the byte-order mark to skip, 0 if none
    pub bom_len: usize,
}

impl Detection {
    pub fn has_bom(&self) -> bool {
        self.bom_len > 0
    }
}

/// Classify a stream from its first bytes.
///
/// A single-byte result is provisional: the `CHAR` line in the header
/// may still change it through [`confirm_or_reject`].
pub fn detect_provisional(chunk: &RawChunk) -> Detection {
    let b = chunk.as_bytes();

    let detection = if b.starts_with(&UTF16_BE_BOM) {
        Detection { encoding: Encoding::Utf16Be, bom_len: 2 }
    } else if b.starts_with(&UTF16_LE_BOM) {
        Detection { encoding: Encoding::Utf16Le, bom_len: 2 }
    } else if b.starts_with(&UTF8_BOM) {
        Detection { encoding: Encoding::Utf8, bom_len: 3 }
    } else if b[0] == 0x00 && b[2] == 0x00 {
        Detection { encoding: Encoding::Utf16Be, bom_len: 0 }
    } else if b[1] == 0x00 && b[3] == 0x00 {
        Detection { encoding: Encoding::Utf16Le, bom_len: 0 }
    } else {
        Detection { encoding: Encoding::Ascii, bom_len: 0 }
    };

    debug!(
        "Provisional encoding {} (first bytes {:#010x}, bom: {})",
        detection.encoding,
        chunk.first_n_bytes(4),
        detection.has_bom()
    );
    detection
}

/// Map a declared `CHAR` value to an encoding family.
///
/// UNICODE maps to big-endian; the byte order always comes from detection.
pub fn encoding_for_declared(declared: &str) -> Option<Encoding> {
    let name = declared.trim().to_ascii_uppercase();
    match name.as_str() {
        "ANSEL" => Some(Encoding::Ansel),
        "ASCII" | "ANSI" | "IBMPC" | "IBM WINDOWS" => Some(Encoding::Ascii),
        "UTF-8" | "UTF8" => Some(Encoding::Utf8),
        "UNICODE" | "UTF-16" | "UTF16" => Some(Encoding::Utf16Be),
        _ => None,
    }
}

/// Reconcile the detected encoding with the header's declared character set.
pub fn confirm_or_reject(provisional: Detection, declared: Option<&str>) -> Result<Encoding> {
    let Some(declared) = declared else {
        return Ok(provisional.encoding);
    };

    let reject = || TransportError::UnsupportedEncoding {
        declared: declared.to_string(),
        detected: provisional.encoding,
    };
    let wanted = encoding_for_declared(declared).ok_or_else(reject)?;

    let confirmed = match (provisional.encoding, wanted) {
        (Encoding::Utf16Be | Encoding::Utf16Le, Encoding::Utf16Be) => provisional.encoding,
        (Encoding::Utf16Be | Encoding::Utf16Le, _) => return Err(reject()),
        (_, Encoding::Utf16Be) => return Err(reject()),
        (Encoding::Utf8, Encoding::Utf8 | Encoding::Ascii) if provisional.has_bom() => Encoding::Utf8,
        (Encoding::Utf8, _) if provisional.has_bom() => return Err(reject()),
        (detected, wanted) if detected.is_single_byte_compatible() => wanted,
        _ => return Err(reject()),
    };

    if confirmed != provisional.encoding {
        debug!("Declared character set {:?} overrides provisional {}", declared, provisional.encoding);
    }
    Ok(confirmed)
}
