//! ANSEL codec
//!
//! ANSEL keeps ASCII in the low half. The high half holds spacing characters
//! and combining diacritics. A diacritic byte comes *before* the letter it
//! modifies, the reverse of Unicode, so decoding holds at most one pending
//! mark and applies it to the next base character. Base plus mark is composed
//! to a precomposed scalar where one exists; encoding decomposes such scalars
//! again and writes the mark byte first.

use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use log::warn;

/// Spacing characters (GEDCOM 5.5.1 ANSEL table plus GEDCOM extensions)
const SPACING: &[(u8, char)] = &[
    (0x8D, '\u{200D}'),
    (0x8E, '\u{200C}'),
    (0xA1, '\u{0141}'),
    (0xA2, '\u{00D8}'),
    (0xA3, '\u{0110}'),
    (0xA4, '\u{00DE}'),
    (0xA5, '\u{00C6}'),
    (0xA6, '\u{0152}'),
    (0xA7, '\u{02B9}'),
    (0xA8, '\u{00B7}'),
    (0xA9, '\u{266D}'),
    (0xAA, '\u{00AE}'),
    (0xAB, '\u{00B1}'),
    (0xAC, '\u{01A0}'),
    (0xAD, '\u{01AF}'),
    (0xAE, '\u{02BC}'),
    (0xB0, '\u{02BB}'),
    (0xB1, '\u{0142}'),
    (0xB2, '\u{00F8}'),
    (0xB3, '\u{0111}'),
    (0xB4, '\u{00FE}'),
    (0xB5, '\u{00E6}'),
    (0xB6, '\u{0153}'),
    (0xB7, '\u{02BA}'),
    (0xB8, '\u{0131}'),
    (0xB9, '\u{00A3}'),
    (0xBA, '\u{00F0}'),
    (0xBC, '\u{01A1}'),
    (0xBD, '\u{01B0}'),
    (0xBE, '\u{25A1}'),
    (0xBF, '\u{25A0}'),
    (0xC0, '\u{00B0}'),
    (0xC1, '\u{2113}'),
    (0xC2, '\u{2117}'),
    (0xC3, '\u{00A9}'),
    (0xC4, '\u{266F}'),
    (0xC5, '\u{00BF}'),
    (0xC6, '\u{00A1}'),
    (0xC7, '\u{00DF}'),
    (0xC8, '\u{20AC}'),
    (0xCF, '\u{00DF}'),
];

/// Combining diacritics, written before their base letter
const COMBINING: &[(u8, char)] = &[
    (0xE0, '\u{0309}'),
    (0xE1, '\u{0300}'),
    (0xE2, '\u{0301}'),
    (0xE3, '\u{0302}'),
    (0xE4, '\u{0303}'),
    (0xE5, '\u{0304}'),
    (0xE6, '\u{0306}'),
    (0xE7, '\u{0307}'),
    (0xE8, '\u{0308}'),
    (0xE9, '\u{030C}'),
    (0xEA, '\u{030A}'),
    (0xEB, '\u{FE20}'),
    (0xEC, '\u{FE21}'),
    (0xED, '\u{0315}'),
    (0xEE, '\u{030B}'),
    (0xEF, '\u{0310}'),
    (0xF0, '\u{0327}'),
    (0xF1, '\u{0328}'),
    (0xF2, '\u{0323}'),
    (0xF3, '\u{0324}'),
    (0xF4, '\u{0325}'),
    (0xF5, '\u{0333}'),
    (0xF6, '\u{0332}'),
    (0xF7, '\u{0326}'),
    (0xF8, '\u{031C}'),
    (0xF9, '\u{032E}'),
    (0xFA, '\u{FE22}'),
    (0xFB, '\u{FE23}'),
    (0xFE, '\u{0313}'),
];

/// Precomposed letters reachable as base + one ANSEL diacritic
const COMPOSED: &[(char, char, char)] = &[
    // grave
    ('À', 'A', '\u{0300}'), ('È', 'E', '\u{0300}'), ('Ì', 'I', '\u{0300}'), ('Ò', 'O', '\u{0300}'), ('Ù', 'U', '\u{0300}'),
    ('à', 'a', '\u{0300}'), ('è', 'e', '\u{0300}'), ('ì', 'i', '\u{0300}'), ('ò', 'o', '\u{0300}'), ('ù', 'u', '\u{0300}'),
    // acute
    ('Á', 'A', '\u{0301}'), ('É', 'E', '\u{0301}'), ('Í', 'I', '\u{0301}'), ('Ó', 'O', '\u{0301}'), ('Ú', 'U', '\u{0301}'),
    ('Ý', 'Y', '\u{0301}'), ('Ć', 'C', '\u{0301}'), ('Ń', 'N', '\u{0301}'), ('Ś', 'S', '\u{0301}'), ('Ź', 'Z', '\u{0301}'),
    ('Ĺ', 'L', '\u{0301}'), ('Ŕ', 'R', '\u{0301}'),
    ('á', 'a', '\u{0301}'), ('é', 'e', '\u{0301}'), ('í', 'i', '\u{0301}'), ('ó', 'o', '\u{0301}'), ('ú', 'u', '\u{0301}'),
    ('ý', 'y', '\u{0301}'), ('ć', 'c', '\u{0301}'), ('ń', 'n', '\u{0301}'), ('ś', 's', '\u{0301}'), ('ź', 'z', '\u{0301}'),
    ('ĺ', 'l', '\u{0301}'), ('ŕ', 'r', '\u{0301}'),
    // circumflex
    ('Â', 'A', '\u{0302}'), ('Ê', 'E', '\u{0302}'), ('Î', 'I', '\u{0302}'), ('Ô', 'O', '\u{0302}'), ('Û', 'U', '\u{0302}'),
    ('Ĉ', 'C', '\u{0302}'), ('Ĝ', 'G', '\u{0302}'), ('Ĥ', 'H', '\u{0302}'), ('Ĵ', 'J', '\u{0302}'), ('Ŝ', 'S', '\u{0302}'),
    ('Ŵ', 'W', '\u{0302}'), ('Ŷ', 'Y', '\u{0302}'),
    ('â', 'a', '\u{0302}'), ('ê', 'e', '\u{0302}'), ('î', 'i', '\u{0302}'), ('ô', 'o', '\u{0302}'), ('û', 'u', '\u{0302}'),
    ('ĉ', 'c', '\u{0302}'), ('ĝ', 'g', '\u{0302}'), ('ĥ', 'h', '\u{0302}'), ('ĵ', 'j', '\u{0302}'), ('ŝ', 's', '\u{0302}'),
    ('ŵ', 'w', '\u{0302}'), ('ŷ', 'y', '\u{0302}'),
    // tilde
    ('Ã', 'A', '\u{0303}'), ('Ñ', 'N', '\u{0303}'), ('Õ', 'O', '\u{0303}'), ('Ĩ', 'I', '\u{0303}'), ('Ũ', 'U', '\u{0303}'),
    ('ã', 'a', '\u{0303}'), ('ñ', 'n', '\u{0303}'), ('õ', 'o', '\u{0303}'), ('ĩ', 'i', '\u{0303}'), ('ũ', 'u', '\u{0303}'),
    // macron
    ('Ā', 'A', '\u{0304}'), ('Ē', 'E', '\u{0304}'), ('Ī', 'I', '\u{0304}'), ('Ō', 'O', '\u{0304}'), ('Ū', 'U', '\u{0304}'),
    ('ā', 'a', '\u{0304}'), ('ē', 'e', '\u{0304}'), ('ī', 'i', '\u{0304}'), ('ō', 'o', '\u{0304}'), ('ū', 'u', '\u{0304}'),
    // breve
    ('Ă', 'A', '\u{0306}'), ('Ĕ', 'E', '\u{0306}'), ('Ğ', 'G', '\u{0306}'), ('Ŏ', 'O', '\u{0306}'), ('Ŭ', 'U', '\u{0306}'),
    ('ă', 'a', '\u{0306}'), ('ĕ', 'e', '\u{0306}'), ('ğ', 'g', '\u{0306}'), ('ŏ', 'o', '\u{0306}'), ('ŭ', 'u', '\u{0306}'),
    // dot above
    ('Ċ', 'C', '\u{0307}'), ('Ė', 'E', '\u{0307}'), ('Ġ', 'G', '\u{0307}'), ('İ', 'I', '\u{0307}'), ('Ż', 'Z', '\u{0307}'),
    ('ċ', 'c', '\u{0307}'), ('ė', 'e', '\u{0307}'), ('ġ', 'g', '\u{0307}'), ('ż', 'z', '\u{0307}'),
    // diaeresis
    ('Ä', 'A', '\u{0308}'), ('Ë', 'E', '\u{0308}'), ('Ï', 'I', '\u{0308}'), ('Ö', 'O', '\u{0308}'), ('Ü', 'U', '\u{0308}'),
    ('Ÿ', 'Y', '\u{0308}'),
    ('ä', 'a', '\u{0308}'), ('ë', 'e', '\u{0308}'), ('ï', 'i', '\u{0308}'), ('ö', 'o', '\u{0308}'), ('ü', 'u', '\u{0308}'),
    ('ÿ', 'y', '\u{0308}'),
    // caron
    ('Č', 'C', '\u{030C}'), ('Ď', 'D', '\u{030C}'), ('Ě', 'E', '\u{030C}'), ('Ň', 'N', '\u{030C}'), ('Ř', 'R', '\u{030C}'),
    ('Š', 'S', '\u{030C}'), ('Ť', 'T', '\u{030C}'), ('Ž', 'Z', '\u{030C}'),
    ('č', 'c', '\u{030C}'), ('ď', 'd', '\u{030C}'), ('ě', 'e', '\u{030C}'), ('ň', 'n', '\u{030C}'), ('ř', 'r', '\u{030C}'),
    ('š', 's', '\u{030C}'), ('ť', 't', '\u{030C}'), ('ž', 'z', '\u{030C}'),
    // ring above
    ('Å', 'A', '\u{030A}'), ('Ů', 'U', '\u{030A}'), ('å', 'a', '\u{030A}'), ('ů', 'u', '\u{030A}'),
    // double acute
    ('Ő', 'O', '\u{030B}'), ('Ű', 'U', '\u{030B}'), ('ő', 'o', '\u{030B}'), ('ű', 'u', '\u{030B}'),
    // cedilla
    ('Ç', 'C', '\u{0327}'), ('Ģ', 'G', '\u{0327}'), ('Ķ', 'K', '\u{0327}'), ('Ļ', 'L', '\u{0327}'), ('Ņ', 'N', '\u{0327}'),
    ('Ŗ', 'R', '\u{0327}'), ('Ş', 'S', '\u{0327}'), ('Ţ', 'T', '\u{0327}'),
    ('ç', 'c', '\u{0327}'), ('ģ', 'g', '\u{0327}'), ('ķ', 'k', '\u{0327}'), ('ļ', 'l', '\u{0327}'), ('ņ', 'n', '\u{0327}'),
    ('ŗ', 'r', '\u{0327}'), ('ş', 's', '\u{0327}'), ('ţ', 't', '\u{0327}'),
    // ogonek
    ('Ą', 'A', '\u{0328}'), ('Ę', 'E', '\u{0328}'), ('Į', 'I', '\u{0328}'), ('Ų', 'U', '\u{0328}'),
    ('ą', 'a', '\u{0328}'), ('ę', 'e', '\u{0328}'), ('į', 'i', '\u{0328}'), ('ų', 'u', '\u{0328}'),
];

/// Substituted for bytes that have no mapping
const UNMAPPED: char = '\u{FFFD}';

/// A pending mark that never found its base is attached to this
const PLACEHOLDER_BASE: char = ' ';

struct Tables {
    decode: [Option<char>; 128],
    encode: HashMap<char, u8>,
    marks: HashMap<char, u8>,
    compose: HashMap<(char, char), char>,
    decompose: HashMap<char, (char, char)>,
}

fn tables() -> &'static Tables {
    static TABLES: OnceLock<Tables> = OnceLock::new();
    TABLES.get_or_init(|| {
        let mut decode = [None; 128];
        let mut encode = HashMap::new();
        for &(byte, ch) in SPACING {
            decode[usize::from(byte - 0x80)] = Some(ch);
            // 0xC7 and 0xCF both decode to sharp s; write the GEDCOM 0xCF form
            encode.insert(ch, byte);
        }
        let mut marks = HashMap::new();
        for &(byte, ch) in COMBINING {
            decode[usize::from(byte - 0x80)] = Some(ch);
            marks.insert(ch, byte);
        }
        let mut compose = HashMap::new();
        let mut decompose = HashMap::new();
        for &(composed, base, mark) in COMPOSED {
            compose.insert((base, mark), composed);
            decompose.insert(composed, (base, mark));
        }
        Tables { decode, encode, marks, compose, decompose }
    })
}

/// True if `byte` is a combining diacritic
pub fn is_combining_byte(byte: u8) -> bool {
    (0xE0..=0xFE).contains(&byte) && tables().decode[usize::from(byte - 0x80)].is_some()
}

/// True if `ch` is a diacritic ANSEL can write
pub fn is_combining_mark(ch: char) -> bool {
    tables().marks.contains_key(&ch)
}

/// One or two scalars produced by a single input byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    first: char,
    second: Option<char>,
}

impl Fragment {
    fn one(ch: char) -> Self {
        Self { first: ch, second: None }
    }

    fn two(first: char, second: char) -> Self {
        Self { first, second: Some(second) }
    }

    pub fn push_to(&self, out: &mut String) {
        out.push(self.first);
        if let Some(second) = self.second {
            out.push(second);
        }
    }
}

impl fmt::Display for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = String::with_capacity(8);
        self.push_to(&mut s);
        f.write_str(&s)
    }
}

/// Streaming ANSEL decoder holding at most one pending diacritic
#[derive(Debug, Default)]
pub struct AnselDecoder {
    pending: Option<char>,
}

impl AnselDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one byte.
    ///
    /// Returns `None` while a diacritic waits for its base letter.
    pub fn decode(&mut self, byte: u8) -> Option<Fragment> {
        let ch = if byte < 0x80 {
            char::from(byte)
        } else {
            match tables().decode[usize::from(byte - 0x80)] {
                Some(ch) => ch,
                None => {
                    warn!("Unmapped ANSEL byte {:#04x}", byte);
                    UNMAPPED
                }
            }
        };

        if is_combining_byte(byte) {
            // Two marks in a row: the first one is left without a base
            let dangling = self.pending.replace(ch);
            return dangling.map(|mark| Fragment::two(PLACEHOLDER_BASE, mark));
        }

        match self.pending.take() {
            None => Some(Fragment::one(ch)),
            Some(mark) => match tables().compose.get(&(ch, mark)) {
                Some(&composed) => Some(Fragment::one(composed)),
                None => Some(Fragment::two(ch, mark)),
            },
        }
    }

    /// Emit a diacritic still waiting at the end of a line.
    pub fn flush(&mut self) -> Option<Fragment> {
        self.pending
            .take()
            .map(|mark| Fragment::two(PLACEHOLDER_BASE, mark))
    }
}

/// Decode a whole line of ANSEL bytes.
pub fn decode_line(bytes: &[u8]) -> String {
    let mut decoder = AnselDecoder::new();
    let mut out = String::with_capacity(bytes.len());
    for &byte in bytes {
        if let Some(fragment) = decoder.decode(byte) {
            fragment.push_to(&mut out);
        }
    }
    if let Some(fragment) = decoder.flush() {
        fragment.push_to(&mut out);
    }
    out
}

/// Encode a single scalar, mark byte first for decomposable letters.
pub fn encode(ch: char) -> Option<Vec<u8>> {
    if ch.is_ascii() {
        return Some(vec![ch as u8]);
    }
    let t = tables();
    if let Some(&byte) = t.encode.get(&ch) {
        return Some(vec![byte]);
    }
    if let Some(&byte) = t.marks.get(&ch) {
        return Some(vec![byte]);
    }
    let &(base, mark) = t.decompose.get(&ch)?;
    let mut bytes = t.marks.get(&mark).map(|&m| vec![m])?;
    bytes.extend(encode(base)?);
    Some(bytes)
}

/// Encode text, moving every trailing combining mark in front of its base.
///
/// Scalars with no ANSEL form are written as `?`.
pub fn encode_str(text: &str) -> Vec<u8> {
    let t = tables();
    let mut out = Vec::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        let mut trailing = Vec::new();
        while let Some(&next) = chars.peek() {
            match t.marks.get(&next) {
                Some(&byte) => {
                    trailing.push(byte);
                    chars.next();
                }
                None => break,
            }
        }

        if let Some(&byte) = t.marks.get(&ch) {
            // A mark with nothing before it
            out.push(byte);
            out.extend_from_slice(&trailing);
            out.push(PLACEHOLDER_BASE as u8);
            continue;
        }

        match encode(ch) {
            Some(bytes) => {
                let (base, marks) = bytes.split_last().map_or((None, &[][..]), |(b, m)| (Some(*b), m));
                out.extend_from_slice(marks);
                out.extend_from_slice(&trailing);
                out.extend(base);
            }
            None => {
                warn!("Character {:?} (U+{:04X}) has no ANSEL form", ch, u32::from(ch));
                out.extend_from_slice(&trailing);
                out.push(b'?');
            }
        }
    }
    out
}
