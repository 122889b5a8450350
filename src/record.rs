//! Leveled lines and the record tree

use std::fmt;

use crate::error::{ParseErrorKind, Result, TransportError};

/// Tag of a continuation line that starts a new line in the parent value
pub const CONT: &str = "CONT";
/// Tag of a continuation line appended to the parent value as is
pub const CONC: &str = "CONC";

/// Level of the synthetic root node
pub const ROOT_LEVEL: i32 = -1;

/// One `LEVEL [@XREF@] TAG [VALUE]` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GedcomLine {
    pub level: u32,
    pub xref: Option<String>,
    pub tag: String,
    pub value: Option<String>,
}

impl GedcomLine {
    pub fn new(level: u32, tag: impl Into<String>) -> Self {
        Self {
            level,
            xref: None,
            tag: tag.into(),
            value: None,
        }
    }

    pub fn with_xref(mut self, xref: impl Into<String>) -> Self {
        self.xref = Some(xref.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Parse a decoded line. `line_number` is only used for error context.
    ///
    /// Leading whitespace and repeated delimiters before the tag are tolerated.
    /// Exactly one space separates the tag from the value, so leading spaces
    /// in a value survive.
    pub fn parse(text: &str, line_number: usize) -> Result<Self> {
        let fail = |kind| TransportError::parse(line_number, text, kind);

        let trimmed = text.trim_start();
        let (level, rest) = trimmed.split_once(' ').unwrap_or((trimmed, ""));
        if level.is_empty() || !level.bytes().all(|b| b.is_ascii_digit()) {
            return Err(fail(ParseErrorKind::MalformedLevel));
        }
        let level: u32 = level.parse().map_err(|_| fail(ParseErrorKind::MalformedLevel))?;

        let rest = rest.trim_start_matches(' ');
        let (xref, rest) = if rest.starts_with('@') {
            let (token, after) = rest.split_once(' ').unwrap_or((rest, ""));
            if token.len() < 3 || !token.ends_with('@') {
                return Err(fail(ParseErrorKind::MalformedXref));
            }
            (Some(token.to_string()), after.trim_start_matches(' '))
        } else {
            (None, rest)
        };

        let (tag, value) = match rest.split_once(' ') {
            Some((tag, value)) => (tag, Some(value)),
            None => (rest, None),
        };
        if tag.is_empty() {
            return Err(fail(ParseErrorKind::MissingTag));
        }

        Ok(Self {
            level,
            xref,
            tag: tag.to_string(),
            value: value.filter(|v| !v.is_empty()).map(str::to_string),
        })
    }

    pub fn is_continuation(&self) -> bool {
        self.tag == CONT || self.tag == CONC
    }
}

impl fmt::Display for GedcomLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.level)?;
        if let Some(xref) = &self.xref {
            write!(f, " {}", xref)?;
        }
        write!(f, " {}", self.tag)?;
        match &self.value {
            Some(value) if !value.is_empty() => write!(f, " {}", value),
            _ => Ok(()),
        }
    }
}

/// A node in the record tree. Each child is owned by its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordNode {
    pub level: i32,
    pub xref: Option<String>,
    pub tag: String,
    pub value: Option<String>,
    pub children: Vec<RecordNode>,
}

impl RecordNode {
    /// The synthetic level -1 node that holds the level 0 records
    pub fn root() -> Self {
        Self {
            level: ROOT_LEVEL,
            xref: None,
            tag: String::new(),
            value: None,
            children: Vec::new(),
        }
    }

    pub fn from_line(line: GedcomLine) -> Self {
        Self {
            // levels beyond i32::MAX cannot get past the level stack
            level: i32::try_from(line.level).unwrap_or(i32::MAX),
            xref: line.xref,
            tag: line.tag,
            value: line.value,
            children: Vec::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.level == ROOT_LEVEL
    }

    pub fn find_child(&self, tag: &str) -> Option<&RecordNode> {
        self.children.iter().find(|c| c.tag == tag)
    }

    pub fn children_with_tag<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a RecordNode> + 'a {
        self.children.iter().filter(move |c| c.tag == tag)
    }

    /// Extend the value with a continuation line's value
    pub fn append_continuation(&mut self, text: Option<&str>, line_break: bool) {
        let value = self.value.get_or_insert_with(String::new);
        if line_break {
            value.push('\n');
        }
        if let Some(text) = text {
            value.push_str(text);
        }
    }

    /// This node as a line, `None` for the root
    pub fn line(&self) -> Option<GedcomLine> {
        let level = u32::try_from(self.level).ok()?;
        Some(GedcomLine {
            level,
            xref: self.xref.clone(),
            tag: self.tag.clone(),
            value: self.value.clone(),
        })
    }

    /// Pre-order lines of this subtree, the root itself excluded.
    ///
    /// Values keep their embedded line breaks; the encoder splits them again.
    pub fn flatten(&self) -> Vec<GedcomLine> {
        let mut out = Vec::new();
        self.flatten_into(&mut out);
        out
    }

    fn flatten_into(&self, out: &mut Vec<GedcomLine>) {
        if let Some(line) = self.line() {
            out.push(line);
        }
        for child in &self.children {
            child.flatten_into(out);
        }
    }

    /// Number of nodes below this one
    pub fn descendant_count(&self) -> usize {
        self.children.iter().map(|c| 1 + c.descendant_count()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_line() {
        let line = GedcomLine::parse("0 @I1@ INDI", 1).unwrap();
        assert_eq!(line.level, 0);
        assert_eq!(line.xref.as_deref(), Some("@I1@"));
        assert_eq!(line.tag, "INDI");
        assert_eq!(line.value, None);

        let line = GedcomLine::parse("1 NAME John /Doe/", 2).unwrap();
        assert_eq!(line.level, 1);
        assert_eq!(line.xref, None);
        assert_eq!(line.tag, "NAME");
        assert_eq!(line.value.as_deref(), Some("John /Doe/"));
    }

    #[test]
    fn test_parse_keeps_value_spacing() {
        let line = GedcomLine::parse("2 CONC  two spaces ", 7).unwrap();
        assert_eq!(line.value.as_deref(), Some(" two spaces "));
    }

    #[test]
    fn test_parse_pointer_value() {
        let line = GedcomLine::parse("1 FAMC @F1@", 3).unwrap();
        assert_eq!(line.xref, None);
        assert_eq!(line.value.as_deref(), Some("@F1@"));
    }

    #[test]
    fn test_parse_tolerates_leading_whitespace() {
        let line = GedcomLine::parse("   1  SEX M", 3).unwrap();
        assert_eq!(line.level, 1);
        assert_eq!(line.tag, "SEX");
        assert_eq!(line.value.as_deref(), Some("M"));
    }

    #[test]
    fn test_parse_errors_carry_context() {
        let err = GedcomLine::parse("X HEAD", 12).unwrap_err();
        match err {
            TransportError::Parse { line, content, kind } => {
                assert_eq!(line, 12);
                assert_eq!(content, "X HEAD");
                assert_eq!(kind, ParseErrorKind::MalformedLevel);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        assert!(matches!(
            GedcomLine::parse("0", 1),
            Err(TransportError::Parse { kind: ParseErrorKind::MissingTag, .. })
        ));
        assert!(matches!(
            GedcomLine::parse("0 @I1 INDI", 1),
            Err(TransportError::Parse { kind: ParseErrorKind::MalformedXref, .. })
        ));
    }

    #[test]
    fn test_display() {
        let line = GedcomLine::new(0, "INDI").with_xref("@I1@");
        assert_eq!(line.to_string(), "0 @I1@ INDI");
        let line = GedcomLine::new(1, "NAME").with_value("Mary /Smith/");
        assert_eq!(line.to_string(), "1 NAME Mary /Smith/");
        assert_eq!(GedcomLine::new(1, "BIRT").with_value("").to_string(), "1 BIRT");
    }

    #[test]
    fn test_append_continuation() {
        let mut node = RecordNode::from_line(GedcomLine::new(1, "NOTE").with_value("first"));
        node.append_continuation(Some("second"), true);
        node.append_continuation(Some(" half"), false);
        node.append_continuation(None, true);
        assert_eq!(node.value.as_deref(), Some("first\nsecond half\n"));
    }

    #[test]
    fn test_flatten_is_pre_order() {
        let mut root = RecordNode::root();
        let mut indi = RecordNode::from_line(GedcomLine::new(0, "INDI").with_xref("@I1@"));
        let mut birt = RecordNode::from_line(GedcomLine::new(1, "BIRT"));
        birt.children.push(RecordNode::from_line(GedcomLine::new(2, "DATE").with_value("1 JAN 1900")));
        indi.children.push(birt);
        indi.children.push(RecordNode::from_line(GedcomLine::new(1, "SEX").with_value("F")));
        root.children.push(indi);

        let tags: Vec<String> = root.flatten().into_iter().map(|l| l.tag).collect();
        assert_eq!(tags, vec!["INDI", "BIRT", "DATE", "SEX"]);
        assert_eq!(root.descendant_count(), 4);
        assert!(root.line().is_none());
        assert!(root.is_root());
        assert!(!root.children[0].is_root());
        assert_eq!(root.find_child("INDI").unwrap().children_with_tag("SEX").count(), 1);
    }
}
