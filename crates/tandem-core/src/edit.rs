//! Text edit descriptors exchanged between collaborators

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Zero-based line/character position in a document
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    pub fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }
}

/// Half-open span between two positions
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    pub fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }
}

/// Replace `range` with `text`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditDescriptor {
    pub range: Range,
    pub text: String,
}

impl EditDescriptor {
    pub fn new(range: Range, text: impl Into<String>) -> Self {
        Self {
            range,
            text: text.into(),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Apply this edit to a document, returning the new text.
    ///
    /// Characters are counted as Unicode scalar values. A position past the
    /// end of its line clamps to the line end.
    pub fn apply_to(&self, document: &str) -> Result<String, ProtocolError> {
        let (start, end) = (self.range.start, self.range.end);
        if end < start {
            return Err(ProtocolError::malformed("applyEdit", "range end precedes start"));
        }
        let from = byte_offset(document, start)?;
        let to = byte_offset(document, end)?;

        let mut out = String::with_capacity(document.len() - (to - from) + self.text.len());
        out.push_str(&document[..from]);
        out.push_str(&self.text);
        out.push_str(&document[to..]);
        Ok(out)
    }
}

fn byte_offset(document: &str, pos: Position) -> Result<usize, ProtocolError> {
    let mut line_start = 0;
    for _ in 0..pos.line {
        match document[line_start..].find('\n') {
            Some(i) => line_start += i + 1,
            None => {
                return Err(ProtocolError::malformed(
                    "applyEdit",
                    format!("line {} out of range", pos.line),
                ))
            }
        }
    }

    let line = &document[line_start..];
    let line_len = line.find('\n').unwrap_or(line.len());
    let within = line[..line_len]
        .char_indices()
        .nth(pos.character as usize)
        .map(|(i, _)| i)
        .unwrap_or(line_len);
    Ok(line_start + within)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edit(sl: u32, sc: u32, el: u32, ec: u32, text: &str) -> EditDescriptor {
        EditDescriptor::new(Range::new(Position::new(sl, sc), Position::new(el, ec)), text)
    }

    #[test]
    fn test_replace_on_first_line() {
        let e = edit(0, 0, 0, 5, "howdy");
        assert_eq!(e.apply_to("hello world").unwrap(), "howdy world");
    }

    #[test]
    fn test_insert_and_multiline_delete() {
        let doc = "one\ntwo\nthree\n";
        assert_eq!(edit(1, 3, 1, 3, "!").apply_to(doc).unwrap(), "one\ntwo!\nthree\n");
        assert_eq!(edit(0, 1, 2, 2, "").apply_to(doc).unwrap(), "oree\n");
    }

    #[test]
    fn test_clamps_past_line_end() {
        assert_eq!(edit(0, 99, 0, 99, "?").apply_to("ab\ncd").unwrap(), "ab?\ncd");
    }

    #[test]
    fn test_unicode_characters() {
        assert_eq!(edit(0, 1, 0, 2, "e").apply_to("héllo").unwrap(), "hello");
    }

    #[test]
    fn test_rejects_bad_ranges() {
        assert!(edit(5, 0, 5, 1, "x").apply_to("only one line").is_err());
        assert!(edit(0, 4, 0, 1, "x").apply_to("backwards").is_err());
    }

    #[test]
    fn test_json_shape() {
        let e = edit(0, 0, 0, 5, "howdy");
        let json = String::from_utf8(e.to_json().unwrap()).unwrap();
        assert!(json.contains(r#""start":{"line":0,"character":0}"#));
        assert_eq!(EditDescriptor::from_json(json.as_bytes()).unwrap(), e);
    }
}
