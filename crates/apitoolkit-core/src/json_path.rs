//! Structural field paths over JSON documents.
//!
//! A small JSONPath subset, enough to address the fields operators usually
//! want hidden:
//!
//! | Syntax | Meaning |
//! |--------|---------|
//! | `$` | document root (optional) |
//! | `.name` / `['name']` / `["name"]` | object member |
//! | `[3]` | array element |
//! | `.*` / `[*]` | every member or element |
//! | `..name` | `name` at any depth below |
//!
//! A path without a leading `$` is read as if it started with `$.`, so
//! `password` and `$.password` are the same path.

use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A path that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    /// The path has no segments after the root.
    #[error("path `{0}` selects the whole document")]
    Root(String),

    /// A segment is malformed.
    #[error("invalid path `{path}` at offset {offset}: {reason}")]
    Syntax {
        /// The offending path
        path: String,
        /// Byte offset of the problem
        offset: usize,
        /// What was expected
        reason: &'static str,
    },
}

/// One step of a [`JsonPath`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Object member by name.
    Key(String),
    /// Array element by position.
    Index(usize),
    /// Every member of an object or element of an array.
    Wildcard,
    /// Member with this name at any depth.
    Descendant(String),
}

/// A compiled structural field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    raw: String,
    segments: Vec<Segment>,
}

impl JsonPath {
    /// Compile a path expression.
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let raw = raw.trim();
        let segments = Parser::new(raw).parse()?;
        if segments.is_empty() {
            return Err(PathError::Root(raw.to_string()));
        }
        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// The expression this path was compiled from.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The compiled segments.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Replace every value this path resolves to with `replacement`.
    ///
    /// Returns how many positions were replaced. A path that does not
    /// resolve leaves `document` untouched and returns 0.
    pub fn replace_all(&self, document: &mut Value, replacement: &Value) -> usize {
        replace_at(document, &self.segments, replacement)
    }
}

impl FromStr for JsonPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn replace_at(value: &mut Value, segments: &[Segment], replacement: &Value) -> usize {
    let Some((head, rest)) = segments.split_first() else {
        *value = replacement.clone();
        return 1;
    };

    match (head, value) {
        (Segment::Key(key), Value::Object(map)) => map
            .get_mut(key)
            .map_or(0, |child| replace_at(child, rest, replacement)),
        (Segment::Index(index), Value::Array(items)) => items
            .get_mut(*index)
            .map_or(0, |child| replace_at(child, rest, replacement)),
        (Segment::Wildcard, Value::Object(map)) => map
            .values_mut()
            .map(|child| replace_at(child, rest, replacement))
            .sum(),
        (Segment::Wildcard, Value::Array(items)) => items
            .iter_mut()
            .map(|child| replace_at(child, rest, replacement))
            .sum(),
        (Segment::Descendant(name), value) => descend(value, name, rest, replacement),
        _ => 0,
    }
}

fn descend(value: &mut Value, name: &str, rest: &[Segment], replacement: &Value) -> usize {
    let mut count = 0;
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                if key == name {
                    count += replace_at(child, rest, replacement);
                }
                count += descend(child, name, rest, replacement);
            }
        }
        Value::Array(items) => {
            for child in items.iter_mut() {
                count += descend(child, name, rest, replacement);
            }
        }
        _ => {}
    }
    count
}

struct Parser<'a> {
    raw: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(raw: &'a str) -> Self {
        Self {
            raw,
            bytes: raw.as_bytes(),
            pos: 0,
        }
    }

    fn error(&self, reason: &'static str) -> PathError {
        PathError::Syntax {
            path: self.raw.to_string(),
            offset: self.pos,
            reason,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn parse(mut self) -> Result<Vec<Segment>, PathError> {
        let mut segments = Vec::new();

        match self.peek() {
            Some(b'$') => self.pos += 1,
            Some(b'.') | Some(b'[') | None => {}
            // bare `name` is shorthand for `$.name`
            Some(_) => segments.push(Segment::Key(self.name()?)),
        }

        while let Some(byte) = self.peek() {
            match byte {
                b'.' => {
                    self.pos += 1;
                    match self.peek() {
                        Some(b'.') => {
                            self.pos += 1;
                            segments.push(Segment::Descendant(self.name()?));
                        }
                        Some(b'*') => {
                            self.pos += 1;
                            segments.push(Segment::Wildcard);
                        }
                        _ => segments.push(Segment::Key(self.name()?)),
                    }
                }
                b'[' => {
                    self.pos += 1;
                    segments.push(self.bracket()?);
                }
                _ => return Err(self.error("expected `.` or `[`")),
            }
        }

        Ok(segments)
    }

    fn name(&mut self) -> Result<String, PathError> {
        let start = self.pos;
        while let Some(byte) = self.peek() {
            if byte == b'.' || byte == b'[' {
                break;
            }
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.error("expected a member name"));
        }
        Ok(self.raw[start..self.pos].to_string())
    }

    fn bracket(&mut self) -> Result<Segment, PathError> {
        let segment = match self.peek() {
            Some(quote @ (b'\'' | b'"')) => {
                self.pos += 1;
                let start = self.pos;
                while self.peek().is_some_and(|b| b != quote) {
                    self.pos += 1;
                }
                if self.peek().is_none() {
                    return Err(self.error("unterminated quoted name"));
                }
                let name = self.raw[start..self.pos].to_string();
                self.pos += 1;
                Segment::Key(name)
            }
            Some(b'*') => {
                self.pos += 1;
                Segment::Wildcard
            }
            Some(b'0'..=b'9') => {
                let start = self.pos;
                while self.peek().is_some_and(|b| b.is_ascii_digit()) {
                    self.pos += 1;
                }
                let index = self.raw[start..self.pos]
                    .parse()
                    .map_err(|_| self.error("index out of range"))?;
                Segment::Index(index)
            }
            _ => return Err(self.error("expected a quoted name, index or `*`")),
        };

        if self.peek() != Some(b']') {
            return Err(self.error("expected `]`"));
        }
        self.pos += 1;
        Ok(segment)
    }
}
