//! Configuration text parser.
//!
//! Line-oriented surface syntax: `key = value` pairs, `[name]` loadable
//! entry headers at column 1 of a line, `#` comments, `{ ... }` nested
//! objects. Values are `true`, `false`, `null`, decimal or hex integers,
//! double-quoted strings, or objects. The parser fills the flat store
//! directly; sibling links are maintained through a stack of open scopes.

use crate::{Config, Entry, Payload, RawValue};

use alloc::vec::Vec;
use core::fmt;

/// Position-tagged parse failure. Only the first error is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseError {
    pub message: &'static str,
    /// 1-based line of the offending byte.
    pub line: usize,
    /// 1-based byte offset within that line.
    pub column: usize,
    /// Absolute byte offset within the text.
    pub offset: usize,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "line {}, column {}: {}",
            self.line, self.column, self.message
        )
    }
}

impl ParseError {
    /// Render the error with the offending source line and a caret.
    #[must_use]
    pub fn display_with<'t>(&self, text: &'t str) -> PrettyParseError<'t> {
        PrettyParseError { err: *self, text }
    }
}

/// Human-formatted parse error:
///
/// ```text
/// failed to parse config, error at line 4
/// 4 | video-mode = aut o
///   |                  ^--- unexpected character
/// ```
pub struct PrettyParseError<'t> {
    err: ParseError,
    text: &'t str,
}

impl fmt::Display for PrettyParseError<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let line_start = self.err.offset - (self.err.column - 1);
        let rest = &self.text[line_start.min(self.text.len())..];
        let line = rest.split('\n').next().unwrap_or("").trim_end_matches('\r');

        writeln!(f, "failed to parse config, error at line {}", self.err.line)?;
        writeln!(f, "{} | {}", self.err.line, line)?;

        let gutter = decimal_width(self.err.line);
        for _ in 0..gutter {
            f.write_str(" ")?;
        }
        f.write_str(" | ")?;
        for _ in 1..self.err.column {
            f.write_str(" ")?;
        }
        write!(f, "^--- {}", self.err.message)
    }
}

fn decimal_width(mut v: usize) -> usize {
    let mut width = 1;
    while v >= 10 {
        v /= 10;
        width += 1;
    }
    width
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum FrameKind {
    Global,
    Entry,
    Object,
}

struct Frame {
    kind: FrameKind,
    /// Offset of the last entry emplaced into this scope, 0 if none yet.
    last: u32,
}

struct Parser<'a> {
    text: &'a [u8],
    pos: usize,
    line: usize,
    line_start: usize,

    entries: Vec<Entry<'a>>,
    first_loadable: u32,
    last_loadable: u32,
    frames: Vec<Frame>,
}

pub(crate) fn parse(text: &str) -> Result<Config<'_>, ParseError> {
    let mut frames = Vec::new();
    frames.push(Frame {
        kind: FrameKind::Global,
        last: 0,
    });

    let mut parser = Parser {
        text: text.as_bytes(),
        pos: 0,
        line: 1,
        line_start: 0,
        entries: Vec::new(),
        first_loadable: 0,
        last_loadable: 0,
        frames,
    };
    parser.run(text)
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_graphic() && !matches!(b, b'=' | b'#' | b'[' | b']' | b'{' | b'}' | b'"')
}

impl<'a> Parser<'a> {
    fn run(mut self, text: &'a str) -> Result<Config<'a>, ParseError> {
        loop {
            self.skip_blank();
            let Some(b) = self.peek() else { break };

            if b == b'[' {
                self.parse_entry_header(text)?;
            } else if b == b'}' {
                self.close_object()?;
            } else if is_word_byte(b) {
                self.parse_key_value(text)?;
            } else {
                return Err(self.error("invalid character"));
            }
        }

        match self.top().kind {
            FrameKind::Object => Err(self.error("unexpected end of file inside an object")),
            FrameKind::Entry if self.top().last == 0 => {
                Err(self.error("empty loadable entries are not allowed"))
            }
            _ => Ok(Config {
                entries: self.entries,
                first_loadable: self.first_loadable,
                last_loadable: self.last_loadable,
            }),
        }
    }

    // -- Scanning primitives.

    fn peek(&self) -> Option<u8> {
        self.text.get(self.pos).copied()
    }

    fn bump(&mut self) {
        if self.text[self.pos] == b'\n' {
            self.line += 1;
            self.line_start = self.pos + 1;
        }
        self.pos += 1;
    }

    fn error(&self, message: &'static str) -> ParseError {
        ParseError {
            message,
            line: self.line,
            column: self.pos - self.line_start + 1,
            offset: self.pos,
        }
    }

    /// Skip whitespace, newlines and comments between items.
    fn skip_blank(&mut self) {
        while let Some(b) = self.peek() {
            match b {
                b' ' | b'\t' | b'\r' | b'\n' => self.bump(),
                b'#' => self.skip_comment(),
                _ => break,
            }
        }
    }

    fn skip_comment(&mut self) {
        while let Some(b) = self.peek() {
            if b == b'\n' {
                break;
            }
            self.bump();
        }
    }

    fn skip_inline_ws(&mut self) {
        while let Some(b) = self.peek() {
            if b == b' ' || b == b'\t' {
                self.bump();
            } else {
                break;
            }
        }
    }

    fn take_word(&mut self, text: &'a str) -> &'a str {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if is_word_byte(b) {
                self.bump();
            } else {
                break;
            }
        }
        &text[start..self.pos]
    }

    /// After a top-level value or header only whitespace and comments may
    /// follow on the same line.
    fn require_end_of_line(&mut self) -> Result<(), ParseError> {
        self.skip_inline_ws();
        match self.peek() {
            None => Ok(()),
            Some(b'\n') => {
                self.bump();
                Ok(())
            }
            Some(b'\r') => {
                self.bump();
                Ok(())
            }
            Some(b'#') => {
                self.skip_comment();
                Ok(())
            }
            Some(_) => Err(self.error("unexpected character after value")),
        }
    }

    // -- Store plumbing.

    fn top(&self) -> &Frame {
        self.frames.last().expect("scope stack is never empty")
    }

    fn in_object(&self) -> bool {
        self.top().kind == FrameKind::Object
    }

    fn emplace(&mut self, key: &'a str, payload: Payload<'a>) -> u32 {
        let off = self.entries.len() as u32 + 1;

        let frame = self.frames.last_mut().expect("scope stack is never empty");
        if frame.last != 0 {
            self.entries[frame.last as usize - 1].next_in_scope = off;
        }
        frame.last = off;

        self.entries.push(Entry {
            key,
            payload,
            next_in_scope: 0,
        });
        off
    }

    // -- Grammar productions.

    fn parse_entry_header(&mut self, text: &'a str) -> Result<(), ParseError> {
        if self.in_object() {
            return Err(self.error("loadable entries may only appear at top level"));
        }
        if self.pos != self.line_start {
            return Err(self.error("loadable entry title must start on a new line"));
        }

        self.bump(); // '['
        let name = self.take_word(text);
        if name.is_empty() {
            return Err(self.error("empty loadable entry title"));
        }
        if self.peek() != Some(b']') {
            return Err(self.error("expected ']' after loadable entry title"));
        }
        self.bump(); // ']'

        // A new header implicitly terminates the previous entry.
        if self.top().kind == FrameKind::Entry {
            if self.top().last == 0 {
                return Err(self.error("empty loadable entries are not allowed"));
            }
            self.frames.pop();
        }

        let off = self.emplace(name, Payload::Loadable { next_loadable: 0 });

        if self.first_loadable == 0 {
            self.first_loadable = off;
        }
        if self.last_loadable != 0 {
            match &mut self.entries[self.last_loadable as usize - 1].payload {
                Payload::Loadable { next_loadable } => *next_loadable = off,
                Payload::Value(_) => unreachable!("loadable chain links a value"),
            }
        }
        self.last_loadable = off;

        self.frames.push(Frame {
            kind: FrameKind::Entry,
            last: 0,
        });

        self.require_end_of_line()
    }

    fn close_object(&mut self) -> Result<(), ParseError> {
        if !self.in_object() {
            return Err(self.error("unexpected '}'"));
        }
        if self.top().last == 0 {
            return Err(self.error("empty objects are not allowed"));
        }

        self.bump(); // '}'
        self.frames.pop();

        if self.in_object() {
            return Ok(());
        }
        self.require_end_of_line()
    }

    fn parse_key_value(&mut self, text: &'a str) -> Result<(), ParseError> {
        let key = self.take_word(text);

        self.skip_inline_ws();
        if self.peek() != Some(b'=') {
            return Err(self.error("expected '=' after key"));
        }
        self.bump();
        self.skip_inline_ws();

        let Some(b) = self.peek() else {
            return Err(self.error("expected a value"));
        };

        match b {
            b'{' => {
                self.bump();
                self.emplace(key, Payload::Value(RawValue::Object));
                self.frames.push(Frame {
                    kind: FrameKind::Object,
                    last: 0,
                });
                // Children are consumed by the main loop until '}'.
                Ok(())
            }
            b'"' => {
                let value = self.parse_string(text)?;
                self.emplace(key, Payload::Value(value));
                self.finish_value()
            }
            _ if is_word_byte(b) => {
                let value = self.parse_bare_value(text)?;
                self.emplace(key, Payload::Value(value));
                self.finish_value()
            }
            _ => Err(self.error("expected a value")),
        }
    }

    fn finish_value(&mut self) -> Result<(), ParseError> {
        if self.in_object() {
            // Further pairs may share the line inside braces.
            return Ok(());
        }
        self.require_end_of_line()
    }

    fn parse_string(&mut self, text: &'a str) -> Result<RawValue<'a>, ParseError> {
        self.bump(); // opening quote
        let start = self.pos;

        loop {
            match self.peek() {
                None => return Err(self.error("unterminated string")),
                Some(b'\n') => return Err(self.error("unterminated string")),
                Some(b'"') => break,
                Some(_) => self.bump(),
            }
        }

        let value = &text[start..self.pos];
        self.bump(); // closing quote
        Ok(RawValue::String(value))
    }

    fn parse_bare_value(&mut self, text: &'a str) -> Result<RawValue<'a>, ParseError> {
        let start_column = self.pos - self.line_start + 1;
        let start_offset = self.pos;
        let word = self.take_word(text);

        let number_error = |message| ParseError {
            message,
            line: self.line,
            column: start_column,
            offset: start_offset,
        };

        match word {
            "true" => return Ok(RawValue::Boolean(true)),
            "false" => return Ok(RawValue::Boolean(false)),
            "null" => return Ok(RawValue::None),
            _ => {}
        }

        if let Some(hex) = word.strip_prefix("0x").or_else(|| word.strip_prefix("0X")) {
            return u64::from_str_radix(hex, 16)
                .map(RawValue::Unsigned)
                .map_err(|_| number_error("invalid hex constant"));
        }

        let first = word.as_bytes()[0];
        if first == b'-' {
            return word
                .parse::<i64>()
                .map(RawValue::Signed)
                .map_err(|_| number_error("invalid integer constant"));
        }
        if first == b'+' || first.is_ascii_digit() {
            let digits = word.strip_prefix('+').unwrap_or(word);
            return digits
                .parse::<u64>()
                .map(RawValue::Unsigned)
                .map_err(|_| number_error("invalid integer constant"));
        }

        Err(number_error("invalid value"))
    }
}
