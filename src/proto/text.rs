//! Protobuf text format (prototxt)
//!
//! Caffe network definitions are `NetParameter` messages in protobuf text
//! format. Rather than binding every Caffe layer parameter, the definition is
//! parsed into a schema-less [`TextMessage`] tree. Scalars keep their source
//! text, so a definition that is read and written back without changes keeps
//! every value exactly as written.

use std::fmt;
use std::str::FromStr;

use crate::error::{CaffeResult, TransformError};

/// A field value
#[derive(Debug, Clone, PartialEq)]
pub enum TextValue {
    /// Quoted string (unescaped content)
    Str(String),
    /// Unquoted scalar: number, enum, or boolean, as written
    Raw(String),
    /// Nested message
    Message(TextMessage),
}

impl TextValue {
    /// String content of a quoted scalar
    pub fn as_str(&self) -> Option<&str> {
        match self {
            TextValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Source text of an unquoted scalar
    pub fn as_raw(&self) -> Option<&str> {
        match self {
            TextValue::Raw(s) => Some(s),
            _ => None,
        }
    }

    /// Nested message
    pub fn as_message(&self) -> Option<&TextMessage> {
        match self {
            TextValue::Message(m) => Some(m),
            _ => None,
        }
    }
}

/// An ordered list of `(field name, value)` pairs
///
/// Repeated fields appear as several entries with the same name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TextMessage {
    fields: Vec<(String, TextValue)>,
}

impl TextMessage {
    /// Create an empty message
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of field entries
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Check if the message has no fields
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate over fields in order
    pub fn fields(&self) -> impl Iterator<Item = (&str, &TextValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// First value of a field
    pub fn get(&self, name: &str) -> Option<&TextValue> {
        self.fields.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    /// All values of a (repeated) field
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a TextValue> + 'a {
        self.fields
            .iter()
            .filter(move |(k, _)| k == name)
            .map(|(_, v)| v)
    }

    /// First string value of a field
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(TextValue::as_str)
    }

    /// All string values of a repeated field
    pub fn get_strs(&self, name: &str) -> Vec<String> {
        self.get_all(name)
            .filter_map(TextValue::as_str)
            .map(str::to_string)
            .collect()
    }

    /// First nested message of a field
    pub fn get_message(&self, name: &str) -> Option<&TextMessage> {
        self.get(name).and_then(TextValue::as_message)
    }

    /// First unquoted scalar parsed as `T`
    pub fn get_parsed<T: FromStr>(&self, name: &str) -> Option<T> {
        self.get(name)
            .and_then(TextValue::as_raw)
            .and_then(|s| s.parse().ok())
    }

    /// All unquoted scalars of a repeated field parsed as `T`
    pub fn get_parsed_all<T: FromStr>(&self, name: &str) -> Vec<T> {
        self.get_all(name)
            .filter_map(TextValue::as_raw)
            .filter_map(|s| s.parse().ok())
            .collect()
    }

    /// Boolean scalar (`true`/`false`, `True`/`False`, `t`/`f`, `1`/`0`)
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.get(name).and_then(TextValue::as_raw)? {
            "true" | "True" | "t" | "1" => Some(true),
            "false" | "False" | "f" | "0" => Some(false),
            _ => None,
        }
    }

    /// Append a field entry
    pub fn push(&mut self, name: &str, value: TextValue) {
        self.fields.push((name.to_string(), value));
    }

    /// Replace the first entry of a field, or append it
    pub fn set(&mut self, name: &str, value: TextValue) {
        match self.fields.iter_mut().find(|(k, _)| k == name) {
            Some(entry) => entry.1 = value,
            None => self.push(name, value),
        }
    }

    /// Remove every entry of a field, returning the removed values
    pub fn remove_all(&mut self, name: &str) -> Vec<TextValue> {
        let mut removed = Vec::new();
        self.fields.retain(|(k, v)| {
            if k == name {
                removed.push(v.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Mutable access to the first nested message of a field, inserting an
    /// empty one if the field is absent
    pub fn message_or_insert(&mut self, name: &str) -> &mut TextMessage {
        let pos = match self
            .fields
            .iter()
            .position(|(k, v)| k == name && matches!(v, TextValue::Message(_)))
        {
            Some(pos) => pos,
            None => {
                self.push(name, TextValue::Message(TextMessage::new()));
                self.fields.len() - 1
            }
        };

        match &mut self.fields[pos].1 {
            TextValue::Message(m) => m,
            _ => unreachable!("position filtered on message values"),
        }
    }
}

impl fmt::Display for TextMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_message(f, self, 0)
    }
}

fn write_message(f: &mut fmt::Formatter<'_>, msg: &TextMessage, depth: usize) -> fmt::Result {
    let indent = "  ".repeat(depth);
    for (name, value) in &msg.fields {
        match value {
            TextValue::Str(s) => writeln!(f, "{}{}: \"{}\"", indent, name, escape(s))?,
            TextValue::Raw(s) => writeln!(f, "{}{}: {}", indent, name, s)?,
            TextValue::Message(m) => {
                writeln!(f, "{}{} {{", indent, name)?;
                write_message(f, m, depth + 1)?;
                writeln!(f, "{}}}", indent)?;
            }
        }
    }
    Ok(())
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let mut buf = [0u8; 4];
                for b in c.encode_utf8(&mut buf).bytes() {
                    out.push_str(&format!("\\{:03o}", b));
                }
            }
            c => out.push(c),
        }
    }
    out
}

/// Parse a prototxt document into its root message
pub fn parse(text: &str) -> CaffeResult<TextMessage> {
    let tokens = Lexer::new(text).tokenize()?;
    let mut parser = Parser { tokens, pos: 0 };
    parser.parse_fields(None)
}

// ============================================================================
// Lexer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Word(String),
    Str(String),
    Punct(char),
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    line: usize,
    column: usize,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    column: usize,
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '+')
}

impl<'a> Lexer<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            chars: text.chars().peekable(),
            line: 1,
            column: 1,
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn error(&self, message: impl Into<String>) -> TransformError {
        TransformError::TextFormat {
            line: self.line,
            column: self.column,
            message: message.into(),
        }
    }

    fn tokenize(mut self) -> CaffeResult<Vec<Token>> {
        let mut tokens = Vec::new();

        while let Some(&c) = self.chars.peek() {
            let (line, column) = (self.line, self.column);

            if c.is_whitespace() {
                self.bump();
            } else if c == '#' {
                while let Some(c) = self.bump() {
                    if c == '\n' {
                        break;
                    }
                }
            } else if c == '"' || c == '\'' {
                let s = self.lex_string()?;
                tokens.push(Token {
                    tok: Tok::Str(s),
                    line,
                    column,
                });
            } else if is_word_char(c) {
                let mut word = String::new();
                while let Some(&c) = self.chars.peek() {
                    if !is_word_char(c) {
                        break;
                    }
                    word.push(c);
                    self.bump();
                }
                tokens.push(Token {
                    tok: Tok::Word(word),
                    line,
                    column,
                });
            } else if matches!(c, '{' | '}' | '<' | '>' | ':' | '[' | ']' | ',' | ';') {
                self.bump();
                tokens.push(Token {
                    tok: Tok::Punct(c),
                    line,
                    column,
                });
            } else {
                return Err(self.error(format!("unexpected character '{}'", c)));
            }
        }

        Ok(tokens)
    }

    fn lex_string(&mut self) -> CaffeResult<String> {
        let quote = self.bump().unwrap_or('"');
        let mut bytes: Vec<u8> = Vec::new();

        loop {
            let c = self
                .bump()
                .ok_or_else(|| self.error("unterminated string"))?;

            if c == quote {
                break;
            }
            if c == '\n' {
                return Err(self.error("newline in string"));
            }
            if c != '\\' {
                let mut buf = [0u8; 4];
                bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                continue;
            }

            let esc = self
                .bump()
                .ok_or_else(|| self.error("unterminated escape"))?;
            match esc {
                'n' => bytes.push(b'\n'),
                'r' => bytes.push(b'\r'),
                't' => bytes.push(b'\t'),
                'a' => bytes.push(0x07),
                'b' => bytes.push(0x08),
                'f' => bytes.push(0x0c),
                'v' => bytes.push(0x0b),
                '\\' | '\'' | '"' | '?' => bytes.push(esc as u8),
                'x' => {
                    let mut value = 0u32;
                    let mut digits = 0;
                    while digits < 2 {
                        match self.chars.peek().and_then(|c| c.to_digit(16)) {
                            Some(d) => {
                                value = value * 16 + d;
                                digits += 1;
                                self.bump();
                            }
                            None => break,
                        }
                    }
                    if digits == 0 {
                        return Err(self.error("invalid hex escape"));
                    }
                    bytes.push(value as u8);
                }
                '0'..='7' => {
                    let mut value = esc.to_digit(8).unwrap_or(0);
                    for _ in 0..2 {
                        match self.chars.peek().and_then(|c| c.to_digit(8)) {
                            Some(d) => {
                                value = value * 8 + d;
                                self.bump();
                            }
                            None => break,
                        }
                    }
                    bytes.push(value as u8);
                }
                other => return Err(self.error(format!("invalid escape '\\{}'", other))),
            }
        }

        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

// ============================================================================
// Parser
// ============================================================================

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|t| &t.tok)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn error(&self, message: impl Into<String>) -> TransformError {
        let (line, column) = match self.tokens.get(self.pos).or(self.tokens.last()) {
            Some(t) => (t.line, t.column),
            None => (1, 1),
        };
        TransformError::TextFormat {
            line,
            column,
            message: message.into(),
        }
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(&Tok::Punct(c)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Parse fields until `close` (or end of input at the root)
    fn parse_fields(&mut self, close: Option<char>) -> CaffeResult<TextMessage> {
        let mut msg = TextMessage::new();

        loop {
            match (self.peek(), close) {
                (None, None) => return Ok(msg),
                (None, Some(c)) => return Err(self.error(format!("expected '{}'", c))),
                (Some(Tok::Punct(p)), Some(c)) if *p == c => {
                    self.pos += 1;
                    return Ok(msg);
                }
                _ => {}
            }

            let name = match self.next() {
                Some(Token {
                    tok: Tok::Word(w), ..
                }) => w,
                _ => {
                    self.pos = self.pos.saturating_sub(1);
                    return Err(self.error("expected field name"));
                }
            };

            self.parse_field_value(&mut msg, &name)?;

            // Optional separators
            if !self.eat(',') {
                self.eat(';');
            }
        }
    }

    fn parse_field_value(&mut self, msg: &mut TextMessage, name: &str) -> CaffeResult<()> {
        let has_colon = self.eat(':');

        if let Some(close) = self.open_message() {
            let nested = self.parse_fields(Some(close))?;
            msg.push(name, TextValue::Message(nested));
            return Ok(());
        }

        if !has_colon {
            return Err(self.error(format!("expected ':' or '{{' after '{}'", name)));
        }

        if self.eat('[') {
            if self.eat(']') {
                return Ok(());
            }
            loop {
                let value = match self.open_message() {
                    Some(close) => TextValue::Message(self.parse_fields(Some(close))?),
                    None => self.parse_scalar()?,
                };
                msg.push(name, value);
                if self.eat(']') {
                    return Ok(());
                }
                if !self.eat(',') {
                    return Err(self.error("expected ',' or ']'"));
                }
            }
        }

        let value = self.parse_scalar()?;
        msg.push(name, value);
        Ok(())
    }

    fn open_message(&mut self) -> Option<char> {
        if self.eat('{') {
            Some('}')
        } else if self.eat('<') {
            Some('>')
        } else {
            None
        }
    }

    fn parse_scalar(&mut self) -> CaffeResult<TextValue> {
        match self.next().map(|t| t.tok) {
            Some(Tok::Word(w)) => Ok(TextValue::Raw(w)),
            Some(Tok::Str(s)) => {
                // Adjacent string literals concatenate
                let mut s = s;
                while let Some(Tok::Str(_)) = self.peek() {
                    if let Some(Tok::Str(more)) = self.next().map(|t| t.tok) {
                        s.push_str(&more);
                    }
                }
                Ok(TextValue::Str(s))
            }
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.error("expected value"))
            }
        }
    }
}
