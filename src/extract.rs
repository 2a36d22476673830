//! Resource extraction from Terraform-style configuration files.
//!
//! This is pattern extraction over the block/attribute structure, not an
//! expression evaluator. Literal values (strings, numbers, booleans, lists,
//! objects, heredocs, nested blocks) are captured as typed [`AttrValue`]s.
//! Anything that would need evaluation (interpolated strings, references,
//! function calls, operators, `for` expressions) is kept verbatim as
//! [`AttrValue::Reference`]. Callers must treat references as opaque.
//!
//! A file that cannot be tokenized (unbalanced braces, unterminated strings or
//! heredocs, invalid UTF-8) yields diagnostics and no resources.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::error::ParseDiagnostic;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scalar {
    Null,
    Bool(bool),
    /// Kept as written so values compare and hash exactly.
    Number(String),
    Text(String),
}

/// A tagged attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrValue {
    Scalar(Scalar),
    List(Vec<AttrValue>),
    Map(BTreeMap<String, AttrValue>),
    /// Unevaluated expression source.
    Reference(String),
}

impl AttrValue {
    pub fn text(s: impl Into<String>) -> Self {
        AttrValue::Scalar(Scalar::Text(s.into()))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttrValue::Scalar(Scalar::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Scalar(Scalar::Bool(b)) => Some(*b),
            AttrValue::Scalar(Scalar::Text(s)) => match s.as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Whether the value switches a setting on. `false`, `null`, empty
    /// strings and empty collections do not; references are assumed to.
    pub fn is_enabled(&self) -> bool {
        match self {
            AttrValue::Scalar(Scalar::Null) => false,
            AttrValue::Scalar(Scalar::Bool(b)) => *b,
            AttrValue::Scalar(Scalar::Number(n)) => {
                n.parse::<f64>().map(|v| v != 0.0).unwrap_or(true)
            }
            AttrValue::Scalar(Scalar::Text(s)) => !s.is_empty() && s != "false",
            AttrValue::List(items) => !items.is_empty(),
            AttrValue::Map(map) => map
                .get("enabled")
                .map(|v| v.is_enabled())
                .unwrap_or(!map.is_empty()),
            AttrValue::Reference(_) => true,
        }
    }

    /// Compares against a user-supplied string. Lists match when any element
    /// does; maps never match a bare value.
    pub fn matches_str(&self, wanted: &str) -> bool {
        match self {
            AttrValue::Scalar(Scalar::Null) => wanted == "null",
            AttrValue::Scalar(Scalar::Bool(b)) => {
                wanted.eq_ignore_ascii_case(if *b { "true" } else { "false" })
            }
            AttrValue::Scalar(Scalar::Number(n)) => {
                n == wanted
                    || matches!((n.parse::<f64>(), wanted.parse::<f64>()), (Ok(a), Ok(b)) if a == b)
            }
            AttrValue::Scalar(Scalar::Text(s)) => s == wanted,
            AttrValue::List(items) => items.iter().any(|v| v.matches_str(wanted)),
            AttrValue::Map(_) => false,
            AttrValue::Reference(raw) => raw == wanted,
        }
    }

    /// Flat textual form used by reports and substring heuristics.
    pub fn render(&self) -> String {
        match self {
            AttrValue::Scalar(Scalar::Null) => "null".to_string(),
            AttrValue::Scalar(Scalar::Bool(b)) => b.to_string(),
            AttrValue::Scalar(Scalar::Number(n)) => n.clone(),
            AttrValue::Scalar(Scalar::Text(s)) => s.clone(),
            AttrValue::List(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.render()).collect();
                format!("[{}]", parts.join(", "))
            }
            AttrValue::Map(map) => {
                let parts: Vec<String> = map
                    .iter()
                    .map(|(k, v)| format!("{k} = {}", v.render()))
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            AttrValue::Reference(raw) => raw.clone(),
        }
    }
}

/// A resource declaration before annotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedResource {
    pub resource_type: String,
    pub name: String,
    pub line_start: usize,
    pub line_end: usize,
    pub attributes: BTreeMap<String, AttrValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub resources: Vec<ExtractedResource>,
    pub diagnostics: Vec<ParseDiagnostic>,
}

pub fn extract(bytes: &[u8]) -> Extraction {
    let src = match std::str::from_utf8(bytes) {
        Ok(s) => s,
        Err(e) => {
            return Extraction {
                resources: Vec::new(),
                diagnostics: vec![ParseDiagnostic::new(
                    None,
                    format!("file is not valid UTF-8: {e}"),
                )],
            };
        }
    };
    let src = src.strip_prefix('\u{feff}').unwrap_or(src);

    let mut parser = Parser::new(src);
    let items = match parser.parse_body(false) {
        Ok(items) => items,
        Err(diag) => {
            return Extraction {
                resources: Vec::new(),
                diagnostics: vec![diag],
            };
        }
    };

    let mut out = Extraction::default();
    let mut seen: HashSet<(String, String)> = HashSet::new();

    for item in items {
        let Item::Block(block) = item else { continue };
        if block.kind != "resource" {
            continue;
        }
        if block.labels.len() != 2 {
            out.diagnostics.push(ParseDiagnostic::new(
                Some(block.line_start),
                format!(
                    "resource block needs a type and a name label, found {}",
                    block.labels.len()
                ),
            ));
            continue;
        }
        let mut labels = block.labels.into_iter();
        let resource_type = labels.next().unwrap_or_default();
        let name = labels.next().unwrap_or_default();
        if !seen.insert((resource_type.clone(), name.clone())) {
            out.diagnostics.push(ParseDiagnostic::new(
                Some(block.line_start),
                format!("duplicate resource {resource_type}.{name}"),
            ));
            continue;
        }
        out.resources.push(ExtractedResource {
            resource_type,
            name,
            line_start: block.line_start,
            line_end: block.line_end,
            attributes: body_to_map(block.body),
        });
    }

    out
}

#[derive(Debug)]
enum Item {
    Attribute(String, AttrValue),
    Block(Block),
}

#[derive(Debug)]
struct Block {
    kind: String,
    labels: Vec<String>,
    body: Vec<Item>,
    line_start: usize,
    line_end: usize,
}

/// Nested blocks become maps keyed by block type. Labeled blocks nest one
/// level per label, and repeated blocks of one type collect into a list.
fn body_to_map(items: Vec<Item>) -> BTreeMap<String, AttrValue> {
    let mut map = BTreeMap::new();
    let mut from_blocks: HashSet<String> = HashSet::new();

    for item in items {
        match item {
            Item::Attribute(key, value) => {
                from_blocks.remove(&key);
                map.insert(key, value);
            }
            Item::Block(block) => {
                let mut value = AttrValue::Map(body_to_map(block.body));
                for label in block.labels.into_iter().rev() {
                    value = AttrValue::Map(BTreeMap::from([(label, value)]));
                }
                let key = block.kind;
                let merged = match map.remove(&key) {
                    Some(AttrValue::List(mut items)) if from_blocks.contains(&key) => {
                        items.push(value);
                        AttrValue::List(items)
                    }
                    Some(existing) if from_blocks.contains(&key) => {
                        AttrValue::List(vec![existing, value])
                    }
                    _ => value,
                };
                from_blocks.insert(key.clone());
                map.insert(key, merged);
            }
        }
    }

    map
}

type ParseResult<T> = Result<T, ParseDiagnostic>;

struct Parser<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    line_starts: Vec<usize>,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(
            src.bytes()
                .enumerate()
                .filter(|(_, b)| *b == b'\n')
                .map(|(i, _)| i + 1),
        );
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
            line_starts,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn line_at(&self, pos: usize) -> usize {
        match self.line_starts.binary_search(&pos) {
            Ok(i) => i + 1,
            Err(i) => i,
        }
    }

    fn error_at(&self, pos: usize, message: impl Into<String>) -> ParseDiagnostic {
        ParseDiagnostic::new(Some(self.line_at(pos)), message)
    }

    fn error(&self, message: impl Into<String>) -> ParseDiagnostic {
        self.error_at(self.pos, message)
    }

    fn current_char(&self) -> char {
        self.src[self.pos..].chars().next().unwrap_or('\0')
    }

    fn skip_inline(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r')) {
            self.pos += 1;
        }
    }

    /// Whitespace, newlines and comments.
    fn skip_trivia(&mut self) -> ParseResult<()> {
        loop {
            match self.peek() {
                Some(b' ' | b'\t' | b'\r' | b'\n') => self.pos += 1,
                Some(b'#') => self.skip_line(),
                Some(b'/') if self.peek_at(1) == Some(b'/') => self.skip_line(),
                Some(b'/') if self.peek_at(1) == Some(b'*') => {
                    let start = self.pos;
                    match self.src[self.pos + 2..].find("*/") {
                        Some(off) => self.pos += 2 + off + 2,
                        None => return Err(self.error_at(start, "unterminated block comment")),
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn skip_line(&mut self) {
        while let Some(b) = self.peek() {
            if b == b'\n' {
                break;
            }
            self.pos += 1;
        }
    }

    fn parse_body(&mut self, nested: bool) -> ParseResult<Vec<Item>> {
        let open = self.pos.saturating_sub(1);
        let mut items = Vec::new();
        loop {
            self.skip_trivia()?;
            match self.peek() {
                None if nested => {
                    return Err(self.error_at(open, "unbalanced braces: block is never closed"));
                }
                None => return Ok(items),
                Some(b'}') if nested => {
                    self.pos += 1;
                    return Ok(items);
                }
                Some(b'}') => return Err(self.error("unbalanced braces: unexpected '}'")),
                Some(c) if is_ident_start(c) => items.push(self.parse_item()?),
                Some(_) => {
                    let found = self.current_char();
                    return Err(self.error(format!("unexpected character '{found}'")));
                }
            }
        }
    }

    fn parse_item(&mut self) -> ParseResult<Item> {
        let start = self.pos;
        let key = self.ident();
        self.skip_inline();

        if self.peek() == Some(b'=') && self.peek_at(1) != Some(b'=') {
            self.pos += 1;
            let value = self.parse_expr()?;
            self.expect_item_end()?;
            return Ok(Item::Attribute(key, value));
        }

        let mut labels = Vec::new();
        loop {
            self.skip_inline();
            match self.peek() {
                Some(b'"') => {
                    let (text, interpolated) = self.string_literal()?;
                    if interpolated {
                        return Err(self.error("block labels cannot be interpolated"));
                    }
                    labels.push(text);
                }
                Some(c) if is_ident_start(c) => labels.push(self.ident()),
                Some(b'{') => break,
                _ => return Err(self.error(format!("expected '=' or '{{' after '{key}'"))),
            }
        }

        self.pos += 1;
        let body = self.parse_body(true)?;
        Ok(Item::Block(Block {
            kind: key,
            labels,
            body,
            line_start: self.line_at(start),
            line_end: self.line_at(self.pos.saturating_sub(1)),
        }))
    }

    fn expect_item_end(&mut self) -> ParseResult<()> {
        self.skip_inline();
        match self.peek() {
            None | Some(b'\n' | b'}' | b'#') => Ok(()),
            Some(b'/') if matches!(self.peek_at(1), Some(b'/' | b'*')) => Ok(()),
            Some(_) => {
                let found = self.current_char();
                Err(self.error(format!("unexpected '{found}' after attribute value")))
            }
        }
    }

    fn ident(&mut self) -> String {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' {
                self.pos += 1;
            } else {
                break;
            }
        }
        self.src[start..self.pos].to_string()
    }

    /// One attribute value. The expression's extent is found first; if a
    /// literal parse does not cover all of it, the source text is kept as a
    /// reference.
    fn parse_expr(&mut self) -> ParseResult<AttrValue> {
        self.skip_inline();
        let start = self.pos;
        let end = self.expr_end(start)?;
        let raw = self.src[start..end].trim();
        if raw.is_empty() {
            return Err(self.error("missing value"));
        }

        let literal = self.parse_literal().ok().flatten();
        let covered = self.pos <= end && self.src[self.pos..end].trim().is_empty();
        let value = match literal {
            Some(v) if covered => v,
            _ => AttrValue::Reference(raw.to_string()),
        };
        self.pos = end;
        Ok(value)
    }

    fn parse_literal(&mut self) -> ParseResult<Option<AttrValue>> {
        match self.peek() {
            Some(b'"') => {
                let (text, interpolated) = self.string_literal()?;
                Ok((!interpolated).then(|| AttrValue::text(text)))
            }
            Some(b'<') if self.heredoc_at(self.pos) => Ok(Some(AttrValue::text(self.heredoc()?))),
            Some(b'[') => self.list().map(Some),
            Some(b'{') => self.object().map(Some),
            Some(b'-' | b'0'..=b'9') => Ok(self.number()),
            Some(c) if is_ident_start(c) => Ok(match self.ident().as_str() {
                "true" => Some(AttrValue::Scalar(Scalar::Bool(true))),
                "false" => Some(AttrValue::Scalar(Scalar::Bool(false))),
                "null" => Some(AttrValue::Scalar(Scalar::Null)),
                _ => None,
            }),
            _ => Ok(None),
        }
    }

    fn list(&mut self) -> ParseResult<AttrValue> {
        self.pos += 1;
        let mut items = Vec::new();
        loop {
            self.skip_trivia()?;
            if self.peek() == Some(b']') {
                self.pos += 1;
                return Ok(AttrValue::List(items));
            }
            items.push(self.parse_expr()?);
            self.skip_trivia()?;
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b']') => {}
                _ => return Err(self.error("expected ',' or ']' in list")),
            }
        }
    }

    fn object(&mut self) -> ParseResult<AttrValue> {
        self.pos += 1;
        let mut map = BTreeMap::new();
        loop {
            self.skip_trivia()?;
            let key = match self.peek() {
                Some(b'}') => {
                    self.pos += 1;
                    return Ok(AttrValue::Map(map));
                }
                Some(b'"') => self.string_literal()?.0,
                Some(c) if is_ident_start(c) => self.ident(),
                _ => return Err(self.error("expected object key")),
            };
            self.skip_inline();
            match self.peek() {
                Some(b'=' | b':') => self.pos += 1,
                _ => {
                    return Err(self.error(format!("expected '=' or ':' after object key '{key}'")));
                }
            }
            let value = self.parse_expr()?;
            map.insert(key, value);
            self.skip_inline();
            if self.peek() == Some(b',') {
                self.pos += 1;
            }
        }
    }

    fn number(&mut self) -> Option<AttrValue> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        let digits_start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9' | b'.' | b'e' | b'E' | b'+')) {
            let previous = self.bytes.get(self.pos.wrapping_sub(1));
            let after_exponent = matches!(previous, Some(b'e' | b'E'));
            if self.peek() == Some(b'+') && !after_exponent {
                break;
            }
            self.pos += 1;
        }
        let text = &self.src[start..self.pos];
        if self.pos == digits_start || text.parse::<f64>().is_err() {
            return None;
        }
        Some(AttrValue::Scalar(Scalar::Number(text.to_string())))
    }

    /// Returns the unescaped text and whether it contains template sequences.
    fn string_literal(&mut self) -> ParseResult<(String, bool)> {
        let start = self.pos;
        let end = self.skip_string(start)?;
        let inner = &self.src[start + 1..end - 1];
        self.pos = end;

        let interpolated = inner.contains("${") || inner.contains("%{");
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c != '\\' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('r') => out.push('\r'),
                Some('"') => out.push('"'),
                Some('\\') => out.push('\\'),
                Some('u') => {
                    let hex: String = chars.by_ref().take(4).collect();
                    match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                        Some(ch) => out.push(ch),
                        None => {
                            out.push_str("\\u");
                            out.push_str(&hex);
                        }
                    }
                }
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        }
        Ok((out, interpolated))
    }

    /// `i` points at an opening quote; returns the index after the closing one.
    fn skip_string(&self, i: usize) -> ParseResult<usize> {
        let mut j = i + 1;
        while let Some(&b) = self.bytes.get(j) {
            match b {
                b'\\' => j += 2,
                b'"' => return Ok(j + 1),
                b'\n' => return Err(self.error_at(i, "unterminated string literal")),
                b'$' | b'%' if self.bytes.get(j + 1) == Some(&b'{') => {
                    j = self.skip_template(i, j + 2)?
                }
                _ => j += 1,
            }
        }
        Err(self.error_at(i, "unterminated string literal"))
    }

    fn skip_template(&self, string_start: usize, mut j: usize) -> ParseResult<usize> {
        let mut depth = 1usize;
        while let Some(&b) = self.bytes.get(j) {
            match b {
                b'"' => j = self.skip_string(j)?,
                b'{' => {
                    depth += 1;
                    j += 1;
                }
                b'}' => {
                    depth -= 1;
                    j += 1;
                    if depth == 0 {
                        return Ok(j);
                    }
                }
                _ => j += 1,
            }
        }
        Err(self.error_at(string_start, "unterminated template sequence"))
    }

    fn heredoc_at(&self, i: usize) -> bool {
        if self.bytes.get(i) != Some(&b'<') || self.bytes.get(i + 1) != Some(&b'<') {
            return false;
        }
        let mut k = i + 2;
        if self.bytes.get(k) == Some(&b'-') {
            k += 1;
        }
        self.bytes.get(k).is_some_and(|b| is_ident_start(*b))
    }

    fn heredoc(&mut self) -> ParseResult<String> {
        let start = self.pos;
        self.pos += 2;
        let indented = self.peek() == Some(b'-');
        if indented {
            self.pos += 1;
        }
        let marker = self.ident();
        self.skip_inline();
        if self.peek() != Some(b'\n') {
            return Err(self.error("heredoc marker must end its line"));
        }
        self.pos += 1;

        let mut lines = Vec::new();
        loop {
            if self.pos >= self.bytes.len() {
                return Err(self.error_at(start, format!("unterminated heredoc '{marker}'")));
            }
            let line_end = self.src[self.pos..]
                .find('\n')
                .map(|o| self.pos + o)
                .unwrap_or(self.bytes.len());
            let line = self.src[self.pos..line_end].trim_end_matches('\r');
            if line.trim() == marker {
                self.pos = line_end;
                break;
            }
            lines.push(line);
            self.pos = (line_end + 1).min(self.bytes.len());
        }

        if indented {
            let indent = lines
                .iter()
                .filter(|l| !l.trim().is_empty())
                .map(|l| l.len() - l.trim_start().len())
                .min()
                .unwrap_or(0);
            let stripped: Vec<&str> = lines.iter().map(|l| l.get(indent..).unwrap_or("")).collect();
            return Ok(join_lines(&stripped));
        }
        Ok(join_lines(&lines))
    }

    /// End of the expression starting at `start`: the first newline, comma,
    /// comment or unmatched closer outside any bracket, string or heredoc.
    fn expr_end(&mut self, start: usize) -> ParseResult<usize> {
        let mut depth = 0usize;
        let mut i = start;
        while let Some(&b) = self.bytes.get(i) {
            match b {
                b'"' => i = self.skip_string(i)?,
                b'<' if self.heredoc_at(i) => {
                    let saved = self.pos;
                    self.pos = i;
                    let result = self.heredoc();
                    i = self.pos;
                    self.pos = saved;
                    result?;
                }
                b'(' | b'[' | b'{' => {
                    depth += 1;
                    i += 1;
                }
                b')' | b']' | b'}' => {
                    if depth == 0 {
                        return Ok(i);
                    }
                    depth -= 1;
                    i += 1;
                }
                b'\n' | b',' if depth == 0 => return Ok(i),
                b'#' => {
                    if depth == 0 {
                        return Ok(i);
                    }
                    i = self.src[i..].find('\n').map(|o| i + o).unwrap_or(self.bytes.len());
                }
                b'/' if self.bytes.get(i + 1) == Some(&b'/') => {
                    if depth == 0 {
                        return Ok(i);
                    }
                    i = self.src[i..].find('\n').map(|o| i + o).unwrap_or(self.bytes.len());
                }
                b'/' if self.bytes.get(i + 1) == Some(&b'*') => {
                    if depth == 0 {
                        return Ok(i);
                    }
                    match self.src[i + 2..].find("*/") {
                        Some(off) => i += 2 + off + 2,
                        None => return Err(self.error_at(i, "unterminated block comment")),
                    }
                }
                _ => i += 1,
            }
        }
        if depth > 0 {
            return Err(self.error_at(start, "unbalanced brackets in expression"));
        }
        Ok(self.bytes.len())
    }
}

fn join_lines(lines: &[&str]) -> String {
    let mut out = lines.join("\n");
    if !lines.is_empty() {
        out.push('\n');
    }
    out
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}
