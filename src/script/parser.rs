// KEEL, a systems foundation library.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// KEEL is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/script/parser.rs

// Reader for script source text. Turns bytes into heap objects one
// top-level expression at a time, tracking position for error reports.

// <>

use std::fmt;

use super::core::{Hndl, Obj, NIL};
use super::Ctx;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseErrorKind {
    UnexpectedEof,
    UnexpectedClose,
    /// Dot outside the second-to-last position of a list
    BadDot,
    BadEscape,
    BadNumber,
    /// Unknown `#` syntax
    BadSpecial,
    /// Lone `:` with no keyword name
    BadKeyword,
    UnterminatedString,
    UnterminatedComment,
    /// Lists or quote shorthands nested past [`MAX_NESTING`]
    TooDeep,
}

/// Deepest nesting of lists and quote shorthands the reader accepts
pub const MAX_NESTING: usize = 512;

/// Reader failure with the byte offset and line / column it occurred at
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub pos: usize,
    pub line: usize,
    pub col: usize,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.kind {
            ParseErrorKind::UnexpectedEof => "unexpected end of input",
            ParseErrorKind::UnexpectedClose => "unexpected ')'",
            ParseErrorKind::BadDot => "misplaced '.'",
            ParseErrorKind::BadEscape => "unknown string escape",
            ParseErrorKind::BadNumber => "malformed number",
            ParseErrorKind::BadSpecial => "unknown '#' syntax",
            ParseErrorKind::BadKeyword => "empty keyword",
            ParseErrorKind::UnterminatedString => "unterminated string",
            ParseErrorKind::UnterminatedComment => "unterminated block comment",
            ParseErrorKind::TooDeep => "nesting too deep",
        };
        write!(f, "parse error at {}:{}: {}", self.line, self.col, what)
    }
}

impl std::error::Error for ParseError {}

/// True for bytes that end an atom
fn delimiter_p(c: u8) -> bool {
    c.is_ascii_whitespace() || matches!(c, b'(' | b')' | b';' | b'"' | b'\'' | b'`' | b',')
}

/// Streaming reader over a source buffer
pub struct Reader<'a> {
    src: &'a [u8],
    pos: usize,
    line: usize,
    col: usize,
    depth: usize,
}

impl<'a> Reader<'a> {
    pub fn new(src: &'a [u8]) -> Self {
        Self {
            src,
            pos: 0,
            line: 1,
            col: 1,
            depth: 0,
        }
    }

    /// Byte offset of the next unread character
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Reads the next top-level expression; `None` at end of input
    pub fn read(&mut self, ctx: &mut Ctx) -> Result<Option<Hndl>, ParseError> {
        self.skip_atmosphere()?;
        if self.peek().is_none() {
            return Ok(None);
        }
        self.depth = 0;
        self.read_value(ctx).map(Some)
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, ahead: usize) -> Option<u8> {
        self.src.get(self.pos + ahead).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn err(&self, kind: ParseErrorKind) -> ParseError {
        ParseError {
            kind,
            pos: self.pos,
            line: self.line,
            col: self.col,
        }
    }

    /// Skips whitespace, line comments and block comments
    fn skip_atmosphere(&mut self) -> Result<(), ParseError> {
        while let Some(c) = self.peek() {
            match c {
                _ if c.is_ascii_whitespace() => {
                    self.bump();
                }
                b';' => {
                    while let Some(c) = self.bump() {
                        if c == b'\n' {
                            break;
                        }
                    }
                }
                b'#' if self.peek_at(1) == Some(b'|') => {
                    let start = self.err(ParseErrorKind::UnterminatedComment);
                    self.bump();
                    self.bump();
                    loop {
                        match self.bump() {
                            Some(b'|') if self.peek() == Some(b'#') => {
                                self.bump();
                                break;
                            }
                            Some(_) => (),
                            None => return Err(start),
                        }
                    }
                }
                _ => break,
            }
        }
        Ok(())
    }

    fn read_value(&mut self, ctx: &mut Ctx) -> Result<Hndl, ParseError> {
        if self.depth >= MAX_NESTING {
            return Err(self.err(ParseErrorKind::TooDeep));
        }

        self.depth += 1;
        let out = self.read_datum(ctx);
        self.depth -= 1;
        out
    }

    /// Returns a value parsed from the input; the reader is almost
    /// always chosen by the first character
    fn read_datum(&mut self, ctx: &mut Ctx) -> Result<Hndl, ParseError> {
        self.skip_atmosphere()?;

        let c = self.peek().ok_or(self.err(ParseErrorKind::UnexpectedEof))?;

        match c {
            b'(' => {
                self.bump();
                self.read_list(ctx)
            }
            b')' => Err(self.err(ParseErrorKind::UnexpectedClose)),
            b'\'' => {
                self.bump();
                self.read_wrapped(ctx, "quote")
            }
            b'`' => {
                self.bump();
                self.read_wrapped(ctx, "quasiquote")
            }
            b',' => {
                self.bump();
                if self.peek() == Some(b'@') {
                    self.bump();
                    self.read_wrapped(ctx, "unquote-splicing")
                } else {
                    self.read_wrapped(ctx, "unquote")
                }
            }
            b'"' => {
                self.bump();
                self.read_string(ctx)
            }
            _ => self.read_atom(ctx),
        }
    }

    /// Reads `x` and yields `(name x)`
    fn read_wrapped(&mut self, ctx: &mut Ctx, name: &str) -> Result<Hndl, ParseError> {
        let inner = self.read_value(ctx)?;
        let head = ctx.symbol(name);
        Ok(ctx.list(&[head, inner]))
    }

    fn read_list(&mut self, ctx: &mut Ctx) -> Result<Hndl, ParseError> {
        let mut items = vec![];
        let mut tail = NIL;

        loop {
            self.skip_atmosphere()?;

            match self.peek() {
                None => return Err(self.err(ParseErrorKind::UnexpectedEof)),
                Some(b')') => {
                    self.bump();
                    break;
                }
                Some(b'.') if self.peek_at(1).map_or(true, delimiter_p) => {
                    // may only appear immediately before the final element
                    if items.is_empty() {
                        return Err(self.err(ParseErrorKind::BadDot));
                    }
                    self.bump();
                    tail = self.read_value(ctx)?;

                    self.skip_atmosphere()?;
                    match self.bump() {
                        Some(b')') => break,
                        None => return Err(self.err(ParseErrorKind::UnexpectedEof)),
                        Some(_) => return Err(self.err(ParseErrorKind::BadDot)),
                    }
                }
                Some(_) => items.push(self.read_value(ctx)?),
            }
        }

        Ok(items.iter().rev().fold(tail, |acc, h| ctx.cons(*h, acc)))
    }

    fn read_string(&mut self, ctx: &mut Ctx) -> Result<Hndl, ParseError> {
        let mut acc = vec![];

        loop {
            match self.bump() {
                None => return Err(self.err(ParseErrorKind::UnterminatedString)),
                Some(b'"') => break,
                Some(b'\\') => {
                    let esc = match self.bump() {
                        Some(b'n') => b'\n',
                        Some(b't') => b'\t',
                        Some(b'r') => b'\r',
                        Some(b'0') => 0,
                        Some(b'\\') => b'\\',
                        Some(b'"') => b'"',
                        None => return Err(self.err(ParseErrorKind::UnterminatedString)),
                        Some(_) => return Err(self.err(ParseErrorKind::BadEscape)),
                    };
                    acc.push(esc);
                }
                Some(c) => acc.push(c),
            }
        }

        let text = String::from_utf8_lossy(&acc);
        Ok(ctx.string(&text))
    }

    fn read_atom(&mut self, ctx: &mut Ctx) -> Result<Hndl, ParseError> {
        let start = self.err(ParseErrorKind::BadNumber);
        let begin = self.pos;
        while let Some(c) = self.peek() {
            if delimiter_p(c) {
                break;
            }
            self.bump();
        }

        let tok = String::from_utf8_lossy(&self.src[begin..self.pos]);

        if let Some(rest) = tok.strip_prefix('#') {
            return read_special(ctx, rest).ok_or(ParseError {
                kind: ParseErrorKind::BadSpecial,
                ..start
            });
        }

        if let Some(name) = tok.strip_prefix(':') {
            if name.is_empty() {
                return Err(ParseError {
                    kind: ParseErrorKind::BadKeyword,
                    ..start
                });
            }
            return Ok(ctx.keyword(name));
        }

        if tok == "." {
            return Err(ParseError {
                kind: ParseErrorKind::BadDot,
                ..start
            });
        }

        if numeric_p(&tok) {
            return match parse_number(&tok) {
                Some(obj) => Ok(ctx.alloc(obj)),
                None => Err(start),
            };
        }

        match &*tok {
            "nil" => Ok(NIL),
            _ => Ok(ctx.symbol(&tok)),
        }
    }
}

/// Whether a token must be read as a number: an optional sign, then a
/// digit or a point followed by a digit
fn numeric_p(tok: &str) -> bool {
    let body = tok.strip_prefix(['+', '-']).unwrap_or(tok).as_bytes();
    match body {
        [d, ..] if d.is_ascii_digit() => true,
        [b'.', d, ..] if d.is_ascii_digit() => true,
        _ => false,
    }
}

fn parse_radix(digits: &str, radix: u32, neg: bool) -> Option<Obj> {
    let n = i64::from_str_radix(digits, radix).ok()?;
    Some(Obj::Fixnum(if neg { n.checked_neg()? } else { n }))
}

fn parse_number(tok: &str) -> Option<Obj> {
    let (neg, body) = match tok.as_bytes().first()? {
        b'-' => (true, &tok[1..]),
        b'+' => (false, &tok[1..]),
        _ => (false, tok),
    };

    for (prefix, radix) in [("0x", 16), ("0b", 2), ("0o", 8)] {
        if let Some(digits) = body.strip_prefix(prefix) {
            return parse_radix(digits, radix, neg);
        }
    }

    if body.contains(['.', 'e', 'E']) {
        tok.parse::<f64>().ok().map(Obj::Flonum)
    } else {
        tok.parse::<i64>().ok().map(Obj::Fixnum)
    }
}

/// Booleans and radix-prefixed integers
fn read_special(ctx: &mut Ctx, rest: &str) -> Option<Hndl> {
    match rest {
        "t" => return Some(ctx.boolean(true)),
        "f" => return Some(ctx.boolean(false)),
        _ => (),
    }

    let mut chars = rest.chars();
    let radix = match chars.next()? {
        'x' => 16,
        'b' => 2,
        'o' => 8,
        _ => return None,
    };
    let digits = chars.as_str();
    let (neg, digits) = match digits.strip_prefix('-') {
        Some(d) => (true, d),
        None => (false, digits),
    };

    parse_radix(digits, radix, neg).map(|obj| ctx.alloc(obj))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{FALSE, TRUE};

    fn read_one(ctx: &mut Ctx, code: &str) -> Result<Hndl, ParseError> {
        Reader::new(code.as_bytes()).read(ctx).map(|v| v.unwrap())
    }

    fn show(code: &str) -> String {
        let mut ctx = Ctx::default();
        let v = read_one(&mut ctx, code).unwrap();
        ctx.display(v).to_string()
    }

    #[test]
    fn atoms() {
        assert_eq!(show("42"), "42");
        assert_eq!(show("-17"), "-17");
        assert_eq!(show("+5"), "5");
        assert_eq!(show("1.25"), "1.25");
        assert_eq!(show(".5"), "0.5");
        assert_eq!(show("1e3"), "1000.0");
        assert_eq!(show("hello-world"), "hello-world");
        assert_eq!(show("-"), "-");
        assert_eq!(show("set!"), "set!");
        assert_eq!(show(":width"), ":width");
        assert_eq!(show("\"tab\\there\""), "\"tab\\there\"");
    }

    #[test]
    fn specials() {
        let mut ctx = Ctx::default();
        assert_eq!(read_one(&mut ctx, "#t").unwrap(), TRUE);
        assert_eq!(read_one(&mut ctx, "#f").unwrap(), FALSE);
        assert_eq!(read_one(&mut ctx, "nil").unwrap(), NIL);

        for (text, n) in [("#xff", 255), ("#b101", 5), ("#o17", 15), ("0x10", 16), ("-0b11", -3)] {
            let v = read_one(&mut ctx, text).unwrap();
            assert_eq!(ctx.fixnum_get(v), Some(n), "{}", text);
        }
    }

    #[test]
    fn lists() {
        assert_eq!(show("()"), "nil");
        assert_eq!(show("(a (b c) d)"), "(a (b c) d)");
        assert_eq!(show("(a . b)"), "(a . b)");
        assert_eq!(show("(a b . c)"), "(a b . c)");
        assert_eq!(show("(  1\n  2\t3 )"), "(1 2 3)");
    }

    #[test]
    fn quote_forms() {
        assert_eq!(show("'x"), "(quote x)");
        assert_eq!(show("`(a ,b ,@c)"), "(quasiquote (a (unquote b) (unquote-splicing c)))");
    }

    #[test]
    fn comments() {
        assert_eq!(show("; leading\n(a ; inner\n b)"), "(a b)");
        assert_eq!(show("#| block\n comment |# 7"), "7");
        assert_eq!(show("(1 #| mid |# 2)"), "(1 2)");
    }

    #[test]
    fn stream() {
        let mut ctx = Ctx::default();
        let mut r = Reader::new(b"1 (2) three ; done\n");
        let mut seen = vec![];
        while let Some(v) = r.read(&mut ctx).unwrap() {
            seen.push(ctx.display(v).to_string());
        }
        assert_eq!(seen, vec!["1", "(2)", "three"]);
        assert_eq!(r.read(&mut ctx), Ok(None));
    }

    #[test]
    fn errors() {
        let mut ctx = Ctx::default();
        let kind = |ctx: &mut Ctx, code: &str| read_one(ctx, code).unwrap_err().kind;

        assert_eq!(kind(&mut ctx, "(1 2"), ParseErrorKind::UnexpectedEof);
        assert_eq!(kind(&mut ctx, ")"), ParseErrorKind::UnexpectedClose);
        assert_eq!(kind(&mut ctx, "(. a)"), ParseErrorKind::BadDot);
        assert_eq!(kind(&mut ctx, "(a . b c)"), ParseErrorKind::BadDot);
        assert_eq!(kind(&mut ctx, "\"abc"), ParseErrorKind::UnterminatedString);
        assert_eq!(kind(&mut ctx, "\"\\q\""), ParseErrorKind::BadEscape);
        assert_eq!(kind(&mut ctx, "12abc"), ParseErrorKind::BadNumber);
        assert_eq!(kind(&mut ctx, "#z"), ParseErrorKind::BadSpecial);
        assert_eq!(kind(&mut ctx, ":"), ParseErrorKind::BadKeyword);
        assert_eq!(kind(&mut ctx, "#| open"), ParseErrorKind::UnterminatedComment);
    }

    #[test]
    fn nesting_limit() {
        let mut ctx = Ctx::default();

        let ok = format!("{}{}", "(".repeat(MAX_NESTING), ")".repeat(MAX_NESTING));
        assert!(read_one(&mut ctx, &ok).is_ok());

        let deep = format!("{}{}", "(".repeat(MAX_NESTING + 1), ")".repeat(MAX_NESTING + 1));
        let e = read_one(&mut ctx, &deep).unwrap_err();
        assert_eq!(e.kind, ParseErrorKind::TooDeep);
        assert_eq!(e.pos, MAX_NESTING);

        assert_eq!(read_one(&mut ctx, &"'".repeat(100_000)).unwrap_err().kind, ParseErrorKind::TooDeep);

        let (v, st) = ctx.eval_source("(".repeat(100_000).as_bytes());
        assert_eq!(st, crate::script::EvalStatus::Error);
        assert_eq!(ctx.error_message(v), Some("parse error at 1:513: nesting too deep"));
    }

    #[test]
    fn error_position() {
        let mut ctx = Ctx::default();
        let e = read_one(&mut ctx, "(a\n  b\n  12x)").unwrap_err();
        assert_eq!(e.kind, ParseErrorKind::BadNumber);
        assert_eq!((e.line, e.col), (3, 3));
        assert_eq!(e.to_string(), "parse error at 3:3: malformed number");
    }
}
