// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tokenizer and Pratt parser for attribute expressions.
//!
//! Precedence, lowest to highest:
//!   ?: (right associative)
//!   ||
//!   &&
//!   == != =?= =!=
//!   < <= > >=
//!   + -
//!   * / %
//!   ! - + (unary prefix)

use super::{BinaryOp, Expr, UnaryOp, Value};

/// Error produced when expression text cannot be parsed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message} at offset {offset}")]
pub struct ParseError {
    /// What went wrong.
    pub message: String,
    /// Byte offset into the source text.
    pub offset: usize,
}

impl ParseError {
    fn new(message: impl Into<String>, offset: usize) -> Self {
        Self {
            message: message.into(),
            offset,
        }
    }
}

// Binding powers: higher = tighter binding.
mod bp {
    pub const COND: (u8, u8) = (2, 1);
    pub const OR: (u8, u8) = (3, 4);
    pub const AND: (u8, u8) = (5, 6);
    pub const EQUALITY: (u8, u8) = (7, 8);
    pub const COMPARISON: (u8, u8) = (9, 10);
    pub const ADD: (u8, u8) = (11, 12);
    pub const MUL: (u8, u8) = (13, 14);
    pub const UNARY: u8 = 15;
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Int(i64),
    Real(f64),
    Str(String),
    Ident(String),
    Sym(&'static str),
    Eof,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    offset: usize,
}

// Longest symbols first so `=?=` wins over `=`.
const SYMBOLS: &[&str] = &[
    "=?=", "=!=", "==", "!=", "<=", ">=", "&&", "||", "<", ">", "+", "-", "*", "/", "%", "!",
    "(", ")", ",", "?", ":",
];

fn tokenize(src: &str) -> Result<Vec<Token>, ParseError> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        let start = i;
        if c.is_ascii_digit() || (c == b'.' && bytes.get(i + 1).is_some_and(u8::is_ascii_digit)) {
            let mut is_real = false;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i < bytes.len() && bytes[i] == b'.' {
                is_real = true;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
            }
            if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
                let mut j = i + 1;
                if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
                    j += 1;
                }
                if j < bytes.len() && bytes[j].is_ascii_digit() {
                    is_real = true;
                    i = j;
                    while i < bytes.len() && bytes[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let text = &src[start..i];
            let tok = if is_real {
                Tok::Real(
                    text.parse()
                        .map_err(|_| ParseError::new(format!("bad number '{}'", text), start))?,
                )
            } else {
                Tok::Int(
                    text.parse()
                        .map_err(|_| ParseError::new(format!("integer '{}' overflows", text), start))?,
                )
            };
            tokens.push(Token { tok, offset: start });
            continue;
        }

        if c.is_ascii_alphabetic() || c == b'_' {
            while i < bytes.len()
                && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'.')
            {
                i += 1;
            }
            tokens.push(Token {
                tok: Tok::Ident(src[start..i].to_string()),
                offset: start,
            });
            continue;
        }

        if c == b'"' {
            i += 1;
            let mut out = String::new();
            let mut closed = false;
            let mut chars = src[i..].char_indices();
            while let Some((off, ch)) = chars.next() {
                match ch {
                    '"' => {
                        i += off + 1;
                        closed = true;
                        break;
                    }
                    '\\' => match chars.next() {
                        Some((_, 'n')) => out.push('\n'),
                        Some((_, 't')) => out.push('\t'),
                        Some((_, other)) => out.push(other),
                        None => break,
                    },
                    other => out.push(other),
                }
            }
            if !closed {
                return Err(ParseError::new("unterminated string", start));
            }
            tokens.push(Token {
                tok: Tok::Str(out),
                offset: start,
            });
            continue;
        }

        match SYMBOLS.iter().find(|s| src[i..].starts_with(**s)) {
            Some(sym) => {
                i += sym.len();
                tokens.push(Token {
                    tok: Tok::Sym(*sym),
                    offset: start,
                });
            }
            None => {
                let ch = src[i..].chars().next().unwrap_or('?');
                return Err(ParseError::new(format!("unexpected character '{}'", ch), start));
            }
        }
    }

    tokens.push(Token {
        tok: Tok::Eof,
        offset: src.len(),
    });
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

/// Parse expression text into an [`Expr`].
pub fn parse(src: &str) -> Result<Expr, ParseError> {
    let mut parser = Parser {
        tokens: tokenize(src)?,
        pos: 0,
    };
    let expr = parser.parse_expr_bp(0)?;
    match parser.peek() {
        Tok::Eof => Ok(expr),
        other => Err(parser.err_here(format!("unexpected trailing {:?}", other))),
    }
}

impl Parser {
    fn peek(&self) -> &Tok {
        self.tokens.get(self.pos).map_or(&Tok::Eof, |t| &t.tok)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map_or(0, |t| t.offset)
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if tok != Tok::Eof {
            self.pos += 1;
        }
        tok
    }

    fn eat_sym(&mut self, sym: &str) -> bool {
        if matches!(self.peek(), Tok::Sym(s) if *s == sym) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_sym(&mut self, sym: &str) -> Result<(), ParseError> {
        if self.eat_sym(sym) {
            Ok(())
        } else {
            Err(self.err_here(format!("expected '{}'", sym)))
        }
    }

    fn err_here(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(message, self.offset())
    }

    fn parse_expr_bp(&mut self, min_bp: u8) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_prefix()?;

        loop {
            let Tok::Sym(sym) = *self.peek() else {
                break;
            };

            if sym == "?" {
                let (l_bp, r_bp) = bp::COND;
                if l_bp < min_bp {
                    break;
                }
                self.pos += 1;
                let then = self.parse_expr_bp(0)?;
                self.expect_sym(":")?;
                let otherwise = self.parse_expr_bp(r_bp)?;
                lhs = Expr::Cond(Box::new(lhs), Box::new(then), Box::new(otherwise));
                continue;
            }

            let Some((op, (l_bp, r_bp))) = infix_op(sym) else {
                break;
            };
            if l_bp < min_bp {
                break;
            }
            self.pos += 1;
            let rhs = self.parse_expr_bp(r_bp)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }

        Ok(lhs)
    }

    fn parse_prefix(&mut self) -> Result<Expr, ParseError> {
        let offset = self.offset();
        match self.advance() {
            Tok::Int(i) => Ok(Expr::Literal(Value::Int(i))),
            Tok::Real(r) => Ok(Expr::Literal(Value::Real(r))),
            Tok::Str(s) => Ok(Expr::Literal(Value::Str(s))),
            Tok::Sym("(") => {
                let inner = self.parse_expr_bp(0)?;
                self.expect_sym(")")?;
                Ok(inner)
            }
            Tok::Sym("!") => Ok(Expr::Unary(
                UnaryOp::Not,
                Box::new(self.parse_expr_bp(bp::UNARY)?),
            )),
            Tok::Sym("-") => Ok(Expr::Unary(
                UnaryOp::Neg,
                Box::new(self.parse_expr_bp(bp::UNARY)?),
            )),
            Tok::Sym("+") => self.parse_expr_bp(bp::UNARY),
            Tok::Ident(name) => {
                if self.eat_sym("(") {
                    let mut args = Vec::new();
                    if !self.eat_sym(")") {
                        loop {
                            args.push(self.parse_expr_bp(0)?);
                            if self.eat_sym(")") {
                                break;
                            }
                            self.expect_sym(",")?;
                        }
                    }
                    return Ok(Expr::Call(name, args));
                }
                Ok(ident_to_expr(name, offset)?)
            }
            Tok::Eof => Err(ParseError::new("unexpected end of expression", offset)),
            other => Err(ParseError::new(format!("unexpected {:?}", other), offset)),
        }
    }
}

fn infix_op(sym: &str) -> Option<(BinaryOp, (u8, u8))> {
    let entry = match sym {
        "||" => (BinaryOp::Or, bp::OR),
        "&&" => (BinaryOp::And, bp::AND),
        "==" => (BinaryOp::Eq, bp::EQUALITY),
        "!=" => (BinaryOp::Ne, bp::EQUALITY),
        "=?=" => (BinaryOp::Is, bp::EQUALITY),
        "=!=" => (BinaryOp::Isnt, bp::EQUALITY),
        "<" => (BinaryOp::Lt, bp::COMPARISON),
        "<=" => (BinaryOp::Le, bp::COMPARISON),
        ">" => (BinaryOp::Gt, bp::COMPARISON),
        ">=" => (BinaryOp::Ge, bp::COMPARISON),
        "+" => (BinaryOp::Add, bp::ADD),
        "-" => (BinaryOp::Sub, bp::ADD),
        "*" => (BinaryOp::Mul, bp::MUL),
        "/" => (BinaryOp::Div, bp::MUL),
        "%" => (BinaryOp::Mod, bp::MUL),
        _ => return None,
    };
    Some(entry)
}

fn ident_to_expr(name: String, offset: usize) -> Result<Expr, ParseError> {
    if name.eq_ignore_ascii_case("true") {
        return Ok(Expr::Literal(Value::Bool(true)));
    }
    if name.eq_ignore_ascii_case("false") {
        return Ok(Expr::Literal(Value::Bool(false)));
    }
    if name.eq_ignore_ascii_case("undefined") {
        return Ok(Expr::Literal(Value::Undefined));
    }
    if name.eq_ignore_ascii_case("error") {
        return Ok(Expr::Literal(Value::Error));
    }

    // `MY.Foo` refers to the record being evaluated.
    let attr = match name.split_once('.') {
        Some((scope, rest)) if scope.eq_ignore_ascii_case("my") => rest,
        Some(_) => return Err(ParseError::new(format!("unknown scope in '{}'", name), offset)),
        None => name.as_str(),
    };
    if !super::is_valid_attr_name(attr) {
        return Err(ParseError::new(format!("bad attribute reference '{}'", name), offset));
    }
    Ok(Expr::Attr(attr.to_string()))
}
