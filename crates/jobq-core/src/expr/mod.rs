// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Attribute expression language.
//!
//! Every attribute value in the queue is stored as expression text: a literal
//! (`42`, `1.5`, `"text"`, `true`, `undefined`) or a formula referencing other
//! attributes of the same record (`RequestCpus * 2`). Evaluation goes through
//! an [`AttrLookup`] so a job can resolve names through its cluster.
//!
//! Three-valued logic applies: a reference to a missing attribute evaluates
//! to `undefined`, which propagates through most operators; type mismatches
//! evaluate to `error`.

mod parser;

use std::cmp::Ordering;
use std::fmt;

pub use parser::{ParseError, parse};

/// Maximum nesting of attribute references followed during one evaluation.
const MAX_EVAL_DEPTH: usize = 32;

/// Result of evaluating an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A referenced attribute does not exist.
    Undefined,
    /// Evaluation failed (type mismatch, division by zero, bad reference).
    Error,
    /// Boolean.
    Bool(bool),
    /// 64-bit integer.
    Int(i64),
    /// Floating point number.
    Real(f64),
    /// String.
    Str(String),
}

impl Value {
    /// Interpret as a boolean; numbers are true when non-zero.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            Value::Real(r) => Some(*r != 0.0),
            _ => None,
        }
    }

    /// Interpret as an integer; reals are truncated.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Real(r) => Some(*r as i64),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Interpret as a real number.
    pub fn as_real(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Real(r) => Some(*r),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Borrow the string payload.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// True only for `Bool(true)` or a non-zero number.
    pub fn is_true(&self) -> bool {
        self.as_bool().unwrap_or(false)
    }

    fn is_number(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Real(_))
    }
}

impl fmt::Display for Value {
    /// Formats the value as expression text that parses back to itself.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => f.write_str("undefined"),
            Value::Error => f.write_str("error"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Real(r) => {
                let text = r.to_string();
                if text.contains(['.', 'e', 'E', 'i', 'N']) {
                    f.write_str(&text)
                } else {
                    write!(f, "{}.0", text)
                }
            }
            Value::Str(s) => f.write_str(&quote(s)),
        }
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// `!`
    Not,
    /// `-`
    Neg,
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// `||`
    Or,
    /// `&&`
    And,
    /// `==`, strings compare case-insensitively
    Eq,
    /// `!=`
    Ne,
    /// `=?=`, identity: same type and value, never undefined
    Is,
    /// `=!=`
    Isnt,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Mod,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Or => "||",
            BinaryOp::And => "&&",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Is => "=?=",
            BinaryOp::Isnt => "=!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
        }
    }
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A constant.
    Literal(Value),
    /// Reference to another attribute of the record being evaluated.
    Attr(String),
    /// Prefix operator.
    Unary(UnaryOp, Box<Expr>),
    /// Infix operator.
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// `cond ? then : otherwise`
    Cond(Box<Expr>, Box<Expr>, Box<Expr>),
    /// Built-in function call.
    Call(String, Vec<Expr>),
}

/// Source of attribute values during evaluation.
///
/// Returns the stored expression text for `name`, or `None` when the
/// attribute does not exist. Names are case-insensitive.
pub trait AttrLookup {
    /// Look up the expression text of an attribute.
    fn lookup(&self, name: &str) -> Option<String>;
}

impl<F> AttrLookup for F
where
    F: Fn(&str) -> Option<String>,
{
    fn lookup(&self, name: &str) -> Option<String> {
        self(name)
    }
}

/// Lookup that never finds anything.
pub struct NoAttrs;

impl AttrLookup for NoAttrs {
    fn lookup(&self, _name: &str) -> Option<String> {
        None
    }
}

impl Expr {
    /// Evaluate against a scope.
    pub fn eval(&self, scope: &dyn AttrLookup) -> Value {
        self.eval_depth(scope, 0)
    }

    /// Returns the literal value if this expression is a constant.
    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            Expr::Literal(v) => Some(v),
            _ => None,
        }
    }

    fn eval_depth(&self, scope: &dyn AttrLookup, depth: usize) -> Value {
        match self {
            Expr::Literal(v) => v.clone(),
            Expr::Attr(name) => {
                if depth >= MAX_EVAL_DEPTH {
                    return Value::Error;
                }
                match scope.lookup(name) {
                    None => Value::Undefined,
                    Some(text) => match parse(&text) {
                        Ok(expr) => expr.eval_depth(scope, depth + 1),
                        Err(_) => Value::Error,
                    },
                }
            }
            Expr::Unary(op, inner) => {
                let v = inner.eval_depth(scope, depth);
                match (op, v) {
                    (_, Value::Undefined) => Value::Undefined,
                    (UnaryOp::Not, Value::Bool(b)) => Value::Bool(!b),
                    (UnaryOp::Neg, Value::Int(i)) => Value::Int(i.wrapping_neg()),
                    (UnaryOp::Neg, Value::Real(r)) => Value::Real(-r),
                    _ => Value::Error,
                }
            }
            Expr::Binary(BinaryOp::And, lhs, rhs) => {
                let Some(left) = logical(&lhs.eval_depth(scope, depth)) else {
                    return Value::Error;
                };
                if left == Some(false) {
                    return Value::Bool(false);
                }
                let Some(right) = logical(&rhs.eval_depth(scope, depth)) else {
                    return Value::Error;
                };
                match (left, right) {
                    (_, Some(false)) => Value::Bool(false),
                    (Some(true), Some(true)) => Value::Bool(true),
                    _ => Value::Undefined,
                }
            }
            Expr::Binary(BinaryOp::Or, lhs, rhs) => {
                let Some(left) = logical(&lhs.eval_depth(scope, depth)) else {
                    return Value::Error;
                };
                if left == Some(true) {
                    return Value::Bool(true);
                }
                let Some(right) = logical(&rhs.eval_depth(scope, depth)) else {
                    return Value::Error;
                };
                match (left, right) {
                    (_, Some(true)) => Value::Bool(true),
                    (Some(false), Some(false)) => Value::Bool(false),
                    _ => Value::Undefined,
                }
            }
            Expr::Binary(op, lhs, rhs) => {
                let l = lhs.eval_depth(scope, depth);
                let r = rhs.eval_depth(scope, depth);
                binary(*op, l, r)
            }
            Expr::Cond(cond, then, otherwise) => match cond.eval_depth(scope, depth) {
                Value::Undefined => Value::Undefined,
                Value::Bool(true) => then.eval_depth(scope, depth),
                Value::Bool(false) => otherwise.eval_depth(scope, depth),
                v if v.is_number() => {
                    if v.is_true() {
                        then.eval_depth(scope, depth)
                    } else {
                        otherwise.eval_depth(scope, depth)
                    }
                }
                _ => Value::Error,
            },
            Expr::Call(name, args) => call(name, args, scope, depth),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(v) => write!(f, "{}", v),
            Expr::Attr(name) => f.write_str(name),
            Expr::Unary(UnaryOp::Not, inner) => write!(f, "!{}", inner),
            Expr::Unary(UnaryOp::Neg, inner) => write!(f, "-{}", inner),
            Expr::Binary(op, lhs, rhs) => write!(f, "({} {} {})", lhs, op.symbol(), rhs),
            Expr::Cond(c, t, e) => write!(f, "({} ? {} : {})", c, t, e),
            Expr::Call(name, args) => {
                write!(f, "{}(", name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                f.write_str(")")
            }
        }
    }
}

// Outer None = error, inner None = undefined.
fn logical(v: &Value) -> Option<Option<bool>> {
    match v {
        Value::Undefined => Some(None),
        Value::Bool(b) => Some(Some(*b)),
        Value::Int(_) | Value::Real(_) => Some(v.as_bool()),
        _ => None,
    }
}

fn binary(op: BinaryOp, l: Value, r: Value) -> Value {
    match op {
        BinaryOp::Is => return Value::Bool(identical(&l, &r)),
        BinaryOp::Isnt => return Value::Bool(!identical(&l, &r)),
        _ => {}
    }

    if l == Value::Error || r == Value::Error {
        return Value::Error;
    }
    if l == Value::Undefined || r == Value::Undefined {
        return Value::Undefined;
    }

    match op {
        BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let Some(ord) = compare(&l, &r) else {
                return Value::Error;
            };
            // Bools only support equality.
            if matches!(l, Value::Bool(_)) && !matches!(op, BinaryOp::Eq | BinaryOp::Ne) {
                return Value::Error;
            }
            Value::Bool(match op {
                BinaryOp::Eq => ord == Ordering::Equal,
                BinaryOp::Ne => ord != Ordering::Equal,
                BinaryOp::Lt => ord == Ordering::Less,
                BinaryOp::Le => ord != Ordering::Greater,
                BinaryOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            })
        }
        _ => arithmetic(op, &l, &r),
    }
}

fn identical(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Real(a), Value::Real(b)) => a == b,
        _ => l == r,
    }
}

fn compare(l: &Value, r: &Value) -> Option<Ordering> {
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (a, b) if a.is_number() && b.is_number() => a.as_real()?.partial_cmp(&b.as_real()?),
        (Value::Str(a), Value::Str(b)) => Some(a.to_lowercase().cmp(&b.to_lowercase())),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn arithmetic(op: BinaryOp, l: &Value, r: &Value) -> Value {
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => {
            let (a, b) = (*a, *b);
            match op {
                BinaryOp::Add => Value::Int(a.wrapping_add(b)),
                BinaryOp::Sub => Value::Int(a.wrapping_sub(b)),
                BinaryOp::Mul => Value::Int(a.wrapping_mul(b)),
                BinaryOp::Div => a.checked_div(b).map_or(Value::Error, Value::Int),
                BinaryOp::Mod => a.checked_rem(b).map_or(Value::Error, Value::Int),
                _ => Value::Error,
            }
        }
        (a, b) if a.is_number() && b.is_number() => {
            let (Some(a), Some(b)) = (a.as_real(), b.as_real()) else {
                return Value::Error;
            };
            match op {
                BinaryOp::Add => Value::Real(a + b),
                BinaryOp::Sub => Value::Real(a - b),
                BinaryOp::Mul => Value::Real(a * b),
                BinaryOp::Div if b != 0.0 => Value::Real(a / b),
                _ => Value::Error,
            }
        }
        _ => Value::Error,
    }
}

fn call(name: &str, args: &[Expr], scope: &dyn AttrLookup, depth: usize) -> Value {
    let arg = |i: usize| {
        args.get(i)
            .map_or(Value::Error, |a| a.eval_depth(scope, depth))
    };

    match name.to_ascii_lowercase().as_str() {
        "isundefined" if args.len() == 1 => Value::Bool(arg(0) == Value::Undefined),
        "iserror" if args.len() == 1 => Value::Bool(arg(0) == Value::Error),
        "isstring" if args.len() == 1 => Value::Bool(matches!(arg(0), Value::Str(_))),
        "ifthenelse" if args.len() == 3 => {
            Expr::Cond(
                Box::new(args[0].clone()),
                Box::new(args[1].clone()),
                Box::new(args[2].clone()),
            )
            .eval_depth(scope, depth)
        }
        "strcat" => {
            let mut out = String::new();
            for i in 0..args.len() {
                match arg(i) {
                    Value::Undefined => return Value::Undefined,
                    Value::Error => return Value::Error,
                    Value::Str(s) => out.push_str(&s),
                    other => out.push_str(&other.to_string()),
                }
            }
            Value::Str(out)
        }
        "int" if args.len() == 1 => match arg(0) {
            Value::Str(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .or_else(|_| s.trim().parse::<f64>().map(|r| Value::Int(r as i64)))
                .unwrap_or(Value::Error),
            Value::Undefined => Value::Undefined,
            other => other.as_int().map_or(Value::Error, Value::Int),
        },
        "real" if args.len() == 1 => match arg(0) {
            Value::Str(s) => s.trim().parse().map(Value::Real).unwrap_or(Value::Error),
            Value::Undefined => Value::Undefined,
            other => other.as_real().map_or(Value::Error, Value::Real),
        },
        "string" if args.len() == 1 => match arg(0) {
            Value::Undefined => Value::Undefined,
            Value::Error => Value::Error,
            Value::Str(s) => Value::Str(s),
            other => Value::Str(other.to_string()),
        },
        _ => Value::Error,
    }
}

/// Parse and evaluate expression text in one step.
pub fn eval_text(text: &str, scope: &dyn AttrLookup) -> Value {
    match parse(text) {
        Ok(expr) => expr.eval(scope),
        Err(_) => Value::Error,
    }
}

/// Quote a string as an expression string literal.
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

/// If `text` is a string literal, return its contents.
pub fn unquote(text: &str) -> Option<String> {
    match parse(text).ok()? {
        Expr::Literal(Value::Str(s)) => Some(s),
        _ => None,
    }
}

/// Attribute names start with a letter or `_` and continue with
/// letters, digits or `_`.
pub fn is_valid_attr_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A value is valid when it parses as an expression.
pub fn is_valid_attr_value(text: &str) -> bool {
    !text.contains('\n') && parse(text).is_ok()
}
