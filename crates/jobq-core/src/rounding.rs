// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-attribute rounding of numeric values.
//!
//! Frequently updated fine-grained numbers (image size, memory usage) are
//! rounded up before they are stored, so small fluctuations do not turn
//! into log traffic. Two rules exist:
//!
//! - `"N"`: round up to a multiple of `10^N` (`N` in `0..=9`).
//! - `"P%"`: round up to `P` percent of the value's order of magnitude
//!   (`P` in `0..=1000`).
//!
//! Values that are not integer or real literals pass through unchanged.

use crate::expr::{self, Expr, UnaryOp, Value};

/// A configured rounding rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RoundingRule {
    /// Round up to a multiple of `10^exp`.
    PowerOfTen(u32),
    /// Round up to this percentage of the value's order of magnitude.
    Percent(f64),
}

impl RoundingRule {
    /// Parse a rule. `""` and `"0"` mean no rounding.
    pub fn parse(text: &str) -> Result<Option<Self>, String> {
        let text = text.trim();
        if text.is_empty() || text == "0" {
            return Ok(None);
        }
        if let Some(pct) = text.strip_suffix('%') {
            let pct: f64 = pct
                .trim()
                .parse()
                .map_err(|_| format!("'{}' is not a percentage", text))?;
            if !(0.0..=1000.0).contains(&pct) {
                return Err(format!("percentage {} outside 0..=1000", pct));
            }
            return Ok(Some(RoundingRule::Percent(pct)));
        }
        let exp: u32 = text
            .parse()
            .map_err(|_| format!("'{}' is neither a power of ten nor a percentage", text))?;
        if exp > 9 {
            return Err(format!("power of ten {} outside 0..=9", exp));
        }
        Ok(Some(RoundingRule::PowerOfTen(exp)))
    }

    /// Round expression text. Returns `None` when the text is not a
    /// numeric literal.
    pub fn apply(&self, text: &str) -> Option<String> {
        let value = match expr::parse(text).ok()? {
            Expr::Literal(v) => v,
            Expr::Unary(UnaryOp::Neg, inner) => match *inner {
                Expr::Literal(Value::Int(i)) => Value::Int(-i),
                Expr::Literal(Value::Real(r)) => Value::Real(-r),
                _ => return None,
            },
            _ => return None,
        };
        let is_int = match value {
            Value::Int(_) => true,
            Value::Real(_) => false,
            _ => return None,
        };
        let fvalue = value.as_real()?;

        match *self {
            RoundingRule::Percent(pct) => {
                if fvalue.abs() < 0.000001 || pct < 0.000001 {
                    return Some(text.to_string());
                }
                let magnitude = ((fvalue / 5.0).abs().log10() + 1.0) as i32;
                let round_to = 10f64.powi(magnitude) * pct / 100.0;
                let rounded = (fvalue / round_to).ceil() * round_to;
                if is_int {
                    Some(format!("{}", rounded as i64))
                } else {
                    Some(format!("{:.6}", rounded))
                }
            }
            RoundingRule::PowerOfTen(exp) => {
                let base = 10i64.pow(exp);
                let ivalue = value.as_int()?;
                let rounded = ivalue.saturating_add(base - 1) / base * base;
                if is_int {
                    Some(rounded.to_string())
                } else {
                    Some(format!("{}.0", rounded))
                }
            }
        }
    }
}
