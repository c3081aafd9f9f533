// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Submit templates ("digests").
//!
//! A digest is a small line-oriented description of one job plus a single
//! `queue` statement describing how many jobs to make from it:
//!
//! ```text
//! # comment
//! executable   = /bin/sleep
//! arguments    = $(Item)
//! request_cpus = 1
//! +Project     = "physics"
//! max_idle     = 10
//! queue 2 Item from (
//!   a
//!   b
//! )
//! ```
//!
//! Known submit keys map onto job attributes; `+Name` and `MY.Name` set an
//! attribute directly; any other `key = value` only defines a macro.
//! `$(Name)` expands macros, item variables and the built-ins `Cluster`,
//! `Process`, `ProcId`, `Step`, `Row` and `Node` (the row index).
//!
//! Queue statement forms:
//!
//! | Form | Meaning |
//! |------|---------|
//! | `queue` | one job |
//! | `queue N` | `N` jobs, no items |
//! | `queue [N] vars in (a, b, c)` | items on one line |
//! | `queue [N] vars from ( ... )` | items on following lines |
//! | `queue [N] vars from path` | items from a file |
//!
//! `in` and `from` may be followed by a slice `[start:end:step]`.

use std::path::PathBuf;

use thiserror::Error;

use crate::attributes as attr;
use crate::expr;

/// Template parse failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {message}")]
pub struct DigestError {
    /// 1-based line of the template.
    pub line: usize,
    /// What went wrong.
    pub message: String,
}

fn fail<T>(line: usize, message: impl Into<String>) -> Result<T, DigestError> {
    Err(DigestError {
        line,
        message: message.into(),
    })
}

/// How a submit key's value is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    /// Quoted as a string literal.
    Text,
    /// Stored as expression text.
    Expr,
    /// `true`/`false` words normalized to booleans.
    Bool,
    /// Universe names mapped to numbers.
    Universe,
}

/// Submit keys that map onto job attributes.
const SUBMIT_KEYS: &[(&str, &str, ValueKind)] = &[
    ("accounting_group", attr::ACCT_GROUP, ValueKind::Text),
    ("accounting_group_user", attr::ACCT_GROUP_USER, ValueKind::Text),
    ("arguments", "Args", ValueKind::Text),
    ("concurrency_limits", attr::CONCURRENCY_LIMITS, ValueKind::Text),
    ("error", "Err", ValueKind::Text),
    ("executable", "Cmd", ValueKind::Text),
    ("input", "In", ValueKind::Text),
    ("leave_in_queue", attr::LEAVE_JOB_IN_QUEUE, ValueKind::Expr),
    ("nice_user", attr::NICE_USER, ValueKind::Bool),
    ("output", "Out", ValueKind::Text),
    ("priority", attr::JOB_PRIO, ValueKind::Expr),
    ("request_cpus", "RequestCpus", ValueKind::Expr),
    ("request_disk", "RequestDisk", ValueKind::Expr),
    ("request_memory", "RequestMemory", ValueKind::Expr),
    ("requirements", "Requirements", ValueKind::Expr),
    ("universe", attr::JOB_UNIVERSE, ValueKind::Universe),
];

/// Submit keys that configure the factory cluster rather than each job.
const CLUSTER_KEYS: &[(&str, &str)] = &[
    ("materialize_constraint", attr::MATERIALIZE_CONSTRAINT),
    ("max_idle", attr::MATERIALIZE_MAX_IDLE),
    ("max_materialize", attr::MATERIALIZE_LIMIT),
];

const UNIVERSES: &[(&str, i64)] = &[
    ("grid", 9),
    ("java", 10),
    ("local", 12),
    ("parallel", 11),
    ("scheduler", 7),
    ("vanilla", 5),
    ("vm", 13),
];

/// Python-style `[start:end:step]` row selection over non-negative indices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Slice {
    /// First selected row.
    pub start: Option<usize>,
    /// One past the last selected row.
    pub end: Option<usize>,
    /// Distance between selected rows.
    pub step: Option<usize>,
}

impl Slice {
    fn parse(text: &str) -> Result<Self, String> {
        let parts: Vec<&str> = text.split(':').collect();
        if parts.len() > 3 {
            return Err(format!("bad slice [{}]", text));
        }
        let field = |i: usize| -> Result<Option<usize>, String> {
            match parts.get(i).map(|s| s.trim()) {
                None | Some("") => Ok(None),
                Some(s) => s
                    .parse()
                    .map(Some)
                    .map_err(|_| format!("bad slice index '{}'", s)),
            }
        };
        let slice = Slice {
            start: field(0)?,
            end: field(1)?,
            step: field(2)?,
        };
        if slice.step == Some(0) {
            return Err("slice step cannot be zero".to_string());
        }
        if parts.len() == 1 {
            // `[n]` selects the single row n.
            let start = slice.start.unwrap_or(0);
            return Ok(Slice {
                start: Some(start),
                end: Some(start + 1),
                step: None,
            });
        }
        Ok(slice)
    }

    /// True when `row` is selected.
    pub fn selects(&self, row: usize) -> bool {
        let start = self.start.unwrap_or(0);
        let step = self.step.unwrap_or(1);
        row >= start && self.end.is_none_or(|end| row < end) && (row - start) % step == 0
    }

    /// First selected row.
    pub fn first(&self) -> usize {
        self.start.unwrap_or(0)
    }

    /// Next selected row after `row`, if the slice has one.
    pub fn next_after(&self, row: usize) -> Option<usize> {
        let start = self.start.unwrap_or(0);
        let step = self.step.unwrap_or(1);
        let next = if row < start {
            start
        } else {
            start + ((row - start) / step + 1) * step
        };
        self.end.is_none_or(|end| next < end).then_some(next)
    }
}

/// Where item rows come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemSpec {
    /// No items: `queue N`.
    None,
    /// Rows given in the template.
    Inline(Vec<String>),
    /// Rows read from a file.
    File(PathBuf),
}

/// A parsed `queue` statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatement {
    /// Jobs per row.
    pub step: u32,
    /// Item variable names; empty means `Item`.
    pub vars: Vec<String>,
    /// Row source.
    pub items: ItemSpec,
    /// Row selection.
    pub slice: Slice,
}

impl QueueStatement {
    /// Variable names bound for each row.
    pub fn var_names(&self) -> Vec<String> {
        if self.vars.is_empty() {
            vec!["Item".to_string()]
        } else {
            self.vars.clone()
        }
    }

    /// Row that job `proc` draws from, counting procs from 0.
    pub fn row_for_proc(&self, proc: u32) -> usize {
        let mut row = self.slice.first();
        for _ in 0..proc / self.step.max(1) {
            row = self.slice.next_after(row).unwrap_or(row + 1);
        }
        row
    }

    /// True when jobs are made from item rows.
    pub fn has_items(&self) -> bool {
        !matches!(self.items, ItemSpec::None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Job(String, ValueKind),
    Cluster(String),
    Macro,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Statement {
    key: String,
    /// False for `+Name` and `MY.Name`, which are not macros.
    plain: bool,
    target: Target,
    value: String,
    line: usize,
}

/// A parsed submit template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitDigest {
    statements: Vec<Statement>,
    queue: QueueStatement,
}

/// Variables in scope while expanding one job.
#[derive(Debug, Clone, Default)]
pub struct JobBindings {
    /// Cluster id.
    pub cluster: i32,
    /// Proc id.
    pub proc: i32,
    /// Step within the row.
    pub step: u32,
    /// Row index, if the job came from an item row.
    pub row: Option<usize>,
    /// Item variables bound from the row.
    pub vars: Vec<(String, String)>,
}

/// Split a row across item variables.
///
/// Rows containing the unit separator (0x1F) split on it; otherwise on runs
/// of commas, spaces and tabs. The last variable takes the rest of the row.
pub fn bind_row(vars: &[String], row: &str) -> Vec<(String, String)> {
    let mut out = Vec::with_capacity(vars.len());
    let mut rest = row.trim_start();
    let us = row.contains('\x1f');
    for (i, var) in vars.iter().enumerate() {
        if i + 1 == vars.len() {
            out.push((var.clone(), rest.trim_end().to_string()));
            break;
        }
        let cut = if us {
            rest.find('\x1f')
        } else {
            rest.find([',', ' ', '\t'])
        };
        match cut {
            Some(pos) => {
                out.push((var.clone(), rest[..pos].to_string()));
                let tail = &rest[pos..];
                rest = if us {
                    &tail[1..]
                } else {
                    tail.trim_start_matches([',', ' ', '\t'])
                };
            }
            None => {
                out.push((var.clone(), rest.trim_end().to_string()));
                rest = "";
            }
        }
    }
    out
}

/// Split `vars in ...` / `vars from ...` at the keyword.
fn split_keyword(tokens: &str) -> Option<(&str, &'static str, &str)> {
    let lower = tokens.to_ascii_lowercase();
    let bytes = lower.as_bytes();
    let ends_word = |i: usize| i >= bytes.len() || bytes[i].is_ascii_whitespace() || bytes[i] == b'(';
    let starts_word = |i: usize| i == 0 || bytes[i - 1].is_ascii_whitespace() || bytes[i - 1] == b',';
    let mut best: Option<(usize, &'static str)> = None;
    for kw in ["in", "from"] {
        if let Some((pos, _)) = lower
            .match_indices(kw)
            .find(|(pos, _)| starts_word(*pos) && ends_word(pos + kw.len()))
        {
            if best.is_none_or(|(b, _)| pos < b) {
                best = Some((pos, kw));
            }
        }
    }
    best.map(|(pos, kw)| (&tokens[..pos], kw, &tokens[pos + kw.len()..]))
}

fn parse_queue(
    line_no: usize,
    rest: &str,
    lines: &mut std::iter::Peekable<impl Iterator<Item = (usize, String)>>,
) -> Result<QueueStatement, DigestError> {
    let mut tokens = rest.trim();
    let mut step = 1u32;

    if let Some(first) = tokens.split_whitespace().next() {
        if let Ok(n) = first.parse::<u32>() {
            if n == 0 {
                return fail(line_no, "queue count must be at least 1");
            }
            step = n;
            tokens = tokens[first.len()..].trim_start();
        }
    }
    if tokens.is_empty() {
        return Ok(QueueStatement {
            step,
            vars: Vec::new(),
            items: ItemSpec::None,
            slice: Slice::default(),
        });
    }

    let (vars_text, keyword, after) = split_keyword(tokens).ok_or_else(|| DigestError {
        line: line_no,
        message: format!("cannot parse queue arguments '{}'", tokens),
    })?;

    let vars: Vec<String> = vars_text
        .split([',', ' ', '\t'])
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect();
    if let Some(bad) = vars.iter().find(|v| !expr::is_valid_attr_name(v)) {
        return fail(line_no, format!("bad item variable '{}'", bad));
    }

    let mut after = after.trim();
    let mut slice = Slice::default();
    if let Some(inner) = after.strip_prefix('[') {
        let Some(close) = inner.find(']') else {
            return fail(line_no, "unterminated slice");
        };
        slice = Slice::parse(&inner[..close]).map_err(|m| DigestError {
            line: line_no,
            message: m,
        })?;
        after = inner[close + 1..].trim();
    }

    let items = if let Some(body) = after.strip_prefix('(') {
        let body = body.trim();
        if let Some(inline) = body.strip_suffix(')') {
            let rows: Vec<String> = if keyword == "in" {
                inline
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            } else {
                Some(inline.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .into_iter()
                    .collect()
            };
            ItemSpec::Inline(rows)
        } else {
            if !body.is_empty() {
                return fail(line_no, "items must start on the line after '('");
            }
            let mut rows = Vec::new();
            loop {
                let Some((_, line)) = lines.next() else {
                    return fail(line_no, "unterminated item list");
                };
                let trimmed = line.trim();
                if trimmed == ")" {
                    break;
                }
                if !trimmed.is_empty() && !trimmed.starts_with('#') {
                    rows.push(trimmed.to_string());
                }
            }
            ItemSpec::Inline(rows)
        }
    } else if keyword == "from" && !after.is_empty() {
        ItemSpec::File(PathBuf::from(after))
    } else {
        return fail(line_no, "expected an item list or file");
    };

    Ok(QueueStatement {
        step,
        vars,
        items,
        slice,
    })
}

fn classify_key(key: &str) -> Target {
    let lower = key.to_ascii_lowercase();
    if let Some(name) = key.strip_prefix('+') {
        return Target::Job(name.to_string(), ValueKind::Expr);
    }
    if lower.starts_with("my.") {
        return Target::Job(key[3..].to_string(), ValueKind::Expr);
    }
    if let Some((_, name, kind)) = SUBMIT_KEYS.iter().find(|(k, _, _)| *k == lower) {
        return Target::Job((*name).to_string(), *kind);
    }
    if let Some((_, name)) = CLUSTER_KEYS.iter().find(|(k, _)| *k == lower) {
        return Target::Cluster((*name).to_string());
    }
    Target::Macro
}

impl SubmitDigest {
    /// Parse template text.
    pub fn parse(text: &str) -> Result<Self, DigestError> {
        let mut statements = Vec::new();
        let mut queue = None;
        let mut lines = text
            .lines()
            .enumerate()
            .map(|(i, l)| (i + 1, l.to_string()))
            .peekable();

        while let Some((line_no, line)) = lines.next() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let lower = trimmed.to_ascii_lowercase();
            if lower == "queue" || lower.starts_with("queue ") {
                if queue.is_some() {
                    return fail(line_no, "only one queue statement is allowed");
                }
                queue = Some(parse_queue(line_no, &trimmed[5..], &mut lines)?);
                continue;
            }
            if queue.is_some() {
                return fail(line_no, "nothing may follow the queue statement");
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                return fail(line_no, format!("expected 'key = value', got '{}'", trimmed));
            };
            let key = key.trim();
            let bare = key.trim_start_matches('+');
            let bare = if bare.len() > 3 && bare[..3].eq_ignore_ascii_case("my.") {
                &bare[3..]
            } else {
                bare
            };
            if !expr::is_valid_attr_name(bare) {
                return fail(line_no, format!("bad key '{}'", key));
            }
            statements.push(Statement {
                key: bare.to_string(),
                plain: bare.len() == key.len(),
                target: classify_key(key),
                value: value.trim().to_string(),
                line: line_no,
            });
        }

        let Some(queue) = queue else {
            return fail(text.lines().count().max(1), "missing queue statement");
        };
        Ok(Self { statements, queue })
    }

    /// The queue statement.
    pub fn queue(&self) -> &QueueStatement {
        &self.queue
    }

    /// Attributes that configure the factory cluster (`max_idle` and so on).
    pub fn cluster_attrs(&self) -> Vec<(String, String)> {
        self.statements
            .iter()
            .filter_map(|s| match &s.target {
                Target::Cluster(name) => Some((name.clone(), s.value.clone())),
                _ => None,
            })
            .collect()
    }

    fn macro_value(&self, name: &str, bindings: &JobBindings, depth: usize) -> String {
        let builtin = match name.to_ascii_lowercase().as_str() {
            "cluster" | "clusterid" => Some(bindings.cluster.to_string()),
            "process" | "procid" => Some(bindings.proc.to_string()),
            "step" => Some(bindings.step.to_string()),
            "row" | "node" => Some(bindings.row.unwrap_or(0).to_string()),
            _ => None,
        };
        if let Some(value) = builtin {
            return value;
        }
        if let Some((_, v)) = bindings
            .vars
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            return v.clone();
        }
        self.statements
            .iter()
            .rev()
            .find(|s| s.plain && s.key.eq_ignore_ascii_case(name))
            .map(|s| self.expand(&s.value, bindings, depth + 1))
            .unwrap_or_default()
    }

    /// Replace every `$(Name)` in `text`.
    fn expand(&self, text: &str, bindings: &JobBindings, depth: usize) -> String {
        if depth > 16 {
            return String::new();
        }
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(start) = rest.find("$(") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find(')') {
                Some(end) => {
                    out.push_str(&self.macro_value(&after[..end], bindings, depth));
                    rest = &after[end + 1..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }

    /// Expand the template into the attributes of one job.
    ///
    /// Fails when an expanded value is not a valid expression.
    pub fn make_job(&self, bindings: &JobBindings) -> Result<Vec<(String, String)>, String> {
        let mut attrs: Vec<(String, String)> = Vec::new();
        for statement in &self.statements {
            let Target::Job(name, kind) = &statement.target else {
                continue;
            };
            let raw = self.expand(&statement.value, bindings, 0);
            let value = match kind {
                ValueKind::Text => expr::quote(&raw),
                ValueKind::Expr => raw,
                ValueKind::Bool => match raw.to_ascii_lowercase().as_str() {
                    "true" | "yes" | "1" => "true".to_string(),
                    "false" | "no" | "0" => "false".to_string(),
                    _ => raw,
                },
                ValueKind::Universe => {
                    let lower = raw.to_ascii_lowercase();
                    match UNIVERSES.iter().find(|(n, _)| *n == lower) {
                        Some((_, code)) => code.to_string(),
                        None => raw,
                    }
                }
            };
            if !expr::is_valid_attr_value(&value) {
                return Err(format!(
                    "line {}: {} = {} is not a valid expression",
                    statement.line, name, value
                ));
            }
            match attrs.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
                Some(existing) => existing.1 = value,
                None => attrs.push((name.clone(), value)),
            }
        }
        Ok(attrs)
    }
}
