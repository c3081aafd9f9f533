// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Staged, not yet committed, log operations.

use std::collections::BTreeSet;

use super::entry::LogOp;
use super::record::Key;

/// An ordered list of staged operations.
///
/// Nothing here is visible to other readers until the transaction is
/// committed through [`TransactionalLog::commit`](super::TransactionalLog::commit).
#[derive(Debug, Default, Clone)]
pub struct Transaction {
    ops: Vec<LogOp>,
    comment: Option<String>,
}

impl Transaction {
    /// Start an empty transaction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an operation.
    pub fn stage(&mut self, op: LogOp) {
        self.ops.push(op);
    }

    /// Staged operations in order.
    pub fn ops(&self) -> &[LogOp] {
        &self.ops
    }

    /// Number of staged operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// True when nothing has been staged.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Attach a note written with the commit entry.
    pub fn set_comment(&mut self, comment: impl Into<String>) {
        self.comment = Some(comment.into());
    }

    /// The commit note, if any.
    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    pub(crate) fn into_parts(self) -> (Vec<LogOp>, Option<String>) {
        (self.ops, self.comment)
    }

    /// What the staged operations say about `name` on `key`.
    ///
    /// `Some(Some(v))` when staged as `v`, `Some(None)` when staged as
    /// absent (deleted, or the record was created or destroyed here), and
    /// `None` when this transaction does not touch it.
    pub fn staged_attr(&self, key: Key, name: &str) -> Option<Option<&str>> {
        for op in self.ops.iter().rev() {
            match op {
                LogOp::SetAttr {
                    key: k,
                    name: n,
                    value,
                } if *k == key && n.eq_ignore_ascii_case(name) => return Some(Some(value.as_str())),
                LogOp::DeleteAttr { key: k, name: n }
                    if *k == key && n.eq_ignore_ascii_case(name) =>
                {
                    return Some(None);
                }
                LogOp::NewRecord { key: k, .. } | LogOp::DestroyRecord { key: k } if *k == key => {
                    return Some(None);
                }
                _ => {}
            }
        }
        None
    }

    /// Whether the staged operations create or destroy `key`.
    pub fn staged_exists(&self, key: Key) -> Option<bool> {
        self.ops.iter().rev().find_map(|op| match op {
            LogOp::NewRecord { key: k, .. } if *k == key => Some(true),
            LogOp::DestroyRecord { key: k } if *k == key => Some(false),
            _ => None,
        })
    }

    /// Every key touched, in key order.
    pub fn touched_keys(&self) -> BTreeSet<Key> {
        self.ops.iter().map(LogOp::key).collect()
    }

    /// Keys created by this transaction and still alive at its end.
    pub fn created_keys(&self) -> Vec<Key> {
        let mut seen = BTreeSet::new();
        self.ops
            .iter()
            .filter_map(|op| match op {
                LogOp::NewRecord { key, .. } if seen.insert(*key) => Some(*key),
                _ => None,
            })
            .filter(|key| self.staged_exists(*key) == Some(true))
            .collect()
    }

    /// Keys destroyed by this transaction.
    pub fn destroyed_keys(&self) -> Vec<Key> {
        let mut seen = BTreeSet::new();
        self.ops
            .iter()
            .filter_map(|op| match op {
                LogOp::DestroyRecord { key } if seen.insert(*key) => Some(*key),
                _ => None,
            })
            .collect()
    }

    /// Attribute names set on `key` by this transaction, first write order.
    pub fn attrs_set_on(&self, key: Key) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for op in &self.ops {
            if let LogOp::SetAttr { key: k, name, .. } = op {
                if *k == key && !names.iter().any(|n| n.eq_ignore_ascii_case(name)) {
                    names.push(name.as_str());
                }
            }
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::record::RecordType;

    fn set(key: Key, name: &str, value: &str) -> LogOp {
        LogOp::SetAttr {
            key,
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn test_read_your_writes() {
        let key = Key::job(1, 0);
        let mut txn = Transaction::new();
        assert_eq!(txn.staged_attr(key, "Foo"), None);

        txn.stage(set(key, "Foo", "1"));
        txn.stage(set(key, "foo", "2"));
        assert_eq!(txn.staged_attr(key, "FOO"), Some(Some("2")));

        txn.stage(LogOp::DeleteAttr {
            key,
            name: "Foo".to_string(),
        });
        assert_eq!(txn.staged_attr(key, "Foo"), Some(None));
        assert_eq!(txn.staged_attr(Key::job(1, 1), "Foo"), None);
    }

    #[test]
    fn test_new_record_hides_committed_values() {
        let key = Key::job(2, 0);
        let mut txn = Transaction::new();
        txn.stage(LogOp::DestroyRecord { key });
        txn.stage(LogOp::NewRecord {
            key,
            kind: RecordType::Job,
        });
        assert_eq!(txn.staged_attr(key, "Anything"), Some(None));
        assert_eq!(txn.staged_exists(key), Some(true));
        assert_eq!(txn.created_keys(), vec![key]);
        assert_eq!(txn.destroyed_keys(), vec![key]);
    }

    #[test]
    fn test_created_then_destroyed_is_not_created() {
        let key = Key::job(3, 0);
        let mut txn = Transaction::new();
        txn.stage(LogOp::NewRecord {
            key,
            kind: RecordType::Job,
        });
        txn.stage(set(key, "A", "1"));
        txn.stage(set(key, "B", "2"));
        txn.stage(set(key, "a", "3"));
        assert_eq!(txn.attrs_set_on(key), vec!["A", "B"]);
        txn.stage(LogOp::DestroyRecord { key });
        assert!(txn.created_keys().is_empty());
        assert_eq!(txn.staged_exists(key), Some(false));
        assert_eq!(txn.touched_keys().len(), 1);
        assert_eq!(txn.len(), 5);
    }
}
