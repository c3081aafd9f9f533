// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Keys and records stored in the log.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Two-part record key.
///
/// `(0, 0)` is the header record, `(c, -1)` the cluster record of cluster
/// `c`, and `(c, p)` with `c >= 1, p >= 0` a job. Ordering is by cluster
/// then proc, so a cluster record sorts directly before its jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key {
    /// Cluster id.
    pub cluster: i32,
    /// Proc id, `-1` for the cluster record.
    pub proc: i32,
}

impl Key {
    /// The header record holding global counters.
    pub const HEADER: Key = Key {
        cluster: 0,
        proc: 0,
    };

    /// Key of a cluster record.
    pub const fn cluster(cluster: i32) -> Self {
        Self { cluster, proc: -1 }
    }

    /// Key of a job record.
    pub const fn job(cluster: i32, proc: i32) -> Self {
        Self { cluster, proc }
    }

    /// True for the header key.
    pub fn is_header(&self) -> bool {
        *self == Self::HEADER
    }

    /// True for cluster record keys.
    pub fn is_cluster(&self) -> bool {
        self.cluster >= 1 && self.proc == -1
    }

    /// True for job record keys.
    pub fn is_job(&self) -> bool {
        self.cluster >= 1 && self.proc >= 0
    }

    /// The kind of record this key addresses, if it is well formed.
    pub fn record_type(&self) -> Option<RecordType> {
        if self.is_header() {
            Some(RecordType::Header)
        } else if self.is_cluster() {
            Some(RecordType::Cluster)
        } else if self.is_job() {
            Some(RecordType::Job)
        } else {
            None
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.cluster, self.proc)
    }
}

/// Kind of record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    /// Singleton header with global counters.
    Header,
    /// Per-cluster record shared by its jobs.
    Cluster,
    /// A single job.
    Job,
}

#[derive(Debug, Clone, PartialEq)]
struct Attr {
    name: String,
    value: String,
}

/// A set of named attributes.
///
/// Names are case-insensitive; the spelling of the first write is kept.
/// Values are expression text.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    kind: RecordType,
    attrs: BTreeMap<String, Attr>,
}

impl Record {
    /// Create an empty record.
    pub fn new(kind: RecordType) -> Self {
        Self {
            kind,
            attrs: BTreeMap::new(),
        }
    }

    /// Kind of record.
    pub fn kind(&self) -> RecordType {
        self.kind
    }

    /// Get the expression text of an attribute.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.attrs
            .get(&name.to_ascii_lowercase())
            .map(|a| a.value.as_str())
    }

    /// True if the attribute exists.
    pub fn contains(&self, name: &str) -> bool {
        self.attrs.contains_key(&name.to_ascii_lowercase())
    }

    /// Set an attribute, returning the previous value.
    pub fn set(&mut self, name: &str, value: &str) -> Option<String> {
        let folded = name.to_ascii_lowercase();
        match self.attrs.get_mut(&folded) {
            Some(attr) => Some(std::mem::replace(&mut attr.value, value.to_string())),
            None => {
                self.attrs.insert(
                    folded,
                    Attr {
                        name: name.to_string(),
                        value: value.to_string(),
                    },
                );
                None
            }
        }
    }

    /// Remove an attribute, returning its value.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.attrs
            .remove(&name.to_ascii_lowercase())
            .map(|a| a.value)
    }

    /// Iterate `(name, value)` pairs in case-folded name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs
            .values()
            .map(|a| (a.name.as_str(), a.value.as_str()))
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    /// True when the record has no attributes.
    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_classification() {
        assert!(Key::HEADER.is_header());
        assert_eq!(Key::HEADER.record_type(), Some(RecordType::Header));
        assert_eq!(Key::cluster(7).record_type(), Some(RecordType::Cluster));
        assert_eq!(Key::job(7, 0).record_type(), Some(RecordType::Job));
        assert_eq!(Key::job(0, 5).record_type(), None);
        assert_eq!(Key::job(3, -2).record_type(), None);
        assert_eq!(Key::job(100, 3).to_string(), "100.3");
    }

    #[test]
    fn test_cluster_record_sorts_before_jobs() {
        let mut keys = vec![Key::job(2, 0), Key::job(1, 1), Key::cluster(2), Key::cluster(1)];
        keys.sort();
        assert_eq!(
            keys,
            vec![Key::cluster(1), Key::job(1, 1), Key::cluster(2), Key::job(2, 0)]
        );
    }

    #[test]
    fn test_case_insensitive_attributes() {
        let mut rec = Record::new(RecordType::Job);
        assert_eq!(rec.set("JobPrio", "5"), None);
        assert_eq!(rec.get("jobprio"), Some("5"));
        assert_eq!(rec.set("JOBPRIO", "6"), Some("5".to_string()));
        assert_eq!(rec.iter().collect::<Vec<_>>(), vec![("JobPrio", "6")]);
        assert_eq!(rec.remove("Jobprio"), Some("6".to_string()));
        assert!(rec.is_empty());
        assert_eq!(rec.kind(), RecordType::Job);
    }
}
