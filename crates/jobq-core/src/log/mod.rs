// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistent transactional log.
//!
//! An append-only file of framed JSON lines. The first line is a header
//! carrying the historical sequence number; every following line is one
//! committed transaction. Opening the log replays every committed line in
//! file order into an in-memory table keyed by [`Key`].
//!
//! # Durability
//!
//! A durable commit calls `sync_data` before returning. A non-durable commit
//! only writes; the caller is expected to call [`TransactionalLog::flush`]
//! on a short timer.
//!
//! # Rotation
//!
//! [`TransactionalLog::rotate`] copies the current file to `<log>.<seq>`
//! (keeping at most `max_historical` copies), writes the live table as a
//! snapshot into `<log>.tmp`, syncs it and renames it over the log.

mod entry;
mod record;
mod transaction;

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{QueueError, Result};

pub use entry::{LogEntry, LogOp};
pub use record::{Key, Record, RecordType};
pub use transaction::Transaction;

/// The log file plus the committed table it describes.
pub struct TransactionalLog {
    path: PathBuf,
    file: File,
    len: u64,
    table: BTreeMap<Key, Record>,
    sequence: u64,
    max_historical: u32,
    unsynced: bool,
    commits_since_rotation: usize,
    recovered_torn_tail: bool,
}

impl std::fmt::Debug for TransactionalLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionalLog")
            .field("path", &self.path)
            .field("records", &self.table.len())
            .field("sequence", &self.sequence)
            .field("unsynced", &self.unsynced)
            .finish()
    }
}

/// Append `.suffix` to the file name of `path`.
fn with_suffix(path: &Path, suffix: impl std::fmt::Display) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{}", suffix));
    PathBuf::from(name)
}

fn sync_parent_dir(path: &Path) {
    if let Some(dir) = path.parent() {
        if let Ok(handle) = File::open(dir) {
            let _ = handle.sync_all();
        }
    }
}

/// Apply one operation to a table. Returns false when it referenced a
/// record that does not exist.
fn apply_op(table: &mut BTreeMap<Key, Record>, op: &LogOp) -> bool {
    match op {
        LogOp::NewRecord { key, kind } => {
            table.insert(*key, Record::new(*kind));
            true
        }
        LogOp::DestroyRecord { key } => table.remove(key).is_some(),
        LogOp::SetAttr { key, name, value } => match table.get_mut(key) {
            Some(record) => {
                record.set(name, value);
                true
            }
            None => false,
        },
        LogOp::DeleteAttr { key, name } => match table.get_mut(key) {
            Some(record) => {
                record.remove(name);
                true
            }
            None => false,
        },
    }
}

impl TransactionalLog {
    /// Open or create the log at `path` and replay it.
    ///
    /// A trailing partial or unverifiable line is discarded and the log is
    /// rotated so nothing is ever appended after it. An unverifiable line
    /// followed by further complete lines is reported as
    /// [`QueueError::Corrupt`].
    pub fn open(path: impl Into<PathBuf>, max_historical: u32) -> Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut table = BTreeMap::new();
        let mut sequence = None;
        let mut good_end = 0usize;
        let mut commits = 0usize;
        let mut torn = false;
        let mut pos = 0usize;
        let mut line_no = 0usize;

        while pos < bytes.len() {
            let Some(nl) = bytes[pos..].iter().position(|b| *b == b'\n') else {
                torn = true;
                break;
            };
            let next = pos + nl + 1;
            line_no += 1;

            let decoded = std::str::from_utf8(&bytes[pos..pos + nl])
                .map_err(|e| e.to_string())
                .and_then(entry::decode);

            let corrupt = |details: String| QueueError::Corrupt {
                path: path.display().to_string(),
                line: line_no,
                details,
            };

            match decoded {
                Ok(LogEntry::Header { sequence: seq, .. }) if sequence.is_none() => {
                    sequence = Some(seq);
                }
                Ok(LogEntry::Header { .. }) => {
                    return Err(corrupt("header in the middle of the log".to_string()));
                }
                Ok(LogEntry::Commit { .. }) if sequence.is_none() => {
                    return Err(corrupt("log does not start with a header".to_string()));
                }
                Ok(LogEntry::Commit { ops, .. }) => {
                    for op in &ops {
                        if !apply_op(&mut table, op) {
                            warn!(key = %op.key(), line = line_no, "Log entry references missing record, skipped");
                        }
                    }
                    commits += 1;
                }
                Err(details) => {
                    if bytes[next..].contains(&b'\n') {
                        return Err(corrupt(details));
                    }
                    warn!(line = line_no, details = %details, "Discarding unverifiable tail of log");
                    torn = true;
                    break;
                }
            }
            good_end = next;
            pos = next;
        }

        let fresh = sequence.is_none();
        if fresh {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)?;
            let header = entry::encode(&LogEntry::Header {
                sequence: 1,
                created_at: Utc::now(),
            })?;
            file.write_all(header.as_bytes())?;
            file.sync_all()?;
            sync_parent_dir(&path);
            good_end = header.len();
            torn = false;
            info!(path = %path.display(), "Created new job queue log");
        } else if torn {
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(good_end as u64)?;
            file.sync_all()?;
        }

        let file = OpenOptions::new().append(true).open(&path)?;
        let mut log = Self {
            path,
            file,
            len: good_end as u64,
            table,
            sequence: sequence.unwrap_or(1),
            max_historical,
            unsynced: false,
            commits_since_rotation: commits,
            recovered_torn_tail: torn,
        };

        info!(
            path = %log.path.display(),
            records = log.table.len(),
            commits,
            sequence = log.sequence,
            torn_tail = torn,
            "Replayed job queue log"
        );

        if torn {
            log.rotate()?;
        }
        Ok(log)
    }

    /// Log file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Historical sequence number of the live file.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// True if the last open found and discarded a torn tail.
    pub fn recovered_torn_tail(&self) -> bool {
        self.recovered_torn_tail
    }

    /// Commits appended since the last rotation.
    pub fn commits_since_rotation(&self) -> usize {
        self.commits_since_rotation
    }

    /// True when non-durable commits are waiting for a flush.
    pub fn has_unsynced(&self) -> bool {
        self.unsynced
    }

    /// Start staging a new transaction.
    pub fn begin(&self) -> Transaction {
        Transaction::new()
    }

    /// Persist a transaction as one entry and apply it to the table.
    ///
    /// On I/O failure the file is cut back to its previous length and
    /// nothing is applied.
    pub fn commit(&mut self, txn: Transaction, durable: bool) -> Result<()> {
        if txn.is_empty() {
            return Ok(());
        }
        let (ops, comment) = txn.into_parts();
        let entry = LogEntry::Commit {
            ops,
            comment,
            committed_at: Utc::now(),
        };
        let line = entry::encode(&entry)?;

        if let Err(e) = self.append(line.as_bytes(), durable) {
            let _ = self.file.set_len(self.len);
            return Err(QueueError::internal("commit", e));
        }
        self.len += line.len() as u64;
        self.commits_since_rotation += 1;

        if let LogEntry::Commit { ops, .. } = &entry {
            for op in ops {
                if !apply_op(&mut self.table, op) {
                    warn!(key = %op.key(), "Committed operation references missing record");
                }
            }
            debug!(ops = ops.len(), durable, "Committed transaction");
        }
        Ok(())
    }

    fn append(&mut self, bytes: &[u8], durable: bool) -> std::io::Result<()> {
        self.file.write_all(bytes)?;
        if durable {
            self.file.sync_data()?;
            self.unsynced = false;
        } else {
            self.unsynced = true;
        }
        Ok(())
    }

    /// Sync pending non-durable commits. Returns true if a sync happened.
    pub fn flush(&mut self) -> Result<bool> {
        if !self.unsynced {
            return Ok(false);
        }
        self.file
            .sync_data()
            .map_err(|e| QueueError::internal("flush", e))?;
        self.unsynced = false;
        Ok(true)
    }

    /// Committed record for `key`.
    pub fn get(&self, key: Key) -> Option<&Record> {
        self.table.get(&key)
    }

    /// Committed attribute value.
    pub fn get_attr(&self, key: Key, name: &str) -> Option<&str> {
        self.table.get(&key).and_then(|r| r.get(name))
    }

    /// True if `key` exists in committed state.
    pub fn contains(&self, key: Key) -> bool {
        self.table.contains_key(&key)
    }

    /// Number of committed records.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// True when the table holds no records.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Iterate committed records in key order.
    pub fn iter(&self) -> impl Iterator<Item = (Key, &Record)> {
        self.table.iter().map(|(k, r)| (*k, r))
    }

    /// Iterate committed records with keys at or after `start`.
    pub fn iter_from(&self, start: Key) -> impl Iterator<Item = (Key, &Record)> {
        self.table.range(start..).map(|(k, r)| (*k, r))
    }

    /// Iterate committed records with keys strictly after `after`, or from
    /// the start when `None`.
    pub fn iter_after(&self, after: Option<Key>) -> impl Iterator<Item = (Key, &Record)> {
        use std::ops::Bound;
        let lower = match after {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        self.table
            .range((lower, Bound::Unbounded))
            .map(|(k, r)| (*k, r))
    }

    /// Committed job records of one cluster.
    pub fn cluster_jobs(&self, cluster: i32) -> impl Iterator<Item = (Key, &Record)> {
        self.table
            .range(Key::job(cluster, 0)..=Key::job(cluster, i32::MAX))
            .map(|(k, r)| (*k, r))
    }

    /// Read-your-own-writes lookup: staged value first, committed second.
    pub fn lookup_in_transaction(
        &self,
        txn: Option<&Transaction>,
        key: Key,
        name: &str,
    ) -> Option<String> {
        if let Some(staged) = txn.and_then(|t| t.staged_attr(key, name)) {
            return staged.map(str::to_string);
        }
        self.get_attr(key, name).map(str::to_string)
    }

    /// Whether `key` exists once `txn` is taken into account.
    pub fn exists_in_transaction(&self, txn: Option<&Transaction>, key: Key) -> bool {
        txn.and_then(|t| t.staged_exists(key))
            .unwrap_or_else(|| self.contains(key))
    }

    /// The record for `key` as it would look if `txn` committed now.
    pub fn record_in_transaction(&self, txn: Option<&Transaction>, key: Key) -> Option<Record> {
        let mut view = BTreeMap::new();
        if let Some(record) = self.table.get(&key) {
            view.insert(key, record.clone());
        }
        if let Some(txn) = txn {
            for op in txn.ops().iter().filter(|op| op.key() == key) {
                apply_op(&mut view, op);
            }
        }
        view.remove(&key)
    }

    /// Rewrite the log as a snapshot of the committed table.
    pub fn rotate(&mut self) -> Result<()> {
        self.flush()?;
        self.save_historical()?;

        let next_sequence = self.sequence + 1;
        let tmp_path = with_suffix(&self.path, "tmp");
        {
            let tmp = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            let mut writer = BufWriter::new(tmp);
            let now = Utc::now();
            writer.write_all(
                entry::encode(&LogEntry::Header {
                    sequence: next_sequence,
                    created_at: now,
                })?
                .as_bytes(),
            )?;
            for (key, record) in &self.table {
                let mut ops = Vec::with_capacity(record.len() + 1);
                ops.push(LogOp::NewRecord {
                    key: *key,
                    kind: record.kind(),
                });
                ops.extend(record.iter().map(|(name, value)| LogOp::SetAttr {
                    key: *key,
                    name: name.to_string(),
                    value: value.to_string(),
                }));
                let line = entry::encode(&LogEntry::Commit {
                    ops,
                    comment: None,
                    committed_at: now,
                })?;
                writer.write_all(line.as_bytes())?;
            }
            writer.flush()?;
            writer
                .get_ref()
                .sync_all()
                .map_err(|e| QueueError::internal("rotate", e))?;
        }

        fs::rename(&tmp_path, &self.path)?;
        sync_parent_dir(&self.path);

        self.file = OpenOptions::new().append(true).open(&self.path)?;
        self.len = self.file.metadata()?.len();
        self.sequence = next_sequence;
        self.commits_since_rotation = 0;
        self.unsynced = false;

        info!(
            path = %self.path.display(),
            sequence = self.sequence,
            records = self.table.len(),
            "Rotated job queue log"
        );
        Ok(())
    }

    fn save_historical(&self) -> Result<()> {
        if self.max_historical == 0 {
            return Ok(());
        }
        let copy = with_suffix(&self.path, self.sequence);
        fs::copy(&self.path, &copy)?;

        if self.sequence > u64::from(self.max_historical) {
            let expired = with_suffix(&self.path, self.sequence - u64::from(self.max_historical));
            match fs::remove_file(&expired) {
                Ok(()) => debug!(path = %expired.display(), "Removed expired historical log"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %expired.display(), error = %e, "Failed to remove historical log"),
            }
        }
        Ok(())
    }
}
