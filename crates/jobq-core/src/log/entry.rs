// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! On-disk entry format.
//!
//! Each entry is one line: `<sha256-hex> <json>\n`. The digest covers the
//! JSON payload. A line is committed only when it is complete (newline
//! present) and its digest matches, so a partially written entry is never
//! replayed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::record::{Key, RecordType};

/// A single staged mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LogOp {
    /// Create an empty record.
    NewRecord {
        /// Record key.
        key: Key,
        /// Record kind.
        kind: RecordType,
    },
    /// Remove a record and all its attributes.
    DestroyRecord {
        /// Record key.
        key: Key,
    },
    /// Set one attribute to expression text.
    SetAttr {
        /// Record key.
        key: Key,
        /// Attribute name.
        name: String,
        /// Expression text.
        value: String,
    },
    /// Remove one attribute.
    DeleteAttr {
        /// Record key.
        key: Key,
        /// Attribute name.
        name: String,
    },
}

impl LogOp {
    /// The record this operation touches.
    pub fn key(&self) -> Key {
        match self {
            LogOp::NewRecord { key, .. }
            | LogOp::DestroyRecord { key }
            | LogOp::SetAttr { key, .. }
            | LogOp::DeleteAttr { key, .. } => *key,
        }
    }
}

/// One line of the log file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEntry {
    /// First line of every log file.
    Header {
        /// Historical sequence number, bumped on every rotation.
        sequence: u64,
        /// When this file was started.
        created_at: DateTime<Utc>,
    },
    /// A committed transaction.
    Commit {
        /// Operations in staging order.
        ops: Vec<LogOp>,
        /// Free-form note.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        comment: Option<String>,
        /// Commit time.
        committed_at: DateTime<Utc>,
    },
}

fn digest_hex(payload: &str) -> String {
    format!("{:x}", Sha256::digest(payload.as_bytes()))
}

/// Encode an entry as a framed line including the trailing newline.
pub fn encode(entry: &LogEntry) -> Result<String, serde_json::Error> {
    let payload = serde_json::to_string(entry)?;
    let mut line = digest_hex(&payload);
    line.reserve(payload.len() + 2);
    line.push(' ');
    line.push_str(&payload);
    line.push('\n');
    Ok(line)
}

/// Decode one line (without its newline).
pub fn decode(line: &str) -> Result<LogEntry, String> {
    let (digest, payload) = line
        .split_once(' ')
        .ok_or_else(|| "missing digest separator".to_string())?;
    if digest_hex(payload) != digest {
        return Err("digest mismatch".to_string());
    }
    serde_json::from_str(payload).map_err(|e| format!("bad entry: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> LogEntry {
        LogEntry::Commit {
            ops: vec![
                LogOp::NewRecord {
                    key: Key::job(100, 0),
                    kind: RecordType::Job,
                },
                LogOp::SetAttr {
                    key: Key::job(100, 0),
                    name: "Cmd".to_string(),
                    value: "\"/bin/sleep\"".to_string(),
                },
            ],
            comment: None,
            committed_at: Utc::now(),
        }
    }

    #[test]
    fn test_encoded_line_is_framed() {
        let entry = sample();
        let line = encode(&entry).unwrap();
        assert!(line.ends_with('\n'));
        let (digest, payload) = line.trim_end().split_once(' ').unwrap();
        assert_eq!(digest.len(), 64);
        assert!(payload.contains("\"op\":\"new_record\""));
        assert_eq!(decode(line.trim_end()).unwrap(), entry);
    }

    #[test]
    fn test_tampered_payload_is_rejected() {
        let line = encode(&sample()).unwrap();
        let tampered = line.trim_end().replace("sleep", "sheep");
        assert_eq!(decode(&tampered).unwrap_err(), "digest mismatch");
        assert!(decode("no-separator").is_err());

        let truncated = &line[..line.len() / 2];
        assert!(decode(truncated).is_err());
    }

    #[test]
    fn test_op_key() {
        let op = LogOp::DeleteAttr {
            key: Key::cluster(5),
            name: "Foo".to_string(),
        };
        assert_eq!(op.key(), Key::cluster(5));
    }
}
