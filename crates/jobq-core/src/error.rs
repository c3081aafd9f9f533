// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for jobq-core.
//!
//! Every failure surfaced by the queue maps onto one [`ErrorKind`], so
//! submitters can tell a permission problem from a quota problem and react
//! (retry, abort, prompt).

use std::fmt;

/// Result type using QueueError
pub type Result<T> = std::result::Result<T, QueueError>;

/// Coarse classification of queue errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed attribute name or value.
    InvalidArgument,
    /// Ownership, immutable, protected or secure attribute violation.
    PermissionDenied,
    /// Unknown key or attribute.
    NotFound,
    /// A per-owner, per-submission, per-cluster or global ceiling was hit.
    QuotaExceeded,
    /// Collision with existing state (reused cluster id, open transaction).
    Conflict,
    /// The on-disk log could not be replayed.
    Corrupt,
    /// I/O failure or broken internal invariant.
    Internal,
}

/// Errors that can occur while operating on the job queue.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum QueueError {
    /// Attribute name or value failed syntax validation.
    InvalidArgument {
        /// The field (attribute name, parameter) that was rejected.
        field: String,
        /// Why it was rejected.
        message: String,
    },

    /// The acting identity is not allowed to perform the operation.
    PermissionDenied {
        /// The record the operation targeted, formatted as `cluster.proc`.
        key: String,
        /// Why permission was denied.
        reason: String,
    },

    /// A record or attribute does not exist.
    NotFound {
        /// Description of what was looked up.
        what: String,
    },

    /// A job-count ceiling was reached.
    QuotaExceeded {
        /// Which limit was hit.
        limit: String,
        /// The configured maximum.
        max: usize,
    },

    /// A new job failed a configured submit requirement at commit.
    SubmitRequirementFailed {
        /// Name of the requirement.
        requirement: String,
        /// The job that failed it, formatted as `cluster.proc`.
        key: String,
    },

    /// The request collides with existing state.
    Conflict {
        /// Description of the collision.
        message: String,
    },

    /// The persistent log contains an entry that cannot be replayed.
    Corrupt {
        /// Log file path.
        path: String,
        /// 1-based line number of the bad entry.
        line: usize,
        /// What was wrong with it.
        details: String,
    },

    /// Commit-time I/O failure or other internal error.
    Internal {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl QueueError {
    /// Build an `InvalidArgument` error.
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Build a `PermissionDenied` error.
    pub fn denied(key: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self::PermissionDenied {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    /// Build a `NotFound` error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Build an `Internal` error.
    pub fn internal(operation: impl Into<String>, details: impl fmt::Display) -> Self {
        Self::Internal {
            operation: operation.into(),
            details: details.to_string(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::PermissionDenied { .. } | Self::SubmitRequirementFailed { .. } => {
                ErrorKind::PermissionDenied
            }
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Corrupt { .. } => ErrorKind::Corrupt,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidArgument { .. } => "INVALID_ARGUMENT",
            Self::PermissionDenied { .. } => "PERMISSION_DENIED",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            Self::SubmitRequirementFailed { .. } => "SUBMIT_REQUIREMENT_FAILED",
            Self::Conflict { .. } => "CONFLICT",
            Self::Corrupt { .. } => "CORRUPT",
            Self::Internal { .. } => "INTERNAL",
        }
    }
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument { field, message } => {
                write!(f, "Invalid argument '{}': {}", field, message)
            }
            Self::PermissionDenied { key, reason } => {
                write!(f, "Permission denied for {}: {}", key, reason)
            }
            Self::NotFound { what } => write!(f, "{} not found", what),
            Self::QuotaExceeded { limit, max } => {
                write!(f, "Quota exceeded: {} (limit {})", limit, max)
            }
            Self::SubmitRequirementFailed { requirement, key } => {
                write!(
                    f,
                    "Job {} rejected by submit requirement '{}'",
                    key, requirement
                )
            }
            Self::Conflict { message } => write!(f, "Conflict: {}", message),
            Self::Corrupt {
                path,
                line,
                details,
            } => {
                write!(f, "Log '{}' is corrupt at line {}: {}", path, line, details)
            }
            Self::Internal { operation, details } => {
                write!(f, "Internal error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for QueueError {}

impl From<std::io::Error> for QueueError {
    fn from(err: std::io::Error) -> Self {
        QueueError::Internal {
            operation: "io".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Internal {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}
