// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! jobq-core - Persistent Job Queue
//!
//! This crate holds the job queue of a batch scheduler: every submitted job
//! and job group (cluster) lives here, persisted in an append-only
//! transactional log so the queue survives crashes with atomic,
//! all-or-nothing commits.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                    Clients (QueueClient handles)                     │
//! └──────────────────────────────────────────────────────────────────────┘
//!                                   │ mpsc + oneshot
//!                                   ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                  QueueRuntime owner task (tokio)                     │
//! │   requests │ log flush │ materialize │ cleanup │ watchdog │ rotation │
//! └──────────────────────────────────────────────────────────────────────┘
//!                                   │
//!                                   ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                              JobQueue                                │
//! │  mutation checks → ActiveTransaction → commit → model + side effects │
//! └──────────────────────────────────────────────────────────────────────┘
//!        │                    │                      │
//!        ▼                    ▼                      ▼
//! ┌──────────────┐   ┌─────────────────┐   ┌──────────────────────────┐
//! │TransactionalLog│ │  EntityModel    │   │ JobFactory per cluster   │
//! │ (JSON lines) │   │ counters/owners │   │ (template + item rows)   │
//! └──────────────┘   └─────────────────┘   └──────────────────────────┘
//! ```
//!
//! # Records
//!
//! | Key | Record |
//! |-----|--------|
//! | `0.0` | Queue header (`NextClusterNum`, `SpoolVersion`) |
//! | `C.-1` | Cluster: attributes shared by its jobs |
//! | `C.P` | Job: its own attributes, falling back to the cluster |
//!
//! # Job Status Codes
//!
//! | Status | Code |
//! |--------|------|
//! | `Idle` | 1 |
//! | `Running` | 2 |
//! | `Removed` | 3 |
//! | `Completed` | 4 |
//! | `Held` | 5 |
//! | `TransferringOutput` | 6 |
//! | `Suspended` | 7 |
//!
//! # Configuration
//!
//! [`config::QueueConfig::from_env`] reads `JOBQ_*` environment variables;
//! `JOBQ_SPOOL_DIR` is required.
//!
//! # Modules
//!
//! - [`log`]: transactional log, records and keys
//! - [`expr`]: attribute expression language
//! - [`attributes`]: well-known names and their categories
//! - [`model`]: entity model, inheritance lookup, job scans
//! - [`mutation`]: security and consistency checks for writes
//! - [`queue`]: the queue itself (transactions, operations, maintenance)
//! - [`factory`]: late materialization templates and item readers
//! - [`lifecycle`]: cluster refcounts and deferred cleanup
//! - [`runtime`] / [`client`]: async owner task and client handles

#![deny(missing_docs)]

/// Well-known attribute names and their categories.
pub mod attributes;

/// Client handles and the remote operation trait.
pub mod client;

/// Queue configuration loaded from environment variables.
pub mod config;

/// Per-connection session state.
pub mod connection;

/// Error types with stable error codes.
pub mod error;

/// Attribute expressions.
pub mod expr;

/// Job factories for late materialization.
pub mod factory;

/// Cluster reference counting and deferred cleanup.
pub mod lifecycle;

/// Append-only transactional log.
pub mod log;

/// Entity model over the log.
pub mod model;

/// Write checks.
pub mod mutation;

/// The job queue.
pub mod queue;

/// Rounding of attribute values.
pub mod rounding;

/// Embeddable async runtime.
pub mod runtime;

/// Per-cluster side files.
pub mod spool;

pub use client::{QueueClient, QueueManagement};
pub use config::QueueConfig;
pub use connection::{ConnectionId, ConnectionInfo};
pub use error::{ErrorKind, QueueError, Result};
pub use log::Key;
pub use queue::{DestroyOutcome, JobPage, JobQueue, SetFlags};
pub use runtime::QueueRuntime;
