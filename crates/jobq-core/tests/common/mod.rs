// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for jobq-core integration tests.
//!
//! Provides TestQueue: a spool directory in a temp dir plus a queue opened
//! on it, with helpers to reopen it as after a crash.

#![allow(dead_code)]

use std::path::PathBuf;

use tempfile::TempDir;

use jobq_core::config::QueueConfig;
use jobq_core::connection::{ConnectionId, ConnectionInfo};
use jobq_core::queue::{JobQueue, SetFlags};

/// Test context owning a spool directory and the queue opened on it.
pub struct TestQueue {
    pub dir: TempDir,
    pub config: QueueConfig,
    pub queue: JobQueue,
}

impl TestQueue {
    /// Open a queue with default settings and cluster ids starting at 100.
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Open a queue after letting `tweak` adjust the configuration.
    pub fn with_config(tweak: impl FnOnce(&mut QueueConfig)) -> Self {
        let dir = TempDir::new().expect("Failed to create spool dir");
        let mut config = QueueConfig::new(dir.path());
        config.cluster_initial_value = 100;
        tweak(&mut config);
        let queue = JobQueue::open(config.clone()).expect("Failed to open queue");
        Self { dir, config, queue }
    }

    /// Drop the in-memory queue and replay the log from disk.
    pub fn reopen(&mut self) {
        self.queue = JobQueue::open(self.config.clone()).expect("Failed to reopen queue");
    }

    /// Path of the live log.
    pub fn log_path(&self) -> PathBuf {
        self.config.log_path()
    }

    /// Connect an authenticated user.
    pub fn user(&mut self, name: &str) -> ConnectionId {
        self.queue.connect(ConnectionInfo::user(name))
    }

    /// Submit a cluster of `procs` jobs owned by `owner`; returns its id.
    pub fn submit(&mut self, owner: &str, procs: usize) -> i32 {
        let conn = self.user(owner);
        self.queue.begin_transaction(conn).expect("begin");
        let cluster = self.queue.new_cluster(conn).expect("new cluster");
        for _ in 0..procs {
            self.queue.new_proc(conn, cluster).expect("new proc");
        }
        self.queue.commit_transaction(conn, true).expect("commit");
        self.queue.disconnect(conn);
        cluster
    }

    /// Set an attribute durably, panicking on failure.
    pub fn set(&mut self, conn: ConnectionId, cluster: i32, proc: i32, name: &str, value: &str) {
        self.queue
            .set_attribute(conn, cluster, proc, name, value, SetFlags::default())
            .unwrap_or_else(|e| panic!("set {} on {}.{}: {}", name, cluster, proc, e));
    }
}
