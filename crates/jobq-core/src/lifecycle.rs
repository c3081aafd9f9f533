// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster lifecycle: per-cluster job counts and deferred cleanup.
//!
//! The size index counts job records per cluster, including jobs created or
//! destroyed by transactions that are still open. It is a cache: after any
//! abort it is rebuilt from committed state plus the remaining open
//! transactions instead of being patched.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::factory::FactoryState;
use crate::log::{Transaction, TransactionalLog};

/// Job counts per cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterSizeIndex {
    sizes: HashMap<i32, usize>,
}

impl ClusterSizeIndex {
    /// Empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Recount from committed state plus open transactions.
    pub fn rebuild<'a>(log: &TransactionalLog, open: impl IntoIterator<Item = &'a Transaction>) -> Self {
        let mut sizes: HashMap<i32, usize> = HashMap::new();
        for (key, _) in log.iter() {
            if key.is_job() {
                *sizes.entry(key.cluster).or_default() += 1;
            }
        }
        for txn in open {
            for key in txn.created_keys() {
                if key.is_job() && !log.contains(key) {
                    *sizes.entry(key.cluster).or_default() += 1;
                }
            }
            for key in txn.destroyed_keys() {
                if key.is_job() && log.contains(key) {
                    if let Some(size) = sizes.get_mut(&key.cluster) {
                        *size = size.saturating_sub(1);
                    }
                }
            }
        }
        debug!(clusters = sizes.len(), "Rebuilt cluster size index");
        Self { sizes }
    }

    /// Count one more job.
    pub fn increment(&mut self, cluster: i32) -> usize {
        let size = self.sizes.entry(cluster).or_default();
        *size += 1;
        *size
    }

    /// Count one job less. Returns the new size.
    pub fn decrement(&mut self, cluster: i32) -> usize {
        let size = self.sizes.entry(cluster).or_default();
        *size = size.saturating_sub(1);
        *size
    }

    /// Current size.
    pub fn get(&self, cluster: i32) -> usize {
        self.sizes.get(&cluster).copied().unwrap_or(0)
    }

    /// Forget a cluster.
    pub fn remove(&mut self, cluster: i32) {
        self.sizes.remove(&cluster);
    }
}

/// What to do with a cluster whose size just changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Still has jobs.
    Alive,
    /// Empty and nothing will refill it.
    DestroyNow,
    /// Empty, but a live factory may still materialize into it.
    Deferred,
}

/// Decide the fate of a cluster of `size` jobs.
pub fn disposition(size: usize, factory: Option<FactoryState>) -> Disposition {
    if size > 0 {
        return Disposition::Alive;
    }
    match factory {
        Some(state) if !state.is_terminal() => Disposition::Deferred,
        _ => Disposition::DestroyNow,
    }
}

/// Clusters waiting for a deferred removal check.
#[derive(Debug, Clone, Default)]
pub struct DeferredCleanup {
    due: BTreeMap<i32, Instant>,
}

impl DeferredCleanup {
    /// Nothing scheduled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a check of `cluster` after `delay`. An existing schedule is
    /// kept.
    pub fn schedule(&mut self, cluster: i32, delay: Duration) {
        self.due
            .entry(cluster)
            .or_insert_with(|| Instant::now() + delay);
    }

    /// Drop a pending check.
    pub fn cancel(&mut self, cluster: i32) -> bool {
        self.due.remove(&cluster).is_some()
    }

    /// Remove and return every cluster due at `now`.
    pub fn take_due(&mut self, now: Instant) -> Vec<i32> {
        let due: Vec<i32> = self
            .due
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(c, _)| *c)
            .collect();
        for cluster in &due {
            self.due.remove(cluster);
        }
        due
    }

    /// Earliest pending deadline.
    pub fn next_due(&self) -> Option<Instant> {
        self.due.values().min().copied()
    }

    /// True if `cluster` has a pending check.
    pub fn is_scheduled(&self, cluster: i32) -> bool {
        self.due.contains_key(&cluster)
    }

    /// Pending checks.
    pub fn len(&self) -> usize {
        self.due.len()
    }

    /// True when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.due.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{Key, LogOp, RecordType};
    use tempfile::TempDir;

    fn new_job(txn: &mut Transaction, key: Key) {
        txn.stage(LogOp::NewRecord {
            key,
            kind: RecordType::Job,
        });
    }

    #[test]
    fn test_rebuild_counts_committed_and_open() {
        let dir = TempDir::new().unwrap();
        let mut log = TransactionalLog::open(dir.path().join("q.log"), 0).unwrap();
        let mut txn = log.begin();
        txn.stage(LogOp::NewRecord {
            key: Key::cluster(1),
            kind: RecordType::Cluster,
        });
        new_job(&mut txn, Key::job(1, 0));
        new_job(&mut txn, Key::job(1, 1));
        log.commit(txn, true).unwrap();

        let mut open = Transaction::new();
        new_job(&mut open, Key::job(1, 2));
        open.stage(LogOp::DestroyRecord { key: Key::job(1, 0) });
        new_job(&mut open, Key::job(2, 0));

        let index = ClusterSizeIndex::rebuild(&log, [&open]);
        assert_eq!(index.get(1), 2);
        assert_eq!(index.get(2), 1);
        assert_eq!(ClusterSizeIndex::rebuild(&log, std::iter::empty()).get(1), 2);
    }

    #[test]
    fn test_increment_decrement() {
        let mut index = ClusterSizeIndex::new();
        assert_eq!(index.increment(5), 1);
        assert_eq!(index.increment(5), 2);
        assert_eq!(index.decrement(5), 1);
        assert_eq!(index.decrement(5), 0);
        assert_eq!(index.decrement(5), 0);
        index.remove(5);
        assert_eq!(index.get(5), 0);
    }

    #[test]
    fn test_disposition() {
        assert_eq!(disposition(2, None), Disposition::Alive);
        assert_eq!(disposition(0, None), Disposition::DestroyNow);
        assert_eq!(
            disposition(0, Some(FactoryState::NoMoreItems)),
            Disposition::DestroyNow
        );
        assert_eq!(disposition(0, Some(FactoryState::Running)), Disposition::Deferred);
        assert_eq!(disposition(0, Some(FactoryState::Held)), Disposition::Deferred);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_cleanup_due() {
        let mut cleanup = DeferredCleanup::new();
        cleanup.schedule(7, Duration::from_secs(2));
        cleanup.schedule(8, Duration::from_secs(5));
        assert!(cleanup.take_due(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(cleanup.take_due(Instant::now()), vec![7]);
        assert!(cleanup.is_scheduled(8));
        assert!(cleanup.cancel(8));
        assert!(cleanup.is_empty());
        assert_eq!(cleanup.next_due(), None);
    }
}
