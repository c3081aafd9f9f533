// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Entity model over the committed table.
//!
//! Records stay in the log's table; the model keeps only derived state:
//! per-cluster counters and factory, and a small per-job cache of the fields
//! read on hot paths (status, universe, owner). Jobs refer to their cluster
//! by id only. Attribute lookups on a job fall back to its cluster record
//! through [`ChainLookup`].

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use crate::attributes as attr;
use crate::expr::{self, AttrLookup, Value};
use crate::factory::{FactoryState, JobFactory};
use crate::log::{Key, Transaction, TransactionalLog};

/// Job status codes stored in `JobStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to run.
    Idle,
    /// Running.
    Running,
    /// Removed, waiting to leave the queue.
    Removed,
    /// Finished.
    Completed,
    /// Held.
    Held,
    /// Sending output back.
    TransferringOutput,
    /// Suspended.
    Suspended,
}

impl JobStatus {
    /// Stored code.
    pub fn code(self) -> i64 {
        match self {
            JobStatus::Idle => 1,
            JobStatus::Running => 2,
            JobStatus::Removed => 3,
            JobStatus::Completed => 4,
            JobStatus::Held => 5,
            JobStatus::TransferringOutput => 6,
            JobStatus::Suspended => 7,
        }
    }

    /// Decode a stored code.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(JobStatus::Idle),
            2 => Some(JobStatus::Running),
            3 => Some(JobStatus::Removed),
            4 => Some(JobStatus::Completed),
            5 => Some(JobStatus::Held),
            6 => Some(JobStatus::TransferringOutput),
            7 => Some(JobStatus::Suspended),
            _ => None,
        }
    }
}

/// Attribute lookup through a job's chain: its own record (with a
/// transaction's staged writes, if any), then its cluster record.
#[derive(Clone, Copy)]
pub struct ChainLookup<'a> {
    log: &'a TransactionalLog,
    txn: Option<&'a Transaction>,
    key: Key,
}

impl<'a> ChainLookup<'a> {
    /// Lookup over committed state.
    pub fn committed(log: &'a TransactionalLog, key: Key) -> Self {
        Self {
            log,
            txn: None,
            key,
        }
    }

    /// Lookup that sees `txn`'s staged writes first.
    pub fn in_transaction(log: &'a TransactionalLog, txn: Option<&'a Transaction>, key: Key) -> Self {
        Self { log, txn, key }
    }

    /// The record key this lookup starts from.
    pub fn key(&self) -> Key {
        self.key
    }

    /// Resolve `name` through the chain.
    pub fn get(&self, name: &str) -> Option<String> {
        resolve_attribute(self.log, self.txn, self.key, name)
    }

    /// Evaluate `name` as an expression in this scope.
    pub fn eval(&self, name: &str) -> Value {
        match self.get(name) {
            Some(text) => expr::eval_text(&text, self),
            None => Value::Undefined,
        }
    }
}

impl AttrLookup for ChainLookup<'_> {
    fn lookup(&self, name: &str) -> Option<String> {
        self.get(name)
    }
}

/// Look `name` up on `key`, falling back to the cluster record for jobs.
pub fn resolve_attribute(
    log: &TransactionalLog,
    txn: Option<&Transaction>,
    key: Key,
    name: &str,
) -> Option<String> {
    if let Some(value) = log.lookup_in_transaction(txn, key, name) {
        return Some(value);
    }
    if key.is_job() {
        return log.lookup_in_transaction(txn, Key::cluster(key.cluster), name);
    }
    None
}

/// Fields cached per job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobCache {
    /// Decoded `JobStatus`.
    pub status: Option<JobStatus>,
    /// `JobUniverse`.
    pub universe: Option<i64>,
    /// Unquoted `Owner`.
    pub owner: Option<String>,
}

impl JobCache {
    fn compute(scope: &ChainLookup<'_>) -> Self {
        Self {
            status: scope
                .eval(attr::JOB_STATUS)
                .as_int()
                .and_then(JobStatus::from_code),
            universe: scope.eval(attr::JOB_UNIVERSE).as_int(),
            owner: scope.eval(attr::OWNER).as_str().map(str::to_string),
        }
    }
}

/// Live counters of one cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClusterCounters {
    /// Attached jobs.
    pub num_procs: usize,
    /// Idle jobs.
    pub idle: usize,
    /// Running jobs.
    pub running: usize,
    /// Held jobs.
    pub held: usize,
}

impl ClusterCounters {
    fn adjust(&mut self, status: Option<JobStatus>, add: bool) {
        let slot = match status {
            Some(JobStatus::Idle) => &mut self.idle,
            Some(JobStatus::Running) | Some(JobStatus::TransferringOutput) => &mut self.running,
            Some(JobStatus::Held) => &mut self.held,
            _ => return,
        };
        if add {
            *slot += 1;
        } else {
            *slot = slot.saturating_sub(1);
        }
    }
}

/// Derived state of one cluster.
#[derive(Debug, Default)]
pub struct ClusterEntry {
    /// Counters.
    pub counters: ClusterCounters,
    /// Attached factory.
    pub factory: Option<JobFactory>,
}

/// Queue-wide totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueSummary {
    /// Job records.
    pub jobs: usize,
    /// Cluster records.
    pub clusters: usize,
    /// Idle jobs.
    pub idle: usize,
    /// Running jobs.
    pub running: usize,
    /// Held jobs.
    pub held: usize,
    /// Clusters with a factory still able to materialize.
    pub active_factories: usize,
}

/// Status change seen when a job is refreshed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    /// Status before.
    pub from: Option<JobStatus>,
    /// Status after.
    pub to: Option<JobStatus>,
}

/// Derived view of every cluster and job.
#[derive(Debug, Default)]
pub struct EntityModel {
    clusters: BTreeMap<i32, ClusterEntry>,
    jobs: BTreeMap<Key, JobCache>,
    owners: HashMap<String, usize>,
}

impl EntityModel {
    /// Empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the model from committed state.
    pub fn build(log: &TransactionalLog) -> Self {
        let mut model = Self::new();
        for (key, _) in log.iter() {
            if key.is_cluster() {
                model.ensure_cluster(key.cluster);
            } else if key.is_job() {
                model.attach_job(log, key);
            }
        }
        debug!(
            clusters = model.clusters.len(),
            jobs = model.jobs.len(),
            "Built entity model"
        );
        model
    }

    /// Cluster entry, created if missing.
    pub fn ensure_cluster(&mut self, cluster: i32) -> &mut ClusterEntry {
        self.clusters.entry(cluster).or_default()
    }

    /// Drop a cluster entry, stopping its factory's reader.
    pub fn remove_cluster(&mut self, cluster: i32) -> Option<ClusterEntry> {
        let mut entry = self.clusters.remove(&cluster)?;
        if let Some(factory) = entry.factory.as_mut() {
            factory.cancel_reader();
        }
        Some(entry)
    }

    /// Cluster entry.
    pub fn cluster(&self, cluster: i32) -> Option<&ClusterEntry> {
        self.clusters.get(&cluster)
    }

    /// Mutable cluster entry.
    pub fn cluster_mut(&mut self, cluster: i32) -> Option<&mut ClusterEntry> {
        self.clusters.get_mut(&cluster)
    }

    /// Cluster ids in order.
    pub fn cluster_ids(&self) -> Vec<i32> {
        self.clusters.keys().copied().collect()
    }

    /// The cluster's factory.
    pub fn factory_mut(&mut self, cluster: i32) -> Option<&mut JobFactory> {
        self.clusters.get_mut(&cluster)?.factory.as_mut()
    }

    /// State of the cluster's factory.
    pub fn factory_state(&self, cluster: i32) -> Option<FactoryState> {
        self.clusters
            .get(&cluster)?
            .factory
            .as_ref()
            .map(JobFactory::state)
    }

    /// Cached fields of a job.
    pub fn job(&self, key: Key) -> Option<&JobCache> {
        self.jobs.get(&key)
    }

    /// Attach a committed job (or refresh it if already attached).
    pub fn attach_job(&mut self, log: &TransactionalLog, key: Key) {
        if self.jobs.contains_key(&key) {
            self.refresh_job(log, key);
            return;
        }
        let cache = JobCache::compute(&ChainLookup::committed(log, key));
        let entry = self.ensure_cluster(key.cluster);
        entry.counters.num_procs += 1;
        entry.counters.adjust(cache.status, true);
        if let Some(owner) = &cache.owner {
            *self.owners.entry(owner.clone()).or_default() += 1;
        }
        self.jobs.insert(key, cache);
    }

    /// Detach a destroyed job.
    pub fn detach_job(&mut self, key: Key) -> Option<JobCache> {
        let cache = self.jobs.remove(&key)?;
        if let Some(entry) = self.clusters.get_mut(&key.cluster) {
            entry.counters.num_procs = entry.counters.num_procs.saturating_sub(1);
            entry.counters.adjust(cache.status, false);
        }
        self.release_owner(cache.owner.as_deref());
        Some(cache)
    }

    /// Recompute a job's cache after its attributes changed.
    pub fn refresh_job(&mut self, log: &TransactionalLog, key: Key) -> Option<StatusChange> {
        let fresh = JobCache::compute(&ChainLookup::committed(log, key));
        let old = self.jobs.get(&key)?.clone();
        if old == fresh {
            return None;
        }
        if let Some(entry) = self.clusters.get_mut(&key.cluster) {
            entry.counters.adjust(old.status, false);
            entry.counters.adjust(fresh.status, true);
        }
        if old.owner != fresh.owner {
            self.release_owner(old.owner.as_deref());
            if let Some(owner) = &fresh.owner {
                *self.owners.entry(owner.clone()).or_default() += 1;
            }
        }
        let change = StatusChange {
            from: old.status,
            to: fresh.status,
        };
        self.jobs.insert(key, fresh);
        (change.from != change.to).then_some(change)
    }

    /// Refresh every job of a cluster, after inherited attributes changed.
    pub fn refresh_cluster_jobs(&mut self, log: &TransactionalLog, cluster: i32) -> Vec<(Key, StatusChange)> {
        let keys: Vec<Key> = self
            .jobs
            .range(Key::job(cluster, 0)..=Key::job(cluster, i32::MAX))
            .map(|(k, _)| *k)
            .collect();
        keys.into_iter()
            .filter_map(|key| self.refresh_job(log, key).map(|c| (key, c)))
            .collect()
    }

    fn release_owner(&mut self, owner: Option<&str>) {
        let Some(owner) = owner else {
            return;
        };
        if let Some(count) = self.owners.get_mut(owner) {
            *count -= 1;
            if *count == 0 {
                self.owners.remove(owner);
            }
        }
    }

    /// Jobs currently owned by `owner`.
    pub fn owner_count(&self, owner: &str) -> usize {
        self.owners.get(owner).copied().unwrap_or(0)
    }

    /// Owners with at least one job.
    pub fn owners(&self) -> impl Iterator<Item = &str> {
        self.owners.keys().map(String::as_str)
    }

    /// Counters of one cluster.
    pub fn counters(&self, cluster: i32) -> Option<ClusterCounters> {
        self.clusters.get(&cluster).map(|c| c.counters)
    }

    /// Number of attached jobs.
    pub fn total_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// Queue-wide totals.
    pub fn summary(&self) -> QueueSummary {
        let mut summary = QueueSummary {
            jobs: self.jobs.len(),
            clusters: self.clusters.len(),
            ..QueueSummary::default()
        };
        for entry in self.clusters.values() {
            summary.idle += entry.counters.idle;
            summary.running += entry.counters.running;
            summary.held += entry.counters.held;
            if entry
                .factory
                .as_ref()
                .is_some_and(|f| !f.state().is_terminal())
            {
                summary.active_factories += 1;
            }
        }
        summary
    }

    /// Comparable snapshot of counters, factory states and job caches.
    pub fn snapshot(&self) -> ModelSnapshot {
        ModelSnapshot {
            clusters: self
                .clusters
                .iter()
                .map(|(id, e)| (*id, e.counters, e.factory.as_ref().map(JobFactory::state)))
                .collect(),
            jobs: self.jobs.iter().map(|(k, c)| (*k, c.clone())).collect(),
        }
    }
}

/// Plain-data copy of an [`EntityModel`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelSnapshot {
    /// Per cluster: counters and factory state.
    pub clusters: Vec<(i32, ClusterCounters, Option<FactoryState>)>,
    /// Per job: cached fields.
    pub jobs: Vec<(Key, JobCache)>,
}

/// A resumable, time-boxed scan over job records.
///
/// Each call to [`JobScan::next_batch`] walks forward from where the last
/// one stopped and returns after `max_matches` hits, `max_misses`
/// consecutive misses, or when the time budget is spent. Records added or
/// removed between batches are seen or skipped depending on their key.
#[derive(Debug, Clone)]
pub struct JobScan {
    after: Option<Key>,
    budget: Duration,
    max_misses: usize,
    finished: bool,
}

/// One batch of scan results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanBatch {
    /// Matching job keys in key order.
    pub matches: Vec<Key>,
    /// True when the scan reached the end of the table.
    pub finished: bool,
}

impl JobScan {
    /// New scan from the start of the table.
    pub fn new(budget: Duration, max_misses: usize) -> Self {
        Self {
            after: None,
            budget,
            max_misses: max_misses.max(1),
            finished: false,
        }
    }

    /// Continue a scan after `after`, the position an earlier batch
    /// stopped at.
    pub fn resume_after(mut self, after: Option<Key>) -> Self {
        self.after = after;
        self
    }

    /// True once the end of the table has been reached.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Last key examined.
    pub fn position(&self) -> Option<Key> {
        self.after
    }

    /// Scan forward, collecting jobs for which `matches` returns true.
    pub fn next_batch(
        &mut self,
        log: &TransactionalLog,
        max_matches: usize,
        mut matches: impl FnMut(&ChainLookup<'_>) -> bool,
    ) -> ScanBatch {
        let mut batch = ScanBatch::default();
        if self.finished {
            batch.finished = true;
            return batch;
        }
        let started = Instant::now();
        let mut misses = 0usize;
        for (key, _) in log.iter_after(self.after) {
            self.after = Some(key);
            if !key.is_job() {
                continue;
            }
            if matches(&ChainLookup::committed(log, key)) {
                batch.matches.push(key);
                misses = 0;
                if batch.matches.len() >= max_matches.max(1) {
                    return batch;
                }
            } else {
                misses += 1;
                if misses >= self.max_misses {
                    return batch;
                }
            }
            if started.elapsed() >= self.budget {
                return batch;
            }
        }
        self.finished = true;
        batch.finished = true;
        batch
    }
}
