// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transaction coordinator.
//!
//! A connection's open transaction is an [`ActiveTransaction`]: the staged
//! log operations plus everything the commit has to act on afterwards.
//! Commit runs submit transforms and requirements over new jobs, persists
//! through the log, brings the entity model up to date and then dispatches
//! side effects (factory pause and resume, factory loading, deferred
//! cleanup, side-file removal). Abort drops the staged state and rebuilds
//! the cluster size index.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::attributes::{self as attr, CategoryFlags};
use crate::error::{QueueError, Result};
use crate::expr;
use crate::factory::{FactoryState, JobFactory};
use crate::lifecycle::ClusterSizeIndex;
use crate::log::{Key, LogOp, RecordType, Transaction};
use crate::model::{ChainLookup, StatusChange};
use crate::mutation::PlannedWrite;

use super::JobQueue;

/// An open transaction and its pending side effects.
#[derive(Debug)]
pub struct ActiveTransaction {
    pub(crate) txn: Transaction,
    pub(crate) flags: CategoryFlags,
    pub(crate) started: Instant,
    /// Cluster attributes edited after submission, per cluster.
    pub(crate) edited_clusters: BTreeMap<i32, BTreeSet<String>>,
    /// Clusters whose materialization controls were written.
    pub(crate) materialize_touched: BTreeSet<i32>,
    /// Templates set in this transaction, loaded into factories at commit.
    pub(crate) factories: BTreeMap<i32, String>,
    /// Side files written while staging; removed again on abort.
    pub(crate) written_files: Vec<PathBuf>,
    /// Clusters whose records this transaction destroys.
    pub(crate) destroyed_clusters: BTreeSet<i32>,
    /// Clusters left empty with a live factory.
    pub(crate) emptied_clusters: BTreeSet<i32>,
    /// Factories that stop because their cluster was removed.
    pub(crate) removed_factories: BTreeSet<i32>,
    /// Jobs waiting for the finished-job hook.
    pub(crate) hook_jobs: Vec<Key>,
    /// Cluster ids allocated in this transaction.
    pub(crate) new_clusters: Vec<i32>,
}

impl ActiveTransaction {
    pub(crate) fn new(txn: Transaction) -> Self {
        Self {
            txn,
            flags: CategoryFlags::NONE,
            started: Instant::now(),
            edited_clusters: BTreeMap::new(),
            materialize_touched: BTreeSet::new(),
            factories: BTreeMap::new(),
            written_files: Vec::new(),
            destroyed_clusters: BTreeSet::new(),
            emptied_clusters: BTreeSet::new(),
            removed_factories: BTreeSet::new(),
            hook_jobs: Vec::new(),
            new_clusters: Vec::new(),
        }
    }

    /// Staged log operations.
    pub fn transaction(&self) -> &Transaction {
        &self.txn
    }

    /// Category flags raised so far.
    pub fn flags(&self) -> CategoryFlags {
        self.flags
    }

    /// When the transaction was opened.
    pub fn started(&self) -> Instant {
        self.started
    }

    /// Stage an internal attribute write.
    pub(crate) fn set(&mut self, key: Key, name: &str, value: impl Into<String>) {
        self.txn.stage(LogOp::SetAttr {
            key,
            name: name.to_string(),
            value: value.into(),
        });
    }

    pub(crate) fn create(&mut self, key: Key, kind: RecordType) {
        self.txn.stage(LogOp::NewRecord { key, kind });
        self.flags |= match kind {
            RecordType::Job => CategoryFlags::NEW_JOB,
            RecordType::Cluster => CategoryFlags::NEW_CLUSTER,
            RecordType::Header => CategoryFlags::NONE,
        };
    }

    pub(crate) fn destroy(&mut self, key: Key) {
        self.txn.stage(LogOp::DestroyRecord { key });
        if key.is_job() {
            self.flags |= CategoryFlags::DESTROYED_JOB;
        }
    }

    /// Stage a checked write and remember what it touched.
    pub(crate) fn apply(&mut self, key: Key, name: &str, planned: PlannedWrite) {
        if planned.ignored {
            return;
        }
        self.note(key, name, planned.flags);
        for (name, value) in planned.writes {
            self.set(key, &name, value);
        }
    }

    /// Stage a checked delete.
    pub(crate) fn apply_delete(&mut self, key: Key, name: &str, planned: PlannedWrite) {
        if planned.ignored {
            return;
        }
        self.note(key, name, planned.flags);
        self.txn.stage(LogOp::DeleteAttr {
            key,
            name: name.to_string(),
        });
    }

    fn note(&mut self, key: Key, name: &str, flags: CategoryFlags) {
        self.flags |= flags;
        if flags.contains(CategoryFlags::CLUSTER_EDITED) {
            self.edited_clusters
                .entry(key.cluster)
                .or_default()
                .insert(name.to_string());
        }
        if flags.contains(CategoryFlags::MATERIALIZE) && key.is_cluster() {
            self.materialize_touched.insert(key.cluster);
        }
    }
}

fn merge_names(existing: Option<&str>, added: &BTreeSet<String>) -> String {
    let mut names: Vec<String> = existing
        .and_then(expr::unquote)
        .map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    for name in added {
        if !names.iter().any(|n| n.eq_ignore_ascii_case(name)) {
            names.push(name.clone());
        }
    }
    expr::quote(&names.join(","))
}

impl JobQueue {
    /// Open transactions of connected clients.
    pub(crate) fn open_transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.connections
            .values()
            .filter_map(|c| c.txn.as_ref().map(|a| &a.txn))
    }

    /// Discard `active`. The size index is rebuilt from committed state and
    /// the transactions still open.
    pub(crate) fn abort_active(&mut self, active: ActiveTransaction) {
        for path in &active.written_files {
            if let Err(e) = self.spool.remove_file(path) {
                warn!(path = %path.display(), error = %e, "Failed to remove side file of aborted transaction");
                self.pending_file_removals.push(path.clone());
            }
        }
        let ops = active.txn.len();
        drop(active);
        self.sizes = ClusterSizeIndex::rebuild(&self.log, self.open_transactions());
        debug!(ops, "Aborted transaction");
    }

    fn apply_transforms(&self, active: &mut ActiveTransaction, new_jobs: &[Key]) {
        if self.config.submit_transforms.is_empty() {
            return;
        }
        for key in new_jobs {
            let mut writes = Vec::new();
            {
                let scope = ChainLookup::in_transaction(&self.log, Some(&active.txn), *key);
                for transform in &self.config.submit_transforms {
                    let applies = transform
                        .condition
                        .as_ref()
                        .is_none_or(|c| c.eval(&scope).is_true());
                    if applies {
                        writes.push((transform.attr.clone(), transform.expr.eval(&scope).to_string()));
                    }
                }
            }
            for (name, value) in writes {
                debug!(key = %key, attr = %name, "Applied submit transform");
                active.set(*key, &name, value);
            }
        }
    }

    fn check_requirements(&self, active: &ActiveTransaction, new_jobs: &[Key]) -> Result<()> {
        for key in new_jobs {
            let scope = ChainLookup::in_transaction(&self.log, Some(&active.txn), *key);
            for requirement in &self.config.submit_requirements {
                if !requirement.expr.eval(&scope).is_true() {
                    info!(key = %key, requirement = %requirement.name, "Submit requirement failed");
                    return Err(QueueError::SubmitRequirementFailed {
                        requirement: requirement.name.clone(),
                        key: key.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Commit `active`.
    ///
    /// On error nothing is applied and the transaction is aborted.
    pub(crate) fn commit_active(&mut self, mut active: ActiveTransaction, durable: bool) -> Result<()> {
        let new_jobs: Vec<Key> = active
            .txn
            .created_keys()
            .into_iter()
            .filter(Key::is_job)
            .collect();

        self.apply_transforms(&mut active, &new_jobs);
        if let Err(e) = self.check_requirements(&active, &new_jobs) {
            self.abort_active(active);
            return Err(e);
        }

        let edited: Vec<(i32, BTreeSet<String>)> = std::mem::take(&mut active.edited_clusters)
            .into_iter()
            .collect();
        for (cluster, names) in edited {
            let key = Key::cluster(cluster);
            if !self.log.contains(key) || active.destroyed_clusters.contains(&cluster) {
                continue;
            }
            let merged = merge_names(self.log.get_attr(key, attr::EDITED_CLUSTER_ATTRS), &names);
            active.set(key, attr::EDITED_CLUSTER_ATTRS, merged);
            active.edited_clusters.insert(cluster, names);
        }

        if !active.new_clusters.is_empty() {
            if !self.log.exists_in_transaction(Some(&active.txn), Key::HEADER) {
                active.create(Key::HEADER, RecordType::Header);
            }
            active.set(Key::HEADER, attr::NEXT_CLUSTER_NUM, self.next_cluster.to_string());
        }

        let touched = active.txn.touched_keys();
        let destroyed = active.txn.destroyed_keys();
        let ops = active.txn.len();
        let txn = std::mem::take(&mut active.txn);

        if let Err(e) = self.log.commit(txn, durable) {
            warn!(error = %e, ops, "Commit failed, transaction aborted");
            self.abort_active(active);
            return Err(e);
        }
        if !durable {
            let due = Instant::now() + self.config.log_flush_delay;
            self.flush_deadline = Some(self.flush_deadline.map_or(due, |d| d.min(due)));
        }

        let changes = self.apply_to_model(&touched, &destroyed, &active);
        self.dispatch(active, &new_jobs, &changes);
        debug!(ops, durable, "Committed transaction");
        Ok(())
    }

    fn apply_to_model(
        &mut self,
        touched: &BTreeSet<Key>,
        destroyed: &[Key],
        active: &ActiveTransaction,
    ) -> Vec<(Key, StatusChange)> {
        let mut changes = Vec::new();
        for key in destroyed {
            if self.log.contains(*key) {
                continue;
            }
            if key.is_job() {
                self.model.detach_job(*key);
            } else if key.is_cluster() {
                self.model.remove_cluster(key.cluster);
                self.sizes.remove(key.cluster);
                self.cleanup.cancel(key.cluster);
                info!(cluster_id = key.cluster, "Cluster destroyed");
            }
        }
        for key in touched {
            if !self.log.contains(*key) {
                continue;
            }
            if key.is_cluster() {
                self.model.ensure_cluster(key.cluster);
            } else if key.is_job() {
                if self.model.job(*key).is_some() {
                    if let Some(change) = self.model.refresh_job(&self.log, *key) {
                        changes.push((*key, change));
                    }
                } else {
                    self.model.attach_job(&self.log, *key);
                }
            }
        }
        for cluster in active.edited_clusters.keys() {
            changes.extend(self.model.refresh_cluster_jobs(&self.log, *cluster));
        }
        changes
    }

    fn dispatch(&mut self, active: ActiveTransaction, new_jobs: &[Key], changes: &[(Key, StatusChange)]) {
        let mut submitted: Vec<Key> = new_jobs.to_vec();
        submitted.extend(active.new_clusters.iter().map(|c| Key::cluster(*c)));
        for key in submitted {
            if let Some(owner) = ChainLookup::committed(&self.log, key)
                .get(attr::OWNER)
                .and_then(|v| expr::unquote(&v))
            {
                self.owner_history.insert(owner);
            }
        }

        for (key, change) in changes {
            if self.model.factory_state(key.cluster) == Some(FactoryState::Running) {
                debug!(key = %key, from = ?change.from, to = ?change.to, "Status change re-arms factory");
                self.materialize_wanted = true;
            }
        }

        for (cluster, template) in &active.factories {
            if !self.log.contains(Key::cluster(*cluster)) {
                continue;
            }
            let items_file = self
                .log
                .get_attr(Key::cluster(*cluster), attr::MATERIALIZE_ITEMS_FILE)
                .and_then(expr::unquote)
                .map(PathBuf::from);
            let factory = JobFactory::load(
                *cluster,
                template,
                items_file.as_deref(),
                self.spool.dir(),
                FactoryState::Running,
            );
            info!(cluster_id = cluster, state = %factory.state(), "Job factory attached");
            self.model.ensure_cluster(*cluster).factory = Some(factory);
            self.materialize_wanted = true;
        }

        for cluster in &active.materialize_touched {
            self.sync_factory_pause(*cluster);
        }

        for cluster in &active.removed_factories {
            if let Some(factory) = self.model.factory_mut(*cluster) {
                factory.pause(FactoryState::ClusterRemoved, None);
            }
        }

        for cluster in &active.destroyed_clusters {
            for path in self.spool.cluster_files(*cluster) {
                if let Err(e) = self.spool.remove_file(&path) {
                    warn!(cluster_id = cluster, path = %path.display(), error = %e, "Failed to remove side file, will retry");
                    self.pending_file_removals.push(path);
                }
            }
        }

        for cluster in &active.emptied_clusters {
            if self.log.contains(Key::cluster(*cluster)) && self.sizes.get(*cluster) == 0 {
                self.cleanup.schedule(*cluster, self.config.deferred_cleanup_delay);
                debug!(cluster_id = cluster, "Scheduled deferred cluster cleanup");
            }
        }

        for key in active.hook_jobs {
            if !self.finished_hook_jobs.contains(&key) {
                self.finished_hook_jobs.push(key);
            }
        }
    }

    /// Bring a factory's pause level in line with `JobMaterializePaused`.
    pub(crate) fn sync_factory_pause(&mut self, cluster: i32) {
        let key = Key::cluster(cluster);
        let code = self
            .log
            .get_attr(key, attr::MATERIALIZE_PAUSED)
            .and_then(|v| v.trim().parse::<i64>().ok());
        let reason = self
            .log
            .get_attr(key, attr::MATERIALIZE_PAUSE_REASON)
            .and_then(expr::unquote);
        let Some(factory) = self.model.factory_mut(cluster) else {
            return;
        };
        match code.and_then(FactoryState::from_code) {
            Some(FactoryState::Running) => {
                factory.resume();
            }
            Some(state) => {
                factory.pause(state, reason.as_deref());
            }
            None => {}
        }
        let actual = factory.state().code();
        self.materialize_wanted = true;
        if code != Some(actual) {
            debug!(cluster_id = cluster, stored = ?code, actual, "Restoring stored factory state");
            let restored = self.internal_transaction(false, |_, active| {
                active.set(key, attr::MATERIALIZE_PAUSED, actual.to_string());
                Ok(())
            });
            if let Err(e) = restored {
                warn!(cluster_id = cluster, error = %e, "Failed to restore stored factory state");
            }
        }
    }
}
