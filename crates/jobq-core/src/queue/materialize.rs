// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Late materialization and periodic maintenance.
//!
//! The runtime calls these from its timers: materialization passes,
//! deferred cluster cleanup, delayed log flushes, idle transaction expiry
//! and log rotation.

use chrono::Utc;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::attributes::{self as attr, CategoryFlags};
use crate::error::{ErrorKind, QueueError, Result};
use crate::expr::{self, AttrLookup};
use crate::factory::{FactoryState, NextJob, PlannedJob};
use crate::lifecycle::{Disposition, disposition};
use crate::log::{Key, RecordType};
use crate::model::{ChainLookup, ClusterCounters};

use super::JobQueue;

/// Jobs one factory may create in a single materialization pass.
const MAX_PER_PASS: usize = 50;

/// When to try a factory again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryHint {
    /// Nothing more to do until something changes.
    None,
    /// Item data is still loading.
    Soon,
    /// A limit or the materialization policy stopped it.
    Later,
}

/// Result of one materialization attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaterializeOutcome {
    /// The job created, if any.
    pub created: Option<Key>,
    /// Retry hint.
    pub retry: RetryHint,
}

impl MaterializeOutcome {
    fn idle(retry: RetryHint) -> Self {
        Self { created: None, retry }
    }

    /// True if a job was created.
    pub fn is_created(&self) -> bool {
        self.created.is_some()
    }
}

/// Cluster attributes plus the live job counters, for materialization
/// constraints.
struct PolicyScope<'a> {
    base: &'a ChainLookup<'a>,
    counters: ClusterCounters,
}

impl AttrLookup for PolicyScope<'_> {
    fn lookup(&self, name: &str) -> Option<String> {
        let counter = match name.to_ascii_lowercase().as_str() {
            "jobsidle" => Some(self.counters.idle),
            "jobsrunning" => Some(self.counters.running),
            "jobsheld" => Some(self.counters.held),
            "jobsmaterialized" => Some(self.counters.num_procs),
            _ => None,
        };
        match counter {
            Some(n) => Some(n.to_string()),
            None => self.base.get(name),
        }
    }
}

impl JobQueue {
    // ========================================================================
    // Materialization
    // ========================================================================

    /// Try to create the next job of `cluster`'s factory.
    pub fn materialize_next(&mut self, cluster: i32) -> Result<MaterializeOutcome> {
        match self.model.factory_state(cluster) {
            Some(FactoryState::Running) => {}
            Some(FactoryState::Held) => return Ok(MaterializeOutcome::idle(RetryHint::Later)),
            _ => return Ok(MaterializeOutcome::idle(RetryHint::None)),
        }
        let cluster_key = Key::cluster(cluster);
        let Some(next_proc) = self
            .log
            .get_attr(cluster_key, attr::MATERIALIZE_NEXT_PROC_ID)
            .and_then(|v| v.trim().parse::<i32>().ok())
        else {
            warn!(cluster_id = cluster, "Factory cluster has no next proc id");
            self.set_factory_state(cluster, FactoryState::Invalid, Some("missing next proc id"))?;
            return Ok(MaterializeOutcome::idle(RetryHint::None));
        };
        if next_proc.max(0) as usize >= self.config.max_jobs_per_submission {
            info!(cluster_id = cluster, next_proc, "Factory reached the per-submission job limit");
            self.finish_factory(cluster, Some(next_proc.max(0) as usize))?;
            return Ok(MaterializeOutcome::idle(RetryHint::None));
        }

        let allowed = {
            let scope = ChainLookup::committed(&self.log, cluster_key);
            let cluster_limit = scope
                .eval(attr::MATERIALIZE_LIMIT)
                .as_int()
                .map_or(usize::MAX, |l| l.max(0) as usize);
            let limit = cluster_limit.min(self.config.max_materialize_per_cluster);
            let owner = scope.eval(attr::OWNER).as_str().map(str::to_string);
            let counters = self.model.counters(cluster).unwrap_or_default();
            if self.sizes.get(cluster) >= limit {
                debug!(cluster_id = cluster, limit, "Factory at materialize limit");
                false
            } else if owner.is_some_and(|o| self.model.owner_count(&o) >= self.config.max_jobs_per_owner) {
                debug!(cluster_id = cluster, "Factory owner at job limit");
                false
            } else if self.model.total_jobs() >= self.config.max_jobs_submitted {
                debug!(cluster_id = cluster, "Queue at job limit");
                false
            } else if let Some(constraint) = scope.get(attr::MATERIALIZE_CONSTRAINT) {
                let policy = PolicyScope {
                    base: &scope,
                    counters,
                };
                expr::eval_text(&constraint, &policy).is_true()
            } else if let Some(max_idle) = scope.eval(attr::MATERIALIZE_MAX_IDLE).as_int() {
                (counters.idle as i64) < max_idle
            } else {
                true
            }
        };
        if !allowed {
            return Ok(MaterializeOutcome::idle(RetryHint::Later));
        }

        let next_row = self
            .log
            .get_attr(cluster_key, attr::MATERIALIZE_NEXT_ROW)
            .and_then(|v| v.trim().parse::<usize>().ok());
        let Some(factory) = self.model.factory_mut(cluster) else {
            return Ok(MaterializeOutcome::idle(RetryHint::None));
        };
        let plan = factory.plan_next(next_proc, next_row);
        let total = factory.total_procs();

        match plan {
            NextJob::Pending => Ok(MaterializeOutcome::idle(RetryHint::Soon)),
            NextJob::Exhausted => {
                self.finish_factory(cluster, total.or(Some(next_proc.max(0) as usize)))?;
                Ok(MaterializeOutcome::idle(RetryHint::None))
            }
            NextJob::Failed(reason) => {
                warn!(cluster_id = cluster, reason = %reason, "Factory failed to plan a job");
                self.set_factory_state(cluster, FactoryState::Held, Some(&reason))?;
                Ok(MaterializeOutcome::idle(RetryHint::None))
            }
            NextJob::Create(job) => self.create_materialized(cluster, job, total),
        }
    }

    fn create_materialized(
        &mut self,
        cluster: i32,
        job: PlannedJob,
        total: Option<usize>,
    ) -> Result<MaterializeOutcome> {
        let key = Key::job(cluster, job.proc);
        let cluster_key = Key::cluster(cluster);
        if self.log.contains(key) {
            let reason = format!("job {} already exists", key);
            warn!(cluster_id = cluster, reason = %reason, "Factory cannot materialize");
            self.set_factory_state(cluster, FactoryState::Held, Some(&reason))?;
            return Ok(MaterializeOutcome::idle(RetryHint::None));
        }

        let now = Utc::now().timestamp().to_string();
        let global_id = self.global_job_id(key);
        let result = self.internal_transaction(false, |queue, active| {
            active.create(key, RecordType::Job);
            active.set(key, attr::CLUSTER_ID, cluster.to_string());
            active.set(key, attr::PROC_ID, job.proc.to_string());
            let mut has_status = false;
            for (name, value) in &job.attrs {
                let flags = queue.policy.classify(name);
                if flags.intersects(CategoryFlags::SECURE | CategoryFlags::JOB_ID) {
                    debug!(cluster_id = cluster, attr = %name, "Template attribute ignored");
                    continue;
                }
                has_status |= name.eq_ignore_ascii_case(attr::JOB_STATUS);
                active.set(key, name, value.clone());
            }
            if !has_status {
                active.set(key, attr::JOB_STATUS, "1");
            }
            active.set(key, attr::ENTERED_CURRENT_STATUS, now.clone());
            active.set(key, attr::Q_DATE, now.clone());
            active.set(key, attr::GLOBAL_JOB_ID, global_id);
            active.set(cluster_key, attr::MATERIALIZE_NEXT_PROC_ID, (job.proc + 1).to_string());
            if let Some(row) = job.next_row {
                active.set(cluster_key, attr::MATERIALIZE_NEXT_ROW, row.to_string());
            }
            if let Some(total) = total {
                active.set(cluster_key, attr::TOTAL_SUBMIT_PROCS, total.to_string());
            }
            queue.sizes.increment(cluster);
            Ok(())
        });
        match result {
            Ok(()) => {}
            Err(e)
                if e.kind() == ErrorKind::InvalidArgument
                    || matches!(e, QueueError::SubmitRequirementFailed { .. }) =>
            {
                warn!(cluster_id = cluster, error = %e, "Materialized job rejected");
                self.set_factory_state(cluster, FactoryState::Held, Some(&e.to_string()))?;
                return Ok(MaterializeOutcome::idle(RetryHint::None));
            }
            Err(e) => return Err(e),
        }

        self.cleanup.cancel(cluster);
        debug!(cluster_id = cluster, proc_id = job.proc, row = ?job.row, "Materialized job");
        Ok(MaterializeOutcome {
            created: Some(key),
            retry: RetryHint::None,
        })
    }

    /// Set a factory's state and persist it in the cluster record.
    fn set_factory_state(&mut self, cluster: i32, state: FactoryState, reason: Option<&str>) -> Result<()> {
        if let Some(factory) = self.model.factory_mut(cluster) {
            factory.pause(state, reason);
        }
        let key = Key::cluster(cluster);
        self.internal_transaction(false, |_, active| {
            active.set(key, attr::MATERIALIZE_PAUSED, state.code().to_string());
            if let Some(reason) = reason {
                active.set(key, attr::MATERIALIZE_PAUSE_REASON, expr::quote(reason));
            }
            Ok(())
        })
    }

    /// Mark a factory as done; an empty cluster is queued for cleanup.
    fn finish_factory(&mut self, cluster: i32, total: Option<usize>) -> Result<()> {
        if let Some(factory) = self.model.factory_mut(cluster) {
            factory.pause(FactoryState::NoMoreItems, None);
        }
        let key = Key::cluster(cluster);
        self.internal_transaction(false, |_, active| {
            active.set(key, attr::MATERIALIZE_PAUSED, FactoryState::NoMoreItems.code().to_string());
            if let Some(total) = total {
                active.set(key, attr::TOTAL_SUBMIT_PROCS, total.to_string());
            }
            Ok(())
        })?;
        info!(cluster_id = cluster, total, "Job factory finished");
        if self.sizes.get(cluster) == 0 {
            self.cleanup.schedule(cluster, std::time::Duration::ZERO);
        }
        Ok(())
    }

    /// Run every running factory until it stops or creates its share for
    /// this pass. Returns the number of jobs created.
    pub fn materialize_tick(&mut self) -> usize {
        self.materialize_wanted = false;
        let running: Vec<i32> = self
            .model
            .cluster_ids()
            .into_iter()
            .filter(|c| self.model.factory_state(*c) == Some(FactoryState::Running))
            .collect();
        let mut created = 0;
        for cluster in running {
            for _ in 0..MAX_PER_PASS {
                match self.materialize_next(cluster) {
                    Ok(outcome) if outcome.is_created() => created += 1,
                    Ok(_) => break,
                    Err(e) => {
                        warn!(cluster_id = cluster, error = %e, "Materialization failed");
                        break;
                    }
                }
            }
        }
        if created > 0 {
            debug!(created, "Materialization pass");
        }
        created
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Destroy clusters whose deferred cleanup is due and still empty.
    /// A running factory gets one more chance to materialize first.
    pub fn run_deferred_cleanup(&mut self, now: Instant) -> Result<usize> {
        self.retry_file_removals();
        let mut destroyed = 0;
        for cluster in self.cleanup.take_due(now) {
            let key = Key::cluster(cluster);
            if !self.log.contains(key) || self.sizes.get(cluster) > 0 {
                continue;
            }
            if self.model.factory_state(cluster) == Some(FactoryState::Running)
                && self.materialize_next(cluster)?.is_created()
            {
                continue;
            }
            match disposition(self.sizes.get(cluster), self.model.factory_state(cluster)) {
                Disposition::Alive => {}
                Disposition::Deferred => {
                    self.cleanup.schedule(cluster, self.config.deferred_cleanup_delay);
                }
                Disposition::DestroyNow => {
                    self.internal_transaction(true, |_, active| {
                        active.destroy(key);
                        active.destroyed_clusters.insert(cluster);
                        Ok(())
                    })?;
                    destroyed += 1;
                }
            }
        }
        Ok(destroyed)
    }

    fn retry_file_removals(&mut self) {
        let pending = std::mem::take(&mut self.pending_file_removals);
        for path in pending {
            if let Err(e) = self.spool.remove_file(&path) {
                debug!(path = %path.display(), error = %e, "Side file removal still failing");
                self.pending_file_removals.push(path);
            }
        }
    }

    /// When the next deferred cleanup is due.
    pub fn next_cleanup_due(&self) -> Option<Instant> {
        self.cleanup.next_due()
    }

    /// When unsynced non-durable commits must be flushed.
    pub fn flush_deadline(&self) -> Option<Instant> {
        self.flush_deadline
    }

    /// Sync the log if the flush deadline has passed.
    pub fn flush_if_due(&mut self, now: Instant) -> Result<bool> {
        match self.flush_deadline {
            Some(due) if due <= now => self.flush(),
            _ => Ok(false),
        }
    }

    /// Sync the log now.
    pub fn flush(&mut self) -> Result<bool> {
        self.flush_deadline = None;
        self.log.flush()
    }

    /// Abort transactions idle for longer than the configured timeout and
    /// drop connections that have gone quiet altogether.
    pub fn expire_idle_transactions(&mut self, now: Instant) -> usize {
        let timeout = self.config.transaction_idle_timeout;
        let expired: Vec<_> = self
            .connections
            .values()
            .filter(|c| c.txn.is_some() && now.duration_since(c.last_activity) >= timeout)
            .map(|c| c.id)
            .collect();
        for id in &expired {
            let Some(active) = self.connections.get_mut(id).and_then(|c| {
                c.active_cluster = None;
                c.next_proc = 0;
                c.txn.take()
            }) else {
                continue;
            };
            warn!(connection_id = %id, ops = active.transaction().len(), "Aborting idle transaction");
            self.abort_active(active);
        }

        let connection_timeout = self.config.connection_idle_timeout;
        let stale: Vec<_> = self
            .connections
            .values()
            .filter(|c| c.txn.is_none() && now.duration_since(c.last_activity) >= connection_timeout)
            .map(|c| c.id)
            .collect();
        for id in stale {
            info!(connection_id = %id, "Dropping idle connection");
            self.connections.remove(&id);
        }
        expired.len()
    }

    /// Rotate the log if the rotation interval has passed.
    pub fn maybe_rotate(&mut self, now: Instant) -> Result<bool> {
        if now.duration_since(self.last_rotation) < self.config.log_truncate_interval {
            return Ok(false);
        }
        self.rotate_log()?;
        Ok(true)
    }

    /// Rewrite the log as a snapshot of the current state.
    pub fn rotate_log(&mut self) -> Result<()> {
        self.flush()?;
        self.log.rotate()?;
        self.last_rotation = Instant::now();
        info!(sequence = self.log.sequence(), "Log rotated");
        Ok(())
    }
}
