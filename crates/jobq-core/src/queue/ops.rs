// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client operations on the queue.
//!
//! Each operation runs inside the connection's open transaction, or inside a
//! one-shot transaction committed before it returns when none is open.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::attributes as attr;
use crate::connection::{Connection, ConnectionId};
use crate::error::{ErrorKind, QueueError, Result};
use crate::expr;
use crate::factory::digest::{ItemSpec, SubmitDigest};
use crate::factory::{FactoryInfo, FactoryState};
use crate::lifecycle::{Disposition, disposition};
use crate::log::{Key, RecordType};
use crate::model::{ChainLookup, JobScan, JobStatus, QueueSummary, resolve_attribute};
use crate::mutation::user_name;

use super::{ActiveTransaction, JobQueue};

/// Consecutive misses after which a scan batch hands back its cursor.
const SCAN_MAX_MISSES: usize = 10_000;

/// One time-boxed slice of a constraint scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPage {
    /// Jobs found, or written, in this slice, in key order.
    pub keys: Vec<Key>,
    /// Pass back to continue the scan; `None` once the table is exhausted.
    pub resume_after: Option<Key>,
}

impl JobPage {
    /// True when nothing is left to scan.
    pub fn is_last(&self) -> bool {
        self.resume_after.is_none()
    }
}

/// Options for [`JobQueue::set_attribute`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetFlags {
    /// Commit without waiting for a sync when no transaction is open.
    pub non_durable: bool,
    /// Only run the checks; stage nothing.
    pub query_only: bool,
}

impl SetFlags {
    /// Non-durable write.
    pub fn non_durable() -> Self {
        Self {
            non_durable: true,
            ..Self::default()
        }
    }

    /// Check-only write.
    pub fn query_only() -> Self {
        Self {
            query_only: true,
            ..Self::default()
        }
    }
}

/// What [`JobQueue::destroy_proc`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestroyOutcome {
    /// The job record is gone.
    Destroyed,
    /// The job asked to stay in the queue.
    LeftInQueue,
    /// The job waits for the finished-job hook first.
    DeferredPendingHook,
}

fn active_mut(conn: &mut Connection) -> Result<&mut ActiveTransaction> {
    conn.txn
        .as_mut()
        .ok_or_else(|| QueueError::internal("stage", "no open transaction"))
}

fn now_epoch() -> String {
    Utc::now().timestamp().to_string()
}

impl JobQueue {
    // ========================================================================
    // Transactions
    // ========================================================================

    /// Open a transaction on `conn`.
    #[instrument(skip(self), fields(connection_id = %conn))]
    pub fn begin_transaction(&mut self, conn: ConnectionId) -> Result<()> {
        self.with_connection(conn, |queue, c| {
            if c.txn.is_some() {
                return Err(QueueError::Conflict {
                    message: "a transaction is already open".to_string(),
                });
            }
            c.txn = Some(ActiveTransaction::new(queue.log.begin()));
            Ok(())
        })
    }

    /// Commit the open transaction of `conn`. Ends the current submission.
    #[instrument(skip(self), fields(connection_id = %conn))]
    pub fn commit_transaction(&mut self, conn: ConnectionId, durable: bool) -> Result<()> {
        self.with_connection(conn, |queue, c| {
            let Some(active) = c.txn.take() else {
                return Ok(());
            };
            c.active_cluster = None;
            c.next_proc = 0;
            queue.commit_active(active, durable)
        })
    }

    /// Abort the open transaction of `conn`.
    #[instrument(skip(self), fields(connection_id = %conn))]
    pub fn abort_transaction(&mut self, conn: ConnectionId) -> Result<()> {
        self.with_connection(conn, |queue, c| {
            c.active_cluster = None;
            c.next_proc = 0;
            if let Some(active) = c.txn.take() {
                queue.abort_active(active);
            }
            Ok(())
        })
    }

    /// Run `f` in a transaction of the queue's own, committed on success.
    pub(crate) fn internal_transaction<T>(
        &mut self,
        durable: bool,
        f: impl FnOnce(&mut Self, &mut ActiveTransaction) -> Result<T>,
    ) -> Result<T> {
        let mut active = ActiveTransaction::new(self.log.begin());
        match f(self, &mut active) {
            Ok(value) => {
                self.commit_active(active, durable)?;
                Ok(value)
            }
            Err(e) => {
                self.abort_active(active);
                Err(e)
            }
        }
    }

    // ========================================================================
    // Submission
    // ========================================================================

    fn allocate_cluster_id(&mut self) -> i32 {
        let id = self.next_cluster;
        let mut next = id.saturating_add(self.config.cluster_increment.max(1));
        if self.config.cluster_max_value > 0 && next > self.config.cluster_max_value {
            info!(from = id, to = self.config.cluster_initial_value, "Cluster ids wrapped");
            next = self.config.cluster_initial_value;
        }
        self.next_cluster = next;
        id
    }

    fn cluster_id_in_use(&self, conn: &Connection, cluster: i32) -> bool {
        let key = Key::cluster(cluster);
        let staged_here = conn
            .txn
            .as_ref()
            .is_some_and(|a| a.txn.staged_exists(key).is_some());
        self.log.contains(key)
            || self.log.cluster_jobs(cluster).next().is_some()
            || staged_here
            || self
                .open_transactions()
                .any(|t| t.staged_exists(key).is_some())
    }

    pub(crate) fn global_job_id(&self, key: Key) -> String {
        expr::quote(&format!(
            "{}#{}.{}#{}",
            self.config.queue_name,
            key.cluster,
            key.proc,
            Utc::now().timestamp()
        ))
    }

    /// Start a submission: allocate a cluster id and create its record.
    #[instrument(skip(self), fields(connection_id = %conn))]
    pub fn new_cluster(&mut self, conn: ConnectionId) -> Result<i32> {
        self.with_connection(conn, |queue, c| {
            let identity = c
                .info
                .identity
                .clone()
                .filter(|_| c.info.authenticated)
                .ok_or_else(|| QueueError::denied("new cluster", "connection has no identity"))?;
            if queue.model.total_jobs() >= queue.config.max_jobs_submitted {
                return Err(QueueError::QuotaExceeded {
                    limit: "max_jobs_submitted".to_string(),
                    max: queue.config.max_jobs_submitted,
                });
            }
            queue.in_transaction(c, true, |queue, c| {
                let id = queue.allocate_cluster_id();
                if queue.cluster_id_in_use(c, id) {
                    return Err(QueueError::Conflict {
                        message: format!("cluster id {} is still in use", id),
                    });
                }
                let key = Key::cluster(id);
                let user = expr::quote(&user_name(&identity, false, &queue.config.uid_domain));
                let active = active_mut(c)?;
                active.create(key, RecordType::Cluster);
                active.set(key, attr::CLUSTER_ID, id.to_string());
                active.set(key, attr::OWNER, expr::quote(&identity));
                active.set(key, attr::USER, user);
                active.new_clusters.push(id);
                c.active_cluster = Some(id);
                c.next_proc = 0;
                info!(cluster_id = id, owner = %identity, "Cluster created");
                Ok(id)
            })
        })
    }

    /// Add a job to the active submission.
    #[instrument(skip(self), fields(connection_id = %conn, cluster_id = cluster))]
    pub fn new_proc(&mut self, conn: ConnectionId, cluster: i32) -> Result<i32> {
        self.with_connection(conn, |queue, c| {
            if c.active_cluster != Some(cluster) {
                return Err(QueueError::denied(
                    Key::cluster(cluster),
                    "not the active submission of this connection",
                ));
            }
            queue.in_transaction(c, true, |queue, c| {
                let proc = c.next_proc;
                let cluster_key = Key::cluster(cluster);
                let txn = c.txn.as_ref().map(|a| &a.txn);
                if !queue.log.exists_in_transaction(txn, cluster_key) {
                    return Err(QueueError::not_found(format!("cluster {}", cluster)));
                }
                if proc.max(0) as usize >= queue.config.max_jobs_per_submission {
                    return Err(QueueError::QuotaExceeded {
                        limit: "max_jobs_per_submission".to_string(),
                        max: queue.config.max_jobs_per_submission,
                    });
                }
                let own_pending = txn.map_or(0, |t| {
                    t.created_keys().into_iter().filter(Key::is_job).count()
                });
                let other_pending: usize = queue
                    .open_transactions()
                    .map(|t| t.created_keys().into_iter().filter(Key::is_job).count())
                    .sum();
                if queue.model.total_jobs() + own_pending + other_pending
                    >= queue.config.max_jobs_submitted
                {
                    return Err(QueueError::QuotaExceeded {
                        limit: "max_jobs_submitted".to_string(),
                        max: queue.config.max_jobs_submitted,
                    });
                }
                let owner = resolve_attribute(&queue.log, txn, cluster_key, attr::OWNER)
                    .and_then(|v| expr::unquote(&v))
                    .or_else(|| c.info.identity.clone());
                if let Some(owner) = &owner {
                    if queue.model.owner_count(owner) + own_pending >= queue.config.max_jobs_per_owner {
                        return Err(QueueError::QuotaExceeded {
                            limit: "max_jobs_per_owner".to_string(),
                            max: queue.config.max_jobs_per_owner,
                        });
                    }
                }

                let key = Key::job(cluster, proc);
                let global_id = queue.global_job_id(key);
                let active = active_mut(c)?;
                active.create(key, RecordType::Job);
                active.set(key, attr::CLUSTER_ID, cluster.to_string());
                active.set(key, attr::PROC_ID, proc.to_string());
                active.set(key, attr::GLOBAL_JOB_ID, global_id);
                active.set(key, attr::Q_DATE, now_epoch());
                queue.sizes.increment(cluster);
                c.next_proc += 1;
                debug!(cluster_id = cluster, proc_id = proc, "Job created");
                Ok(proc)
            })
        })
    }

    // ========================================================================
    // Attributes
    // ========================================================================

    /// Set an attribute on a job (`proc >= 0`) or cluster (`proc == -1`)
    /// record.
    #[instrument(skip(self, value), fields(connection_id = %conn, cluster_id = cluster, proc_id = proc))]
    pub fn set_attribute(
        &mut self,
        conn: ConnectionId,
        cluster: i32,
        proc: i32,
        name: &str,
        value: &str,
        flags: SetFlags,
    ) -> Result<()> {
        let key = Key::job(cluster, proc);
        self.with_connection(conn, |queue, c| {
            if flags.query_only {
                let actor = queue.actor(c);
                let ctx = queue.mutation_context(c.txn.as_ref().map(|a| &a.txn), &actor);
                ctx.check_set(key, name, value)?;
                return Ok(());
            }
            queue.in_transaction(c, !flags.non_durable, |queue, c| {
                let actor = queue.actor(c);
                let planned = queue
                    .mutation_context(c.txn.as_ref().map(|a| &a.txn), &actor)
                    .check_set(key, name, value)?;
                active_mut(c)?.apply(key, name, planned);
                Ok(())
            })
        })
    }

    /// Read an attribute, seeing the connection's own staged writes and
    /// falling back to the cluster record for jobs.
    pub fn get_attribute(
        &mut self,
        conn: ConnectionId,
        cluster: i32,
        proc: i32,
        name: &str,
    ) -> Result<String> {
        let key = Key::job(cluster, proc);
        self.with_connection(conn, |queue, c| {
            let txn = c.txn.as_ref().map(|a| &a.txn);
            if !queue.log.exists_in_transaction(txn, key) {
                return Err(QueueError::not_found(format!("record {}", key)));
            }
            resolve_attribute(&queue.log, txn, key, name)
                .ok_or_else(|| QueueError::not_found(format!("attribute {} of {}", name, key)))
        })
    }

    /// Remove an attribute from a record.
    #[instrument(skip(self), fields(connection_id = %conn, cluster_id = cluster, proc_id = proc))]
    pub fn delete_attribute(
        &mut self,
        conn: ConnectionId,
        cluster: i32,
        proc: i32,
        name: &str,
    ) -> Result<()> {
        let key = Key::job(cluster, proc);
        self.with_connection(conn, |queue, c| {
            queue.in_transaction(c, true, |queue, c| {
                let actor = queue.actor(c);
                let planned = queue
                    .mutation_context(c.txn.as_ref().map(|a| &a.txn), &actor)
                    .check_delete(key, name)?;
                active_mut(c)?.apply_delete(key, name, planned);
                Ok(())
            })
        })
    }

    /// Set `name = value` on the jobs matching `constraint` that the caller
    /// may modify, one scan slice at a time. Returns the jobs written and
    /// where to resume.
    #[instrument(skip(self, value), fields(connection_id = %conn))]
    pub fn set_attribute_by_constraint(
        &mut self,
        conn: ConnectionId,
        constraint: &str,
        name: &str,
        value: &str,
        after: Option<Key>,
    ) -> Result<JobPage> {
        let page = self.find_jobs(constraint, usize::MAX, after)?;
        self.with_connection(conn, |queue, c| {
            queue.in_transaction(c, true, |queue, c| {
                let actor = queue.actor(c);
                let mut written = Vec::new();
                for key in page.keys {
                    let planned = match queue
                        .mutation_context(c.txn.as_ref().map(|a| &a.txn), &actor)
                        .check_set(key, name, value)
                    {
                        Ok(planned) => planned,
                        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                            debug!(key = %key, error = %e, "Skipping job");
                            continue;
                        }
                        Err(e) => return Err(e),
                    };
                    active_mut(c)?.apply(key, name, planned);
                    written.push(key);
                }
                Ok(JobPage {
                    keys: written,
                    resume_after: page.resume_after,
                })
            })
        })
    }

    /// Committed jobs matching `constraint`, in key order, scanning from
    /// just past `after`.
    ///
    /// Returns after at most `limit` matches or one scan time slice,
    /// whichever comes first. A page may be short, even empty, while
    /// `resume_after` is still set.
    pub fn find_jobs(&self, constraint: &str, limit: usize, after: Option<Key>) -> Result<JobPage> {
        let filter = expr::parse(constraint)
            .map_err(|e| QueueError::invalid("constraint", e.to_string()))?;
        let mut scan = JobScan::new(self.config.scan_batch_time, SCAN_MAX_MISSES).resume_after(after);
        let batch = scan.next_batch(&self.log, limit, |scope| filter.eval(scope).is_true());
        Ok(JobPage {
            keys: batch.matches,
            resume_after: if batch.finished { None } else { scan.position() },
        })
    }

    /// Committed value of `name` through the job's chain.
    pub fn resolve_attribute(&self, key: Key, name: &str) -> Option<String> {
        resolve_attribute(&self.log, None, key, name)
    }

    // ========================================================================
    // Removal
    // ========================================================================

    /// Stage the removal of one job, following its completion, hook and
    /// leave-in-queue settings, and decide the fate of its cluster.
    pub(crate) fn destroy_job_in(
        &mut self,
        active: &mut ActiveTransaction,
        key: Key,
        honor_hook: bool,
    ) -> DestroyOutcome {
        let (needs_completion_date, hook_pending, leave) = {
            let txn = Some(&active.txn);
            let scope = ChainLookup::in_transaction(&self.log, txn, key);
            let status = scope.eval(attr::JOB_STATUS).as_int().and_then(JobStatus::from_code);
            (
                status == Some(JobStatus::Completed) && scope.get(attr::COMPLETION_DATE).is_none(),
                honor_hook
                    && self.config.job_finished_hook
                    && self.log.contains(key)
                    && self
                        .log
                        .lookup_in_transaction(txn, key, attr::JOB_FINISHED_HOOK_DONE)
                        .is_none(),
                scope.eval(attr::LEAVE_JOB_IN_QUEUE).is_true(),
            )
        };

        if needs_completion_date {
            active.set(key, attr::COMPLETION_DATE, now_epoch());
        }
        if hook_pending {
            debug!(key = %key, "Job removal waits for finished-job hook");
            active.hook_jobs.push(key);
            return DestroyOutcome::DeferredPendingHook;
        }
        if leave {
            return DestroyOutcome::LeftInQueue;
        }

        active.destroy(key);
        let cluster = key.cluster;
        let size = self.sizes.decrement(cluster);
        let factory = if active.factories.contains_key(&cluster) {
            Some(FactoryState::Running)
        } else {
            self.model.factory_state(cluster)
        };
        match disposition(size, factory) {
            Disposition::Alive => {}
            Disposition::DestroyNow => {
                let cluster_key = Key::cluster(cluster);
                if self.log.exists_in_transaction(Some(&active.txn), cluster_key) {
                    active.destroy(cluster_key);
                    active.destroyed_clusters.insert(cluster);
                }
            }
            Disposition::Deferred => {
                active.emptied_clusters.insert(cluster);
            }
        }
        DestroyOutcome::Destroyed
    }

    /// Remove a job.
    #[instrument(skip(self), fields(connection_id = %conn, cluster_id = cluster, proc_id = proc))]
    pub fn destroy_proc(&mut self, conn: ConnectionId, cluster: i32, proc: i32) -> Result<DestroyOutcome> {
        let key = Key::job(cluster, proc);
        self.with_connection(conn, |queue, c| {
            queue.in_transaction(c, true, |queue, c| {
                queue.check_record_access(c, key)?;
                let active = active_mut(c)?;
                Ok(queue.destroy_job_in(active, key, true))
            })
        })
    }

    /// Remove every job of a cluster, recording `reason` on each, and stop
    /// its factory. Jobs that ask to stay are kept. Returns the number of
    /// jobs removed.
    #[instrument(skip(self), fields(connection_id = %conn, cluster_id = cluster))]
    pub fn destroy_cluster(&mut self, conn: ConnectionId, cluster: i32, reason: &str) -> Result<usize> {
        let cluster_key = Key::cluster(cluster);
        self.with_connection(conn, |queue, c| {
            queue.in_transaction(c, true, |queue, c| {
                queue.check_record_access(c, cluster_key)?;
                let txn = c.txn.as_ref().map(|a| &a.txn);
                let mut jobs: Vec<Key> = queue.log.cluster_jobs(cluster).map(|(k, _)| k).collect();
                if let Some(txn) = txn {
                    jobs.extend(txn.created_keys().into_iter().filter(|k| k.is_job() && k.cluster == cluster));
                }
                jobs.sort();
                jobs.dedup();
                jobs.retain(|k| queue.log.exists_in_transaction(txn, *k));
                for key in &jobs {
                    queue.check_record_access(c, *key)?;
                }

                let reason_value = expr::quote(reason);
                let has_factory = queue
                    .model
                    .cluster(cluster)
                    .is_some_and(|e| e.factory.is_some());
                let active = active_mut(c)?;
                let has_factory = has_factory || active.factories.contains_key(&cluster);
                let mut removed = 0;
                for key in jobs {
                    let leave = ChainLookup::in_transaction(&queue.log, Some(&active.txn), key)
                        .eval(attr::LEAVE_JOB_IN_QUEUE)
                        .is_true();
                    if leave {
                        continue;
                    }
                    active.set(key, attr::REMOVE_REASON, reason_value.clone());
                    active.destroy(key);
                    queue.sizes.decrement(cluster);
                    removed += 1;
                }
                if queue.sizes.get(cluster) == 0 {
                    active.destroy(cluster_key);
                    active.destroyed_clusters.insert(cluster);
                } else if has_factory {
                    active.set(
                        cluster_key,
                        attr::MATERIALIZE_PAUSED,
                        FactoryState::ClusterRemoved.code().to_string(),
                    );
                    active.removed_factories.insert(cluster);
                }
                info!(cluster_id = cluster, removed, reason, "Cluster removal staged");
                Ok(removed)
            })
        })
    }

    /// Jobs whose removal waits for the finished-job hook. Each key is
    /// returned once.
    pub fn take_finished_hook_jobs(&mut self) -> Vec<Key> {
        std::mem::take(&mut self.finished_hook_jobs)
    }

    /// Record that the finished-job hook ran for `key` and remove the job.
    #[instrument(skip(self), fields(key = %key))]
    pub fn complete_finished_hook(&mut self, key: Key) -> Result<DestroyOutcome> {
        if !self.log.contains(key) || !key.is_job() {
            return Err(QueueError::not_found(format!("job {}", key)));
        }
        self.internal_transaction(true, |queue, active| {
            active.set(key, attr::JOB_FINISHED_HOOK_DONE, now_epoch());
            Ok(queue.destroy_job_in(active, key, false))
        })
    }

    /// Record exists in the caller's view and the caller may act on it.
    /// First proc id of `cluster` that no job, staged or committed, uses.
    fn first_free_proc(&self, c: &Connection, cluster: i32) -> i32 {
        let committed = self
            .log
            .cluster_jobs(cluster)
            .map(|(k, _)| k.proc + 1)
            .max()
            .unwrap_or(0);
        let staged = c
            .txn
            .as_ref()
            .map(|a| a.txn.created_keys())
            .unwrap_or_default()
            .into_iter()
            .filter(|k| k.is_job() && k.cluster == cluster)
            .map(|k| k.proc + 1)
            .max()
            .unwrap_or(0);
        let allocated = if c.active_cluster == Some(cluster) {
            c.next_proc
        } else {
            0
        };
        committed.max(staged).max(allocated)
    }

    fn check_record_access(&self, c: &Connection, key: Key) -> Result<()> {
        let txn = c.txn.as_ref().map(|a| &a.txn);
        if !self.log.exists_in_transaction(txn, key) {
            return Err(QueueError::not_found(format!("record {}", key)));
        }
        if self.log.contains(key) {
            let actor = self.actor(c);
            return self.mutation_context(txn, &actor).check_owner(key);
        }
        if c.active_cluster == Some(key.cluster) {
            Ok(())
        } else {
            Err(QueueError::denied(key, "outside the active submission"))
        }
    }

    // ========================================================================
    // Factories
    // ========================================================================

    /// Attach a job factory to a cluster. The template is stored in a side
    /// file; the factory starts materializing once the transaction commits.
    #[instrument(skip(self, template), fields(connection_id = %conn, cluster_id = cluster))]
    pub fn set_job_factory(&mut self, conn: ConnectionId, cluster: i32, template: &str) -> Result<()> {
        let cluster_key = Key::cluster(cluster);
        self.with_connection(conn, |queue, c| {
            queue.in_transaction(c, true, |queue, c| {
                queue.check_record_access(c, cluster_key)?;
                let attached = queue
                    .model
                    .cluster(cluster)
                    .is_some_and(|e| e.factory.is_some())
                    || c.txn.as_ref().is_some_and(|a| a.factories.contains_key(&cluster));
                if attached {
                    return Err(QueueError::Conflict {
                        message: format!("cluster {} already has a job factory", cluster),
                    });
                }
                let digest = SubmitDigest::parse(template)
                    .map_err(|e| QueueError::invalid("template", e.to_string()))?;
                if let ItemSpec::File(path) = &digest.queue().items {
                    let resolved = if path.is_absolute() {
                        path.clone()
                    } else {
                        queue.spool.dir().join(path)
                    };
                    if !queue.spool.contains(&resolved) {
                        return Err(QueueError::denied(cluster_key, "item file outside the spool"));
                    }
                }

                let next_proc = queue.first_free_proc(c, cluster);
                let actor = queue.actor(c);
                let mut planned = Vec::new();
                {
                    let ctx = queue.mutation_context(c.txn.as_ref().map(|a| &a.txn), &actor);
                    for (name, value) in digest.cluster_attrs() {
                        let write = ctx.check_set(cluster_key, &name, &value)?;
                        planned.push((name, write));
                    }
                }

                let path = queue
                    .spool
                    .write_digest(cluster, template)
                    .map_err(|e| QueueError::internal("write template", e))?;
                let active = active_mut(c)?;
                active.written_files.push(path.clone());
                active.set(
                    cluster_key,
                    attr::MATERIALIZE_DIGEST_FILE,
                    expr::quote(&path.to_string_lossy()),
                );
                active.set(cluster_key, attr::MATERIALIZE_NEXT_PROC_ID, next_proc.to_string());
                if next_proc > 0 && digest.queue().has_items() {
                    let row = digest.queue().row_for_proc(next_proc as u32);
                    active.set(cluster_key, attr::MATERIALIZE_NEXT_ROW, row.to_string());
                }
                active.set(
                    cluster_key,
                    attr::MATERIALIZE_PAUSED,
                    FactoryState::Running.code().to_string(),
                );
                for (name, write) in planned {
                    active.apply(cluster_key, &name, write);
                }
                active.factories.insert(cluster, template.to_string());
                info!(cluster_id = cluster, step = digest.queue().step, "Job factory staged");
                Ok(())
            })
        })
    }

    /// Store item rows for a cluster's factory. Must come before the
    /// factory is committed. Returns the number of rows kept.
    #[instrument(skip(self, rows), fields(connection_id = %conn, cluster_id = cluster))]
    pub fn send_materialize_item_data(
        &mut self,
        conn: ConnectionId,
        cluster: i32,
        rows: Vec<String>,
    ) -> Result<usize> {
        let cluster_key = Key::cluster(cluster);
        self.with_connection(conn, |queue, c| {
            queue.in_transaction(c, true, |queue, c| {
                queue.check_record_access(c, cluster_key)?;
                if queue.model.cluster(cluster).is_some_and(|e| e.factory.is_some()) {
                    return Err(QueueError::Conflict {
                        message: format!("job factory of cluster {} is already running", cluster),
                    });
                }
                let rows: Vec<String> = rows.into_iter().filter(|r| !r.trim().is_empty()).collect();
                let path = queue
                    .spool
                    .write_items(cluster, &rows)
                    .map_err(|e| QueueError::internal("write item data", e))?;
                let active = active_mut(c)?;
                active.written_files.push(path.clone());
                active.set(
                    cluster_key,
                    attr::MATERIALIZE_ITEMS_FILE,
                    expr::quote(&path.to_string_lossy()),
                );
                debug!(cluster_id = cluster, rows = rows.len(), "Item data stored");
                Ok(rows.len())
            })
        })
    }

    /// Report on a cluster's factory.
    pub fn factory_info(&mut self, cluster: i32) -> Option<FactoryInfo> {
        self.model.factory_mut(cluster).map(|f| f.info())
    }

    /// Queue-wide totals.
    pub fn queue_summary(&self) -> QueueSummary {
        self.model.summary()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::connection::ConnectionInfo;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> JobQueue {
        let mut config = QueueConfig::new(dir.path());
        config.cluster_initial_value = 100;
        JobQueue::open(config).unwrap()
    }

    #[test]
    fn test_submission_and_abort() {
        let dir = TempDir::new().unwrap();
        let mut queue = open(&dir);
        let alice = queue.connect(ConnectionInfo::user("alice"));

        assert_eq!(queue.new_cluster(alice).unwrap(), 100);
        assert_eq!(queue.new_proc(alice, 100).unwrap(), 0);
        queue.set_attribute(alice, 100, 0, "Foo", "1", SetFlags::default()).unwrap();

        queue.begin_transaction(alice).unwrap();
        queue.set_attribute(alice, 100, 0, "Foo", "2", SetFlags::default()).unwrap();
        assert_eq!(queue.get_attribute(alice, 100, 0, "Foo").unwrap(), "2");
        queue.abort_transaction(alice).unwrap();

        assert_eq!(queue.get_attribute(alice, 100, 0, "Foo").unwrap(), "1");
        assert_eq!(
            queue.get_attribute(alice, 100, 0, "Owner").unwrap(),
            "\"alice\""
        );
    }

    #[test]
    fn test_new_proc_outside_submission() {
        let dir = TempDir::new().unwrap();
        let mut queue = open(&dir);
        let alice = queue.connect(ConnectionInfo::user("alice"));
        let bob = queue.connect(ConnectionInfo::user("bob"));
        let cluster = queue.new_cluster(alice).unwrap();
        let err = queue.new_proc(bob, cluster).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_anonymous_cannot_submit() {
        let dir = TempDir::new().unwrap();
        let mut queue = open(&dir);
        let anon = queue.connect(ConnectionInfo::anonymous());
        assert_eq!(queue.new_cluster(anon).unwrap_err().kind(), ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_begin_twice_conflicts() {
        let dir = TempDir::new().unwrap();
        let mut queue = open(&dir);
        let alice = queue.connect(ConnectionInfo::user("alice"));
        queue.begin_transaction(alice).unwrap();
        assert_eq!(queue.begin_transaction(alice).unwrap_err().kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_destroy_last_job_destroys_cluster() {
        let dir = TempDir::new().unwrap();
        let mut queue = open(&dir);
        let alice = queue.connect(ConnectionInfo::user("alice"));
        let cluster = queue.new_cluster(alice).unwrap();
        queue.new_proc(alice, cluster).unwrap();
        queue.new_proc(alice, cluster).unwrap();

        assert_eq!(queue.destroy_proc(alice, cluster, 0).unwrap(), DestroyOutcome::Destroyed);
        assert!(queue.log().contains(Key::cluster(cluster)));
        assert_eq!(queue.cluster_size(cluster), 1);
        queue.destroy_proc(alice, cluster, 1).unwrap();
        assert!(!queue.log().contains(Key::cluster(cluster)));
        assert_eq!(queue.cluster_size(cluster), 0);
    }

    #[test]
    fn test_leave_in_queue_and_completion_date() {
        let dir = TempDir::new().unwrap();
        let mut queue = open(&dir);
        let alice = queue.connect(ConnectionInfo::user("alice"));
        let cluster = queue.new_cluster(alice).unwrap();
        queue.new_proc(alice, cluster).unwrap();
        queue.set_attribute(alice, cluster, 0, "JobStatus", "4", SetFlags::default()).unwrap();
        queue.set_attribute(alice, cluster, 0, "LeaveJobInQueue", "true", SetFlags::default()).unwrap();

        assert_eq!(queue.destroy_proc(alice, cluster, 0).unwrap(), DestroyOutcome::LeftInQueue);
        assert!(queue.resolve_attribute(Key::job(cluster, 0), "CompletionDate").is_some());
    }

    #[test]
    fn test_finished_hook_defers_removal() {
        let dir = TempDir::new().unwrap();
        let mut config = QueueConfig::new(dir.path());
        config.job_finished_hook = true;
        let mut queue = JobQueue::open(config).unwrap();
        let alice = queue.connect(ConnectionInfo::user("alice"));
        let cluster = queue.new_cluster(alice).unwrap();
        queue.new_proc(alice, cluster).unwrap();

        assert_eq!(
            queue.destroy_proc(alice, cluster, 0).unwrap(),
            DestroyOutcome::DeferredPendingHook
        );
        assert_eq!(queue.take_finished_hook_jobs(), vec![Key::job(cluster, 0)]);
        assert!(queue.take_finished_hook_jobs().is_empty());
        assert_eq!(
            queue.complete_finished_hook(Key::job(cluster, 0)).unwrap(),
            DestroyOutcome::Destroyed
        );
        assert!(!queue.log().contains(Key::cluster(cluster)));
    }

    #[test]
    fn test_destroy_cluster_sets_reason_and_keeps_stayers() {
        let dir = TempDir::new().unwrap();
        let mut queue = open(&dir);
        let alice = queue.connect(ConnectionInfo::user("alice"));
        let cluster = queue.new_cluster(alice).unwrap();
        for _ in 0..3 {
            queue.new_proc(alice, cluster).unwrap();
        }
        queue.set_attribute(alice, cluster, 2, "LeaveJobInQueue", "true", SetFlags::default()).unwrap();

        let bob = queue.connect(ConnectionInfo::user("bob"));
        assert_eq!(
            queue.destroy_cluster(bob, cluster, "nope").unwrap_err().kind(),
            ErrorKind::PermissionDenied
        );

        assert_eq!(queue.destroy_cluster(alice, cluster, "user request").unwrap(), 2);
        assert!(queue.log().contains(Key::cluster(cluster)));
        assert!(!queue.log().contains(Key::job(cluster, 0)));
        assert!(queue.log().contains(Key::job(cluster, 2)));
        assert_eq!(queue.cluster_size(cluster), 1);
    }

    #[test]
    fn test_constraint_helpers() {
        let dir = TempDir::new().unwrap();
        let mut queue = open(&dir);
        let alice = queue.connect(ConnectionInfo::user("alice"));
        let cluster = queue.new_cluster(alice).unwrap();
        for i in 0..4 {
            queue.new_proc(alice, cluster).unwrap();
            queue
                .set_attribute(alice, cluster, i, "Weight", &i.to_string(), SetFlags::default())
                .unwrap();
        }
        let page = queue.find_jobs("Weight >= 2", 10, None).unwrap();
        assert_eq!(page.keys, vec![Key::job(cluster, 2), Key::job(cluster, 3)]);
        assert!(page.is_last());
        assert_eq!(queue.find_jobs("true", 1, None).unwrap().keys.len(), 1);
        let written = queue
            .set_attribute_by_constraint(alice, "Weight < 2", "Tag", "\"low\"", None)
            .unwrap();
        assert_eq!(written.keys.len(), 2);
        assert_eq!(
            queue.resolve_attribute(Key::job(cluster, 1), "Tag").as_deref(),
            Some("\"low\"")
        );

        let bob = queue.connect(ConnectionInfo::user("bob"));
        let denied = queue.set_attribute_by_constraint(bob, "true", "Tag", "1", None).unwrap();
        assert!(denied.keys.is_empty());
        assert_eq!(
            queue.find_jobs("Weight >", 10, None).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn test_constraint_scan_resumes_from_cursor() {
        let dir = TempDir::new().unwrap();
        let mut queue = open(&dir);
        let alice = queue.connect(ConnectionInfo::user("alice"));
        let cluster = queue.new_cluster(alice).unwrap();
        for _ in 0..4 {
            queue.new_proc(alice, cluster).unwrap();
        }

        let first = queue.find_jobs("true", 2, None).unwrap();
        assert_eq!(first.keys, vec![Key::job(cluster, 0), Key::job(cluster, 1)]);
        assert_eq!(first.resume_after, Some(Key::job(cluster, 1)));
        let second = queue.find_jobs("true", 2, first.resume_after).unwrap();
        assert_eq!(second.keys, vec![Key::job(cluster, 2), Key::job(cluster, 3)]);
        let last = queue.find_jobs("true", 2, second.resume_after).unwrap();
        assert!(last.keys.is_empty());
        assert!(last.is_last());

        let written = queue
            .set_attribute_by_constraint(alice, "true", "Tag", "1", first.resume_after)
            .unwrap();
        assert_eq!(written.keys, vec![Key::job(cluster, 2), Key::job(cluster, 3)]);
        assert!(written.is_last());
        assert_eq!(queue.resolve_attribute(Key::job(cluster, 1), "Tag"), None);
        assert_eq!(queue.resolve_attribute(Key::job(cluster, 3), "Tag").as_deref(), Some("1"));
    }

    #[test]
    fn test_query_only_stages_nothing() {
        let dir = TempDir::new().unwrap();
        let mut queue = open(&dir);
        let alice = queue.connect(ConnectionInfo::user("alice"));
        let cluster = queue.new_cluster(alice).unwrap();
        queue.new_proc(alice, cluster).unwrap();
        queue
            .set_attribute(alice, cluster, 0, "Foo", "1", SetFlags::query_only())
            .unwrap();
        assert_eq!(
            queue.get_attribute(alice, cluster, 0, "Foo").unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }
}
