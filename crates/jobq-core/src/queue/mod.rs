// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The job queue.
//!
//! [`JobQueue`] is the single owner of all queue state: the log, the entity
//! model, the cluster size index, factories, connections and timers. It is
//! synchronous; [`crate::runtime::QueueRuntime`] drives it from one tokio
//! task, and embedders or tests can call it directly.
//!
//! # Startup
//!
//! [`JobQueue::open`] replays the log and then, in order:
//!
//! 1. migrates older spool layouts (inline templates move to side files)
//! 2. destroys jobs without a cluster or with mismatched id attributes
//! 3. validates the stored next cluster id
//! 4. builds the entity model and size index
//! 5. reconstructs factories (a bad template only invalidates its cluster)
//! 6. cleans up clusters left without jobs

mod materialize;
mod ops;
mod transaction;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::attributes::{self as attr, AttributePolicy};
use crate::config::QueueConfig;
use crate::connection::{Connection, ConnectionId, ConnectionInfo};
use crate::error::{QueueError, Result};
use crate::expr;
use crate::factory::{FactoryState, JobFactory};
use crate::lifecycle::{ClusterSizeIndex, DeferredCleanup, Disposition, disposition};
use crate::log::{Key, LogOp, RecordType, Transaction, TransactionalLog};
use crate::model::{EntityModel, ModelSnapshot};
use crate::mutation::{Actor, MutationContext};
use crate::spool::{SPOOL_VERSION, Spool};

pub use materialize::{MaterializeOutcome, RetryHint};
pub use ops::{DestroyOutcome, JobPage, SetFlags};
pub use transaction::ActiveTransaction;

/// Persistent job queue state.
pub struct JobQueue {
    config: QueueConfig,
    policy: AttributePolicy,
    spool: Spool,
    log: TransactionalLog,
    model: EntityModel,
    sizes: ClusterSizeIndex,
    cleanup: DeferredCleanup,
    connections: HashMap<ConnectionId, Connection>,
    owner_history: HashSet<String>,
    next_cluster: i32,
    flush_deadline: Option<Instant>,
    pending_file_removals: Vec<PathBuf>,
    finished_hook_jobs: Vec<Key>,
    materialize_wanted: bool,
    last_rotation: Instant,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("log", &self.log)
            .field("clusters", &self.model.cluster_ids().len())
            .field("jobs", &self.model.total_jobs())
            .field("connections", &self.connections.len())
            .field("next_cluster", &self.next_cluster)
            .finish()
    }
}

impl JobQueue {
    /// Open the queue in `config.spool_dir`, replaying and validating the
    /// log.
    pub fn open(config: QueueConfig) -> Result<Self> {
        let spool = Spool::new(&config.spool_dir);
        let log = TransactionalLog::open(config.log_path(), config.max_historical_logs)?;
        let policy = AttributePolicy::new(
            &config.immutable_attrs,
            &config.protected_attrs,
            &config.secure_attrs,
        );

        let mut queue = Self {
            config,
            policy,
            spool,
            log,
            model: EntityModel::new(),
            sizes: ClusterSizeIndex::new(),
            cleanup: DeferredCleanup::new(),
            connections: HashMap::new(),
            owner_history: HashSet::new(),
            next_cluster: 0,
            flush_deadline: None,
            pending_file_removals: Vec::new(),
            finished_hook_jobs: Vec::new(),
            materialize_wanted: false,
            last_rotation: Instant::now(),
        };

        queue.migrate_spool()?;
        queue.drop_orphan_jobs()?;
        queue.next_cluster = queue.validate_next_cluster()?;
        queue.model = EntityModel::build(&queue.log);
        queue.sizes = ClusterSizeIndex::rebuild(&queue.log, std::iter::empty());
        queue.load_owner_history();
        queue.rebuild_factories();
        queue.cleanup_empty_clusters()?;

        info!(
            path = %queue.log.path().display(),
            clusters = queue.model.cluster_ids().len(),
            jobs = queue.model.total_jobs(),
            next_cluster = queue.next_cluster,
            "Job queue opened"
        );
        Ok(queue)
    }

    fn migrate_spool(&mut self) -> Result<()> {
        let version = self
            .log
            .get_attr(Key::HEADER, attr::SPOOL_VERSION)
            .and_then(|v| v.trim().parse::<i64>().ok())
            .unwrap_or(0);
        if version >= SPOOL_VERSION {
            return Ok(());
        }

        let mut txn = self.log.begin();
        if !self.log.contains(Key::HEADER) {
            txn.stage(LogOp::NewRecord {
                key: Key::HEADER,
                kind: RecordType::Header,
            });
        }
        let inline: Vec<(Key, String)> = self
            .log
            .iter()
            .filter(|(key, _)| key.is_cluster())
            .filter_map(|(key, record)| {
                record
                    .get(attr::MATERIALIZE_DIGEST)
                    .and_then(expr::unquote)
                    .map(|text| (key, text))
            })
            .collect();
        for (key, template) in inline {
            let path = self
                .spool
                .write_digest(key.cluster, &template)
                .map_err(|e| QueueError::internal("migrate spool", e))?;
            stage_set(&mut txn, key, attr::MATERIALIZE_DIGEST_FILE, expr::quote(&path.to_string_lossy()));
            txn.stage(LogOp::DeleteAttr {
                key,
                name: attr::MATERIALIZE_DIGEST.to_string(),
            });
            info!(cluster_id = key.cluster, "Moved inline factory template to side file");
        }
        stage_set(&mut txn, Key::HEADER, attr::SPOOL_VERSION, SPOOL_VERSION.to_string());
        txn.set_comment(format!("spool migration {} -> {}", version, SPOOL_VERSION));
        self.log.commit(txn, true)?;
        info!(from = version, to = SPOOL_VERSION, "Spool format migrated");
        Ok(())
    }

    fn drop_orphan_jobs(&mut self) -> Result<()> {
        let bad: Vec<Key> = self
            .log
            .iter()
            .filter(|(key, _)| key.is_job())
            .filter(|(key, record)| {
                let id_mismatch = |name: &str, expected: i32| {
                    record
                        .get(name)
                        .is_some_and(|v| v.trim().parse::<i32>().ok() != Some(expected))
                };
                !self.log.contains(Key::cluster(key.cluster))
                    || id_mismatch(attr::CLUSTER_ID, key.cluster)
                    || id_mismatch(attr::PROC_ID, key.proc)
            })
            .map(|(key, _)| key)
            .collect();
        if bad.is_empty() {
            return Ok(());
        }
        let mut txn = self.log.begin();
        for key in &bad {
            warn!(key = %key, "Destroying job without a valid cluster or with mismatched ids");
            txn.stage(LogOp::DestroyRecord { key: *key });
        }
        txn.set_comment("startup validation");
        self.log.commit(txn, true)
    }

    fn validate_next_cluster(&self) -> Result<i32> {
        let max_existing = self
            .log
            .iter()
            .filter(|(key, _)| key.is_cluster() || key.is_job())
            .map(|(key, _)| key.cluster)
            .max();
        let stored = self
            .log
            .get_attr(Key::HEADER, attr::NEXT_CLUSTER_NUM)
            .and_then(|v| v.trim().parse::<i32>().ok());
        match (stored, max_existing) {
            (Some(next), Some(max)) if self.config.cluster_max_value == 0 && max >= next => {
                error!(stored = next, max_existing = max, "Stored next cluster id is behind existing clusters");
                Err(QueueError::Corrupt {
                    path: self.log.path().display().to_string(),
                    line: 0,
                    details: "header next cluster id would reuse ids".to_string(),
                })
            }
            (Some(next), _) => Ok(next),
            (None, Some(max)) => Ok(self
                .config
                .cluster_initial_value
                .max(max + self.config.cluster_increment)),
            (None, None) => Ok(self.config.cluster_initial_value),
        }
    }

    fn load_owner_history(&mut self) {
        let owners: Vec<String> = self
            .log
            .iter()
            .filter(|(key, _)| key.is_cluster() || key.is_job())
            .filter_map(|(_, record)| record.get(attr::OWNER).and_then(expr::unquote))
            .collect();
        self.owner_history.extend(owners);
    }

    fn rebuild_factories(&mut self) {
        for cluster in self.model.cluster_ids() {
            let key = Key::cluster(cluster);
            let Some(path) = self
                .log
                .get_attr(key, attr::MATERIALIZE_DIGEST_FILE)
                .and_then(expr::unquote)
            else {
                continue;
            };
            let state = self
                .log
                .get_attr(key, attr::MATERIALIZE_PAUSED)
                .and_then(|v| v.trim().parse::<i64>().ok())
                .and_then(FactoryState::from_code)
                .unwrap_or(FactoryState::Running);
            let items_file = self
                .log
                .get_attr(key, attr::MATERIALIZE_ITEMS_FILE)
                .and_then(expr::unquote)
                .map(PathBuf::from);
            let factory = match std::fs::read_to_string(&path) {
                Ok(template) => JobFactory::load(
                    cluster,
                    &template,
                    items_file.as_deref(),
                    self.spool.dir(),
                    state,
                ),
                Err(e) => {
                    warn!(cluster_id = cluster, path = %path, error = %e, "Failed to read factory template");
                    JobFactory::invalid(cluster, format!("{}: {}", path, e))
                }
            };
            self.model.ensure_cluster(cluster).factory = Some(factory);
        }
    }

    fn cleanup_empty_clusters(&mut self) -> Result<()> {
        let mut active = ActiveTransaction::new(self.log.begin());
        for cluster in self.model.cluster_ids() {
            match disposition(self.sizes.get(cluster), self.model.factory_state(cluster)) {
                Disposition::Alive => {}
                Disposition::DestroyNow => {
                    info!(cluster_id = cluster, "Removing empty cluster at startup");
                    active.destroy(Key::cluster(cluster));
                    active.destroyed_clusters.insert(cluster);
                }
                Disposition::Deferred => {
                    self.cleanup.schedule(cluster, self.config.deferred_cleanup_delay);
                }
            }
        }
        if active.transaction().is_empty() {
            return Ok(());
        }
        self.commit_active(active, true)
    }

    // ========================================================================
    // Connections and sessions
    // ========================================================================

    /// Register a client connection.
    pub fn connect(&mut self, info: ConnectionInfo) -> ConnectionId {
        let conn = Connection::new(info);
        let id = conn.id;
        info!(connection_id = %id, identity = ?conn.info.identity, "Client connected");
        self.connections.insert(id, conn);
        id
    }

    /// Drop a connection, aborting its open transaction.
    pub fn disconnect(&mut self, id: ConnectionId) {
        let Some(mut conn) = self.connections.remove(&id) else {
            return;
        };
        if let Some(active) = conn.txn.take() {
            warn!(connection_id = %id, "Aborting transaction of closed connection");
            self.abort_active(active);
        }
        info!(connection_id = %id, "Client disconnected");
    }

    /// Number of connected clients.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Run `f` with the connection taken out of the table.
    fn with_connection<T>(
        &mut self,
        id: ConnectionId,
        f: impl FnOnce(&mut Self, &mut Connection) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self
            .connections
            .remove(&id)
            .ok_or_else(|| QueueError::not_found(format!("connection {}", id)))?;
        conn.touch();
        let result = f(self, &mut conn);
        self.connections.insert(id, conn);
        result
    }

    /// Run `f` inside the connection's transaction, or inside a one-shot
    /// transaction committed right after when none is open.
    fn in_transaction<T>(
        &mut self,
        conn: &mut Connection,
        durable: bool,
        f: impl FnOnce(&mut Self, &mut Connection) -> Result<T>,
    ) -> Result<T> {
        if conn.txn.is_some() {
            return f(self, conn);
        }
        conn.txn = Some(ActiveTransaction::new(self.log.begin()));
        let result = f(self, conn);
        let Some(active) = conn.txn.take() else {
            return result;
        };
        match result {
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

    fn actor(&self, conn: &Connection) -> Actor {
        conn.actor(&self.config.super_users)
    }

    fn mutation_context<'a>(
        &'a self,
        txn: Option<&'a Transaction>,
        actor: &'a Actor,
    ) -> MutationContext<'a> {
        MutationContext {
            log: &self.log,
            txn,
            policy: &self.policy,
            config: &self.config,
            owner_history: &self.owner_history,
            actor,
        }
    }

    // ========================================================================
    // Read access
    // ========================================================================

    /// Configuration in effect.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// The committed log.
    pub fn log(&self) -> &TransactionalLog {
        &self.log
    }

    /// The entity model.
    pub fn model(&self) -> &EntityModel {
        &self.model
    }

    /// Comparable copy of the entity model.
    pub fn snapshot(&self) -> ModelSnapshot {
        self.model.snapshot()
    }

    /// Job records counted for `cluster`, open transactions included.
    pub fn cluster_size(&self, cluster: i32) -> usize {
        self.sizes.get(cluster)
    }

    /// Next cluster id to hand out.
    pub fn next_cluster_id(&self) -> i32 {
        self.next_cluster
    }

    /// True if `owner` has ever submitted.
    pub fn knows_owner(&self, owner: &str) -> bool {
        self.owner_history.contains(owner)
    }

    /// True if a status change or factory change asked for a materialization
    /// pass since the last one.
    pub fn wants_materialize(&self) -> bool {
        self.materialize_wanted
    }

    /// Pending deferred cleanup checks.
    pub fn deferred_cleanups(&self) -> usize {
        self.cleanup.len()
    }
}

fn stage_set(txn: &mut Transaction, key: Key, name: &str, value: String) {
    txn.stage(LogOp::SetAttr {
        key,
        name: name.to_string(),
        value,
    });
}
