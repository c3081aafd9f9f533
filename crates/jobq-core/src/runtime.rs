// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for jobq-core.
//!
//! [`QueueRuntime`] moves a [`JobQueue`] into a single owner task. Clients
//! talk to it through [`QueueClient`] handles; the owner task serves their
//! requests one at a time between its timers (delayed log flush, factory
//! materialization, deferred cluster cleanup, idle transaction watchdog and
//! log rotation).
//!
//! # Example
//!
//! ```rust,ignore
//! use jobq_core::config::QueueConfig;
//! use jobq_core::connection::ConnectionInfo;
//! use jobq_core::runtime::QueueRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = QueueRuntime::builder()
//!         .config(QueueConfig::from_env()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let client = runtime.connect(ConnectionInfo::user("alice")).await?;
//!     let cluster = client.new_cluster().await?;
//!     client.new_proc(cluster).await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep_until};
use tracing::{debug, error, info, warn};

use crate::client::QueueClient;
use crate::config::QueueConfig;
use crate::connection::ConnectionInfo;
use crate::error::QueueError;
use crate::log::Key;
use crate::queue::{DestroyOutcome, JobQueue};

/// Default capacity of the request channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// How often the owner task checks idle transactions and log rotation.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

/// Work sent to the owner task.
pub(crate) struct Request(Box<dyn FnOnce(&mut JobQueue) + Send>);

impl Request {
    pub(crate) fn new(run: impl FnOnce(&mut JobQueue) + Send + 'static) -> Self {
        Self(Box::new(run))
    }
}

/// Run `f` on the owner task and wait for its result.
pub(crate) async fn call<T, F>(requests: &mpsc::Sender<Request>, f: F) -> crate::error::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut JobQueue) -> crate::error::Result<T> + Send + 'static,
{
    let (reply_tx, reply_rx) = oneshot::channel();
    let request = Request::new(move |queue| {
        let _ = reply_tx.send(f(queue));
    });
    requests
        .send(request)
        .await
        .map_err(|_| QueueError::internal("queue request", "queue runtime stopped"))?;
    reply_rx
        .await
        .map_err(|_| QueueError::internal("queue request", "queue runtime dropped the request"))?
}

/// Builder for creating a [`QueueRuntime`].
pub struct QueueRuntimeBuilder {
    config: Option<QueueConfig>,
    channel_capacity: usize,
}

impl std::fmt::Debug for QueueRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRuntimeBuilder")
            .field("spool_dir", &self.config.as_ref().map(|c| c.spool_dir.display().to_string()))
            .field("channel_capacity", &self.channel_capacity)
            .finish()
    }
}

impl Default for QueueRuntimeBuilder {
    fn default() -> Self {
        Self {
            config: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl QueueRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the queue configuration (required).
    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the request channel capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<QueueRuntimeConfig> {
        let config = self
            .config
            .ok_or_else(|| anyhow::anyhow!("queue config is required"))?;

        Ok(QueueRuntimeConfig {
            config,
            channel_capacity: self.channel_capacity,
        })
    }
}

/// Configuration for a [`QueueRuntime`].
pub struct QueueRuntimeConfig {
    config: QueueConfig,
    channel_capacity: usize,
}

impl std::fmt::Debug for QueueRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRuntimeConfig")
            .field("spool_dir", &self.config.spool_dir)
            .field("channel_capacity", &self.channel_capacity)
            .finish()
    }
}

impl QueueRuntimeConfig {
    /// Open the queue and spawn its owner task.
    pub async fn start(self) -> Result<QueueRuntime> {
        let spool_dir = self.config.spool_dir.clone();
        let queue = JobQueue::open(self.config)?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (requests_tx, requests_rx) = mpsc::channel(self.channel_capacity);

        let owner_handle = tokio::spawn(run_owner(queue, requests_rx, shutdown_rx));

        info!(spool_dir = %spool_dir.display(), "QueueRuntime started");

        Ok(QueueRuntime {
            owner_handle,
            shutdown_tx,
            requests: requests_tx,
        })
    }
}

/// A running job queue.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination; it syncs the
/// log before the owner task exits.
pub struct QueueRuntime {
    owner_handle: JoinHandle<Result<()>>,
    shutdown_tx: watch::Sender<bool>,
    requests: mpsc::Sender<Request>,
}

impl std::fmt::Debug for QueueRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRuntime")
            .field("running", &self.is_running())
            .finish()
    }
}

impl QueueRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> QueueRuntimeBuilder {
        QueueRuntimeBuilder::new()
    }

    /// Register a client connection.
    pub async fn connect(&self, info: ConnectionInfo) -> crate::error::Result<QueueClient> {
        let id = call(&self.requests, move |queue| Ok(queue.connect(info))).await?;
        Ok(QueueClient::new(id, self.requests.clone()))
    }

    /// Run `f` against the queue on the owner task.
    pub async fn with_queue<T, F>(&self, f: F) -> crate::error::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut JobQueue) -> crate::error::Result<T> + Send + 'static,
    {
        call(&self.requests, f).await
    }

    /// Jobs waiting for the finished-job hook. Each is returned once.
    pub async fn take_finished_hook_jobs(&self) -> crate::error::Result<Vec<Key>> {
        call(&self.requests, |queue| Ok(queue.take_finished_hook_jobs())).await
    }

    /// Report the finished-job hook done for `key` and remove the job.
    pub async fn complete_finished_hook(&self, key: Key) -> crate::error::Result<DestroyOutcome> {
        call(&self.requests, move |queue| queue.complete_finished_hook(key)).await
    }

    /// Sync the log now.
    pub async fn flush(&self) -> crate::error::Result<bool> {
        call(&self.requests, |queue| queue.flush()).await
    }

    /// Gracefully shut down the runtime.
    ///
    /// Pending requests already queued are dropped; the log is synced.
    pub async fn shutdown(self) -> Result<()> {
        info!("QueueRuntime shutting down...");

        let _ = self.shutdown_tx.send(true);

        match self.owner_handle.await {
            Ok(Ok(())) => {
                info!("QueueRuntime shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("QueueRuntime owner error during shutdown: {}", e);
                Err(e)
            }
            Err(e) => {
                error!("QueueRuntime owner task panicked: {}", e);
                Err(anyhow::anyhow!("owner task panicked: {}", e))
            }
        }
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.owner_handle.is_finished()
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn log_failure<T>(what: &str, result: crate::error::Result<T>) {
    if let Err(e) = result {
        warn!(error = %e, code = e.error_code(), "{} failed", what);
    }
}

/// Serve requests and timers until shutdown or until every sender is gone.
async fn run_owner(
    mut queue: JobQueue,
    mut requests: mpsc::Receiver<Request>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let mut materialize = interval(queue.config().materialize_interval);
    materialize.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut housekeeping = interval(HOUSEKEEPING_INTERVAL);
    housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("Queue owner task running");

    loop {
        let flush_at = queue.flush_deadline();
        let cleanup_at = queue.next_cleanup_due();

        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("Queue owner received shutdown signal");
                    break;
                }
            }

            request = requests.recv() => {
                match request {
                    Some(Request(run)) => run(&mut queue),
                    None => {
                        debug!("All queue handles dropped");
                        break;
                    }
                }
            }

            _ = sleep_until_some(flush_at) => {
                log_failure("Delayed log flush", queue.flush_if_due(Instant::now()));
            }

            _ = sleep_until_some(cleanup_at) => {
                log_failure("Deferred cluster cleanup", queue.run_deferred_cleanup(Instant::now()));
            }

            _ = materialize.tick() => {
                queue.materialize_tick();
            }

            _ = housekeeping.tick() => {
                let now = Instant::now();
                queue.expire_idle_transactions(now);
                log_failure("Log rotation", queue.maybe_rotate(now));
            }
        }
    }

    queue.flush()?;
    info!("Queue owner task stopped");
    Ok(())
}
