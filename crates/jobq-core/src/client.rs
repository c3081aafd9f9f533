// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client handles for a running queue.
//!
//! [`QueueManagement`] is the remote operation surface. [`QueueClient`]
//! implements it by sending each call to the runtime's owner task; one
//! client is one connection, and dropping it disconnects (aborting any open
//! transaction).

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use crate::connection::ConnectionId;
use crate::error::Result;
use crate::factory::FactoryInfo;
use crate::log::Key;
use crate::model::QueueSummary;
use crate::queue::{DestroyOutcome, SetFlags};
use crate::runtime::{Request, call};

/// Remote queue operations, scoped to one connection.
#[async_trait]
pub trait QueueManagement: Send + Sync {
    /// Open a transaction.
    async fn begin_transaction(&self) -> Result<()>;

    /// Commit the open transaction. A no-op when none is open.
    async fn commit_transaction(&self, durable: bool) -> Result<()>;

    /// Abort the open transaction.
    async fn abort_transaction(&self) -> Result<()>;

    /// Start a submission; returns the new cluster id.
    async fn new_cluster(&self) -> Result<i32>;

    /// Add a job to the active submission; returns its proc id.
    async fn new_proc(&self, cluster: i32) -> Result<i32>;

    /// Set an attribute; `proc == -1` addresses the cluster record.
    async fn set_attribute(
        &self,
        cluster: i32,
        proc: i32,
        name: &str,
        value: &str,
        flags: SetFlags,
    ) -> Result<()>;

    /// Read an attribute through the job's chain.
    async fn get_attribute(&self, cluster: i32, proc: i32, name: &str) -> Result<String>;

    /// Remove an attribute.
    async fn delete_attribute(&self, cluster: i32, proc: i32, name: &str) -> Result<()>;

    /// Set an attribute on every matching job the caller may modify.
    ///
    /// The scan runs one slice per request, so other work interleaves.
    /// Outside a transaction each slice commits on its own.
    async fn set_attribute_by_constraint(&self, constraint: &str, name: &str, value: &str) -> Result<usize>;

    /// Remove a job.
    async fn destroy_proc(&self, cluster: i32, proc: i32) -> Result<DestroyOutcome>;

    /// Remove a cluster's jobs and stop its factory.
    async fn destroy_cluster(&self, cluster: i32, reason: &str) -> Result<usize>;

    /// Attach a job factory template to a cluster.
    async fn set_job_factory(&self, cluster: i32, template: &str) -> Result<()>;

    /// Send item rows for a cluster's factory.
    async fn send_materialize_item_data(&self, cluster: i32, rows: Vec<String>) -> Result<usize>;

    /// Committed jobs matching a constraint, at most `limit`.
    async fn find_jobs(&self, constraint: &str, limit: usize) -> Result<Vec<Key>>;

    /// Factory report for a cluster.
    async fn factory_info(&self, cluster: i32) -> Result<Option<FactoryInfo>>;

    /// Queue-wide totals.
    async fn queue_summary(&self) -> Result<QueueSummary>;
}

/// A connection to a [`crate::runtime::QueueRuntime`].
pub struct QueueClient {
    id: ConnectionId,
    requests: mpsc::Sender<Request>,
}

impl std::fmt::Debug for QueueClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueClient").field("id", &self.id).finish()
    }
}

impl QueueClient {
    pub(crate) fn new(id: ConnectionId, requests: mpsc::Sender<Request>) -> Self {
        Self { id, requests }
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for QueueClient {
    fn drop(&mut self) {
        let id = self.id;
        let request = Request::new(move |queue| queue.disconnect(id));
        match self.requests.try_send(request) {
            Ok(()) => {}
            Err(TrySendError::Full(request)) => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let requests = self.requests.clone();
                    handle.spawn(async move {
                        let _ = requests.send(request).await;
                    });
                }
                Err(_) => {
                    debug!(connection_id = %id, "Queue busy and no runtime, connection left to the idle watchdog");
                }
            },
            Err(TrySendError::Closed(_)) => {
                debug!(connection_id = %id, "Queue gone, disconnect not delivered");
            }
        }
    }
}

#[async_trait]
impl QueueManagement for QueueClient {
    async fn begin_transaction(&self) -> Result<()> {
        let id = self.id;
        call(&self.requests, move |q| q.begin_transaction(id)).await
    }

    async fn commit_transaction(&self, durable: bool) -> Result<()> {
        let id = self.id;
        call(&self.requests, move |q| q.commit_transaction(id, durable)).await
    }

    async fn abort_transaction(&self) -> Result<()> {
        let id = self.id;
        call(&self.requests, move |q| q.abort_transaction(id)).await
    }

    async fn new_cluster(&self) -> Result<i32> {
        let id = self.id;
        call(&self.requests, move |q| q.new_cluster(id)).await
    }

    async fn new_proc(&self, cluster: i32) -> Result<i32> {
        let id = self.id;
        call(&self.requests, move |q| q.new_proc(id, cluster)).await
    }

    async fn set_attribute(
        &self,
        cluster: i32,
        proc: i32,
        name: &str,
        value: &str,
        flags: SetFlags,
    ) -> Result<()> {
        let id = self.id;
        let (name, value) = (name.to_string(), value.to_string());
        call(&self.requests, move |q| {
            q.set_attribute(id, cluster, proc, &name, &value, flags)
        })
        .await
    }

    async fn get_attribute(&self, cluster: i32, proc: i32, name: &str) -> Result<String> {
        let id = self.id;
        let name = name.to_string();
        call(&self.requests, move |q| q.get_attribute(id, cluster, proc, &name)).await
    }

    async fn delete_attribute(&self, cluster: i32, proc: i32, name: &str) -> Result<()> {
        let id = self.id;
        let name = name.to_string();
        call(&self.requests, move |q| q.delete_attribute(id, cluster, proc, &name)).await
    }

    async fn set_attribute_by_constraint(&self, constraint: &str, name: &str, value: &str) -> Result<usize> {
        let id = self.id;
        let mut written = 0;
        let mut after = None;
        loop {
            let (constraint, name, value) = (constraint.to_string(), name.to_string(), value.to_string());
            let page = call(&self.requests, move |q| {
                q.set_attribute_by_constraint(id, &constraint, &name, &value, after)
            })
            .await?;
            written += page.keys.len();
            match page.resume_after {
                Some(next) => after = Some(next),
                None => return Ok(written),
            }
        }
    }

    async fn destroy_proc(&self, cluster: i32, proc: i32) -> Result<DestroyOutcome> {
        let id = self.id;
        call(&self.requests, move |q| q.destroy_proc(id, cluster, proc)).await
    }

    async fn destroy_cluster(&self, cluster: i32, reason: &str) -> Result<usize> {
        let id = self.id;
        let reason = reason.to_string();
        call(&self.requests, move |q| q.destroy_cluster(id, cluster, &reason)).await
    }

    async fn set_job_factory(&self, cluster: i32, template: &str) -> Result<()> {
        let id = self.id;
        let template = template.to_string();
        call(&self.requests, move |q| q.set_job_factory(id, cluster, &template)).await
    }

    async fn send_materialize_item_data(&self, cluster: i32, rows: Vec<String>) -> Result<usize> {
        let id = self.id;
        call(&self.requests, move |q| q.send_materialize_item_data(id, cluster, rows)).await
    }

    async fn find_jobs(&self, constraint: &str, limit: usize) -> Result<Vec<Key>> {
        let mut found = Vec::new();
        let mut after = None;
        while found.len() < limit {
            let constraint = constraint.to_string();
            let want = limit - found.len();
            let page = call(&self.requests, move |q| q.find_jobs(&constraint, want, after)).await?;
            found.extend(page.keys);
            match page.resume_after {
                Some(next) => after = Some(next),
                None => break,
            }
        }
        Ok(found)
    }

    async fn factory_info(&self, cluster: i32) -> Result<Option<FactoryInfo>> {
        call(&self.requests, move |q| Ok(q.factory_info(cluster))).await
    }

    async fn queue_summary(&self) -> Result<QueueSummary> {
        call(&self.requests, |q| Ok(q.queue_summary())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::connection::ConnectionInfo;
    use crate::error::ErrorKind;
    use crate::runtime::QueueRuntime;
    use tempfile::TempDir;

    async fn start(dir: &TempDir) -> QueueRuntime {
        QueueRuntime::builder()
            .config(QueueConfig::new(dir.path()))
            .build()
            .unwrap()
            .start()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_client_transaction_round_trip() {
        let dir = TempDir::new().unwrap();
        let runtime = start(&dir).await;
        let client = runtime.connect(ConnectionInfo::user("alice")).await.unwrap();

        client.begin_transaction().await.unwrap();
        let cluster = client.new_cluster().await.unwrap();
        client.new_proc(cluster).await.unwrap();
        client
            .set_attribute(cluster, 0, "Cmd", "\"/bin/true\"", SetFlags::default())
            .await
            .unwrap();
        client.commit_transaction(true).await.unwrap();

        assert_eq!(
            client.get_attribute(cluster, 0, "Cmd").await.unwrap(),
            "\"/bin/true\""
        );
        assert_eq!(client.queue_summary().await.unwrap().jobs, 1);
        assert_eq!(client.find_jobs("true", 10).await.unwrap(), vec![Key::job(cluster, 0)]);

        drop(client);
        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_client_aborts_transaction() {
        let dir = TempDir::new().unwrap();
        let runtime = start(&dir).await;
        let client = runtime.connect(ConnectionInfo::user("alice")).await.unwrap();
        client.begin_transaction().await.unwrap();
        let cluster = client.new_cluster().await.unwrap();
        client.new_proc(cluster).await.unwrap();
        drop(client);

        let (connections, size) = runtime
            .with_queue(move |q| Ok((q.connection_count(), q.cluster_size(cluster))))
            .await
            .unwrap();
        assert_eq!(connections, 0);
        assert_eq!(size, 0);

        let other = runtime.connect(ConnectionInfo::user("bob")).await.unwrap();
        let err = other.get_attribute(cluster, 0, "ProcId").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        drop(other);
        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_constraint_calls_cover_every_page() {
        let dir = TempDir::new().unwrap();
        let runtime = start(&dir).await;
        let client = runtime.connect(ConnectionInfo::user("alice")).await.unwrap();
        let cluster = client.new_cluster().await.unwrap();
        for _ in 0..5 {
            client.new_proc(cluster).await.unwrap();
        }

        assert_eq!(client.find_jobs("true", 3).await.unwrap().len(), 3);
        assert!(client.find_jobs("true", 0).await.unwrap().is_empty());
        assert_eq!(
            client.set_attribute_by_constraint("ProcId >= 1", "Tag", "1").await.unwrap(),
            4
        );
        assert_eq!(client.find_jobs("Tag == 1", 10).await.unwrap().len(), 4);

        drop(client);
        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_client_after_shutdown() {
        let dir = TempDir::new().unwrap();
        let runtime = start(&dir).await;
        let client = runtime.connect(ConnectionInfo::user("alice")).await.unwrap();
        runtime.shutdown().await.unwrap();
        let err = client.new_cluster().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
