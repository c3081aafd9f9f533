// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the async runtime: timers driven by the owner task and the
//! client surface.

use std::time::Duration;

use tempfile::TempDir;

use jobq_core::config::QueueConfig;
use jobq_core::connection::ConnectionInfo;
use jobq_core::log::Key;
use jobq_core::queue::{DestroyOutcome, SetFlags};
use jobq_core::{QueueManagement, QueueRuntime};

async fn start(config: QueueConfig) -> QueueRuntime {
    QueueRuntime::builder()
        .config(config)
        .build()
        .expect("Failed to build runtime config")
        .start()
        .await
        .expect("Failed to start runtime")
}

fn config(dir: &TempDir) -> QueueConfig {
    let mut config = QueueConfig::new(dir.path());
    config.cluster_initial_value = 100;
    config
}

#[tokio::test(start_paused = true)]
async fn test_factory_materialized_by_timer() {
    let dir = TempDir::new().unwrap();
    let runtime = start(config(&dir)).await;
    let client = runtime.connect(ConnectionInfo::user("alice")).await.unwrap();

    client.begin_transaction().await.unwrap();
    let cluster = client.new_cluster().await.unwrap();
    client
        .set_job_factory(cluster, "executable = /bin/true\nqueue 4\n")
        .await
        .unwrap();
    client.commit_transaction(true).await.unwrap();
    assert_eq!(client.queue_summary().await.unwrap().jobs, 0);

    tokio::time::sleep(Duration::from_secs(3)).await;

    let summary = client.queue_summary().await.unwrap();
    assert_eq!(summary.jobs, 4);
    assert_eq!(summary.idle, 4);
    assert_eq!(summary.active_factories, 0);
    let info = client.factory_info(cluster).await.unwrap().unwrap();
    assert_eq!(info.total_procs, Some(4));

    drop(client);
    runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_idle_transaction_aborted_by_watchdog() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir);
    config.transaction_idle_timeout = Duration::from_secs(10);
    let runtime = start(config).await;
    let client = runtime.connect(ConnectionInfo::user("alice")).await.unwrap();

    client.begin_transaction().await.unwrap();
    let cluster = client.new_cluster().await.unwrap();
    client.new_proc(cluster).await.unwrap();

    tokio::time::sleep(Duration::from_secs(15)).await;

    let exists = runtime
        .with_queue(move |q| Ok(q.log().contains(Key::cluster(cluster)) || q.cluster_size(cluster) > 0))
        .await
        .unwrap();
    assert!(!exists);
    // The transaction is gone, so there is nothing left to commit.
    client.commit_transaction(true).await.unwrap();
    assert_eq!(client.queue_summary().await.unwrap().clusters, 0);

    drop(client);
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_finished_hook_round_trip() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir);
    config.job_finished_hook = true;
    let runtime = start(config).await;
    let client = runtime.connect(ConnectionInfo::user("alice")).await.unwrap();

    let cluster = client.new_cluster().await.unwrap();
    client.new_proc(cluster).await.unwrap();
    client.new_proc(cluster).await.unwrap();
    client
        .set_attribute(cluster, 0, "JobStatus", "4", SetFlags::default())
        .await
        .unwrap();

    assert_eq!(
        client.destroy_proc(cluster, 0).await.unwrap(),
        DestroyOutcome::DeferredPendingHook
    );
    let pending = runtime.take_finished_hook_jobs().await.unwrap();
    assert_eq!(pending, vec![Key::job(cluster, 0)]);
    assert!(client.get_attribute(cluster, 0, "CompletionDate").await.is_ok());

    let outcome = runtime.complete_finished_hook(Key::job(cluster, 0)).await.unwrap();
    assert_eq!(outcome, DestroyOutcome::Destroyed);
    assert_eq!(client.queue_summary().await.unwrap().jobs, 1);

    drop(client);
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_state_survives_runtime_restart() {
    let dir = TempDir::new().unwrap();
    let runtime = start(config(&dir)).await;
    let client = runtime.connect(ConnectionInfo::user("alice")).await.unwrap();
    let cluster = client.new_cluster().await.unwrap();
    client.new_proc(cluster).await.unwrap();
    client
        .set_attribute(cluster, 0, "Progress", "7", SetFlags::non_durable())
        .await
        .unwrap();
    drop(client);
    runtime.shutdown().await.unwrap();

    let runtime = start(config(&dir)).await;
    let client = runtime.connect(ConnectionInfo::user("bob")).await.unwrap();
    assert_eq!(client.get_attribute(cluster, 0, "Progress").await.unwrap(), "7");
    assert_eq!(
        client.find_jobs("Owner == \"alice\"", 10).await.unwrap(),
        vec![Key::job(cluster, 0)]
    );
    drop(client);
    runtime.shutdown().await.unwrap();
}
