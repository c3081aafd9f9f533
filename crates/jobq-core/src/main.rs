// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! jobq-core - Persistent Job Queue
//!
//! Runs the queue as a standalone process: recovers the log from the spool
//! directory, serves the maintenance timers and shuts down cleanly on
//! Ctrl-C, syncing the log on the way out.

use anyhow::Result;
use tracing::{error, info};

use jobq_core::config::QueueConfig;
use jobq_core::runtime::QueueRuntime;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("jobq_core=info".parse()?),
        )
        .init();

    info!("Starting jobq-core");

    let config = QueueConfig::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        spool_dir = %config.spool_dir.display(),
        queue_name = %config.queue_name,
        max_jobs_submitted = config.max_jobs_submitted,
        "Configuration loaded"
    );

    let runtime = QueueRuntime::builder().config(config).build()?.start().await?;

    let summary = runtime.with_queue(|queue| Ok(queue.queue_summary())).await?;
    info!(
        clusters = summary.clusters,
        jobs = summary.jobs,
        active_factories = summary.active_factories,
        "Job queue recovered"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    info!("Shutdown complete");

    Ok(())
}
