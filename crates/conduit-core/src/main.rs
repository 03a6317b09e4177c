// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Conduit Core - Channel Rendezvous Service
//!
//! Core is responsible for:
//! - Matching producers and consumers of workflow channels
//! - Failing transfers over to replacement producers
//! - Tearing down channels durably
//!
//! Workflow abort requests go to the workflow service when
//! `CONDUIT_WORKFLOW_URL` is set and are only logged otherwise.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::{error, info};

use conduit_core::cleanup_worker::CleanupWorkerConfig;
use conduit_core::config::Config;
use conduit_core::notifier::HttpTransferNotifier;
use conduit_core::runtime::ConduitRuntime;
use conduit_core::workflow::{HttpWorkflowClient, LoggingWorkflowClient, WorkflowClient};

const COLLABORATOR_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("conduit_core=info".parse()?)
                .add_directive("conduit_operations=info".parse()?),
        )
        .init();

    info!("Starting Conduit Core");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;
    let cleanup = CleanupWorkerConfig::from_env();

    info!(
        http_addr = %config.http_addr,
        instance_id = %config.instance_id,
        max_operations = config.max_concurrent_operations,
        workflow_url = ?config.workflow_url,
        "Configuration loaded"
    );

    // Connect to database
    info!("Connecting to database...");
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect(&config.database_url)
        .await?;

    // Verify connection
    let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&pool).await?;
    info!(result = row.0, "Database health check passed");

    let workflow: Arc<dyn WorkflowClient> = match &config.workflow_url {
        Some(url) => Arc::new(HttpWorkflowClient::new(url.clone(), COLLABORATOR_TIMEOUT)?),
        None => Arc::new(LoggingWorkflowClient),
    };

    let runtime = ConduitRuntime::builder()
        .pool(pool.clone())
        .http_addr(config.http_addr)
        .instance_id(config.instance_id.clone())
        .max_concurrent_operations(config.max_concurrent_operations)
        .producer_retry_budget(config.producer_retry_budget)
        .operation_deadline(config.operation_deadline)
        .cleanup(cleanup)
        .notifier(Arc::new(HttpTransferNotifier::new(COLLABORATOR_TIMEOUT)?))
        .workflow(workflow)
        .build()?
        .start()
        .await?;

    info!("Conduit Core initialized successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    pool.close().await;
    info!("Shutdown complete");

    Ok(())
}
