// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for conduit-core.
//!
//! [`ConduitRuntime`] wires the store, the operation engine, the handlers, the
//! cleanup worker and (with the `http` feature) the HTTP listener together, so
//! the service can run inside an existing tokio application.
//!
//! # Example
//!
//! ```rust,ignore
//! use conduit_core::runtime::ConduitRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = sqlx::SqlitePool::connect("sqlite:conduit.db?mode=rwc").await?;
//!
//!     let runtime = ConduitRuntime::builder()
//!         .pool(pool)
//!         .http_addr("0.0.0.0:8122".parse()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use conduit_operations::step::DEFAULT_RESTART_DELAY;
use conduit_operations::{EngineConfig, FailPoints, NoFailPoints, OperationEngine, RetryConfig};
use sqlx::SqlitePool;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::access::{AccessClient, AllowAll};
use crate::actions::{self, ActionDeps};
use crate::channel_handlers::ChannelHandlerState;
use crate::cleanup_worker::{CleanupWorker, CleanupWorkerConfig};
use crate::lock::ChannelLocks;
use crate::notifier::{LoggingNotifier, TransferNotifier};
use crate::slot_handlers::{
    DEFAULT_OPERATION_DEADLINE, DEFAULT_PRODUCER_RETRY_BUDGET, SlotHandlerState,
};
use crate::workflow::{LoggingWorkflowClient, OperationTeardown, WorkflowClient};

/// Builder for creating a [`ConduitRuntime`].
pub struct ConduitRuntimeBuilder {
    pool: Option<SqlitePool>,
    http_addr: Option<SocketAddr>,
    engine: EngineConfig,
    producer_retry_budget: i64,
    operation_deadline: Duration,
    restart_delay: Duration,
    retry: RetryConfig,
    cleanup: CleanupWorkerConfig,
    run_migrations: bool,
    access: Arc<dyn AccessClient>,
    notifier: Arc<dyn TransferNotifier>,
    workflow: Arc<dyn WorkflowClient>,
    fail_points: Arc<dyn FailPoints>,
}

impl std::fmt::Debug for ConduitRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConduitRuntimeBuilder")
            .field("pool", &self.pool.as_ref().map(|_| "..."))
            .field("http_addr", &self.http_addr)
            .field("engine", &self.engine)
            .field("producer_retry_budget", &self.producer_retry_budget)
            .field("operation_deadline", &self.operation_deadline)
            .field("cleanup", &self.cleanup)
            .field("run_migrations", &self.run_migrations)
            .finish()
    }
}

impl Default for ConduitRuntimeBuilder {
    fn default() -> Self {
        Self {
            pool: None,
            http_addr: None,
            engine: EngineConfig::default(),
            producer_retry_budget: DEFAULT_PRODUCER_RETRY_BUDGET,
            operation_deadline: DEFAULT_OPERATION_DEADLINE,
            restart_delay: DEFAULT_RESTART_DELAY,
            retry: RetryConfig::default(),
            cleanup: CleanupWorkerConfig::default(),
            run_migrations: true,
            access: Arc::new(AllowAll),
            notifier: Arc::new(LoggingNotifier),
            workflow: Arc::new(LoggingWorkflowClient),
            fail_points: Arc::new(NoFailPoints),
        }
    }
}

impl ConduitRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the SQLite pool (required).
    pub fn pool(mut self, pool: SqlitePool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Serve the HTTP API on `addr`. Without it no listener is started.
    ///
    /// Ignored unless the `http` feature is enabled.
    pub fn http_addr(mut self, addr: SocketAddr) -> Self {
        self.http_addr = Some(addr);
        self
    }

    /// Set the instance id owning the operations this runtime creates.
    ///
    /// Default: `conduit-local`
    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.engine.owner = id.into();
        self
    }

    /// Set the maximum number of operations running at once.
    ///
    /// Default: 16
    pub fn max_concurrent_operations(mut self, max: usize) -> Self {
        self.engine.max_concurrent = max;
        self
    }

    /// Set the initial retry budget of new producers.
    ///
    /// Default: 2
    pub fn producer_retry_budget(mut self, budget: i64) -> Self {
        self.producer_retry_budget = budget;
        self
    }

    /// Set the deadline of engine operations.
    ///
    /// Default: 10 minutes
    pub fn operation_deadline(mut self, deadline: Duration) -> Self {
        self.operation_deadline = deadline;
        self
    }

    /// Set the delay before an action retries a collaborator call.
    pub fn restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    /// Set the retry policy around handler transactions.
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the cleanup worker configuration.
    pub fn cleanup(mut self, cleanup: CleanupWorkerConfig) -> Self {
        self.cleanup = cleanup;
        self
    }

    /// Whether to apply migrations on start.
    ///
    /// Default: true
    pub fn run_migrations(mut self, run: bool) -> Self {
        self.run_migrations = run;
        self
    }

    /// Set the access collaborator. Default: [`AllowAll`].
    pub fn access(mut self, access: Arc<dyn AccessClient>) -> Self {
        self.access = access;
        self
    }

    /// Set the consumer push collaborator. Default: [`LoggingNotifier`].
    pub fn notifier(mut self, notifier: Arc<dyn TransferNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Set the workflow collaborator. Default: [`LoggingWorkflowClient`].
    pub fn workflow(mut self, workflow: Arc<dyn WorkflowClient>) -> Self {
        self.workflow = workflow;
        self
    }

    /// Set the failure-injection hook of the engine.
    pub fn fail_points(mut self, fail_points: Arc<dyn FailPoints>) -> Self {
        self.fail_points = fail_points;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<ConduitRuntimeConfig> {
        let pool = self
            .pool
            .ok_or_else(|| anyhow::anyhow!("pool is required"))?;
        if self.producer_retry_budget < 0 {
            anyhow::bail!("producer retry budget must not be negative");
        }

        Ok(ConduitRuntimeConfig {
            pool,
            http_addr: self.http_addr,
            engine: self.engine,
            producer_retry_budget: self.producer_retry_budget,
            operation_deadline: self.operation_deadline,
            restart_delay: self.restart_delay,
            retry: self.retry,
            cleanup: self.cleanup,
            run_migrations: self.run_migrations,
            access: self.access,
            notifier: self.notifier,
            workflow: self.workflow,
            fail_points: self.fail_points,
        })
    }
}

/// Configuration for a [`ConduitRuntime`].
pub struct ConduitRuntimeConfig {
    pool: SqlitePool,
    http_addr: Option<SocketAddr>,
    engine: EngineConfig,
    producer_retry_budget: i64,
    operation_deadline: Duration,
    restart_delay: Duration,
    retry: RetryConfig,
    cleanup: CleanupWorkerConfig,
    run_migrations: bool,
    access: Arc<dyn AccessClient>,
    notifier: Arc<dyn TransferNotifier>,
    workflow: Arc<dyn WorkflowClient>,
    fail_points: Arc<dyn FailPoints>,
}

impl std::fmt::Debug for ConduitRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConduitRuntimeConfig")
            .field("pool", &"...")
            .field("http_addr", &self.http_addr)
            .field("engine", &self.engine)
            .field("operation_deadline", &self.operation_deadline)
            .finish()
    }
}

impl ConduitRuntimeConfig {
    /// Start the runtime.
    ///
    /// Applies migrations, resumes unfinished operations of this instance,
    /// then spawns the cleanup worker and the HTTP listener.
    pub async fn start(self) -> Result<ConduitRuntime> {
        if self.run_migrations {
            crate::migrations::run(&self.pool).await?;
        }

        let locks = ChannelLocks::new();
        let deps = ActionDeps {
            locks: locks.clone(),
            notifier: self.notifier,
            workflow: self.workflow,
            restart_delay: self.restart_delay,
        };
        let engine = OperationEngine::with_fail_points(
            self.pool.clone(),
            self.engine,
            actions::registry(&deps),
            self.fail_points,
        );

        let recovered = engine.recover().await?;

        let teardown = Arc::new(OperationTeardown::new(engine.clone(), self.operation_deadline));
        let slots = Arc::new(SlotHandlerState {
            pool: self.pool.clone(),
            engine: engine.clone(),
            locks: locks.clone(),
            access: self.access,
            teardown,
            retry: self.retry.clone(),
            producer_retry_budget: self.producer_retry_budget,
            operation_deadline: self.operation_deadline,
        });
        let channels = Arc::new(ChannelHandlerState {
            pool: self.pool.clone(),
            engine: engine.clone(),
            locks,
            retry: self.retry,
            producer_retry_budget: self.producer_retry_budget,
            operation_deadline: self.operation_deadline,
        });

        let worker = CleanupWorker::new(self.pool.clone(), self.cleanup);
        let cleanup_shutdown = worker.shutdown_handle();
        let cleanup_handle = tokio::spawn(async move { worker.run().await });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (http_addr, http_handle) =
            spawn_http(self.http_addr, slots.clone(), channels.clone(), shutdown_rx).await?;

        info!(
            owner = %engine.owner(),
            recovered,
            http_addr = ?http_addr,
            "ConduitRuntime started"
        );

        Ok(ConduitRuntime {
            engine,
            slots,
            channels,
            shutdown_tx,
            cleanup_shutdown,
            cleanup_handle,
            http_handle,
            http_addr,
        })
    }
}

type HttpTask = Option<JoinHandle<Result<()>>>;

#[cfg(feature = "http")]
async fn spawn_http(
    addr: Option<SocketAddr>,
    slots: Arc<SlotHandlerState>,
    channels: Arc<ChannelHandlerState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(Option<SocketAddr>, HttpTask)> {
    let Some(addr) = addr else {
        return Ok((None, None));
    };

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    let router = crate::http::build_router(crate::http::AppState { slots, channels });

    let handle = tokio::spawn(async move {
        info!(addr = %local_addr, "HTTP server starting");
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                while shutdown_rx.changed().await.is_ok() {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                info!("HTTP server received shutdown signal");
            })
            .await?;
        info!("HTTP server stopped");
        Ok(())
    });
    Ok((Some(local_addr), Some(handle)))
}

#[cfg(not(feature = "http"))]
async fn spawn_http(
    addr: Option<SocketAddr>,
    _slots: Arc<SlotHandlerState>,
    _channels: Arc<ChannelHandlerState>,
    _shutdown_rx: watch::Receiver<bool>,
) -> Result<(Option<SocketAddr>, HttpTask)> {
    if addr.is_some() {
        tracing::warn!("HTTP address set but the http feature is disabled");
    }
    Ok((None, None))
}

/// A running conduit-core instance that can be embedded in an application.
///
/// The runtime manages:
/// - the operation engine and its worker pool
/// - the retention cleanup worker
/// - the HTTP listener, when configured
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct ConduitRuntime {
    engine: OperationEngine,
    slots: Arc<SlotHandlerState>,
    channels: Arc<ChannelHandlerState>,
    shutdown_tx: watch::Sender<bool>,
    cleanup_shutdown: Arc<Notify>,
    cleanup_handle: JoinHandle<()>,
    http_handle: HttpTask,
    http_addr: Option<SocketAddr>,
}

impl ConduitRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> ConduitRuntimeBuilder {
        ConduitRuntimeBuilder::new()
    }

    /// Address the HTTP listener is bound to, if one was started.
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    /// The operation engine.
    pub fn engine(&self) -> &OperationEngine {
        &self.engine
    }

    /// State of the slot protocol handlers.
    pub fn slots(&self) -> &Arc<SlotHandlerState> {
        &self.slots
    }

    /// State of the private channel API handlers.
    pub fn channels(&self) -> &Arc<ChannelHandlerState> {
        &self.channels
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops the HTTP listener, the cleanup worker and the engine's worker pool.
    /// Unfinished operations stay in the store and are resumed on the next start.
    pub async fn shutdown(self) -> Result<()> {
        info!("ConduitRuntime shutting down...");

        let _ = self.shutdown_tx.send(true);
        self.cleanup_shutdown.notify_one();
        self.engine.shutdown();

        let mut result = Ok(());
        if let Some(handle) = self.http_handle {
            result = match handle.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    error!("HTTP server error during shutdown: {}", e);
                    Err(e)
                }
                Err(e) => {
                    error!("HTTP server task panicked: {}", e);
                    Err(anyhow::anyhow!("HTTP server task panicked: {}", e))
                }
            };
        }
        if let Err(e) = self.cleanup_handle.await {
            error!("Cleanup worker task panicked: {}", e);
        }

        if result.is_ok() {
            info!("ConduitRuntime shutdown complete");
        }
        result
    }

    /// Check if the HTTP listener is still running.
    pub fn is_running(&self) -> bool {
        self.http_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    #[test]
    fn test_builder_requires_pool() {
        let err = ConduitRuntime::builder().build().unwrap_err();
        assert!(err.to_string().contains("pool is required"));
    }

    #[tokio::test]
    async fn test_builder_rejects_negative_budget() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let err = ConduitRuntime::builder()
            .pool(pool)
            .producer_retry_budget(-1)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("budget"));
    }

    #[tokio::test]
    async fn test_start_and_shutdown_without_http() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let runtime = ConduitRuntime::builder()
            .pool(pool)
            .instance_id("test-instance")
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert_eq!(runtime.engine().owner(), "test-instance");
        assert!(runtime.http_addr().is_none());
        assert!(!runtime.is_running());
        runtime.shutdown().await.unwrap();
    }
}
