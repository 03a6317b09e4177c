// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for retention of idempotency keys and finished operations.
//!
//! Each cycle:
//! 1. Deletes ledger entries older than `idempotency_ttl`
//! 2. Deletes finished operations older than `operation_ttl`, in batches
//!
//! Running operations are never touched, whatever their age.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use conduit_operations::{dao, ledger};
use sqlx::SqlitePool;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::error::{ChannelError, Result};

/// Configuration for the cleanup worker.
#[derive(Debug, Clone)]
pub struct CleanupWorkerConfig {
    /// Whether cleanup runs at all.
    pub enabled: bool,
    /// How often to run cleanup.
    pub poll_interval: Duration,
    /// Age after which ledger entries are dropped; replays stop working after it.
    pub idempotency_ttl: Duration,
    /// Age after which finished operations are dropped.
    pub operation_ttl: Duration,
    /// Maximum operations deleted per statement.
    pub batch_size: i64,
}

impl Default for CleanupWorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_secs(3600),           // 1 hour
            idempotency_ttl: Duration::from_secs(24 * 3600),    // 1 day
            operation_ttl: Duration::from_secs(7 * 24 * 3600), // 7 days
            batch_size: 500,
        }
    }
}

impl CleanupWorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `CONDUIT_CLEANUP_ENABLED`: "false" or "0" to disable (default: true)
    /// - `CONDUIT_CLEANUP_POLL_INTERVAL_SECS`: seconds between runs (default: 3600)
    /// - `CONDUIT_CLEANUP_IDEMPOTENCY_TTL_SECS`: ledger retention (default: 86400)
    /// - `CONDUIT_CLEANUP_OPERATION_TTL_SECS`: finished operation retention (default: 604800)
    /// - `CONDUIT_CLEANUP_BATCH_SIZE`: max operations per batch (default: 500)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let enabled = std::env::var("CONDUIT_CLEANUP_ENABLED")
            .map(|v| !(v == "false" || v == "0"))
            .unwrap_or(defaults.enabled);

        let secs = |name: &str, default: Duration| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };

        let batch_size = std::env::var("CONDUIT_CLEANUP_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|size: &i64| *size > 0)
            .unwrap_or(defaults.batch_size);

        Self {
            enabled,
            poll_interval: secs("CONDUIT_CLEANUP_POLL_INTERVAL_SECS", defaults.poll_interval),
            idempotency_ttl: secs("CONDUIT_CLEANUP_IDEMPOTENCY_TTL_SECS", defaults.idempotency_ttl),
            operation_ttl: secs("CONDUIT_CLEANUP_OPERATION_TTL_SECS", defaults.operation_ttl),
            batch_size,
        }
    }
}

/// Rows removed by one cleanup cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    /// Ledger entries deleted.
    pub idempotency_keys: u64,
    /// Operations deleted.
    pub operations: u64,
}

/// Background worker that drops expired idempotency keys and operations.
pub struct CleanupWorker {
    pool: SqlitePool,
    config: CleanupWorkerConfig,
    shutdown: Arc<Notify>,
}

impl CleanupWorker {
    /// Create a new cleanup worker.
    pub fn new(pool: SqlitePool, config: CleanupWorkerConfig) -> Self {
        Self {
            pool,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the cleanup loop until the shutdown signal is received.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Cleanup worker disabled");
            return;
        }

        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            idempotency_ttl_secs = self.config.idempotency_ttl.as_secs(),
            operation_ttl_secs = self.config.operation_ttl.as_secs(),
            batch_size = self.config.batch_size,
            "Cleanup worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Cleanup worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.run_once(Utc::now()).await {
                        error!(error = %e, "Cleanup cycle failed");
                    }
                }
            }
        }

        info!("Cleanup worker stopped");
    }

    /// Run one cleanup cycle as of `now`.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<CleanupStats> {
        let mut conn = self.pool.acquire().await?;
        let mut stats = CleanupStats::default();

        let ledger_cutoff = now - to_chrono(self.config.idempotency_ttl)?;
        stats.idempotency_keys = ledger::delete_older_than(&mut conn, ledger_cutoff).await?;

        let operation_cutoff = now - to_chrono(self.config.operation_ttl)?;
        loop {
            let deleted =
                dao::delete_finished_older_than(&mut conn, operation_cutoff, self.config.batch_size)
                    .await?;
            stats.operations += deleted;

            // Fewer than a full batch means nothing is left
            if deleted < self.config.batch_size as u64 {
                break;
            }
        }

        if stats != CleanupStats::default() {
            info!(
                idempotency_keys = stats.idempotency_keys,
                operations = stats.operations,
                "Cleanup cycle completed"
            );
        } else {
            debug!("Cleanup cycle completed, nothing expired");
        }
        Ok(stats)
    }
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|e| ChannelError::internal(format!("Invalid duration: {}", e)))
}
