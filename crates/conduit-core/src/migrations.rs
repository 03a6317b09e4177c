// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for conduit-core.
//!
//! Core extends the conduit-operations schema (operations, idempotency ledger)
//! with channels, peers, and transfers. [`run`] merges both sets into a single
//! migrator so SQLx sees them as one ordered history.
//!
//! # Example
//!
//! ```ignore
//! use sqlx::SqlitePool;
//! use conduit_core::migrations;
//!
//! let pool = SqlitePool::connect("sqlite:conduit.db?mode=rwc").await?;
//! migrations::run(&pool).await?;
//! ```

use sqlx::migrate::{MigrateError, Migration, Migrator};

/// Channel-specific migrations embedded at compile time.
static CHANNEL_MIGRATOR: Migrator = sqlx::migrate!("./migrations/sqlite");

/// Migration source merging engine and channel migrations.
#[derive(Debug)]
struct CombinedMigrations;

impl<'s> sqlx::migrate::MigrationSource<'s> for CombinedMigrations {
    fn resolve(
        self,
    ) -> std::pin::Pin<
        Box<
            dyn std::future::Future<
                    Output = Result<Vec<Migration>, Box<dyn std::error::Error + Send + Sync>>,
                > + Send
                + 's,
        >,
    > {
        Box::pin(async move { Ok(all()) })
    }
}

fn all() -> Vec<Migration> {
    let mut migrations: Vec<Migration> = conduit_operations::migrations::SQLITE
        .iter()
        .cloned()
        .collect();
    migrations.extend(CHANNEL_MIGRATOR.iter().cloned());
    migrations.sort_by_key(|m| m.version);
    migrations
}

/// Migrator with engine and channel migrations.
pub async fn migrator() -> Result<Migrator, MigrateError> {
    Migrator::new(CombinedMigrations).await
}

/// Run all migrations (engine + channels).
///
/// Safe to call multiple times; already-applied migrations are skipped.
pub async fn run(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    let migrator = migrator().await?;
    migrator.run(pool).await
}
