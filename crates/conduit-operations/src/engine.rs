// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The durable operation engine.
//!
//! Operations are created inside the caller's transaction with
//! [`OperationEngine::create`] and handed to the pool with
//! [`OperationEngine::launch`] once that transaction committed. Launching always
//! goes through the store: the action is rebuilt from its persisted state by the
//! factory registered for its kind, exactly as [`OperationEngine::recover`] does
//! after a restart.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::action::{OperationAction, StepContext, decode_state, encode_state};
use crate::dao::{self, Inserted};
use crate::error::{OperationError, Result};
use crate::executor::{OperationsExecutor, Runnable};
use crate::failpoint::{FailPoints, NoFailPoints};
use crate::operation::{
    IdempotencyKey, NewOperation, OperationFailure, OperationRecord, codes,
};
use crate::runner::OperationRunner;

type Factory =
    Box<dyn Fn(&OperationRecord, StepContext) -> Result<Box<dyn Runnable>> + Send + Sync>;

/// Maps persisted operation kinds to action factories.
#[derive(Default)]
pub struct ActionRegistry {
    factories: HashMap<&'static str, Factory>,
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("kinds", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ActionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register how to rebuild action `A` from its persisted state.
    pub fn register<A, F>(&mut self, factory: F) -> &mut Self
    where
        A: OperationAction,
        F: Fn(A::State) -> A + Send + Sync + 'static,
    {
        self.factories.insert(
            A::KIND,
            Box::new(move |record: &OperationRecord, ctx: StepContext| {
                let state = decode_state::<A>(&record.state)?;
                let runner: Box<dyn Runnable> = Box::new(OperationRunner::new(factory(state), ctx));
                Ok(runner)
            }),
        );
        self
    }

    /// Whether a factory is registered for `kind`.
    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    fn restore(&self, record: &OperationRecord, ctx: StepContext) -> Result<Box<dyn Runnable>> {
        let factory = self
            .factories
            .get(record.kind.as_str())
            .ok_or_else(|| OperationError::UnknownKind(record.kind.clone()))?;
        factory(record, ctx)
    }
}

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Coordinator instance id; recovery only resumes operations it created.
    pub owner: String,
    /// Maximum number of runners executing at once.
    pub max_concurrent: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            owner: "conduit-local".to_string(),
            max_concurrent: 16,
        }
    }
}

/// What the caller knows about a new operation before it is created.
#[derive(Debug, Clone, Default)]
pub struct OperationSpec {
    /// Human-readable description.
    pub description: String,
    /// Optional deadline.
    pub deadline: Option<DateTime<Utc>>,
    /// Optional idempotency key.
    pub idempotency_key: Option<IdempotencyKey>,
}

/// Durable operation engine: store, registry, and worker pool.
#[derive(Clone)]
pub struct OperationEngine {
    pool: SqlitePool,
    config: EngineConfig,
    registry: Arc<ActionRegistry>,
    executor: OperationsExecutor,
    fail_points: Arc<dyn FailPoints>,
}

impl std::fmt::Debug for OperationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationEngine")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("executor", &self.executor)
            .finish()
    }
}

impl OperationEngine {
    /// Create an engine with production failure injection (none).
    pub fn new(pool: SqlitePool, config: EngineConfig, registry: ActionRegistry) -> Self {
        Self::with_fail_points(pool, config, registry, Arc::new(NoFailPoints))
    }

    /// Create an engine with a custom failure-injection hook.
    pub fn with_fail_points(
        pool: SqlitePool,
        config: EngineConfig,
        registry: ActionRegistry,
        fail_points: Arc<dyn FailPoints>,
    ) -> Self {
        let executor = OperationsExecutor::new(config.max_concurrent);
        Self {
            pool,
            config,
            registry: Arc::new(registry),
            executor,
            fail_points,
        }
    }

    /// Owner id written to new operations.
    pub fn owner(&self) -> &str {
        &self.config.owner
    }

    /// Store pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Worker pool.
    pub fn executor(&self) -> &OperationsExecutor {
        &self.executor
    }

    /// Insert an operation for action `A` inside the caller's transaction.
    ///
    /// The operation does not run until [`launch`](Self::launch) is called after commit.
    pub async fn create<A: OperationAction>(
        &self,
        conn: &mut SqliteConnection,
        spec: OperationSpec,
        state: &A::State,
    ) -> Result<Inserted> {
        let op = NewOperation {
            id: Uuid::new_v4().to_string(),
            kind: A::KIND.to_string(),
            description: spec.description,
            created_by: self.config.owner.clone(),
            deadline: spec.deadline,
            idempotency_key: spec.idempotency_key,
            state: encode_state::<A>(state)?,
        };
        dao::create(conn, &op).await
    }

    /// Load an operation by id.
    pub async fn get(&self, id: &str) -> Result<Option<OperationRecord>> {
        let mut conn = self.pool.acquire().await?;
        dao::get(&mut conn, id).await
    }

    /// Submit a committed operation to the worker pool.
    ///
    /// Finished operations and operations already in flight are skipped.
    /// Returns whether a runner was submitted.
    pub async fn launch(&self, id: &str) -> Result<bool> {
        let record = self
            .get(id)
            .await?
            .ok_or_else(|| OperationError::NotFound(id.to_string()))?;
        self.launch_record(&record).await
    }

    async fn launch_record(&self, record: &OperationRecord) -> Result<bool> {
        if record.done || self.executor.is_in_flight(&record.id) {
            return Ok(false);
        }
        let ctx = StepContext::new(&record.id, self.pool.clone(), self.fail_points.clone());
        match self.registry.restore(record, ctx) {
            Ok(runner) => Ok(self.executor.submit(runner)),
            Err(
                e @ (OperationError::UnknownKind(_)
                | OperationError::StateVersion { .. }
                | OperationError::Json(_)),
            ) => {
                error!(operation_id = %record.id, kind = %record.kind, error = %e, "Cannot restore operation");
                let mut conn = self.pool.acquire().await?;
                dao::fail(
                    &mut conn,
                    &record.id,
                    &OperationFailure::new(codes::INTERNAL, e.to_string()),
                )
                .await?;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Resume every unfinished operation owned by this instance.
    ///
    /// Returns the number of operations submitted.
    pub async fn recover(&self) -> Result<usize> {
        let records = {
            let mut conn = self.pool.acquire().await?;
            dao::list_unfinished(&mut conn, &self.config.owner).await?
        };

        let mut submitted = 0;
        for record in &records {
            match self.launch_record(record).await {
                Ok(true) => submitted += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(operation_id = %record.id, error = %e, "Failed to recover operation");
                }
            }
        }

        info!(
            owner = %self.config.owner,
            found = records.len(),
            submitted,
            "Recovered unfinished operations"
        );
        Ok(submitted)
    }

    /// Wait until the worker pool has nothing scheduled or running.
    pub async fn wait_idle(&self) {
        self.executor.wait_idle().await;
    }

    /// Stop the worker pool.
    pub fn shutdown(&self) {
        self.executor.shutdown();
    }
}
