// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Actions: the domain-specific half of a durable operation.
//!
//! An action owns a serializable state and declares an ordered list of steps.
//! The engine drives the steps, persists the state after every step that returns
//! [`StepResult::Continue`], and rebuilds the action from the persisted state after
//! a restart. Each step should first consult the state and return
//! [`StepResult::AlreadyDone`] when its effect has already landed.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};

use crate::dao;
use crate::error::{OperationError, Result};
use crate::failpoint::{FailPoints, InjectedFailure};
use crate::operation::OperationFailure;
use crate::step::StepResult;

/// A resumable unit of work driven by the engine.
#[async_trait]
pub trait OperationAction: Send + Sync + 'static {
    /// Everything needed to resume after a crash.
    type State: Serialize + DeserializeOwned + Send + Sync;
    /// Closed set of steps, executed in the order returned by [`steps`](Self::steps).
    type Step: Copy + Debug + Send + Sync + 'static;

    /// Stable kind name stored with the operation.
    const KIND: &'static str;
    /// Version of the persisted state layout.
    const STATE_VERSION: u32 = 1;

    /// Ordered steps.
    fn steps(&self) -> &'static [Self::Step];

    /// Current in-memory state.
    fn state(&self) -> &Self::State;

    /// Execute one step.
    ///
    /// Errors are reserved for exceptional conditions. Transient errors make the
    /// engine restart the step, [`OperationError::Injected`] terminates the runner,
    /// anything else fails the operation with `INTERNAL`.
    async fn execute(&mut self, step: Self::Step, ctx: &StepContext) -> Result<StepResult>;

    /// Cleanup after the deadline passed. Runs in the transaction that fails the
    /// operation and must be idempotent.
    async fn on_expired(&mut self, _conn: &mut SqliteConnection) -> Result<()> {
        Ok(())
    }

    /// Called once the operation reached an outcome through this runner.
    async fn on_finished(&mut self) {}
}

/// Persisted form of an action's state.
#[derive(Debug, Serialize, Deserialize)]
pub struct StateEnvelope<S> {
    /// Action kind.
    pub kind: String,
    /// State layout version.
    pub version: u32,
    /// Action-owned state.
    pub state: S,
}

/// Encode an action state into its versioned envelope.
pub fn encode_state<A: OperationAction>(state: &A::State) -> Result<String> {
    let envelope = StateEnvelope {
        kind: A::KIND.to_string(),
        version: A::STATE_VERSION,
        state,
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Decode an envelope written by [`encode_state`], checking kind and version.
pub fn decode_state<A: OperationAction>(json: &str) -> Result<A::State> {
    let envelope: StateEnvelope<serde_json::Value> = serde_json::from_str(json)?;
    if envelope.kind != A::KIND {
        return Err(OperationError::UnknownKind(envelope.kind));
    }
    if envelope.version != A::STATE_VERSION {
        return Err(OperationError::StateVersion {
            kind: envelope.kind,
            expected: A::STATE_VERSION,
            found: envelope.version,
        });
    }
    Ok(serde_json::from_value(envelope.state)?)
}

/// Handles available to a step while it runs.
#[derive(Clone)]
pub struct StepContext {
    operation_id: String,
    pool: SqlitePool,
    fail_points: Arc<dyn FailPoints>,
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("operation_id", &self.operation_id)
            .field("pool", &"...")
            .field("fail_points", &"...")
            .finish()
    }
}

impl StepContext {
    /// Create a context for one operation.
    pub fn new(
        operation_id: impl Into<String>,
        pool: SqlitePool,
        fail_points: Arc<dyn FailPoints>,
    ) -> Self {
        Self {
            operation_id: operation_id.into(),
            pool,
            fail_points,
        }
    }

    /// Id of the running operation.
    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    /// Store pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Failure-injection checkpoint; call right after a side effect.
    pub fn fail_point(&self, name: &str) -> std::result::Result<(), InjectedFailure> {
        self.fail_points.check(name)
    }

    /// Persist `state` inside the caller's transaction, together with the side
    /// effect it records.
    pub async fn save_state<A: OperationAction>(
        &self,
        conn: &mut SqliteConnection,
        state: &A::State,
    ) -> Result<()> {
        let encoded = encode_state::<A>(state)?;
        dao::update_state(conn, &self.operation_id, &encoded).await
    }

    /// Record a successful outcome inside the caller's transaction.
    pub async fn complete<R: Serialize + ?Sized>(
        &self,
        conn: &mut SqliteConnection,
        response: &R,
    ) -> Result<()> {
        let value = serde_json::to_value(response)?;
        dao::complete(conn, &self.operation_id, &value).await
    }

    /// Record a failed outcome inside the caller's transaction.
    pub async fn fail(&self, conn: &mut SqliteConnection, failure: &OperationFailure) -> Result<()> {
        dao::fail(conn, &self.operation_id, failure).await
    }
}
