// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `destroy_channels`: delete channels one by one, then optionally abort the workflow.
//!
//! Each channel is deleted in its own transaction together with the updated
//! operation state, so a crash between channels resumes with the rest. A channel
//! is only deleted once no PENDING or ACTIVE transfer is left on it; until then the
//! step restarts. Past the deadline the remaining channels are deleted regardless.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conduit_operations::{
    IdempotencyKey, OperationAction, OperationEngine, OperationFailure, OperationRecord,
    OperationSpec, StepContext, StepResult, Transient, codes,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqliteConnection;
use tracing::{debug, error, info, warn};

use crate::db::{channels, transfers};
use crate::error::Result;
use crate::lock::ChannelLocks;
use crate::model::LifeStatus;
use crate::workflow::WorkflowClient;

/// Checkpoint after each deleted channel.
pub const AFTER_CHANNEL: &str = "destroy_channels.after_channel";
/// Checkpoint after the workflow was aborted.
pub const AFTER_ABORT: &str = "destroy_channels.after_abort";
/// Checkpoint after the outcome was written.
pub const AFTER_COMPLETE: &str = "destroy_channels.after_complete";

/// What to destroy; also the idempotency payload of the operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestroyRequest {
    /// Execution owning the channels.
    pub execution_id: String,
    /// Channels to delete.
    pub channel_ids: Vec<String>,
    /// Why, forwarded to the workflow service.
    pub reason: Option<String>,
    /// Whether to abort the execution afterwards.
    pub abort_workflow: bool,
}

/// Persisted state of [`DestroyChannelsAction`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestroyState {
    /// Execution owning the channels.
    pub execution_id: String,
    /// Channels to delete.
    pub to_destroy: Vec<String>,
    /// Channels already deleted.
    pub destroyed: Vec<String>,
    /// Why.
    pub reason: Option<String>,
    /// Whether to abort the execution.
    pub abort_workflow: bool,
    /// Whether the abort was acknowledged.
    #[serde(default)]
    pub aborted: bool,
}

impl From<DestroyRequest> for DestroyState {
    fn from(request: DestroyRequest) -> Self {
        Self {
            execution_id: request.execution_id,
            to_destroy: request.channel_ids,
            destroyed: Vec::new(),
            reason: request.reason,
            abort_workflow: request.abort_workflow,
            aborted: false,
        }
    }
}

/// Steps of [`DestroyChannelsAction`].
#[derive(Debug, Clone, Copy)]
pub enum DestroyStep {
    /// Delete every channel not yet destroyed.
    DestroyChannels,
    /// Abort the execution, if requested.
    AbortWorkflow,
    /// Write the outcome.
    Complete,
}

/// Deletes channels and optionally aborts their execution.
pub struct DestroyChannelsAction {
    pub(crate) state: DestroyState,
    pub(crate) locks: ChannelLocks,
    pub(crate) workflow: Arc<dyn WorkflowClient>,
    pub(crate) restart_delay: Duration,
}

/// Mark the channels DESTROYING and create the operation inside `conn`'s transaction.
///
/// The caller launches the returned operation after commit.
pub async fn schedule(
    engine: &OperationEngine,
    conn: &mut SqliteConnection,
    request: DestroyRequest,
    idempotency_key: Option<IdempotencyKey>,
    deadline: Duration,
) -> Result<OperationRecord> {
    for channel_id in &request.channel_ids {
        channels::set_life_status(conn, channel_id, LifeStatus::Destroying).await?;
    }

    let description = match request.channel_ids.as_slice() {
        [single] => format!("Destroy channel {}", single),
        _ => format!("Destroy channels of execution {}", request.execution_id),
    };
    let spec = OperationSpec {
        description,
        deadline: Some(super::deadline_from_now(deadline)?),
        idempotency_key,
    };

    let inserted = engine
        .create::<DestroyChannelsAction>(conn, spec, &DestroyState::from(request))
        .await?;
    Ok(inserted.into_record())
}

impl DestroyChannelsAction {
    async fn destroy_channels(&mut self, ctx: &StepContext) -> conduit_operations::Result<StepResult> {
        let remaining: Vec<String> = self
            .state
            .to_destroy
            .iter()
            .filter(|id| !self.state.destroyed.contains(id))
            .cloned()
            .collect();
        if remaining.is_empty() {
            return Ok(StepResult::AlreadyDone);
        }

        let mut waiting = Vec::new();
        for channel_id in remaining {
            let _lock = self.locks.lock(&channel_id).await;

            let mut tx = ctx.pool().begin().await?;
            let in_flight = transfers::count_in_flight(&mut tx, &channel_id).await?;
            if in_flight > 0 {
                tx.rollback().await?;
                debug!(channel_id = %channel_id, in_flight, "Channel still has transfers in flight");
                waiting.push(channel_id);
                continue;
            }

            let mut next = self.state.clone();
            next.destroyed.push(channel_id.clone());

            let existed = channels::delete(&mut tx, &channel_id).await?;
            ctx.save_state::<Self>(&mut tx, &next).await?;
            tx.commit().await?;

            self.state = next;
            debug!(channel_id = %channel_id, existed, "Channel destroyed");
            ctx.fail_point(AFTER_CHANNEL)?;
        }

        if !waiting.is_empty() {
            debug!(
                execution_id = %self.state.execution_id,
                waiting = waiting.len(),
                "Waiting for in-flight transfers before destroying channels"
            );
            return Ok(StepResult::restart_after(self.restart_delay));
        }
        Ok(StepResult::Continue)
    }

    async fn abort_workflow(&mut self, ctx: &StepContext) -> conduit_operations::Result<StepResult> {
        if !self.state.abort_workflow || self.state.aborted {
            return Ok(StepResult::AlreadyDone);
        }

        let reason = self.state.reason.as_deref().unwrap_or("channel destroyed");
        match self
            .workflow
            .abort_execution(&self.state.execution_id, reason)
            .await
        {
            Ok(()) => {
                info!(execution_id = %self.state.execution_id, "Execution aborted");
                self.state.aborted = true;
                ctx.fail_point(AFTER_ABORT)?;
                Ok(StepResult::Continue)
            }
            Err(e) if e.is_transient() => {
                warn!(execution_id = %self.state.execution_id, error = %e, "Abort failed, will retry");
                Ok(StepResult::restart_after(self.restart_delay))
            }
            Err(e) => {
                error!(execution_id = %self.state.execution_id, error = %e, "Abort rejected");
                let mut tx = ctx.pool().begin().await?;
                ctx.fail(
                    &mut tx,
                    &OperationFailure::new(
                        codes::FAILED_PRECONDITION,
                        format!("Cannot abort execution: {}", e),
                    ),
                )
                .await?;
                tx.commit().await?;
                Ok(StepResult::Finish)
            }
        }
    }

    async fn complete(&mut self, ctx: &StepContext) -> conduit_operations::Result<StepResult> {
        let mut tx = ctx.pool().begin().await?;
        ctx.complete(&mut tx, &json!({ "destroyed": self.state.destroyed }))
            .await?;
        tx.commit().await?;
        ctx.fail_point(AFTER_COMPLETE)?;
        Ok(StepResult::Finish)
    }
}

#[async_trait]
impl OperationAction for DestroyChannelsAction {
    type State = DestroyState;
    type Step = DestroyStep;
    const KIND: &'static str = "destroy_channels";

    fn steps(&self) -> &'static [DestroyStep] {
        &[
            DestroyStep::DestroyChannels,
            DestroyStep::AbortWorkflow,
            DestroyStep::Complete,
        ]
    }

    fn state(&self) -> &DestroyState {
        &self.state
    }

    async fn execute(
        &mut self,
        step: DestroyStep,
        ctx: &StepContext,
    ) -> conduit_operations::Result<StepResult> {
        match step {
            DestroyStep::DestroyChannels => self.destroy_channels(ctx).await,
            DestroyStep::AbortWorkflow => self.abort_workflow(ctx).await,
            DestroyStep::Complete => self.complete(ctx).await,
        }
    }

    /// Deletes what is left, in-flight transfers included. The abort is skipped.
    async fn on_expired(&mut self, conn: &mut SqliteConnection) -> conduit_operations::Result<()> {
        let remaining: Vec<String> = self
            .state
            .to_destroy
            .iter()
            .filter(|id| !self.state.destroyed.contains(id))
            .cloned()
            .collect();
        for channel_id in &remaining {
            channels::delete(conn, channel_id).await?;
        }
        warn!(
            execution_id = %self.state.execution_id,
            forced = remaining.len(),
            "Destroy operation expired, remaining channels deleted"
        );
        self.state.destroyed.extend(remaining);
        Ok(())
    }

    async fn on_finished(&mut self) {
        info!(
            execution_id = %self.state.execution_id,
            destroyed = self.state.destroyed.len(),
            "Destroy operation finished"
        );
    }
}
