// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `start_transfer`: push `startTransfer` to a consumer, then activate the transfer.
//!
//! Created in the producer's bind transaction for every PENDING transfer and
//! launched after commit, so the bind reply never waits on slow slots. A push that
//! is rejected or runs past the deadline fails the transfer and leaves the consumer
//! waiting for the next producer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conduit_operations::{
    OperationAction, OperationFailure, StepContext, StepResult, Transient, codes,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqliteConnection;
use tracing::{debug, error, warn};

use crate::db::{peers, transfers};
use crate::lock::ChannelLocks;
use crate::notifier::{StartTransfer, TransferNotifier};

/// Checkpoint after the consumer acknowledged the push.
pub const AFTER_NOTIFY: &str = "start_transfer.after_notify";
/// Checkpoint after the transfer was activated.
pub const AFTER_ACTIVATE: &str = "start_transfer.after_activate";

/// Description written to transfers whose push never went through.
pub const EXPIRED_DESCRIPTION: &str = "start transfer notification expired";

/// Persisted state of [`StartTransferAction`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTransferState {
    /// The push to deliver.
    pub request: StartTransfer,
    /// Whether the consumer acknowledged it.
    #[serde(default)]
    pub notified: bool,
}

impl StartTransferState {
    /// State of a push that has not been sent yet.
    pub fn new(request: StartTransfer) -> Self {
        Self {
            request,
            notified: false,
        }
    }
}

/// Steps of [`StartTransferAction`].
#[derive(Debug, Clone, Copy)]
pub enum StartTransferStep {
    /// Deliver the push.
    Notify,
    /// PENDING -> ACTIVE and write the outcome.
    Activate,
}

/// Delivers one `startTransfer` push.
pub struct StartTransferAction {
    pub(crate) state: StartTransferState,
    pub(crate) locks: ChannelLocks,
    pub(crate) notifier: Arc<dyn TransferNotifier>,
    pub(crate) restart_delay: Duration,
}

impl StartTransferAction {
    async fn notify(&mut self, ctx: &StepContext) -> conduit_operations::Result<StepResult> {
        if self.state.notified {
            return Ok(StepResult::AlreadyDone);
        }

        let request = &self.state.request;
        match self.notifier.start_transfer(request).await {
            Ok(()) => {
                debug!(transfer_id = %request.transfer_id, "Consumer notified");
                self.state.notified = true;
                ctx.fail_point(AFTER_NOTIFY)?;
                Ok(StepResult::Continue)
            }
            Err(e) if e.is_transient() => {
                warn!(transfer_id = %request.transfer_id, error = %e, "Start transfer push failed, will retry");
                Ok(StepResult::restart_after(self.restart_delay))
            }
            Err(e) => {
                error!(transfer_id = %request.transfer_id, error = %e, "Start transfer push rejected");
                let description = format!("start transfer rejected: {}", e);
                let _lock = self.locks.lock(&request.channel_id).await;
                let mut tx = ctx.pool().begin().await?;
                release_consumer(&mut tx, request, &description).await?;
                ctx.fail(
                    &mut tx,
                    &OperationFailure::new(codes::FAILED_PRECONDITION, description.clone()),
                )
                .await?;
                tx.commit().await?;
                Ok(StepResult::Finish)
            }
        }
    }

    async fn activate(&mut self, ctx: &StepContext) -> conduit_operations::Result<StepResult> {
        let request = &self.state.request;
        let _lock = self.locks.lock(&request.channel_id).await;

        let mut tx = ctx.pool().begin().await?;
        let activated = transfers::activate(&mut tx, &request.transfer_id).await?;
        ctx.complete(
            &mut tx,
            &json!({ "transferId": request.transfer_id, "activated": activated }),
        )
        .await?;
        tx.commit().await?;

        if !activated {
            debug!(transfer_id = %request.transfer_id, "Transfer left PENDING before activation");
        }
        ctx.fail_point(AFTER_ACTIVATE)?;
        Ok(StepResult::Finish)
    }
}

/// Fail the transfer and put its consumer back among the waiting ones.
///
/// The consumer is only released if the transfer was still in flight.
async fn release_consumer(
    conn: &mut SqliteConnection,
    request: &StartTransfer,
    description: &str,
) -> conduit_operations::Result<bool> {
    if !transfers::mark_failed(conn, &request.transfer_id, None, description).await? {
        return Ok(false);
    }
    peers::disconnect(conn, &request.channel_id, &request.consumer.peer_id).await?;
    Ok(true)
}

#[async_trait]
impl OperationAction for StartTransferAction {
    type State = StartTransferState;
    type Step = StartTransferStep;
    const KIND: &'static str = "start_transfer";

    fn steps(&self) -> &'static [StartTransferStep] {
        &[StartTransferStep::Notify, StartTransferStep::Activate]
    }

    fn state(&self) -> &StartTransferState {
        &self.state
    }

    async fn execute(
        &mut self,
        step: StartTransferStep,
        ctx: &StepContext,
    ) -> conduit_operations::Result<StepResult> {
        match step {
            StartTransferStep::Notify => self.notify(ctx).await,
            StartTransferStep::Activate => self.activate(ctx).await,
        }
    }

    async fn on_expired(&mut self, conn: &mut SqliteConnection) -> conduit_operations::Result<()> {
        let failed = release_consumer(conn, &self.state.request, EXPIRED_DESCRIPTION).await?;
        warn!(
            transfer_id = %self.state.request.transfer_id,
            failed,
            "Start transfer expired"
        );
        Ok(())
    }
}
