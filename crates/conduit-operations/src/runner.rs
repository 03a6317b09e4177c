// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Drives one action through its steps.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::action::{OperationAction, StepContext, encode_state};
use crate::dao;
use crate::error::{OperationError, Result};
use crate::executor::{RunNext, Runnable};
use crate::operation::{OperationFailure, OperationRecord, codes};
use crate::retry::Transient;
use crate::step::{DEFAULT_RESTART_DELAY, StepResult};

/// Delay before retrying after the store could not be read or written.
const STORE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Runner for a single operation.
///
/// Holds the live action between runs: after a [`StepResult::Continue`] the state
/// is persisted and the runner is resubmitted positioned on the next step. A fresh
/// or recovered runner starts at the first step.
pub struct OperationRunner<A: OperationAction> {
    action: A,
    ctx: StepContext,
    next_step: usize,
    unsaved: bool,
}

impl<A: OperationAction> OperationRunner<A> {
    /// Create a runner starting at the first step.
    pub fn new(action: A, ctx: StepContext) -> Self {
        Self {
            action,
            ctx,
            next_step: 0,
            unsaved: false,
        }
    }

    async fn load(&self) -> Result<Option<OperationRecord>> {
        let mut conn = self.ctx.pool().acquire().await?;
        dao::get(&mut conn, self.ctx.operation_id()).await
    }

    async fn persist_state(&self) -> Result<()> {
        let encoded = encode_state::<A>(self.action.state())?;
        let mut conn = self.ctx.pool().acquire().await?;
        dao::update_state(&mut conn, self.ctx.operation_id(), &encoded).await
    }

    async fn expire(&mut self) -> RunNext {
        let failure = OperationFailure::new(codes::DEADLINE_EXCEEDED, "Operation deadline exceeded");
        let result: Result<()> = async {
            let mut tx = self.ctx.pool().begin().await?;
            dao::fail(&mut tx, self.ctx.operation_id(), &failure).await?;
            self.action.on_expired(&mut tx).await?;
            tx.commit().await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                warn!("Operation expired");
                self.action.on_finished().await;
                RunNext::Stop
            }
            Err(OperationError::AlreadyCompleted(_)) => RunNext::Stop,
            Err(e) => {
                warn!(error = %e, "Failed to expire operation, will retry");
                RunNext::Reschedule(STORE_RETRY_DELAY)
            }
        }
    }

    async fn fail_internal(&mut self, message: String) -> RunNext {
        let failure = OperationFailure::new(codes::INTERNAL, message);
        let result: Result<()> = async {
            let mut conn = self.ctx.pool().acquire().await?;
            dao::fail(&mut conn, self.ctx.operation_id(), &failure).await
        }
        .await;

        match result {
            Ok(()) => {
                self.action.on_finished().await;
                RunNext::Stop
            }
            Err(OperationError::AlreadyCompleted(_)) | Err(OperationError::NotFound(_)) => {
                RunNext::Stop
            }
            Err(e) => {
                warn!(error = %e, "Failed to record operation failure, will retry");
                RunNext::Reschedule(STORE_RETRY_DELAY)
            }
        }
    }
}

#[async_trait]
impl<A: OperationAction> Runnable for OperationRunner<A> {
    fn operation_id(&self) -> &str {
        self.ctx.operation_id()
    }

    #[tracing::instrument(skip(self), fields(operation_id = %self.ctx.operation_id(), kind = A::KIND))]
    async fn run(&mut self) -> RunNext {
        // 1. Reload the row: the outcome may have been written elsewhere
        let record = match self.load().await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!("Operation not found, dropping runner");
                return RunNext::Stop;
            }
            Err(e) => {
                warn!(error = %e, "Failed to load operation, will retry");
                return RunNext::Reschedule(STORE_RETRY_DELAY);
            }
        };
        if record.done {
            warn!("Operation already completed outside of this runner");
            return RunNext::Stop;
        }

        // 2. Flush state whose persistence failed on the previous run
        if self.unsaved {
            match self.persist_state().await {
                Ok(()) => self.unsaved = false,
                Err(OperationError::AlreadyCompleted(_)) | Err(OperationError::NotFound(_)) => {
                    return RunNext::Stop;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to persist operation state, will retry");
                    return RunNext::Reschedule(STORE_RETRY_DELAY);
                }
            }
        }

        // 3. Execute steps until one needs a scheduling decision
        let steps = self.action.steps();
        while let Some(step) = steps.get(self.next_step).copied() {
            if record.is_expired(Utc::now()) {
                return self.expire().await;
            }

            debug!(step = ?step, index = self.next_step, "Executing step");

            match self.action.execute(step, &self.ctx).await {
                Ok(StepResult::AlreadyDone) => {
                    self.next_step += 1;
                }
                Ok(StepResult::Continue) => {
                    self.next_step += 1;
                    return match self.persist_state().await {
                        Ok(()) => RunNext::Reschedule(Duration::ZERO),
                        Err(OperationError::AlreadyCompleted(_))
                        | Err(OperationError::NotFound(_)) => {
                            warn!("Operation completed while running, dropping runner");
                            RunNext::Stop
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to persist operation state, will retry");
                            self.unsaved = true;
                            RunNext::Reschedule(STORE_RETRY_DELAY)
                        }
                    };
                }
                Ok(StepResult::Restart(after)) => {
                    debug!(step = ?step, delay_ms = after.as_millis() as u64, "Restarting step");
                    return RunNext::Reschedule(after);
                }
                Ok(StepResult::Finish) => {
                    info!(step = ?step, "Operation finished");
                    self.action.on_finished().await;
                    return RunNext::Stop;
                }
                Err(OperationError::Injected(failure)) => {
                    error!(checkpoint = %failure.0, "Terminated by injected failure");
                    return RunNext::Stop;
                }
                Err(OperationError::AlreadyCompleted(_)) => {
                    warn!(step = ?step, "Operation completed concurrently, dropping runner");
                    return RunNext::Stop;
                }
                Err(e) if e.is_transient() => {
                    warn!(step = ?step, error = %e, "Transient step failure, restarting");
                    return RunNext::Reschedule(DEFAULT_RESTART_DELAY);
                }
                Err(e) => {
                    error!(step = ?step, error = %e, "Step failed");
                    return self.fail_internal(e.to_string()).await;
                }
            }
        }

        error!("Operation ran out of steps without recording an outcome");
        self.fail_internal("Operation ran out of steps without an outcome".to_string())
            .await
    }
}
