// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable operations run by the engine on behalf of the channel handlers.
//!
//! | Kind | Action | Created by |
//! |------|--------|------------|
//! | `start_transfer` | [`StartTransferAction`] | producer `bind` |
//! | `destroy_channels` | [`DestroyChannelsAction`] | `destroy`, `destroy_all`, unrecoverable channels |

pub mod destroy;
pub mod start_transfer;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use conduit_operations::step::DEFAULT_RESTART_DELAY;
use conduit_operations::{ActionRegistry, OperationEngine};
use tracing::warn;

use crate::error::{ChannelError, Result};
use crate::lock::ChannelLocks;
use crate::notifier::TransferNotifier;
use crate::workflow::WorkflowClient;

pub use destroy::{DestroyChannelsAction, DestroyRequest, DestroyState};
pub use start_transfer::{StartTransferAction, StartTransferState};

/// What the actions need to run.
#[derive(Clone)]
pub struct ActionDeps {
    /// Channel locks shared with the handlers.
    pub locks: ChannelLocks,
    /// Consumer push client.
    pub notifier: Arc<dyn TransferNotifier>,
    /// Workflow abort client.
    pub workflow: Arc<dyn WorkflowClient>,
    /// Delay before retrying a collaborator call that failed transiently.
    pub restart_delay: Duration,
}

impl ActionDeps {
    /// Dependencies with the default restart delay.
    pub fn new(
        locks: ChannelLocks,
        notifier: Arc<dyn TransferNotifier>,
        workflow: Arc<dyn WorkflowClient>,
    ) -> Self {
        Self {
            locks,
            notifier,
            workflow,
            restart_delay: DEFAULT_RESTART_DELAY,
        }
    }
}

impl std::fmt::Debug for ActionDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionDeps")
            .field("locks", &self.locks)
            .field("notifier", &"...")
            .field("workflow", &"...")
            .field("restart_delay", &self.restart_delay)
            .finish()
    }
}

/// Registry rebuilding every conduit action from its persisted state.
pub fn registry(deps: &ActionDeps) -> ActionRegistry {
    let mut registry = ActionRegistry::new();

    let start = deps.clone();
    registry.register::<StartTransferAction, _>(move |state| StartTransferAction {
        state,
        locks: start.locks.clone(),
        notifier: start.notifier.clone(),
        restart_delay: start.restart_delay,
    });

    let destroy = deps.clone();
    registry.register::<DestroyChannelsAction, _>(move |state| DestroyChannelsAction {
        state,
        locks: destroy.locks.clone(),
        workflow: destroy.workflow.clone(),
        restart_delay: destroy.restart_delay,
    });

    registry
}

/// Submit operations created by a committed transaction.
///
/// Failures are only logged: the operations stay in the store and are picked up
/// by recovery on the next start.
pub async fn launch_all(engine: &OperationEngine, operation_ids: &[String]) {
    for id in operation_ids {
        if let Err(e) = engine.launch(id).await {
            warn!(operation_id = %id, error = %e, "Failed to launch operation");
        }
    }
}

pub(crate) fn deadline_from_now(after: Duration) -> Result<DateTime<Utc>> {
    let after = chrono::Duration::from_std(after)
        .map_err(|e| ChannelError::internal(format!("deadline out of range: {e}")))?;
    Ok(Utc::now() + after)
}
