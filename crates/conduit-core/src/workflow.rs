// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow collaborators.
//!
//! [`WorkflowTeardown`] runs inside the handler's transaction when a channel
//! becomes unrecoverable; [`OperationTeardown`] implements it by scheduling a
//! `destroy_channels` operation that also aborts the execution.
//! [`WorkflowClient`] is what that operation calls to abort.

use std::time::Duration;

use async_trait::async_trait;
use conduit_operations::{IdempotencyKey, OperationEngine};
use sqlx::SqliteConnection;
use tracing::{info, warn};

use crate::actions::destroy::{self, DestroyRequest};
use crate::error::CallError;
use crate::model::Channel;

/// Aborts workflow executions.
#[async_trait]
pub trait WorkflowClient: Send + Sync {
    /// Abort `execution_id`. Must tolerate repeated calls.
    async fn abort_execution(&self, execution_id: &str, reason: &str) -> Result<(), CallError>;
}

/// Logs the abort and succeeds. Used when no workflow service is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingWorkflowClient;

#[async_trait]
impl WorkflowClient for LoggingWorkflowClient {
    async fn abort_execution(&self, execution_id: &str, reason: &str) -> Result<(), CallError> {
        warn!(execution_id, reason, "Abort execution (no workflow service configured)");
        Ok(())
    }
}

#[cfg(feature = "server")]
pub use http::HttpWorkflowClient;

#[cfg(feature = "server")]
mod http {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tracing::debug;

    use super::WorkflowClient;
    use crate::error::CallError;

    /// Calls `POST {base}/v1/executions/{id}/abort` on the workflow service.
    #[derive(Debug, Clone)]
    pub struct HttpWorkflowClient {
        client: reqwest::Client,
        base_url: String,
    }

    impl HttpWorkflowClient {
        /// Create a client for the workflow service at `base_url`.
        pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, CallError> {
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| {
                    CallError::Permanent(format!("Failed to create HTTP client: {}", e))
                })?;
            Ok(Self {
                client,
                base_url: base_url.into().trim_end_matches('/').to_string(),
            })
        }
    }

    #[async_trait]
    impl WorkflowClient for HttpWorkflowClient {
        async fn abort_execution(&self, execution_id: &str, reason: &str) -> Result<(), CallError> {
            let url = format!("{}/v1/executions/{}/abort", self.base_url, execution_id);
            let response = self
                .client
                .post(&url)
                .json(&json!({ "reason": reason }))
                .send()
                .await
                .map_err(|e| CallError::Transient(format!("POST {} failed: {}", url, e)))?;

            let status = response.status();
            debug!(%url, status = status.as_u16(), "Abort execution requested");
            // Already finished or unknown executions need no abort.
            if status.is_success() || status.as_u16() == 404 || status.as_u16() == 409 {
                Ok(())
            } else if status.is_server_error() || status.as_u16() == 429 {
                Err(CallError::Transient(format!("POST {} returned {}", url, status)))
            } else {
                Err(CallError::Permanent(format!("POST {} returned {}", url, status)))
            }
        }
    }
}

/// Tears down a channel and its workflow from inside a transaction.
#[async_trait]
pub trait WorkflowTeardown: Send + Sync {
    /// Record the teardown in `conn`'s transaction.
    ///
    /// Returns the id of an operation to launch once the transaction commits.
    async fn destroy_channel_and_workflow(
        &self,
        conn: &mut SqliteConnection,
        channel: &Channel,
        reason: &str,
        idempotency_key: &str,
    ) -> crate::error::Result<Option<String>>;
}

/// Teardown through a durable `destroy_channels` operation.
#[derive(Debug, Clone)]
pub struct OperationTeardown {
    engine: OperationEngine,
    deadline: Duration,
}

impl OperationTeardown {
    /// Create a teardown that schedules operations on `engine`.
    pub fn new(engine: OperationEngine, deadline: Duration) -> Self {
        Self { engine, deadline }
    }
}

#[async_trait]
impl WorkflowTeardown for OperationTeardown {
    async fn destroy_channel_and_workflow(
        &self,
        conn: &mut SqliteConnection,
        channel: &Channel,
        reason: &str,
        idempotency_key: &str,
    ) -> crate::error::Result<Option<String>> {
        let request = DestroyRequest {
            execution_id: channel.execution_id.clone(),
            channel_ids: vec![channel.id.clone()],
            reason: Some(reason.to_string()),
            abort_workflow: true,
        };
        let hash = conduit_operations::ledger::request_hash(&request)?;
        let key = IdempotencyKey::new(format!("teardown:{}:{}", channel.id, idempotency_key), hash);

        let record = destroy::schedule(&self.engine, conn, request, Some(key), self.deadline).await?;
        info!(
            channel_id = %channel.id,
            execution_id = %channel.execution_id,
            operation_id = %record.id,
            reason,
            "Channel unrecoverable, teardown scheduled"
        );
        Ok(Some(record.id))
    }
}
