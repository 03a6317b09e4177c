// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Private channel API handlers.
//!
//! Used by the workflow service to create channels for an execution, tear
//! them down, and inspect them. Destruction is asynchronous: the handlers
//! return an [`OperationHandle`] that can be polled with
//! [`handle_get_operation`].

use std::time::Duration;

use conduit_operations::ledger::{self, LedgerEntry};
use conduit_operations::{
    IdempotencyKey, OperationEngine, OperationHandle, OperationRecord, RetryConfig, dao,
    with_retries,
};
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info, instrument};

use crate::actions::destroy::{self, DestroyRequest};
use crate::actions::launch_all;
use crate::db::channels::{self, NewChannel};
use crate::db::peers::{self, NewPeer};
use crate::error::{ChannelError, Result};
use crate::lock::ChannelLocks;
use crate::model::{self, Channel, LifeStatus, PeerDescription, Priority, Role};
use crate::slot_handlers::{DEFAULT_OPERATION_DEADLINE, DEFAULT_PRODUCER_RETRY_BUDGET};
use crate::status::{self, ChannelStatus};

const CREATE_SCOPE: &str = "channel_create";

/// Peer id of the storage producer created with a channel.
pub const STORAGE_PRODUCER_ID: &str = "storage-producer";
/// Peer id of the storage consumer created with a channel.
pub const STORAGE_CONSUMER_ID: &str = "storage-consumer";

/// Shared state for channel handlers.
#[derive(Debug, Clone)]
pub struct ChannelHandlerState {
    /// Store pool.
    pub pool: SqlitePool,
    /// Engine receiving destroy operations.
    pub engine: OperationEngine,
    /// Per-channel locks.
    pub locks: ChannelLocks,
    /// Retry policy around each transaction.
    pub retry: RetryConfig,
    /// Initial retry budget of the storage producer.
    pub producer_retry_budget: i64,
    /// Deadline of destroy operations.
    pub operation_deadline: Duration,
}

impl ChannelHandlerState {
    /// Create channel handler state with default limits.
    pub fn new(pool: SqlitePool, engine: OperationEngine, locks: ChannelLocks) -> Self {
        Self {
            pool,
            engine,
            locks,
            retry: RetryConfig::default(),
            producer_retry_budget: DEFAULT_PRODUCER_RETRY_BUDGET,
            operation_deadline: DEFAULT_OPERATION_DEADLINE,
        }
    }
}

/// Create a channel of an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChannelRequest {
    /// Owning execution.
    pub execution_id: String,
    /// Workflow name.
    pub workflow_name: String,
    /// Owner of the workflow.
    pub user_id: String,
    /// Channel name, unique within the execution.
    pub name: String,
    /// Opaque data scheme.
    #[serde(default)]
    pub data_scheme: serde_json::Value,
    /// Storage the channel reads from when no slot produces.
    #[serde(default)]
    pub storage_producer_uri: Option<String>,
    /// Storage the channel always writes to.
    #[serde(default)]
    pub storage_consumer_uri: Option<String>,
    /// Client-chosen key making retries safe.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// Id of the created (or existing) channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChannelResponse {
    /// Channel id.
    pub channel_id: String,
}

/// Destroy one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestroyChannelRequest {
    /// Channel id.
    pub channel_id: String,
    /// Client-chosen key making retries safe.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// Destroy every channel of an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestroyAllRequest {
    /// Execution id.
    pub execution_id: String,
    /// Client-chosen key making retries safe.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

// ============================================================================
// Create
// ============================================================================

/// Handle a channel creation request.
///
/// Creating a channel that already exists with the same owner and scheme
/// returns it.
///
/// # Errors
///
/// - `VALIDATION_ERROR` if an id or the name is empty
/// - `CHANNEL_ALREADY_EXISTS` if the id is taken by a different channel
/// - `INVALID_CHANNEL_STATE` if the existing channel is being destroyed
#[instrument(skip(state, request), fields(execution_id = %request.execution_id, name = %request.name))]
pub async fn handle_create_channel(
    state: &ChannelHandlerState,
    request: CreateChannelRequest,
) -> Result<CreateChannelResponse> {
    ChannelError::require_non_empty("execution_id", &request.execution_id)?;
    ChannelError::require_non_empty("workflow_name", &request.workflow_name)?;
    ChannelError::require_non_empty("user_id", &request.user_id)?;
    ChannelError::require_non_empty("name", &request.name)?;
    let hash = ledger::request_hash(&request)?;
    let channel_id = model::channel_id(&request.execution_id, &request.name);

    let _lock = state.locks.lock(&channel_id).await;
    let response = with_retries(&state.retry, "create_channel", || {
        create_in_tx(state, &request, &channel_id, &hash)
    })
    .await?;

    info!(channel_id = %response.channel_id, "Channel created");
    Ok(response)
}

async fn create_in_tx(
    state: &ChannelHandlerState,
    request: &CreateChannelRequest,
    channel_id: &str,
    hash: &str,
) -> Result<CreateChannelResponse> {
    let key = request.idempotency_key.as_deref();
    let mut tx = state.pool.begin().await?;

    if let Some(key) = key {
        match ledger::record_or_replay(&mut tx, CREATE_SCOPE, key, hash).await? {
            LedgerEntry::Fresh => {}
            LedgerEntry::Replay(response) => return Ok(serde_json::from_value(response)?),
            LedgerEntry::Conflict => {
                return Err(ChannelError::IdempotencyConflict {
                    key: key.to_string(),
                });
            }
        }
    }

    let response = CreateChannelResponse {
        channel_id: channel_id.to_string(),
    };

    match channels::get(&mut tx, channel_id).await? {
        Some(existing) => ensure_same_channel(&existing, request)?,
        None => insert_channel(state, &mut tx, request, channel_id, key.unwrap_or(hash), hash).await?,
    }

    if let Some(key) = key {
        ledger::store_result(&mut tx, CREATE_SCOPE, key, &serde_json::to_value(&response)?).await?;
    }
    tx.commit().await?;
    Ok(response)
}

fn ensure_same_channel(existing: &Channel, request: &CreateChannelRequest) -> Result<()> {
    let same = existing.user_id == request.user_id
        && existing.workflow_name == request.workflow_name
        && existing.data_scheme == request.data_scheme;
    if !same {
        return Err(ChannelError::ChannelAlreadyExists {
            channel_id: existing.id.clone(),
        });
    }
    if existing.life_status != LifeStatus::Alive {
        return Err(ChannelError::InvalidChannelState {
            channel_id: existing.id.clone(),
            actual: existing.life_status.as_str().to_string(),
        });
    }
    debug!(channel_id = %existing.id, "Channel already exists");
    Ok(())
}

async fn insert_channel(
    state: &ChannelHandlerState,
    conn: &mut SqliteConnection,
    request: &CreateChannelRequest,
    channel_id: &str,
    row_key: &str,
    hash: &str,
) -> Result<()> {
    channels::insert(
        conn,
        &NewChannel {
            id: channel_id.to_string(),
            execution_id: request.execution_id.clone(),
            workflow_name: request.workflow_name.clone(),
            user_id: request.user_id.clone(),
            data_scheme: request.data_scheme.clone(),
            storage_producer_uri: request.storage_producer_uri.clone(),
            storage_consumer_uri: request.storage_consumer_uri.clone(),
        },
    )
    .await?;

    let storage_peers = [
        (STORAGE_PRODUCER_ID, Role::Producer, &request.storage_producer_uri),
        (STORAGE_CONSUMER_ID, Role::Consumer, &request.storage_consumer_uri),
    ];
    for (peer_id, role, uri) in storage_peers {
        let Some(uri) = uri else {
            continue;
        };
        peers::create(
            conn,
            &NewPeer {
                id: peer_id.to_string(),
                channel_id: channel_id.to_string(),
                role,
                priority: Priority::Primary,
                connected: false,
                description: PeerDescription::Storage {
                    storage_uri: uri.clone(),
                },
                retry_budget: state.producer_retry_budget,
                idempotency_key: row_key.to_string(),
                request_hash: hash.to_string(),
            },
        )
        .await?;
        debug!(peer_id, role = role.as_str(), "Storage peer added");
    }
    Ok(())
}

// ============================================================================
// Destroy
// ============================================================================

/// Handle a request to destroy one channel.
///
/// The channel is marked DESTROYING right away; the returned operation deletes
/// it.
///
/// # Errors
///
/// - `CHANNEL_NOT_FOUND` if the channel does not exist
/// - `INVALID_CHANNEL_STATE` if the channel is already being destroyed
#[instrument(skip(state, request), fields(channel_id = %request.channel_id))]
pub async fn handle_destroy_channel(
    state: &ChannelHandlerState,
    request: DestroyChannelRequest,
) -> Result<OperationHandle> {
    ChannelError::require_non_empty("channel_id", &request.channel_id)?;
    let key = operation_key("destroy", request.idempotency_key.as_deref(), &request)?;

    let record = {
        let _lock = state.locks.lock(&request.channel_id).await;
        with_retries(&state.retry, "destroy_channel", || {
            destroy_in_tx(state, &request.channel_id, key.as_ref())
        })
        .await?
    };

    launch_all(&state.engine, std::slice::from_ref(&record.id)).await;
    info!(operation_id = %record.id, "Channel destruction scheduled");
    Ok(OperationHandle::from(&record))
}

async fn destroy_in_tx(
    state: &ChannelHandlerState,
    channel_id: &str,
    key: Option<&IdempotencyKey>,
) -> Result<OperationRecord> {
    let mut tx = state.pool.begin().await?;

    if let Some(existing) = existing_operation(&mut tx, key).await? {
        return Ok(existing);
    }

    let channel = channels::get(&mut tx, channel_id)
        .await?
        .ok_or_else(|| ChannelError::ChannelNotFound {
            channel_id: channel_id.to_string(),
        })?;
    if channel.life_status != LifeStatus::Alive {
        return Err(ChannelError::InvalidChannelState {
            channel_id: channel.id,
            actual: channel.life_status.as_str().to_string(),
        });
    }

    let record = destroy::schedule(
        &state.engine,
        &mut tx,
        DestroyRequest {
            execution_id: channel.execution_id,
            channel_ids: vec![channel.id],
            reason: None,
            abort_workflow: false,
        },
        key.cloned(),
        state.operation_deadline,
    )
    .await?;

    tx.commit().await?;
    Ok(record)
}

/// Handle a request to destroy every ALIVE channel of an execution.
///
/// An execution without channels gets an operation that finishes with an
/// empty `destroyed` list.
#[instrument(skip(state, request), fields(execution_id = %request.execution_id))]
pub async fn handle_destroy_all(
    state: &ChannelHandlerState,
    request: DestroyAllRequest,
) -> Result<OperationHandle> {
    ChannelError::require_non_empty("execution_id", &request.execution_id)?;
    let key = operation_key("destroy_all", request.idempotency_key.as_deref(), &request)?;

    let record = with_retries(&state.retry, "destroy_all", || {
        destroy_all_in_tx(state, &request.execution_id, key.as_ref())
    })
    .await?;

    launch_all(&state.engine, std::slice::from_ref(&record.id)).await;
    info!(operation_id = %record.id, "Execution channels destruction scheduled");
    Ok(OperationHandle::from(&record))
}

async fn destroy_all_in_tx(
    state: &ChannelHandlerState,
    execution_id: &str,
    key: Option<&IdempotencyKey>,
) -> Result<OperationRecord> {
    let mut tx = state.pool.begin().await?;

    if let Some(existing) = existing_operation(&mut tx, key).await? {
        return Ok(existing);
    }

    let channel_ids = channels::list_alive(&mut tx, execution_id)
        .await?
        .into_iter()
        .map(|channel| channel.id)
        .collect();

    let record = destroy::schedule(
        &state.engine,
        &mut tx,
        DestroyRequest {
            execution_id: execution_id.to_string(),
            channel_ids,
            reason: None,
            abort_workflow: false,
        },
        key.cloned(),
        state.operation_deadline,
    )
    .await?;

    tx.commit().await?;
    Ok(record)
}

/// Operation key namespaced by handler, hashed over the whole request.
fn operation_key<T: Serialize>(
    scope: &str,
    key: Option<&str>,
    request: &T,
) -> Result<Option<IdempotencyKey>> {
    let Some(key) = key else {
        return Ok(None);
    };
    Ok(Some(IdempotencyKey::new(
        format!("{}:{}", scope, key),
        ledger::request_hash(request)?,
    )))
}

async fn existing_operation(
    conn: &mut SqliteConnection,
    key: Option<&IdempotencyKey>,
) -> Result<Option<OperationRecord>> {
    let Some(key) = key else {
        return Ok(None);
    };
    let Some(existing) = dao::get_by_idempotency_key(conn, &key.token).await? else {
        return Ok(None);
    };
    if existing.request_hash.as_deref() != Some(key.request_hash.as_str()) {
        return Err(ChannelError::IdempotencyConflict {
            key: key.token.clone(),
        });
    }
    debug!(operation_id = %existing.id, "Destroy operation already exists");
    Ok(Some(existing))
}

// ============================================================================
// Status
// ============================================================================

/// Snapshot of one ALIVE channel.
#[instrument(skip(state))]
pub async fn handle_channel_status(state: &ChannelHandlerState, channel_id: &str) -> Result<ChannelStatus> {
    let mut conn = state.pool.acquire().await?;
    let channel = channels::get(&mut conn, channel_id)
        .await?
        .filter(|channel| channel.life_status == LifeStatus::Alive)
        .ok_or_else(|| ChannelError::ChannelNotFound {
            channel_id: channel_id.to_string(),
        })?;
    status::load(&mut conn, &channel).await
}

/// Snapshots of every ALIVE channel of an execution.
#[instrument(skip(state))]
pub async fn handle_channel_status_all(
    state: &ChannelHandlerState,
    execution_id: &str,
) -> Result<Vec<ChannelStatus>> {
    let mut conn = state.pool.acquire().await?;
    let alive = channels::list_alive(&mut conn, execution_id).await?;
    let mut statuses = Vec::with_capacity(alive.len());
    for channel in &alive {
        statuses.push(status::load(&mut conn, channel).await?);
    }
    Ok(statuses)
}

/// Current state of an operation.
#[instrument(skip(state))]
pub async fn handle_get_operation(state: &ChannelHandlerState, operation_id: &str) -> Result<OperationHandle> {
    let record = state
        .engine
        .get(operation_id)
        .await?
        .ok_or_else(|| ChannelError::OperationNotFound {
            operation_id: operation_id.to_string(),
        })?;
    Ok(OperationHandle::from(&record))
}
