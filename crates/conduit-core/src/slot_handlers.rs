// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Slot protocol handlers for conduit-core.
//!
//! These handlers process requests from workflow slots: binding producers and
//! consumers, unbinding, and reporting transfer outcomes. Every mutating handler
//! follows the same shape:
//!
//! 1. validate the request
//! 2. load the channel and check access
//! 3. take the channel lock
//! 4. run one transaction (retried on transient errors) that starts with the
//!    idempotency ledger and ends by storing the response in it
//! 5. release the lock, then launch operations created by the transaction

use std::sync::Arc;
use std::time::Duration;

use conduit_operations::ledger::{self, LedgerEntry};
use conduit_operations::{IdempotencyKey, OperationEngine, OperationSpec, RetryConfig, with_retries};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, error, info, instrument, warn};

use crate::access::{AccessClient, OperationType};
use crate::actions::start_transfer::{StartTransferAction, StartTransferState};
use crate::actions::{deadline_from_now, launch_all};
use crate::db::peers::{self, NewPeer};
use crate::db::transfers::{self, NewTransfer};
use crate::db::channels;
use crate::error::{ChannelError, Result};
use crate::lock::ChannelLocks;
use crate::model::{Channel, LifeStatus, Peer, PeerDescription, Priority, Role, Transfer, TransferState};
use crate::notifier::{StartTransfer, TransferEndpoint};
use crate::status::{self, ChannelStatus};
use crate::workflow::WorkflowTeardown;

const BIND_SCOPE: &str = "bind";
const TRANSFER_FAILED_SCOPE: &str = "transfer_failed";
const TRANSFER_COMPLETED_SCOPE: &str = "transfer_completed";

/// Default initial retry budget of a producer.
pub const DEFAULT_PRODUCER_RETRY_BUDGET: i64 = 2;
/// Default deadline of operations created by the handlers.
pub const DEFAULT_OPERATION_DEADLINE: Duration = Duration::from_secs(600);

/// Shared state for slot handlers.
#[derive(Clone)]
pub struct SlotHandlerState {
    /// Store pool.
    pub pool: SqlitePool,
    /// Engine receiving start-transfer operations.
    pub engine: OperationEngine,
    /// Per-channel locks, shared with the engine actions.
    pub locks: ChannelLocks,
    /// Authorization collaborator.
    pub access: Arc<dyn AccessClient>,
    /// Teardown of unrecoverable channels.
    pub teardown: Arc<dyn WorkflowTeardown>,
    /// Retry policy around each transaction.
    pub retry: RetryConfig,
    /// Initial retry budget of new producers.
    pub producer_retry_budget: i64,
    /// Deadline of created operations.
    pub operation_deadline: Duration,
}

impl SlotHandlerState {
    /// Create slot handler state with default limits.
    pub fn new(
        pool: SqlitePool,
        engine: OperationEngine,
        locks: ChannelLocks,
        access: Arc<dyn AccessClient>,
        teardown: Arc<dyn WorkflowTeardown>,
    ) -> Self {
        Self {
            pool,
            engine,
            locks,
            access,
            teardown,
            retry: RetryConfig::default(),
            producer_retry_budget: DEFAULT_PRODUCER_RETRY_BUDGET,
            operation_deadline: DEFAULT_OPERATION_DEADLINE,
        }
    }
}

impl std::fmt::Debug for SlotHandlerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotHandlerState")
            .field("engine", &self.engine)
            .field("access", &"...")
            .field("teardown", &"...")
            .field("retry", &self.retry)
            .field("producer_retry_budget", &self.producer_retry_budget)
            .field("operation_deadline", &self.operation_deadline)
            .finish()
    }
}

// ============================================================================
// Wire types
// ============================================================================

/// Bind a peer to a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindRequest {
    /// Channel id.
    pub channel_id: String,
    /// Peer id, unique within the channel.
    pub peer_id: String,
    /// `PRODUCER` or `CONSUMER`.
    #[serde(default)]
    pub role: Option<String>,
    /// Where the peer lives.
    pub description: PeerDescription,
    /// Client-chosen key making retries safe.
    #[serde(default)]
    pub idempotency_key: Option<String>,
    /// Caller identity.
    #[serde(default)]
    pub subject: String,
}

/// The peer to exchange data with, if one is known yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindResponse {
    /// Counterpart peer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<TransferEndpoint>,
    /// Transfer between the two peers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_id: Option<String>,
}

/// Remove a peer from a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnbindRequest {
    /// Channel id.
    pub channel_id: String,
    /// Peer id.
    pub peer_id: String,
    /// Caller identity.
    #[serde(default)]
    pub subject: String,
}

/// Empty acknowledgement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnbindResponse {}

/// Report a failed transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferFailedRequest {
    /// Channel id.
    pub channel_id: String,
    /// Failed transfer.
    pub transfer_id: String,
    /// What went wrong.
    #[serde(default)]
    pub description: String,
    /// Client-chosen key making retries safe.
    #[serde(default)]
    pub idempotency_key: Option<String>,
    /// Caller identity.
    #[serde(default)]
    pub subject: String,
}

/// Replacement producer for the failed transfer's consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferFailedResponse {
    /// Producer to read from now.
    pub new_peer: TransferEndpoint,
    /// Transfer replacing the failed one.
    pub new_transfer_id: String,
}

/// Report a completed transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferCompletedRequest {
    /// Channel id.
    pub channel_id: String,
    /// Completed transfer.
    pub transfer_id: String,
    /// Client-chosen key making retries safe.
    #[serde(default)]
    pub idempotency_key: Option<String>,
    /// Caller identity.
    #[serde(default)]
    pub subject: String,
}

/// Empty acknowledgement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCompletedResponse {}

/// Snapshot of channels of an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetChannelsStatusRequest {
    /// Execution id.
    pub execution_id: String,
    /// Channels to report; all ALIVE channels when empty.
    #[serde(default)]
    pub channel_ids: Vec<String>,
    /// Caller identity.
    #[serde(default)]
    pub subject: String,
}

/// Channel snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetChannelsStatusResponse {
    /// One entry per channel.
    pub channels: Vec<ChannelStatus>,
}

/// What a `transferFailed` request decided; stored in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
enum FailedOutcome {
    Replaced(TransferFailedResponse),
    Unrecoverable { reason: String },
}

impl FailedOutcome {
    fn into_result(self, channel_id: String) -> Result<TransferFailedResponse> {
        match self {
            Self::Replaced(response) => Ok(response),
            Self::Unrecoverable { reason } => {
                Err(ChannelError::ChannelUnrecoverable { channel_id, reason })
            }
        }
    }
}

// ============================================================================
// Bind
// ============================================================================

/// Handle a bind request.
///
/// A consumer is matched with the best available producer right away. A
/// producer is matched with every waiting consumer; slot consumers are told to
/// start by `start_transfer` operations launched after commit, a storage
/// consumer is returned to the producer directly.
///
/// # Errors
///
/// - `VALIDATION_ERROR` if the role is unset or unknown
/// - `INVALID_CHANNEL_STATE` if the channel is not ALIVE
/// - `PEER_ALREADY_EXISTS` if the peer id was bound by a different request
#[instrument(skip(state, request), fields(channel_id = %request.channel_id, peer_id = %request.peer_id))]
pub async fn handle_bind(state: &SlotHandlerState, request: BindRequest) -> Result<BindResponse> {
    // 1. Validate
    ChannelError::require_non_empty("channel_id", &request.channel_id)?;
    ChannelError::require_non_empty("peer_id", &request.peer_id)?;
    let role = match request.role.as_deref() {
        None | Some("") => return Err(ChannelError::validation("role", "must be set")),
        Some(role) => Role::parse(role).ok_or_else(|| {
            ChannelError::validation("role", format!("unknown role '{}'", role))
        })?,
    };
    let hash = ledger::request_hash(&request)?;

    // 2. Load the channel and check access
    let channel = authorize(state, &request.channel_id, &request.subject).await?;
    ensure_alive(&channel)?;
    info!(role = role.as_str(), "Binding peer");

    // 3-4. Lock and transact
    let (response, operations) = {
        let _lock = state.locks.lock(&channel.id).await;
        with_retries(&state.retry, "bind", || {
            bind_in_tx(state, &request, role, &hash)
        })
        .await?
    };

    // 5. Launch start-transfer operations outside the lock
    launch_all(&state.engine, &operations).await;
    Ok(response)
}

async fn bind_in_tx(
    state: &SlotHandlerState,
    request: &BindRequest,
    role: Role,
    hash: &str,
) -> Result<(BindResponse, Vec<String>)> {
    let key = request.idempotency_key.as_deref();
    let mut tx = state.pool.begin().await?;

    if let Some(replay) = claim::<BindResponse>(&mut tx, BIND_SCOPE, key, hash).await? {
        debug!("Bind replayed from ledger");
        return Ok((replay, Vec::new()));
    }

    let channel = require_channel(&mut tx, &request.channel_id).await?;
    ensure_alive(&channel)?;

    // Rows remember the request that created them; without a key the hash stands in.
    let row_key = key.unwrap_or(hash);
    let (response, operations) = match role {
        Role::Consumer => (
            bind_consumer(state, &mut tx, request, row_key, hash).await?,
            Vec::new(),
        ),
        Role::Producer => bind_producer(state, &mut tx, request, row_key, hash).await?,
    };

    remember(&mut tx, BIND_SCOPE, key, &response).await?;
    tx.commit().await?;
    Ok((response, operations))
}

async fn bind_consumer(
    state: &SlotHandlerState,
    conn: &mut SqliteConnection,
    request: &BindRequest,
    row_key: &str,
    hash: &str,
) -> Result<BindResponse> {
    let producer = peers::find_producer(conn, &request.channel_id).await?;

    let created = peers::create(
        conn,
        &NewPeer {
            id: request.peer_id.clone(),
            channel_id: request.channel_id.clone(),
            role: Role::Consumer,
            priority: Priority::Primary,
            connected: producer.is_some(),
            description: request.description.clone(),
            retry_budget: state.producer_retry_budget,
            idempotency_key: row_key.to_string(),
            request_hash: hash.to_string(),
        },
    )
    .await?;

    if !created.is_created() {
        debug!("Consumer already bound by the same request");
        return existing_consumer_response(conn, &request.channel_id, &request.peer_id).await;
    }

    let Some(producer) = producer else {
        info!("No producer available, consumer waits");
        return Ok(BindResponse::default());
    };

    let transfer = transfers::create(
        conn,
        &NewTransfer {
            channel_id: request.channel_id.clone(),
            from_peer_id: producer.id.clone(),
            to_peer_id: request.peer_id.clone(),
            state: TransferState::Active,
            idempotency_key: row_key.to_string(),
        },
    )
    .await?;

    info!(producer_id = %producer.id, transfer_id = %transfer.id, "Consumer connected to producer");
    Ok(BindResponse {
        peer: Some(endpoint(&producer)),
        transfer_id: Some(transfer.id),
    })
}

async fn existing_consumer_response(
    conn: &mut SqliteConnection,
    channel_id: &str,
    consumer_id: &str,
) -> Result<BindResponse> {
    let Some(transfer) = transfers::in_flight_to(conn, channel_id, consumer_id).await? else {
        return Ok(BindResponse::default());
    };
    let producer = require_peer(conn, channel_id, &transfer.from_peer_id).await?;
    Ok(BindResponse {
        peer: Some(endpoint(&producer)),
        transfer_id: Some(transfer.id),
    })
}

async fn bind_producer(
    state: &SlotHandlerState,
    conn: &mut SqliteConnection,
    request: &BindRequest,
    row_key: &str,
    hash: &str,
) -> Result<(BindResponse, Vec<String>)> {
    let created = peers::create(
        conn,
        &NewPeer {
            id: request.peer_id.clone(),
            channel_id: request.channel_id.clone(),
            role: Role::Producer,
            priority: Priority::Primary,
            connected: false,
            description: request.description.clone(),
            retry_budget: state.producer_retry_budget,
            idempotency_key: row_key.to_string(),
            request_hash: hash.to_string(),
        },
    )
    .await?;
    let producer = created.peer().clone();

    if producer.retry_budget < 0 {
        warn!("Producer has exhausted its retries, not matching consumers");
        return Ok((BindResponse::default(), Vec::new()));
    }

    let consumers = peers::connect_waiting_consumers(conn, &request.channel_id).await?;
    let deadline = deadline_from_now(state.operation_deadline)?;

    let mut response = BindResponse::default();
    let mut operations = Vec::new();
    for (i, consumer) in consumers.iter().enumerate() {
        let storage = consumer.description.is_storage();
        let transfer = transfers::create(
            conn,
            &NewTransfer {
                channel_id: request.channel_id.clone(),
                from_peer_id: producer.id.clone(),
                to_peer_id: consumer.id.clone(),
                state: if storage {
                    TransferState::Active
                } else {
                    TransferState::Pending
                },
                idempotency_key: row_key.to_string(),
            },
        )
        .await?;

        if storage {
            // The producer writes to storage itself.
            if response.transfer_id.is_none() {
                response = BindResponse {
                    peer: Some(endpoint(consumer)),
                    transfer_id: Some(transfer.id),
                };
            }
            continue;
        }

        let start = StartTransferState::new(StartTransfer {
            channel_id: request.channel_id.clone(),
            transfer_id: transfer.id.clone(),
            consumer: endpoint(consumer),
            producer: endpoint(&producer),
        });
        let idempotency_key = match request.idempotency_key.as_deref() {
            Some(key) => Some(IdempotencyKey::new(
                format!("start_transfer:{}_{}", key, i),
                ledger::request_hash(&start)?,
            )),
            None => None,
        };
        let inserted = state
            .engine
            .create::<StartTransferAction>(
                conn,
                OperationSpec {
                    description: format!("Start transfer {}", transfer.id),
                    deadline: Some(deadline),
                    idempotency_key,
                },
                &start,
            )
            .await?;
        operations.push(inserted.into_record().id);
    }

    info!(
        created = created.is_created(),
        matched = consumers.len(),
        notifications = operations.len(),
        "Producer bound"
    );
    Ok((response, operations))
}

// ============================================================================
// Unbind
// ============================================================================

/// Handle an unbind request.
///
/// # Errors
///
/// - `PEER_NOT_FOUND` if the peer is not bound
/// - `UNAVAILABLE` while a PENDING or ACTIVE transfer references the peer
#[instrument(skip(state, request), fields(channel_id = %request.channel_id, peer_id = %request.peer_id))]
pub async fn handle_unbind(state: &SlotHandlerState, request: UnbindRequest) -> Result<UnbindResponse> {
    // 1. Validate
    ChannelError::require_non_empty("channel_id", &request.channel_id)?;
    ChannelError::require_non_empty("peer_id", &request.peer_id)?;

    // 2. Load the channel and check access
    let channel = authorize(state, &request.channel_id, &request.subject).await?;

    // 3-4. Lock and transact
    {
        let _lock = state.locks.lock(&channel.id).await;
        with_retries(&state.retry, "unbind", || unbind_in_tx(state, &request)).await?;
    }

    info!("Peer unbound");
    Ok(UnbindResponse {})
}

async fn unbind_in_tx(state: &SlotHandlerState, request: &UnbindRequest) -> Result<()> {
    let mut tx = state.pool.begin().await?;

    require_peer(&mut tx, &request.channel_id, &request.peer_id).await?;
    if transfers::peer_has_in_flight(&mut tx, &request.channel_id, &request.peer_id).await? {
        warn!("Cannot unbind peer with transfers in flight");
        return Err(ChannelError::Unavailable {
            reason: "cannot unbind peer now, it has transfers in flight".to_string(),
        });
    }
    peers::delete(&mut tx, &request.channel_id, &request.peer_id).await?;

    tx.commit().await?;
    Ok(())
}

// ============================================================================
// Transfer Failed
// ============================================================================

/// Handle a transfer failure report.
///
/// Marks the transfer FAILED and selects a replacement producer for its
/// consumer. When the consumer is a storage peer, or no producer is left, the
/// channel and its workflow are torn down and `CHANNEL_UNRECOVERABLE` is
/// returned; the teardown is committed first, and a retry gets the same error.
///
/// # Errors
///
/// - `TRANSFER_NOT_FOUND` if the transfer does not exist
/// - `INVALID_TRANSFER_STATE` if the transfer is not ACTIVE (and not a replay)
/// - `CHANNEL_UNRECOVERABLE` as described above
#[instrument(skip(state, request), fields(channel_id = %request.channel_id, transfer_id = %request.transfer_id))]
pub async fn handle_transfer_failed(
    state: &SlotHandlerState,
    request: TransferFailedRequest,
) -> Result<TransferFailedResponse> {
    // 1. Validate
    ChannelError::require_non_empty("channel_id", &request.channel_id)?;
    ChannelError::require_non_empty("transfer_id", &request.transfer_id)?;
    let hash = ledger::request_hash(&request)?;

    // 2. Load the channel and check access; a torn-down channel may still replay
    let channel = match authorize(state, &request.channel_id, &request.subject).await {
        Err(ChannelError::ChannelNotFound { channel_id }) => {
            return match replay_without_channel(state, &request, &hash).await? {
                Some(outcome) => outcome.into_result(channel_id),
                None => Err(ChannelError::ChannelNotFound { channel_id }),
            };
        }
        other => other?,
    };

    // 3-4. Lock and transact
    let (outcome, operations) = {
        let _lock = state.locks.lock(&channel.id).await;
        with_retries(&state.retry, "transfer_failed", || {
            transfer_failed_in_tx(state, &request, &hash)
        })
        .await?
    };

    // 5. Launch teardown outside the lock
    launch_all(&state.engine, &operations).await;

    outcome.into_result(channel.id)
}

/// Ledger lookup for a report whose channel is already gone. Never claims a key.
async fn replay_without_channel(
    state: &SlotHandlerState,
    request: &TransferFailedRequest,
    hash: &str,
) -> Result<Option<FailedOutcome>> {
    let Some(key) = request.idempotency_key.as_deref() else {
        return Ok(None);
    };
    let mut tx = state.pool.begin().await?;
    let replay = claim::<FailedOutcome>(&mut tx, TRANSFER_FAILED_SCOPE, Some(key), hash).await?;
    tx.rollback().await?;
    if replay.is_some() {
        debug!("Transfer failure replayed after channel teardown");
    }
    Ok(replay)
}

async fn transfer_failed_in_tx(
    state: &SlotHandlerState,
    request: &TransferFailedRequest,
    hash: &str,
) -> Result<(FailedOutcome, Vec<String>)> {
    let key = request.idempotency_key.as_deref();
    let mut tx = state.pool.begin().await?;

    if let Some(replay) = claim::<FailedOutcome>(&mut tx, TRANSFER_FAILED_SCOPE, key, hash).await? {
        debug!("Transfer failure replayed from ledger");
        return Ok((replay, Vec::new()));
    }

    let channel = require_channel(&mut tx, &request.channel_id).await?;
    let transfer = require_transfer(&mut tx, &request.channel_id, &request.transfer_id).await?;

    let (outcome, operations) = match transfer.state {
        TransferState::Failed
            if key.is_some() && transfer.state_change_idempotency_key.as_deref() == key =>
        {
            debug!("Transfer failure already recorded");
            (replay_failure(&mut tx, &transfer).await?, Vec::new())
        }
        TransferState::Active => fail_over(state, &mut tx, &channel, &transfer, request).await?,
        other => {
            return Err(ChannelError::InvalidTransferState {
                transfer_id: transfer.id,
                actual: other.as_str().to_string(),
            });
        }
    };

    remember(&mut tx, TRANSFER_FAILED_SCOPE, key, &outcome).await?;
    tx.commit().await?;
    Ok((outcome, operations))
}

/// Mark `transfer` FAILED and feed its sink from the best remaining producer.
///
/// The failing producer's budget is decremented first and selection runs after
/// that, so the same producer is picked again while its budget is still `>= 0`.
/// Only once it goes negative does a different producer take over. A channel
/// that is already DESTROYING records the failure without a replacement.
async fn fail_over(
    state: &SlotHandlerState,
    conn: &mut SqliteConnection,
    channel: &Channel,
    transfer: &Transfer,
    request: &TransferFailedRequest,
) -> Result<(FailedOutcome, Vec<String>)> {
    let key = request.idempotency_key.as_deref();
    if !transfers::mark_failed(conn, &transfer.id, key, &request.description).await? {
        return Err(ChannelError::InvalidTransferState {
            transfer_id: transfer.id.clone(),
            actual: transfer.state.as_str().to_string(),
        });
    }
    warn!(
        from = %transfer.from_peer_id,
        to = %transfer.to_peer_id,
        description = %request.description,
        "Transfer failed"
    );

    let teardown_key = key.unwrap_or(&transfer.id);
    if channel.life_status != LifeStatus::Alive {
        let reason = "channel is being destroyed".to_string();
        return tear_down(state, conn, channel, reason, teardown_key).await;
    }

    let sink = require_peer(conn, &channel.id, &transfer.to_peer_id).await?;
    if sink.description.is_storage() {
        return tear_down(state, conn, channel, unrecoverable_reason(Some(&sink)), teardown_key).await;
    }

    let budget = peers::decrement_retry_budget(conn, &channel.id, &transfer.from_peer_id).await?;
    if budget < 0 {
        warn!(peer_id = %transfer.from_peer_id, "Producer retries exceeded, excluded from selection");
    }

    let Some(replacement) = peers::find_producer(conn, &channel.id).await? else {
        return tear_down(state, conn, channel, unrecoverable_reason(None), teardown_key).await;
    };

    // The replacement feeds the original sink, not the failed transfer's source.
    let replacement_transfer = transfers::create(
        conn,
        &NewTransfer {
            channel_id: channel.id.clone(),
            from_peer_id: replacement.id.clone(),
            to_peer_id: sink.id.clone(),
            state: TransferState::Active,
            idempotency_key: teardown_key.to_string(),
        },
    )
    .await?;
    transfers::set_replaced_by(conn, &transfer.id, &replacement_transfer.id).await?;

    info!(
        producer_id = %replacement.id,
        new_transfer_id = %replacement_transfer.id,
        "Failed over to replacement producer"
    );
    Ok((
        FailedOutcome::Replaced(TransferFailedResponse {
            new_peer: endpoint(&replacement),
            new_transfer_id: replacement_transfer.id,
        }),
        Vec::new(),
    ))
}

async fn replay_failure(conn: &mut SqliteConnection, transfer: &Transfer) -> Result<FailedOutcome> {
    if let Some(replacement_id) = &transfer.replaced_by
        && let Some(replacement) = transfers::get(conn, &transfer.channel_id, replacement_id).await?
    {
        let producer = require_peer(conn, &transfer.channel_id, &replacement.from_peer_id).await?;
        return Ok(FailedOutcome::Replaced(TransferFailedResponse {
            new_peer: endpoint(&producer),
            new_transfer_id: replacement.id,
        }));
    }
    let sink = peers::get(conn, &transfer.channel_id, &transfer.to_peer_id).await?;
    Ok(FailedOutcome::Unrecoverable {
        reason: unrecoverable_reason(sink.as_ref().filter(|peer| peer.description.is_storage())),
    })
}

fn unrecoverable_reason(failed_storage_sink: Option<&Peer>) -> String {
    match failed_storage_sink {
        Some(sink) => format!("transfer to storage consumer '{}' failed", sink.id),
        None => "no producer left to feed the consumer".to_string(),
    }
}

async fn tear_down(
    state: &SlotHandlerState,
    conn: &mut SqliteConnection,
    channel: &Channel,
    reason: String,
    idempotency_key: &str,
) -> Result<(FailedOutcome, Vec<String>)> {
    let mut operations = Vec::new();
    // A channel already on its way out is not torn down twice.
    if channel.life_status == LifeStatus::Alive
        && let Some(operation_id) = state
            .teardown
            .destroy_channel_and_workflow(conn, channel, &reason, idempotency_key)
            .await?
    {
        operations.push(operation_id);
    }
    error!(reason = %reason, "Channel unrecoverable");
    Ok((FailedOutcome::Unrecoverable { reason }, operations))
}

// ============================================================================
// Transfer Completed
// ============================================================================

/// Handle a transfer completion report.
///
/// A completed transfer into a storage consumer turns that consumer into a
/// BACKUP producer, so later consumers can read the stored copy.
///
/// # Errors
///
/// - `TRANSFER_NOT_FOUND` if the transfer does not exist
/// - `INVALID_TRANSFER_STATE` if the transfer is not ACTIVE (and not a replay)
#[instrument(skip(state, request), fields(channel_id = %request.channel_id, transfer_id = %request.transfer_id))]
pub async fn handle_transfer_completed(
    state: &SlotHandlerState,
    request: TransferCompletedRequest,
) -> Result<TransferCompletedResponse> {
    // 1. Validate
    ChannelError::require_non_empty("channel_id", &request.channel_id)?;
    ChannelError::require_non_empty("transfer_id", &request.transfer_id)?;
    let hash = ledger::request_hash(&request)?;

    // 2. Load the channel and check access
    let channel = authorize(state, &request.channel_id, &request.subject).await?;

    // 3-4. Lock and transact
    let _lock = state.locks.lock(&channel.id).await;
    with_retries(&state.retry, "transfer_completed", || {
        transfer_completed_in_tx(state, &request, &hash)
    })
    .await
}

async fn transfer_completed_in_tx(
    state: &SlotHandlerState,
    request: &TransferCompletedRequest,
    hash: &str,
) -> Result<TransferCompletedResponse> {
    let key = request.idempotency_key.as_deref();
    let mut tx = state.pool.begin().await?;

    if let Some(replay) =
        claim::<TransferCompletedResponse>(&mut tx, TRANSFER_COMPLETED_SCOPE, key, hash).await?
    {
        debug!("Transfer completion replayed from ledger");
        return Ok(replay);
    }

    let transfer = require_transfer(&mut tx, &request.channel_id, &request.transfer_id).await?;
    match transfer.state {
        TransferState::Completed
            if key.is_some() && transfer.state_change_idempotency_key.as_deref() == key =>
        {
            debug!("Transfer completion already recorded");
        }
        TransferState::Active => complete_transfer(state, &mut tx, &transfer, key).await?,
        other => {
            return Err(ChannelError::InvalidTransferState {
                transfer_id: transfer.id,
                actual: other.as_str().to_string(),
            });
        }
    }

    let response = TransferCompletedResponse {};
    remember(&mut tx, TRANSFER_COMPLETED_SCOPE, key, &response).await?;
    tx.commit().await?;
    Ok(response)
}

async fn complete_transfer(
    state: &SlotHandlerState,
    conn: &mut SqliteConnection,
    transfer: &Transfer,
    key: Option<&str>,
) -> Result<()> {
    if !transfers::mark_completed(conn, &transfer.id, key).await? {
        return Err(ChannelError::InvalidTransferState {
            transfer_id: transfer.id.clone(),
            actual: transfer.state.as_str().to_string(),
        });
    }
    info!(from = %transfer.from_peer_id, to = %transfer.to_peer_id, "Transfer completed");

    let Some(sink) = peers::get(conn, &transfer.channel_id, &transfer.to_peer_id).await? else {
        return Ok(());
    };
    if sink.role != Role::Consumer || !sink.description.is_storage() {
        return Ok(());
    }

    // The stored copy becomes a source for later consumers.
    peers::delete(conn, &sink.channel_id, &sink.id).await?;
    peers::create(
        conn,
        &NewPeer {
            id: sink.id.clone(),
            channel_id: sink.channel_id.clone(),
            role: Role::Producer,
            priority: Priority::Backup,
            connected: false,
            description: sink.description.clone(),
            retry_budget: state.producer_retry_budget,
            idempotency_key: sink.idempotency_key.clone(),
            request_hash: sink.request_hash.clone(),
        },
    )
    .await?;
    info!(peer_id = %sink.id, "Storage consumer promoted to backup producer");
    Ok(())
}

// ============================================================================
// Channels Status
// ============================================================================

/// Handle a status request for channels of an execution.
///
/// Read-only; only ALIVE channels are reported.
///
/// # Errors
///
/// - `CHANNEL_NOT_FOUND` if a requested channel id is not an ALIVE channel of the execution
#[instrument(skip(state, request), fields(execution_id = %request.execution_id))]
pub async fn handle_get_channels_status(
    state: &SlotHandlerState,
    request: GetChannelsStatusRequest,
) -> Result<GetChannelsStatusResponse> {
    ChannelError::require_non_empty("execution_id", &request.execution_id)?;

    let mut conn = state.pool.acquire().await?;
    let alive = channels::list_alive(&mut conn, &request.execution_id).await?;

    let selected = if request.channel_ids.is_empty() {
        alive
    } else {
        request
            .channel_ids
            .iter()
            .map(|id| {
                alive
                    .iter()
                    .find(|channel| &channel.id == id)
                    .cloned()
                    .ok_or_else(|| ChannelError::ChannelNotFound {
                        channel_id: id.clone(),
                    })
            })
            .collect::<Result<Vec<_>>>()?
    };

    let mut statuses = Vec::with_capacity(selected.len());
    for channel in &selected {
        check_access(state, channel, &request.subject, OperationType::Read).await?;
        statuses.push(status::load(&mut conn, channel).await?);
    }

    debug!(channels = statuses.len(), "Channels status");
    Ok(GetChannelsStatusResponse { channels: statuses })
}

// ============================================================================
// Helpers
// ============================================================================

async fn authorize(state: &SlotHandlerState, channel_id: &str, subject: &str) -> Result<Channel> {
    let channel = {
        let mut conn = state.pool.acquire().await?;
        require_channel(&mut conn, channel_id).await?
    };
    check_access(state, &channel, subject, OperationType::Write).await?;
    Ok(channel)
}

async fn check_access(
    state: &SlotHandlerState,
    channel: &Channel,
    subject: &str,
    operation: OperationType,
) -> Result<()> {
    let allowed = state
        .access
        .check_access(subject, &channel.user_id, &channel.workflow_name, operation)
        .await?;
    if !allowed {
        warn!(channel_id = %channel.id, subject, operation = operation.as_str(), "Access denied");
        return Err(ChannelError::PermissionDenied {
            channel_id: channel.id.clone(),
            subject: subject.to_string(),
        });
    }
    Ok(())
}

fn ensure_alive(channel: &Channel) -> Result<()> {
    if channel.life_status != LifeStatus::Alive {
        return Err(ChannelError::InvalidChannelState {
            channel_id: channel.id.clone(),
            actual: channel.life_status.as_str().to_string(),
        });
    }
    Ok(())
}

async fn require_channel(conn: &mut SqliteConnection, channel_id: &str) -> Result<Channel> {
    channels::get(conn, channel_id)
        .await?
        .ok_or_else(|| ChannelError::ChannelNotFound {
            channel_id: channel_id.to_string(),
        })
}

async fn require_peer(conn: &mut SqliteConnection, channel_id: &str, peer_id: &str) -> Result<Peer> {
    peers::get(conn, channel_id, peer_id)
        .await?
        .ok_or_else(|| ChannelError::PeerNotFound {
            channel_id: channel_id.to_string(),
            peer_id: peer_id.to_string(),
        })
}

async fn require_transfer(
    conn: &mut SqliteConnection,
    channel_id: &str,
    transfer_id: &str,
) -> Result<Transfer> {
    transfers::get(conn, channel_id, transfer_id)
        .await?
        .ok_or_else(|| ChannelError::TransferNotFound {
            channel_id: channel_id.to_string(),
            transfer_id: transfer_id.to_string(),
        })
}

fn endpoint(peer: &Peer) -> TransferEndpoint {
    TransferEndpoint {
        peer_id: peer.id.clone(),
        description: peer.description.clone(),
    }
}

/// Claim `key` in the ledger, or return the response stored for it.
async fn claim<T: DeserializeOwned>(
    conn: &mut SqliteConnection,
    scope: &str,
    key: Option<&str>,
    hash: &str,
) -> Result<Option<T>> {
    let Some(key) = key else {
        return Ok(None);
    };
    match ledger::record_or_replay(conn, scope, key, hash).await? {
        LedgerEntry::Fresh => Ok(None),
        LedgerEntry::Replay(response) => Ok(Some(serde_json::from_value(response)?)),
        LedgerEntry::Conflict => Err(ChannelError::IdempotencyConflict {
            key: key.to_string(),
        }),
    }
}

async fn remember<T: Serialize>(
    conn: &mut SqliteConnection,
    scope: &str,
    key: Option<&str>,
    response: &T,
) -> Result<()> {
    if let Some(key) = key {
        ledger::store_result(conn, scope, key, &serde_json::to_value(response)?).await?;
    }
    Ok(())
}
