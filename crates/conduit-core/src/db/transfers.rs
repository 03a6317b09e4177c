// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transfer rows.
//!
//! State changes are guarded by the expected current state, so a transition
//! only happens once even if two requests race past the channel lock.

use chrono::Utc;
use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{Transfer, TransferState};

const TRANSFER_FIELDS: &str = "id, channel_id, from_peer_id, to_peer_id, state, \
     state_change_idempotency_key, error_description, replaced_by, idempotency_key, \
     created_at, modified_at";

/// A transfer to insert.
#[derive(Debug, Clone)]
pub struct NewTransfer {
    /// Channel id.
    pub channel_id: String,
    /// Producer peer id.
    pub from_peer_id: String,
    /// Consumer peer id.
    pub to_peer_id: String,
    /// Initial state, PENDING or ACTIVE.
    pub state: TransferState,
    /// Key of the creating request.
    pub idempotency_key: String,
}

/// Insert a transfer with a fresh id.
pub async fn create(conn: &mut SqliteConnection, transfer: &NewTransfer) -> Result<Transfer> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now();
    let sql = format!(
        "INSERT INTO transfers (id, channel_id, from_peer_id, to_peer_id, state, \
         idempotency_key, created_at, modified_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
         RETURNING {TRANSFER_FIELDS}"
    );
    let created = sqlx::query_as::<_, Transfer>(&sql)
        .bind(&id)
        .bind(&transfer.channel_id)
        .bind(&transfer.from_peer_id)
        .bind(&transfer.to_peer_id)
        .bind(transfer.state.as_str())
        .bind(&transfer.idempotency_key)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *conn)
        .await?;
    Ok(created)
}

/// Load a transfer of a channel.
pub async fn get(
    conn: &mut SqliteConnection,
    channel_id: &str,
    id: &str,
) -> Result<Option<Transfer>> {
    let sql = format!("SELECT {TRANSFER_FIELDS} FROM transfers WHERE channel_id = ? AND id = ?");
    let transfer = sqlx::query_as::<_, Transfer>(&sql)
        .bind(channel_id)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(transfer)
}

/// All transfers of a channel, oldest first.
pub async fn list(conn: &mut SqliteConnection, channel_id: &str) -> Result<Vec<Transfer>> {
    let sql = format!(
        "SELECT {TRANSFER_FIELDS} FROM transfers WHERE channel_id = ? ORDER BY created_at, id"
    );
    let transfers = sqlx::query_as::<_, Transfer>(&sql)
        .bind(channel_id)
        .fetch_all(&mut *conn)
        .await?;
    Ok(transfers)
}

/// The PENDING or ACTIVE transfer feeding `to_peer_id`, if any.
pub async fn in_flight_to(
    conn: &mut SqliteConnection,
    channel_id: &str,
    to_peer_id: &str,
) -> Result<Option<Transfer>> {
    let sql = format!(
        "SELECT {TRANSFER_FIELDS} FROM transfers \
         WHERE channel_id = ? AND to_peer_id = ? AND state IN ('PENDING', 'ACTIVE')"
    );
    let transfer = sqlx::query_as::<_, Transfer>(&sql)
        .bind(channel_id)
        .bind(to_peer_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(transfer)
}

/// PENDING -> ACTIVE. Returns `false` if the transfer was not PENDING.
pub async fn activate(conn: &mut SqliteConnection, id: &str) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE transfers
        SET state = 'ACTIVE', modified_at = ?
        WHERE id = ? AND state = 'PENDING'
        "#,
    )
    .bind(Utc::now())
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Move an in-flight transfer to FAILED. Returns `false` if it was not in flight.
pub async fn mark_failed(
    conn: &mut SqliteConnection,
    id: &str,
    state_change_key: Option<&str>,
    description: &str,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE transfers
        SET state = 'FAILED', state_change_idempotency_key = ?, error_description = ?,
            modified_at = ?
        WHERE id = ? AND state IN ('PENDING', 'ACTIVE')
        "#,
    )
    .bind(state_change_key)
    .bind(description)
    .bind(Utc::now())
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// ACTIVE -> COMPLETED. Returns `false` if the transfer was not ACTIVE.
pub async fn mark_completed(
    conn: &mut SqliteConnection,
    id: &str,
    state_change_key: Option<&str>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE transfers
        SET state = 'COMPLETED', state_change_idempotency_key = ?, modified_at = ?
        WHERE id = ? AND state = 'ACTIVE'
        "#,
    )
    .bind(state_change_key)
    .bind(Utc::now())
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Link a failed transfer to the transfer that replaced it.
pub async fn set_replaced_by(
    conn: &mut SqliteConnection,
    id: &str,
    replacement_id: &str,
) -> Result<()> {
    sqlx::query("UPDATE transfers SET replaced_by = ?, modified_at = ? WHERE id = ?")
        .bind(replacement_id)
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Whether a PENDING or ACTIVE transfer references the peer on either end.
pub async fn peer_has_in_flight(
    conn: &mut SqliteConnection,
    channel_id: &str,
    peer_id: &str,
) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM transfers
        WHERE channel_id = ?
          AND (from_peer_id = ? OR to_peer_id = ?)
          AND state IN ('PENDING', 'ACTIVE')
        "#,
    )
    .bind(channel_id)
    .bind(peer_id)
    .bind(peer_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(count > 0)
}

/// Number of PENDING or ACTIVE transfers on the channel.
pub async fn count_in_flight(conn: &mut SqliteConnection, channel_id: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM transfers WHERE channel_id = ? AND state IN ('PENDING', 'ACTIVE')",
    )
    .bind(channel_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(count)
}
