// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operation rows.
//!
//! Every function takes a `&mut SqliteConnection` so callers can compose them
//! into their own transactions (`&mut *tx`) or run them on a pooled connection.
//! Outcome writes are guarded by `done = FALSE`: an operation completes at most once.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use crate::error::{OperationError, Result};
use crate::operation::{NewOperation, OperationFailure, OperationRecord};

const OPERATION_FIELDS: &str = "id, kind, description, created_by, created_at, modified_at, \
     deadline, done, state, response, error_code, error_message, idempotency_key, request_hash";

/// Result of [`create`].
#[derive(Debug, Clone)]
pub enum Inserted {
    /// A new row was written.
    Created(OperationRecord),
    /// A row with the same idempotency key and request hash already existed.
    Existing(OperationRecord),
}

impl Inserted {
    /// The operation row, new or existing.
    pub fn record(&self) -> &OperationRecord {
        match self {
            Self::Created(r) | Self::Existing(r) => r,
        }
    }

    /// Consume into the operation row.
    pub fn into_record(self) -> OperationRecord {
        match self {
            Self::Created(r) | Self::Existing(r) => r,
        }
    }
}

/// Insert an operation, idempotently on its idempotency key.
///
/// Reusing a key with a different request hash is an
/// [`OperationError::IdempotencyConflict`].
pub async fn create(conn: &mut SqliteConnection, op: &NewOperation) -> Result<Inserted> {
    let now = Utc::now();
    let (token, hash) = match &op.idempotency_key {
        Some(key) => (Some(key.token.as_str()), Some(key.request_hash.as_str())),
        None => (None, None),
    };

    let inserted = sqlx::query(
        r#"
        INSERT INTO operations (id, kind, description, created_by, created_at, modified_at,
                                deadline, done, state, idempotency_key, request_hash)
        VALUES (?, ?, ?, ?, ?, ?, ?, FALSE, ?, ?, ?)
        ON CONFLICT (idempotency_key) DO NOTHING
        "#,
    )
    .bind(&op.id)
    .bind(&op.kind)
    .bind(&op.description)
    .bind(&op.created_by)
    .bind(now)
    .bind(now)
    .bind(op.deadline)
    .bind(&op.state)
    .bind(token)
    .bind(hash)
    .execute(&mut *conn)
    .await?;

    if inserted.rows_affected() == 0
        && let Some(key) = &op.idempotency_key
    {
        let existing = get_by_idempotency_key(conn, &key.token)
            .await?
            .ok_or_else(|| OperationError::NotFound(key.token.clone()))?;
        if existing.request_hash.as_deref() != Some(key.request_hash.as_str()) {
            return Err(OperationError::IdempotencyConflict {
                key: key.token.clone(),
            });
        }
        return Ok(Inserted::Existing(existing));
    }

    let record = get(conn, &op.id)
        .await?
        .ok_or_else(|| OperationError::NotFound(op.id.clone()))?;
    Ok(Inserted::Created(record))
}

/// Load an operation by id.
pub async fn get(conn: &mut SqliteConnection, id: &str) -> Result<Option<OperationRecord>> {
    let sql = format!("SELECT {OPERATION_FIELDS} FROM operations WHERE id = ?");
    let record = sqlx::query_as::<_, OperationRecord>(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(record)
}

/// Load an operation by idempotency token.
pub async fn get_by_idempotency_key(
    conn: &mut SqliteConnection,
    token: &str,
) -> Result<Option<OperationRecord>> {
    let sql = format!("SELECT {OPERATION_FIELDS} FROM operations WHERE idempotency_key = ?");
    let record = sqlx::query_as::<_, OperationRecord>(&sql)
        .bind(token)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(record)
}

/// Persist a new state envelope for a running operation.
pub async fn update_state(conn: &mut SqliteConnection, id: &str, state: &str) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE operations
        SET state = ?, modified_at = ?
        WHERE id = ? AND done = FALSE
        "#,
    )
    .bind(state)
    .bind(Utc::now())
    .bind(id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(missing_or_completed(conn, id).await);
    }
    Ok(())
}

/// Record a successful outcome.
pub async fn complete(
    conn: &mut SqliteConnection,
    id: &str,
    response: &serde_json::Value,
) -> Result<()> {
    let response = serde_json::to_string(response)?;
    let result = sqlx::query(
        r#"
        UPDATE operations
        SET done = TRUE, response = ?, modified_at = ?
        WHERE id = ? AND done = FALSE
        "#,
    )
    .bind(response)
    .bind(Utc::now())
    .bind(id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(missing_or_completed(conn, id).await);
    }
    Ok(())
}

/// Record a failed outcome.
pub async fn fail(
    conn: &mut SqliteConnection,
    id: &str,
    failure: &OperationFailure,
) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE operations
        SET done = TRUE, error_code = ?, error_message = ?, modified_at = ?
        WHERE id = ? AND done = FALSE
        "#,
    )
    .bind(&failure.code)
    .bind(&failure.message)
    .bind(Utc::now())
    .bind(id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(missing_or_completed(conn, id).await);
    }
    Ok(())
}

/// Operations owned by `owner` that have not finished yet, oldest first.
pub async fn list_unfinished(
    conn: &mut SqliteConnection,
    owner: &str,
) -> Result<Vec<OperationRecord>> {
    let sql = format!(
        "SELECT {OPERATION_FIELDS} FROM operations \
         WHERE created_by = ? AND done = FALSE ORDER BY created_at ASC"
    );
    let records = sqlx::query_as::<_, OperationRecord>(&sql)
        .bind(owner)
        .fetch_all(&mut *conn)
        .await?;
    Ok(records)
}

/// Delete up to `limit` finished operations last modified before `cutoff`.
pub async fn delete_finished_older_than(
    conn: &mut SqliteConnection,
    cutoff: DateTime<Utc>,
    limit: i64,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM operations
        WHERE id IN (
            SELECT id FROM operations
            WHERE done = TRUE AND modified_at < ?
            LIMIT ?
        )
        "#,
    )
    .bind(cutoff)
    .bind(limit)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

async fn missing_or_completed(conn: &mut SqliteConnection, id: &str) -> OperationError {
    match get(conn, id).await {
        Ok(Some(_)) => OperationError::AlreadyCompleted(id.to_string()),
        Ok(None) => OperationError::NotFound(id.to_string()),
        Err(e) => e,
    }
}
