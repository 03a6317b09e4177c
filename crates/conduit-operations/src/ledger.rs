// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Idempotency ledger.
//!
//! Records `(scope, key) -> (request hash, response)` so a retried request with an
//! identical payload replays the stored response, while the same key with a
//! different payload is rejected. Both calls run inside the caller's transaction,
//! so the ledger entry commits or rolls back together with the work it describes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::SqliteConnection;

use crate::error::Result;

/// Outcome of [`record_or_replay`].
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerEntry {
    /// First time this key is seen; the caller performs the work.
    Fresh,
    /// Same key and payload as before; the stored response is returned.
    Replay(serde_json::Value),
    /// Same key, different payload.
    Conflict,
}

/// Hex SHA-256 of the request's JSON encoding.
pub fn request_hash<T: Serialize + ?Sized>(request: &T) -> Result<String> {
    let bytes = serde_json::to_vec(request)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

/// Claim `key` within `scope`, or replay what was stored for it.
pub async fn record_or_replay(
    conn: &mut SqliteConnection,
    scope: &str,
    key: &str,
    request_hash: &str,
) -> Result<LedgerEntry> {
    let inserted = sqlx::query(
        r#"
        INSERT INTO idempotency_keys (scope, idempotency_key, request_hash, created_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT (scope, idempotency_key) DO NOTHING
        "#,
    )
    .bind(scope)
    .bind(key)
    .bind(request_hash)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    if inserted.rows_affected() == 1 {
        return Ok(LedgerEntry::Fresh);
    }

    let (stored_hash, response): (String, Option<String>) = sqlx::query_as(
        r#"
        SELECT request_hash, response
        FROM idempotency_keys
        WHERE scope = ? AND idempotency_key = ?
        "#,
    )
    .bind(scope)
    .bind(key)
    .fetch_one(&mut *conn)
    .await?;

    if stored_hash != request_hash {
        return Ok(LedgerEntry::Conflict);
    }

    match response {
        Some(json) => Ok(LedgerEntry::Replay(serde_json::from_str(&json)?)),
        // Claimed by a request that never stored a response; redo the work.
        None => Ok(LedgerEntry::Fresh),
    }
}

/// Store the response for a key claimed by [`record_or_replay`].
pub async fn store_result(
    conn: &mut SqliteConnection,
    scope: &str,
    key: &str,
    response: &serde_json::Value,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE idempotency_keys
        SET response = ?
        WHERE scope = ? AND idempotency_key = ?
        "#,
    )
    .bind(serde_json::to_string(response)?)
    .bind(scope)
    .bind(key)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Delete ledger entries created before `cutoff`.
pub async fn delete_older_than(conn: &mut SqliteConnection, cutoff: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query("DELETE FROM idempotency_keys WHERE created_at < ?")
        .bind(cutoff)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}
