// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Peer rows.
//!
//! A peer id is unique within its channel. Creating a peer that already exists
//! succeeds only when the stored provenance (idempotency key and request hash)
//! matches the new request.

use chrono::Utc;
use sqlx::SqliteConnection;

use crate::error::{ChannelError, Result};
use crate::model::{Peer, PeerDescription, Priority, Role};

const PEER_FIELDS: &str = "seq, id, channel_id, role, priority, connected, description, \
     retry_budget, idempotency_key, request_hash, created_at";

/// A peer to insert.
#[derive(Debug, Clone)]
pub struct NewPeer {
    /// Peer id.
    pub id: String,
    /// Channel id.
    pub channel_id: String,
    /// Producer or consumer.
    pub role: Role,
    /// Selection priority.
    pub priority: Priority,
    /// Whether the peer is matched on creation.
    pub connected: bool,
    /// Where the peer lives.
    pub description: PeerDescription,
    /// Initial retry budget.
    pub retry_budget: i64,
    /// Key of the creating request.
    pub idempotency_key: String,
    /// Hash of the creating request.
    pub request_hash: String,
}

/// Result of [`create`].
#[derive(Debug, Clone)]
pub enum PeerCreated {
    /// A new row was written.
    Created(Peer),
    /// The peer already existed with the same provenance.
    Existing(Peer),
}

impl PeerCreated {
    /// The peer row, new or existing.
    pub fn peer(&self) -> &Peer {
        match self {
            Self::Created(p) | Self::Existing(p) => p,
        }
    }

    /// Whether a new row was written.
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Insert a peer, idempotently on `(channel_id, id)` plus provenance.
pub async fn create(conn: &mut SqliteConnection, peer: &NewPeer) -> Result<PeerCreated> {
    let inserted = sqlx::query(
        r#"
        INSERT INTO peers (id, channel_id, role, priority, connected, description,
                           retry_budget, idempotency_key, request_hash, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (channel_id, id) DO NOTHING
        "#,
    )
    .bind(&peer.id)
    .bind(&peer.channel_id)
    .bind(peer.role.as_str())
    .bind(peer.priority.as_str())
    .bind(peer.connected)
    .bind(serde_json::to_string(&peer.description)?)
    .bind(peer.retry_budget)
    .bind(&peer.idempotency_key)
    .bind(&peer.request_hash)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    let stored = get(conn, &peer.channel_id, &peer.id)
        .await?
        .ok_or_else(|| ChannelError::PeerNotFound {
            channel_id: peer.channel_id.clone(),
            peer_id: peer.id.clone(),
        })?;

    if inserted.rows_affected() == 1 {
        return Ok(PeerCreated::Created(stored));
    }
    if stored.idempotency_key != peer.idempotency_key || stored.request_hash != peer.request_hash
    {
        return Err(ChannelError::PeerAlreadyExists {
            channel_id: peer.channel_id.clone(),
            peer_id: peer.id.clone(),
        });
    }
    Ok(PeerCreated::Existing(stored))
}

/// Load a peer.
pub async fn get(conn: &mut SqliteConnection, channel_id: &str, id: &str) -> Result<Option<Peer>> {
    let sql = format!("SELECT {PEER_FIELDS} FROM peers WHERE channel_id = ? AND id = ?");
    let peer = sqlx::query_as::<_, Peer>(&sql)
        .bind(channel_id)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(peer)
}

/// All peers of a channel in creation order.
pub async fn list(conn: &mut SqliteConnection, channel_id: &str) -> Result<Vec<Peer>> {
    let sql = format!("SELECT {PEER_FIELDS} FROM peers WHERE channel_id = ? ORDER BY seq");
    let peers = sqlx::query_as::<_, Peer>(&sql)
        .bind(channel_id)
        .fetch_all(&mut *conn)
        .await?;
    Ok(peers)
}

/// Best producer to feed a consumer: primaries first, then oldest.
///
/// Producers whose retry budget went negative are never selected.
pub async fn find_producer(conn: &mut SqliteConnection, channel_id: &str) -> Result<Option<Peer>> {
    let sql = format!(
        "SELECT {PEER_FIELDS} FROM peers \
         WHERE channel_id = ? AND role = 'PRODUCER' AND retry_budget >= 0 \
         ORDER BY CASE priority WHEN 'PRIMARY' THEN 0 ELSE 1 END, seq \
         LIMIT 1"
    );
    let peer = sqlx::query_as::<_, Peer>(&sql)
        .bind(channel_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(peer)
}

/// Mark every waiting consumer connected and return them in creation order.
pub async fn connect_waiting_consumers(
    conn: &mut SqliteConnection,
    channel_id: &str,
) -> Result<Vec<Peer>> {
    let sql = format!(
        "SELECT {PEER_FIELDS} FROM peers \
         WHERE channel_id = ? AND role = 'CONSUMER' AND connected = FALSE \
         ORDER BY seq"
    );
    let mut waiting = sqlx::query_as::<_, Peer>(&sql)
        .bind(channel_id)
        .fetch_all(&mut *conn)
        .await?;

    sqlx::query(
        "UPDATE peers SET connected = TRUE \
         WHERE channel_id = ? AND role = 'CONSUMER' AND connected = FALSE",
    )
    .bind(channel_id)
    .execute(&mut *conn)
    .await?;

    for peer in &mut waiting {
        peer.connected = true;
    }
    Ok(waiting)
}

/// Decrement a producer's retry budget and return the new value.
pub async fn decrement_retry_budget(
    conn: &mut SqliteConnection,
    channel_id: &str,
    id: &str,
) -> Result<i64> {
    let budget: Option<i64> = sqlx::query_scalar(
        r#"
        UPDATE peers
        SET retry_budget = retry_budget - 1
        WHERE channel_id = ? AND id = ?
        RETURNING retry_budget
        "#,
    )
    .bind(channel_id)
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    budget.ok_or_else(|| ChannelError::PeerNotFound {
        channel_id: channel_id.to_string(),
        peer_id: id.to_string(),
    })
}

/// Put a consumer back among the waiting ones, so the next producer bind matches it.
pub async fn disconnect(conn: &mut SqliteConnection, channel_id: &str, id: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE peers SET connected = FALSE \
         WHERE channel_id = ? AND id = ? AND role = 'CONSUMER'",
    )
    .bind(channel_id)
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Delete a peer. Returns `false` if it did not exist.
pub async fn delete(conn: &mut SqliteConnection, channel_id: &str, id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM peers WHERE channel_id = ? AND id = ?")
        .bind(channel_id)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() == 1)
}
