// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Channel rows.

use chrono::Utc;
use sqlx::SqliteConnection;

use crate::error::Result;
use crate::model::{Channel, LifeStatus};

const CHANNEL_FIELDS: &str = "id, execution_id, workflow_name, user_id, data_scheme, \
     storage_producer_uri, storage_consumer_uri, life_status, created_at";

/// A channel to insert.
#[derive(Debug, Clone)]
pub struct NewChannel {
    /// Derived channel id.
    pub id: String,
    /// Owning execution.
    pub execution_id: String,
    /// Workflow name.
    pub workflow_name: String,
    /// Owner of the workflow.
    pub user_id: String,
    /// Opaque data scheme.
    pub data_scheme: serde_json::Value,
    /// Storage producer endpoint.
    pub storage_producer_uri: Option<String>,
    /// Storage consumer endpoint.
    pub storage_consumer_uri: Option<String>,
}

/// Insert an ALIVE channel. Returns `false` if the id is taken.
pub async fn insert(conn: &mut SqliteConnection, channel: &NewChannel) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO channels (id, execution_id, workflow_name, user_id, data_scheme,
                              storage_producer_uri, storage_consumer_uri, life_status, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, 'ALIVE', ?)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(&channel.id)
    .bind(&channel.execution_id)
    .bind(&channel.workflow_name)
    .bind(&channel.user_id)
    .bind(serde_json::to_string(&channel.data_scheme)?)
    .bind(&channel.storage_producer_uri)
    .bind(&channel.storage_consumer_uri)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Load a channel by id, whatever its status.
pub async fn get(conn: &mut SqliteConnection, id: &str) -> Result<Option<Channel>> {
    let sql = format!("SELECT {CHANNEL_FIELDS} FROM channels WHERE id = ?");
    let channel = sqlx::query_as::<_, Channel>(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(channel)
}

/// ALIVE channels of an execution, ordered by id.
pub async fn list_alive(conn: &mut SqliteConnection, execution_id: &str) -> Result<Vec<Channel>> {
    let sql = format!(
        "SELECT {CHANNEL_FIELDS} FROM channels \
         WHERE execution_id = ? AND life_status = 'ALIVE' ORDER BY id"
    );
    let channels = sqlx::query_as::<_, Channel>(&sql)
        .bind(execution_id)
        .fetch_all(&mut *conn)
        .await?;
    Ok(channels)
}

/// Move a channel to `status`. Returns `false` if the channel does not exist.
pub async fn set_life_status(
    conn: &mut SqliteConnection,
    id: &str,
    status: LifeStatus,
) -> Result<bool> {
    let result = sqlx::query("UPDATE channels SET life_status = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Delete a channel with its transfers and peers. Returns `false` if it was already gone.
pub async fn delete(conn: &mut SqliteConnection, id: &str) -> Result<bool> {
    sqlx::query("DELETE FROM transfers WHERE channel_id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM peers WHERE channel_id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    let result = sqlx::query("DELETE FROM channels WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() == 1)
}
