// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Channels, peers, and transfers as stored by the DAOs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};

fn decode_error(message: String) -> sqlx::Error {
    sqlx::Error::Decode(message.into())
}

/// Lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifeStatus {
    /// Peers may bind.
    Alive,
    /// Teardown in progress; no new peers.
    Destroying,
    /// Gone.
    Destroyed,
}

impl LifeStatus {
    /// Returns the string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alive => "ALIVE",
            Self::Destroying => "DESTROYING",
            Self::Destroyed => "DESTROYED",
        }
    }

    /// Parse a status from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ALIVE" => Some(Self::Alive),
            "DESTROYING" => Some(Self::Destroying),
            "DESTROYED" => Some(Self::Destroyed),
            _ => None,
        }
    }
}

/// Which side of the channel a peer is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    /// Source of data.
    Producer,
    /// Sink of data.
    Consumer,
}

impl Role {
    /// Returns the string representation of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Producer => "PRODUCER",
            Self::Consumer => "CONSUMER",
        }
    }

    /// Parse a role from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PRODUCER" => Some(Self::Producer),
            "CONSUMER" => Some(Self::Consumer),
            _ => None,
        }
    }
}

/// Producer selection order: primaries before backups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    /// Preferred source.
    Primary,
    /// Used once primaries are exhausted.
    Backup,
}

impl Priority {
    /// Returns the string representation of the priority.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "PRIMARY",
            Self::Backup => "BACKUP",
        }
    }

    /// Parse a priority from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PRIMARY" => Some(Self::Primary),
            "BACKUP" => Some(Self::Backup),
            _ => None,
        }
    }
}

/// State of a transfer.
///
/// ```text
/// PENDING ──► ACTIVE ──► COMPLETED
///                │
///                └─────► FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferState {
    /// Waiting for the producer to be told to start.
    Pending,
    /// Data is flowing.
    Active,
    /// Reported failed by a peer.
    Failed,
    /// Reported completed by a peer.
    Completed,
}

impl TransferState {
    /// Returns the string representation of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Active => "ACTIVE",
            Self::Failed => "FAILED",
            Self::Completed => "COMPLETED",
        }
    }

    /// Parse a state from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "ACTIVE" => Some(Self::Active),
            "FAILED" => Some(Self::Failed),
            "COMPLETED" => Some(Self::Completed),
            _ => None,
        }
    }

    /// Whether the transfer still occupies its sink.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Pending | Self::Active)
    }
}

/// Where a peer lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PeerDescription {
    /// A running workflow slot reachable over the network.
    #[serde(rename_all = "camelCase")]
    Slot {
        /// Base URL of the slot.
        peer_url: String,
    },
    /// Durable storage endpoint.
    #[serde(rename_all = "camelCase")]
    Storage {
        /// Storage location.
        storage_uri: String,
    },
}

impl PeerDescription {
    /// Whether this is a storage endpoint.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage { .. })
    }
}

/// Derive the channel id for a named channel of an execution.
///
/// Characters outside `[A-Za-z0-9-_]` become `-`.
pub fn channel_id(execution_id: &str, name: &str) -> String {
    format!("channel-{}-{}", execution_id, name)
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// A named data-flow group of one workflow execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    /// Channel id.
    pub id: String,
    /// Owning execution.
    pub execution_id: String,
    /// Workflow the execution runs.
    pub workflow_name: String,
    /// Owner of the workflow.
    pub user_id: String,
    /// Opaque data scheme.
    pub data_scheme: serde_json::Value,
    /// Storage endpoint acting as the initial producer.
    pub storage_producer_uri: Option<String>,
    /// Storage endpoint acting as a consumer.
    pub storage_consumer_uri: Option<String>,
    /// Lifecycle status.
    pub life_status: LifeStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, SqliteRow> for Channel {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let scheme: String = row.try_get("data_scheme")?;
        let status: String = row.try_get("life_status")?;
        Ok(Self {
            id: row.try_get("id")?,
            execution_id: row.try_get("execution_id")?,
            workflow_name: row.try_get("workflow_name")?,
            user_id: row.try_get("user_id")?,
            data_scheme: serde_json::from_str(&scheme)
                .map_err(|e| decode_error(format!("data_scheme: {e}")))?,
            storage_producer_uri: row.try_get("storage_producer_uri")?,
            storage_consumer_uri: row.try_get("storage_consumer_uri")?,
            life_status: LifeStatus::parse(&status)
                .ok_or_else(|| decode_error(format!("unknown life status '{status}'")))?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// One endpoint bound to a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Peer {
    /// Creation sequence; breaks ties in producer selection.
    pub seq: i64,
    /// Peer id, unique within the channel.
    pub id: String,
    /// Channel the peer is bound to.
    pub channel_id: String,
    /// Producer or consumer.
    pub role: Role,
    /// Selection priority.
    pub priority: Priority,
    /// Whether the peer has been matched.
    pub connected: bool,
    /// Where the peer lives.
    pub description: PeerDescription,
    /// Remaining failovers this producer may cause; negative excludes it.
    pub retry_budget: i64,
    /// Key of the request that created the peer.
    pub idempotency_key: String,
    /// Hash of the request that created the peer.
    pub request_hash: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, SqliteRow> for Peer {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let role: String = row.try_get("role")?;
        let priority: String = row.try_get("priority")?;
        let description: String = row.try_get("description")?;
        Ok(Self {
            seq: row.try_get("seq")?,
            id: row.try_get("id")?,
            channel_id: row.try_get("channel_id")?,
            role: Role::parse(&role).ok_or_else(|| decode_error(format!("unknown role '{role}'")))?,
            priority: Priority::parse(&priority)
                .ok_or_else(|| decode_error(format!("unknown priority '{priority}'")))?,
            connected: row.try_get("connected")?,
            description: serde_json::from_str(&description)
                .map_err(|e| decode_error(format!("description: {e}")))?,
            retry_budget: row.try_get("retry_budget")?,
            idempotency_key: row.try_get("idempotency_key")?,
            request_hash: row.try_get("request_hash")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// One attempted data movement between two peers.
#[derive(Debug, Clone, PartialEq)]
pub struct Transfer {
    /// Transfer id.
    pub id: String,
    /// Channel of both peers.
    pub channel_id: String,
    /// Producer peer id.
    pub from_peer_id: String,
    /// Consumer peer id.
    pub to_peer_id: String,
    /// Current state.
    pub state: TransferState,
    /// Key of the request that moved the transfer out of ACTIVE.
    pub state_change_idempotency_key: Option<String>,
    /// Failure description reported by a peer.
    pub error_description: Option<String>,
    /// Transfer created by failover in place of this one.
    pub replaced_by: Option<String>,
    /// Key of the request that created the transfer.
    pub idempotency_key: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub modified_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, SqliteRow> for Transfer {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let state: String = row.try_get("state")?;
        Ok(Self {
            id: row.try_get("id")?,
            channel_id: row.try_get("channel_id")?,
            from_peer_id: row.try_get("from_peer_id")?,
            to_peer_id: row.try_get("to_peer_id")?,
            state: TransferState::parse(&state)
                .ok_or_else(|| decode_error(format!("unknown transfer state '{state}'")))?,
            state_change_idempotency_key: row.try_get("state_change_idempotency_key")?,
            error_description: row.try_get("error_description")?,
            replaced_by: row.try_get("replaced_by")?,
            idempotency_key: row.try_get("idempotency_key")?,
            created_at: row.try_get("created_at")?,
            modified_at: row.try_get("modified_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_id_sanitizes_name() {
        assert_eq!(channel_id("exec-1", "out"), "channel-exec-1-out");
        assert_eq!(
            channel_id("exec.1", "my channel/2"),
            "channel-exec-1-my-channel-2"
        );
        assert_eq!(channel_id("e_1", "a_b"), "channel-e_1-a_b");
    }

    #[test]
    fn test_enum_string_forms() {
        for status in [LifeStatus::Alive, LifeStatus::Destroying, LifeStatus::Destroyed] {
            assert_eq!(LifeStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(Role::parse("producer"), None);
        assert_eq!(Priority::parse("BACKUP"), Some(Priority::Backup));
        assert!(TransferState::Pending.is_in_flight());
        assert!(!TransferState::Failed.is_in_flight());
    }

    #[test]
    fn test_peer_description_json_shape() {
        let slot = PeerDescription::Slot {
            peer_url: "http://slot-1:9000".to_string(),
        };
        let json = serde_json::to_value(&slot).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "type": "slot", "peerUrl": "http://slot-1:9000" })
        );

        let storage: PeerDescription =
            serde_json::from_str(r#"{"type":"storage","storageUri":"s3://bucket/key"}"#).unwrap();
        assert!(storage.is_storage());
        assert!(!slot.is_storage());
    }
}
