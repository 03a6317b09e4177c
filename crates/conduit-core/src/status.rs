// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Read-only channel projection shared by the slot and channel APIs.

use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;

use crate::db::peers;
use crate::error::Result;
use crate::model::{Channel, Peer, PeerDescription, Priority, Role};

/// A peer as reported in a channel status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStatus {
    /// Peer id.
    pub peer_id: String,
    /// Selection priority.
    pub priority: Priority,
    /// Whether the peer has been matched.
    pub connected: bool,
    /// Where the peer lives.
    pub description: PeerDescription,
}

impl From<Peer> for PeerStatus {
    fn from(peer: Peer) -> Self {
        Self {
            peer_id: peer.id,
            priority: peer.priority,
            connected: peer.connected,
            description: peer.description,
        }
    }
}

/// Snapshot of one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStatus {
    /// Channel id.
    pub channel_id: String,
    /// Owning execution.
    pub execution_id: String,
    /// Workflow name.
    pub workflow_name: String,
    /// Opaque data scheme.
    pub data_scheme: serde_json::Value,
    /// Producers in creation order.
    pub producers: Vec<PeerStatus>,
    /// Consumers in creation order.
    pub consumers: Vec<PeerStatus>,
}

/// Build the snapshot of `channel`.
pub async fn load(conn: &mut SqliteConnection, channel: &Channel) -> Result<ChannelStatus> {
    let (producers, consumers): (Vec<Peer>, Vec<Peer>) = peers::list(conn, &channel.id)
        .await?
        .into_iter()
        .partition(|peer| peer.role == Role::Producer);

    Ok(ChannelStatus {
        channel_id: channel.id.clone(),
        execution_id: channel.execution_id.clone(),
        workflow_name: channel.workflow_name.clone(),
        data_scheme: channel.data_scheme.clone(),
        producers: producers.into_iter().map(PeerStatus::from).collect(),
        consumers: consumers.into_iter().map(PeerStatus::from).collect(),
    })
}
