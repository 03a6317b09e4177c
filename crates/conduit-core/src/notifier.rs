// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tells a consumer slot to start pulling from its producer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::CallError;
use crate::model::PeerDescription;

/// One side of a transfer, as known to the notifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferEndpoint {
    /// Peer id.
    pub peer_id: String,
    /// Where the peer lives.
    pub description: PeerDescription,
}

/// A `startTransfer` push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTransfer {
    /// Channel of both peers.
    pub channel_id: String,
    /// Transfer to start.
    pub transfer_id: String,
    /// The slot being told.
    pub consumer: TransferEndpoint,
    /// Where the consumer should read from.
    pub producer: TransferEndpoint,
}

/// Pushes `startTransfer` to consumer slots.
#[async_trait]
pub trait TransferNotifier: Send + Sync {
    /// Tell `request.consumer` to start reading from `request.producer`.
    ///
    /// Must tolerate being called more than once for the same transfer.
    async fn start_transfer(&self, request: &StartTransfer) -> Result<(), CallError>;
}

/// Logs the push and succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl TransferNotifier for LoggingNotifier {
    async fn start_transfer(&self, request: &StartTransfer) -> Result<(), CallError> {
        info!(
            channel_id = %request.channel_id,
            transfer_id = %request.transfer_id,
            consumer = %request.consumer.peer_id,
            producer = %request.producer.peer_id,
            "Start transfer"
        );
        Ok(())
    }
}

#[cfg(feature = "server")]
pub use http::HttpTransferNotifier;

#[cfg(feature = "server")]
mod http {
    use std::time::Duration;

    use async_trait::async_trait;
    use tracing::debug;

    use super::{StartTransfer, TransferNotifier};
    use crate::error::CallError;
    use crate::model::PeerDescription;

    /// POSTs the push to `{peerUrl}/start-transfer` of the consumer slot.
    #[derive(Debug, Clone)]
    pub struct HttpTransferNotifier {
        client: reqwest::Client,
    }

    impl HttpTransferNotifier {
        /// Create a notifier with a per-request timeout.
        pub fn new(timeout: Duration) -> Result<Self, CallError> {
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| {
                    CallError::Permanent(format!("Failed to create HTTP client: {}", e))
                })?;
            Ok(Self { client })
        }
    }

    #[async_trait]
    impl TransferNotifier for HttpTransferNotifier {
        async fn start_transfer(&self, request: &StartTransfer) -> Result<(), CallError> {
            let base = match &request.consumer.description {
                PeerDescription::Slot { peer_url } => peer_url,
                PeerDescription::Storage { .. } => {
                    return Err(CallError::Permanent(format!(
                        "consumer '{}' is a storage peer and cannot be notified",
                        request.consumer.peer_id
                    )));
                }
            };
            let url = format!("{}/start-transfer", base.trim_end_matches('/'));

            let response = self
                .client
                .post(&url)
                .json(request)
                .send()
                .await
                .map_err(|e| CallError::Transient(format!("POST {} failed: {}", url, e)))?;

            let status = response.status();
            debug!(%url, status = status.as_u16(), "Start transfer pushed");
            if status.is_success() {
                Ok(())
            } else if status.is_server_error() || status.as_u16() == 429 {
                Err(CallError::Transient(format!("POST {} returned {}", url, status)))
            } else {
                Err(CallError::Permanent(format!("POST {} returned {}", url, status)))
            }
        }
    }
}
