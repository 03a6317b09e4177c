// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! JSON/HTTP surface for the slot and channel handlers.
//!
//! Every route is a thin wrapper: decode, call the handler, encode. Errors are
//! rendered as `{ "error": { "code", "message" } }` with a status derived from
//! [`ErrorKind`].

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use conduit_operations::OperationHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, warn};

use crate::channel_handlers::{
    self, ChannelHandlerState, CreateChannelRequest, CreateChannelResponse, DestroyAllRequest,
    DestroyChannelRequest,
};
use crate::error::{ChannelError, ErrorKind};
use crate::slot_handlers::{
    self, BindRequest, BindResponse, GetChannelsStatusRequest, GetChannelsStatusResponse,
    SlotHandlerState, TransferCompletedRequest, TransferCompletedResponse, TransferFailedRequest,
    TransferFailedResponse, UnbindRequest, UnbindResponse,
};
use crate::status::ChannelStatus;

/// Handler state shared by all routes.
#[derive(Clone)]
pub struct AppState {
    /// Slot protocol state.
    pub slots: Arc<SlotHandlerState>,
    /// Private channel API state.
    pub channels: Arc<ChannelHandlerState>,
}

/// A [`ChannelError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub ChannelError);

impl From<ChannelError> for ApiError {
    fn from(err: ChannelError) -> Self {
        Self(err)
    }
}

impl ApiError {
    /// HTTP status for the error.
    pub fn status(&self) -> StatusCode {
        match self.0.kind() {
            ErrorKind::Client if matches!(self.0, ChannelError::PermissionDenied { .. }) => {
                StatusCode::FORBIDDEN
            }
            ErrorKind::Client => StatusCode::BAD_REQUEST,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Unrecoverable | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(code = self.0.error_code(), error = %self.0, "Request failed");
        } else {
            warn!(code = self.0.error_code(), error = %self.0, "Request rejected");
        }
        (status, Json(json!({ "error": self.0.to_body() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Body of the destroy routes; the target comes from the path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestroyBody {
    /// Client-chosen key making retries safe.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// Build the router serving every handler.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/slots/bind", post(bind))
        .route("/v1/slots/unbind", post(unbind))
        .route("/v1/slots/transfer-failed", post(transfer_failed))
        .route("/v1/slots/transfer-completed", post(transfer_completed))
        .route("/v1/slots/status", post(channels_status))
        .route("/v1/channels", post(create_channel))
        .route("/v1/channels/{id}", get(channel_status))
        .route("/v1/channels/{id}/destroy", post(destroy_channel))
        .route("/v1/executions/{id}/destroy", post(destroy_all))
        .route("/v1/executions/{id}/channels", get(channel_status_all))
        .route("/v1/operations/{id}", get(get_operation))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

// ============================================================================
// Slot routes
// ============================================================================

async fn bind(State(state): State<AppState>, Json(request): Json<BindRequest>) -> ApiResult<BindResponse> {
    Ok(Json(slot_handlers::handle_bind(&state.slots, request).await?))
}

async fn unbind(
    State(state): State<AppState>,
    Json(request): Json<UnbindRequest>,
) -> ApiResult<UnbindResponse> {
    Ok(Json(slot_handlers::handle_unbind(&state.slots, request).await?))
}

async fn transfer_failed(
    State(state): State<AppState>,
    Json(request): Json<TransferFailedRequest>,
) -> ApiResult<TransferFailedResponse> {
    Ok(Json(slot_handlers::handle_transfer_failed(&state.slots, request).await?))
}

async fn transfer_completed(
    State(state): State<AppState>,
    Json(request): Json<TransferCompletedRequest>,
) -> ApiResult<TransferCompletedResponse> {
    Ok(Json(slot_handlers::handle_transfer_completed(&state.slots, request).await?))
}

async fn channels_status(
    State(state): State<AppState>,
    Json(request): Json<GetChannelsStatusRequest>,
) -> ApiResult<GetChannelsStatusResponse> {
    Ok(Json(slot_handlers::handle_get_channels_status(&state.slots, request).await?))
}

// ============================================================================
// Channel routes
// ============================================================================

async fn create_channel(
    State(state): State<AppState>,
    Json(request): Json<CreateChannelRequest>,
) -> ApiResult<CreateChannelResponse> {
    Ok(Json(channel_handlers::handle_create_channel(&state.channels, request).await?))
}

async fn channel_status(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<ChannelStatus> {
    Ok(Json(channel_handlers::handle_channel_status(&state.channels, &id).await?))
}

async fn destroy_channel(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<DestroyBody>,
) -> ApiResult<OperationHandle> {
    let request = DestroyChannelRequest {
        channel_id: id,
        idempotency_key: body.idempotency_key,
    };
    Ok(Json(channel_handlers::handle_destroy_channel(&state.channels, request).await?))
}

async fn destroy_all(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<DestroyBody>,
) -> ApiResult<OperationHandle> {
    let request = DestroyAllRequest {
        execution_id: id,
        idempotency_key: body.idempotency_key,
    };
    Ok(Json(channel_handlers::handle_destroy_all(&state.channels, request).await?))
}

async fn channel_status_all(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<ChannelStatus>> {
    Ok(Json(channel_handlers::handle_channel_status_all(&state.channels, &id).await?))
}

async fn get_operation(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<OperationHandle> {
    Ok(Json(channel_handlers::handle_get_operation(&state.channels, &id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ChannelError::validation("role", "must be set"), StatusCode::BAD_REQUEST),
            (
                ChannelError::PermissionDenied {
                    channel_id: "ch".to_string(),
                    subject: "eve".to_string(),
                },
                StatusCode::FORBIDDEN,
            ),
            (
                ChannelError::IdempotencyConflict { key: "k".to_string() },
                StatusCode::CONFLICT,
            ),
            (
                ChannelError::ChannelNotFound {
                    channel_id: "ch".to_string(),
                },
                StatusCode::NOT_FOUND,
            ),
            (
                ChannelError::Unavailable {
                    reason: "busy".to_string(),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ChannelError::ChannelUnrecoverable {
                    channel_id: "ch".to_string(),
                    reason: "no producer".to_string(),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).status(), status);
        }
    }
}
