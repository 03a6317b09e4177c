// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for conduit-core.
//!
//! Every handler returns [`ChannelError`]. Its [`ErrorKind`] decides how the
//! transport reports it; [`ChannelError::error_code`] is the stable wire code.

use std::fmt;

use conduit_operations::{OperationError, Transient};
use serde::{Deserialize, Serialize};

/// Result type using ChannelError
pub type Result<T> = std::result::Result<T, ChannelError>;

/// Coarse error classes shared by all transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request itself is wrong.
    Client,
    /// The request contradicts stored state.
    Conflict,
    /// A referenced entity does not exist.
    NotFound,
    /// Try again later.
    Unavailable,
    /// The channel cannot make progress and is being torn down.
    Unrecoverable,
    /// Storage or programming failure.
    Internal,
}

/// Errors returned by the channel handlers.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum ChannelError {
    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Channel is not in a state that allows the request.
    InvalidChannelState {
        /// The channel ID.
        channel_id: String,
        /// The actual life status.
        actual: String,
    },

    /// The subject may not act on the channel.
    PermissionDenied {
        /// The channel ID.
        channel_id: String,
        /// The caller.
        subject: String,
    },

    /// Idempotency key reused with a different request.
    IdempotencyConflict {
        /// The reused key.
        key: String,
    },

    /// Channel id taken by a channel with a different owner or scheme.
    ChannelAlreadyExists {
        /// The channel ID.
        channel_id: String,
    },

    /// Peer id already bound with a different request.
    PeerAlreadyExists {
        /// The channel ID.
        channel_id: String,
        /// The peer ID.
        peer_id: String,
    },

    /// Transfer is not in a state that allows the transition.
    InvalidTransferState {
        /// The transfer ID.
        transfer_id: String,
        /// The actual state.
        actual: String,
    },

    /// Channel was not found.
    ChannelNotFound {
        /// The channel ID that was not found.
        channel_id: String,
    },

    /// Peer was not found.
    PeerNotFound {
        /// The channel ID.
        channel_id: String,
        /// The peer ID that was not found.
        peer_id: String,
    },

    /// Transfer was not found.
    TransferNotFound {
        /// The channel ID.
        channel_id: String,
        /// The transfer ID that was not found.
        transfer_id: String,
    },

    /// Operation was not found.
    OperationNotFound {
        /// The operation ID that was not found.
        operation_id: String,
    },

    /// The request cannot be served now.
    Unavailable {
        /// Why.
        reason: String,
    },

    /// The channel lost its last usable source and is being destroyed.
    ChannelUnrecoverable {
        /// The channel ID.
        channel_id: String,
        /// Teardown reason.
        reason: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
        /// Whether a retry may succeed.
        transient: bool,
    },

    /// Anything else.
    Internal {
        /// Error details.
        details: String,
    },
}

impl ChannelError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::InvalidChannelState { .. } => "INVALID_CHANNEL_STATE",
            Self::PermissionDenied { .. } => "PERMISSION_DENIED",
            Self::IdempotencyConflict { .. } => "IDEMPOTENCY_CONFLICT",
            Self::ChannelAlreadyExists { .. } => "CHANNEL_ALREADY_EXISTS",
            Self::PeerAlreadyExists { .. } => "PEER_ALREADY_EXISTS",
            Self::InvalidTransferState { .. } => "INVALID_TRANSFER_STATE",
            Self::ChannelNotFound { .. } => "CHANNEL_NOT_FOUND",
            Self::PeerNotFound { .. } => "PEER_NOT_FOUND",
            Self::TransferNotFound { .. } => "TRANSFER_NOT_FOUND",
            Self::OperationNotFound { .. } => "OPERATION_NOT_FOUND",
            Self::Unavailable { .. } => "UNAVAILABLE",
            Self::ChannelUnrecoverable { .. } => "CHANNEL_UNRECOVERABLE",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
            Self::Internal { .. } => "INTERNAL",
        }
    }

    /// Error class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ValidationError { .. }
            | Self::InvalidChannelState { .. }
            | Self::PermissionDenied { .. } => ErrorKind::Client,
            Self::IdempotencyConflict { .. }
            | Self::ChannelAlreadyExists { .. }
            | Self::PeerAlreadyExists { .. }
            | Self::InvalidTransferState { .. } => ErrorKind::Conflict,
            Self::ChannelNotFound { .. }
            | Self::PeerNotFound { .. }
            | Self::TransferNotFound { .. }
            | Self::OperationNotFound { .. } => ErrorKind::NotFound,
            Self::Unavailable { .. } => ErrorKind::Unavailable,
            Self::ChannelUnrecoverable { .. } => ErrorKind::Unrecoverable,
            Self::DatabaseError { .. } | Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Wire form of this error.
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.error_code().to_string(),
            message: self.to_string(),
        }
    }

    pub(crate) fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn require_non_empty(field: &str, value: &str) -> Result<()> {
        if value.trim().is_empty() {
            return Err(Self::validation(field, "must not be empty"));
        }
        Ok(())
    }

    pub(crate) fn internal(details: impl Into<String>) -> Self {
        Self::Internal {
            details: details.into(),
        }
    }
}

/// Serializable `{ code, message }` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::InvalidChannelState { channel_id, actual } => {
                write!(f, "Channel '{}' is {}, expected ALIVE", channel_id, actual)
            }
            Self::PermissionDenied {
                channel_id,
                subject,
            } => {
                write!(
                    f,
                    "Subject '{}' has no access to channel '{}'",
                    subject, channel_id
                )
            }
            Self::IdempotencyConflict { key } => {
                write!(
                    f,
                    "Idempotency key '{}' was already used with a different request",
                    key
                )
            }
            Self::ChannelAlreadyExists { channel_id } => {
                write!(
                    f,
                    "Channel '{}' already exists with a different owner or scheme",
                    channel_id
                )
            }
            Self::PeerAlreadyExists {
                channel_id,
                peer_id,
            } => {
                write!(
                    f,
                    "Peer '{}' already exists in channel '{}' with a different request",
                    peer_id, channel_id
                )
            }
            Self::InvalidTransferState {
                transfer_id,
                actual,
            } => {
                write!(f, "Transfer '{}' is in state {}", transfer_id, actual)
            }
            Self::ChannelNotFound { channel_id } => {
                write!(f, "Channel '{}' not found", channel_id)
            }
            Self::PeerNotFound {
                channel_id,
                peer_id,
            } => {
                write!(f, "Peer '{}' not found in channel '{}'", peer_id, channel_id)
            }
            Self::TransferNotFound {
                channel_id,
                transfer_id,
            } => {
                write!(
                    f,
                    "Transfer '{}' not found in channel '{}'",
                    transfer_id, channel_id
                )
            }
            Self::OperationNotFound { operation_id } => {
                write!(f, "Operation '{}' not found", operation_id)
            }
            Self::Unavailable { reason } => write!(f, "Unavailable: {}", reason),
            Self::ChannelUnrecoverable { channel_id, reason } => {
                write!(
                    f,
                    "Channel '{}' is unrecoverable and is being destroyed: {}",
                    channel_id, reason
                )
            }
            Self::DatabaseError {
                operation, details, ..
            } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
            Self::Internal { details } => write!(f, "Internal error: {}", details),
        }
    }
}

impl std::error::Error for ChannelError {}

impl Transient for ChannelError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::DatabaseError {
                transient: true,
                ..
            }
        )
    }
}

impl From<sqlx::Error> for ChannelError {
    fn from(err: sqlx::Error) -> Self {
        ChannelError::DatabaseError {
            operation: "query".to_string(),
            transient: err.is_transient(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for ChannelError {
    fn from(err: serde_json::Error) -> Self {
        ChannelError::Internal {
            details: format!("json: {}", err),
        }
    }
}

impl From<OperationError> for ChannelError {
    fn from(err: OperationError) -> Self {
        match err {
            OperationError::Database(e) => e.into(),
            OperationError::IdempotencyConflict { key } => ChannelError::IdempotencyConflict { key },
            OperationError::NotFound(operation_id) => {
                ChannelError::OperationNotFound { operation_id }
            }
            other => ChannelError::Internal {
                details: other.to_string(),
            },
        }
    }
}

/// Failure of a call to an external collaborator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    /// The collaborator may succeed if asked again.
    #[error("transient collaborator failure: {0}")]
    Transient(String),

    /// Asking again will not help.
    #[error("collaborator failure: {0}")]
    Permanent(String),
}

impl Transient for CallError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<CallError> for OperationError {
    fn from(err: CallError) -> Self {
        OperationError::Collaborator {
            transient: err.is_transient(),
            message: err.to_string(),
        }
    }
}

impl From<ChannelError> for OperationError {
    fn from(err: ChannelError) -> Self {
        OperationError::Collaborator {
            transient: err.is_transient(),
            message: err.to_string(),
        }
    }
}

impl From<CallError> for ChannelError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::Transient(reason) => ChannelError::Unavailable { reason },
            CallError::Permanent(details) => ChannelError::Internal { details },
        }
    }
}
