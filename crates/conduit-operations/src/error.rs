// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for conduit-operations.

use thiserror::Error;

use crate::failpoint::InjectedFailure;
use crate::retry::Transient;

/// Engine and ledger errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OperationError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Operation was not found.
    #[error("Operation '{0}' not found")]
    NotFound(String),

    /// Operation was already completed by someone else.
    #[error("Operation '{0}' is already completed")]
    AlreadyCompleted(String),

    /// Idempotency key reused with a different request.
    #[error("Idempotency key '{key}' was already used with a different request")]
    IdempotencyConflict {
        /// The reused key.
        key: String,
    },

    /// No action is registered for the persisted operation kind.
    #[error("No action registered for operation kind '{0}'")]
    UnknownKind(String),

    /// Persisted state was written by an incompatible action version.
    #[error("Operation kind '{kind}' has state version {found}, expected {expected}")]
    StateVersion {
        /// Operation kind.
        kind: String,
        /// Version the action understands.
        expected: u32,
        /// Version found in the store.
        found: u32,
    },

    /// An armed failure-injection checkpoint fired.
    #[error(transparent)]
    Injected(#[from] InjectedFailure),

    /// A call made by an action outside the engine failed.
    #[error("{message}")]
    Collaborator {
        /// Error details.
        message: String,
        /// Whether restarting the step may succeed.
        transient: bool,
    },
}

impl Transient for OperationError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Database(e) => e.is_transient(),
            Self::Collaborator { transient, .. } => *transient,
            _ => false,
        }
    }
}

/// Result type using [`OperationError`].
pub type Result<T> = std::result::Result<T, OperationError>;
