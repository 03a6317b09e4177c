// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operation records and their externally visible outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Well-known failure codes written to `operations.error_code`.
pub mod codes {
    /// The operation's deadline passed before it finished.
    pub const DEADLINE_EXCEEDED: &str = "DEADLINE_EXCEEDED";
    /// Unexpected engine or action failure.
    pub const INTERNAL: &str = "INTERNAL";
    /// The operation cannot proceed given the current state of its target.
    pub const FAILED_PRECONDITION: &str = "FAILED_PRECONDITION";
    /// The target of the operation does not exist.
    pub const NOT_FOUND: &str = "NOT_FOUND";
}

/// Client-supplied retry token plus a hash of the request it was used with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyKey {
    /// The retry token.
    pub token: String,
    /// Hex SHA-256 of the canonical request.
    pub request_hash: String,
}

impl IdempotencyKey {
    /// Create a key from a token and a request hash.
    pub fn new(token: impl Into<String>, request_hash: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            request_hash: request_hash.into(),
        }
    }
}

/// Operation row from the store.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OperationRecord {
    /// Unique operation id.
    pub id: String,
    /// Action kind used to restore the operation after restart.
    pub kind: String,
    /// Human-readable description.
    pub description: String,
    /// Coordinator instance that owns and resumes the operation.
    pub created_by: String,
    /// When the operation was created.
    pub created_at: DateTime<Utc>,
    /// Last state or outcome change.
    pub modified_at: DateTime<Utc>,
    /// After this moment the operation fails with `DEADLINE_EXCEEDED`.
    pub deadline: Option<DateTime<Utc>>,
    /// Whether an outcome has been recorded.
    pub done: bool,
    /// Versioned action state envelope (JSON).
    pub state: String,
    /// Successful outcome (JSON).
    pub response: Option<String>,
    /// Failure code.
    pub error_code: Option<String>,
    /// Failure message.
    pub error_message: Option<String>,
    /// Idempotency token, if the operation was created with one.
    pub idempotency_key: Option<String>,
    /// Hash of the request that created the operation.
    pub request_hash: Option<String>,
}

impl OperationRecord {
    /// Current outcome of the operation.
    pub fn outcome(&self) -> OperationOutcome {
        if !self.done {
            return OperationOutcome::Running;
        }
        if let Some(code) = &self.error_code {
            return OperationOutcome::Failed(OperationFailure {
                code: code.clone(),
                message: self.error_message.clone().unwrap_or_default(),
            });
        }
        let response = self
            .response
            .as_deref()
            .and_then(|r| serde_json::from_str(r).ok())
            .unwrap_or(serde_json::Value::Null);
        OperationOutcome::Succeeded(response)
    }

    /// Whether `now` is past the deadline.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|d| now > d)
    }
}

/// Failure recorded on a finished operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationFailure {
    /// Failure code, see [`codes`].
    pub code: String,
    /// Failure message.
    pub message: String,
}

impl OperationFailure {
    /// Create a failure with the given code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// What a caller polling an operation sees.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutcome {
    /// Still in progress.
    Running,
    /// Finished with a response.
    Succeeded(serde_json::Value),
    /// Finished with an error.
    Failed(OperationFailure),
}

/// Serializable handle returned to callers of asynchronous requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationHandle {
    /// Operation id.
    pub id: String,
    /// Human-readable description.
    pub description: String,
    /// Whether the operation finished.
    pub done: bool,
    /// Successful outcome, once done.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
    /// Failure, once done.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationFailure>,
}

impl From<&OperationRecord> for OperationHandle {
    fn from(record: &OperationRecord) -> Self {
        let (response, error) = match record.outcome() {
            OperationOutcome::Running => (None, None),
            OperationOutcome::Succeeded(value) => (Some(value), None),
            OperationOutcome::Failed(failure) => (None, Some(failure)),
        };
        Self {
            id: record.id.clone(),
            description: record.description.clone(),
            done: record.done,
            response,
            error,
        }
    }
}

/// Parameters for inserting a new operation.
#[derive(Debug, Clone)]
pub struct NewOperation {
    /// Unique operation id.
    pub id: String,
    /// Action kind.
    pub kind: String,
    /// Human-readable description.
    pub description: String,
    /// Owning coordinator instance.
    pub created_by: String,
    /// Optional deadline.
    pub deadline: Option<DateTime<Utc>>,
    /// Optional idempotency key.
    pub idempotency_key: Option<IdempotencyKey>,
    /// Initial state envelope (JSON).
    pub state: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> OperationRecord {
        let now = Utc::now();
        OperationRecord {
            id: "op-1".to_string(),
            kind: "test".to_string(),
            description: "test op".to_string(),
            created_by: "instance-a".to_string(),
            created_at: now,
            modified_at: now,
            deadline: None,
            done: false,
            state: "{}".to_string(),
            response: None,
            error_code: None,
            error_message: None,
            idempotency_key: None,
            request_hash: None,
        }
    }

    #[test]
    fn test_outcome_running() {
        assert_eq!(record().outcome(), OperationOutcome::Running);
    }

    #[test]
    fn test_outcome_failed() {
        let mut rec = record();
        rec.done = true;
        rec.error_code = Some(codes::DEADLINE_EXCEEDED.to_string());
        rec.error_message = Some("too slow".to_string());

        let handle = OperationHandle::from(&rec);
        assert!(handle.done);
        assert!(handle.response.is_none());
        assert_eq!(
            handle.error,
            Some(OperationFailure::new(codes::DEADLINE_EXCEEDED, "too slow"))
        );
    }

    #[test]
    fn test_outcome_succeeded() {
        let mut rec = record();
        rec.done = true;
        rec.response = Some(r#"{"destroyed":["a"]}"#.to_string());

        assert_eq!(
            rec.outcome(),
            OperationOutcome::Succeeded(serde_json::json!({"destroyed": ["a"]}))
        );
    }

    #[test]
    fn test_is_expired() {
        let mut rec = record();
        let now = Utc::now();
        assert!(!rec.is_expired(now));
        rec.deadline = Some(now - chrono::Duration::seconds(1));
        assert!(rec.is_expired(now));
    }
}
