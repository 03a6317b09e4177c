// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Authorization collaborator.

use async_trait::async_trait;

use crate::error::CallError;

/// What the caller intends to do with a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    /// Read-only access.
    Read,
    /// Mutating access.
    Write,
}

impl OperationType {
    /// Returns the string representation of the operation type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "READ",
            Self::Write => "WRITE",
        }
    }
}

/// Decides whether a subject may act on a workflow owned by a user.
#[async_trait]
pub trait AccessClient: Send + Sync {
    /// Returns `Ok(false)` when access is refused.
    async fn check_access(
        &self,
        subject: &str,
        owner_user_id: &str,
        workflow_name: &str,
        operation: OperationType,
    ) -> Result<bool, CallError>;
}

/// Grants everything. For embedded deployments behind a trusted gateway.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl AccessClient for AllowAll {
    async fn check_access(
        &self,
        _subject: &str,
        _owner_user_id: &str,
        _workflow_name: &str,
        _operation: OperationType,
    ) -> Result<bool, CallError> {
        Ok(true)
    }
}

/// Only the owner of a workflow may act on its channels.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticAccess;

#[async_trait]
impl AccessClient for StaticAccess {
    async fn check_access(
        &self,
        subject: &str,
        owner_user_id: &str,
        _workflow_name: &str,
        _operation: OperationType,
    ) -> Result<bool, CallError> {
        Ok(subject == owner_user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_access_requires_owner() {
        let access = StaticAccess;
        assert!(
            access
                .check_access("user-1", "user-1", "wf", OperationType::Write)
                .await
                .unwrap()
        );
        assert!(
            !access
                .check_access("user-2", "user-1", "wf", OperationType::Read)
                .await
                .unwrap()
        );
        assert!(
            AllowAll
                .check_access("anyone", "user-1", "wf", OperationType::Write)
                .await
                .unwrap()
        );
    }
}
