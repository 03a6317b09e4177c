// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Failure-injection checkpoints.
//!
//! Actions call [`StepContext::fail_point`](crate::action::StepContext::fail_point)
//! right after a side effect lands. In production the hook is [`NoFailPoints`] and
//! every checkpoint passes. Tests install [`ArmedFailPoints`] to make a named
//! checkpoint return [`InjectedFailure`], which the engine treats as a crash: the
//! runner is dropped without touching the store.

use std::collections::HashSet;
use std::sync::Mutex;

use thiserror::Error;

/// Synthetic crash raised by an armed checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Terminated by injected failure at '{0}'")]
pub struct InjectedFailure(pub String);

/// Strategy consulted at every named checkpoint.
pub trait FailPoints: Send + Sync {
    /// Returns `Err` if the checkpoint `name` should terminate the runner.
    fn check(&self, name: &str) -> Result<(), InjectedFailure>;
}

/// Production hook: never fires.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFailPoints;

impl FailPoints for NoFailPoints {
    fn check(&self, _name: &str) -> Result<(), InjectedFailure> {
        Ok(())
    }
}

/// Test hook: each armed checkpoint fires exactly once, then disarms.
#[derive(Debug, Default)]
pub struct ArmedFailPoints {
    armed: Mutex<HashSet<String>>,
    fired: Mutex<Vec<String>>,
}

impl ArmedFailPoints {
    /// Create a hook with nothing armed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a checkpoint by name.
    pub fn arm(&self, name: impl Into<String>) {
        self.armed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name.into());
    }

    /// Names of the checkpoints that fired so far, in order.
    pub fn fired(&self) -> Vec<String> {
        self.fired
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Whether any armed checkpoint has not fired yet.
    pub fn has_pending(&self) -> bool {
        !self
            .armed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_empty()
    }
}

impl FailPoints for ArmedFailPoints {
    fn check(&self, name: &str) -> Result<(), InjectedFailure> {
        let removed = self
            .armed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(name);
        if removed {
            self.fired
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(name.to_string());
            return Err(InjectedFailure(name.to_string()));
        }
        Ok(())
    }
}
