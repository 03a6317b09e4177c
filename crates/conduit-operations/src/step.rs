// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The decision a step hands back to the engine.

use std::time::Duration;

/// Delay used by [`StepResult::restart`].
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(1);

/// Result of executing one step of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// The step's effect is already reflected in the state; move on without I/O.
    AlreadyDone,
    /// The step performed a side effect; persist the state and schedule the next step.
    Continue,
    /// Transient failure; run the same step again after the delay. Persisted state is untouched.
    Restart(Duration),
    /// The operation outcome has been recorded; stop.
    Finish,
}

impl StepResult {
    /// Restart after [`DEFAULT_RESTART_DELAY`].
    pub fn restart() -> Self {
        Self::Restart(DEFAULT_RESTART_DELAY)
    }

    /// Restart after `delay`.
    pub fn restart_after(delay: Duration) -> Self {
        Self::Restart(delay)
    }
}
