// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Conduit Operations - Durable, Resumable Operation Engine
//!
//! Runs a named, ordered list of steps against a slow and failure-prone external
//! system, persisting progress after every step so that a crash or restart resumes
//! where it left off without repeating side effects that already landed.
//!
//! # Architecture
//!
//! ```text
//!   caller transaction                       after commit
//! ┌──────────────────────────┐        ┌───────────────────────────┐
//! │ OperationEngine::create  │───────►│ OperationEngine::launch   │
//! │  (operations row, state) │        │  registry: kind -> action │
//! └──────────────────────────┘        └─────────────┬─────────────┘
//!                                                   │
//!                                                   ▼
//!                                    ┌───────────────────────────┐
//!                                    │ OperationsExecutor        │
//!                                    │  semaphore-bounded tasks  │
//!                                    └─────────────┬─────────────┘
//!                                                  │ one work item per run
//!                                                  ▼
//!                                    ┌───────────────────────────┐
//!                                    │ OperationRunner<A>        │
//!                                    │  deadline check           │
//!                                    │  A::execute(step)         │
//!                                    └─────────────┬─────────────┘
//!                                                  ▼
//!                                    ┌───────────────────────────┐
//!                                    │ SQLite: operations,       │
//!                                    │ idempotency_keys          │
//!                                    └───────────────────────────┘
//! ```
//!
//! # Step Results
//!
//! | Result | Engine behavior |
//! |--------|-----------------|
//! | `AlreadyDone` | Advance to the next step without I/O |
//! | `Continue` | Persist state, submit the next step as a new work item |
//! | `Restart(d)` | Submit the same step again after `d`, state untouched |
//! | `Finish` | Stop; the step recorded the outcome in its own transaction |
//!
//! # Recovery
//!
//! [`OperationEngine::recover`] loads every unfinished operation owned by this
//! coordinator instance and re-enters it from the first step. Steps consult the
//! restored state and short-circuit with `AlreadyDone`.
//!
//! # Idempotency
//!
//! [`ledger`] stores `(key, request hash, response)` triples so retried requests
//! replay their first response, and [`dao::create`] deduplicates operations by key.

#![deny(missing_docs)]

/// Actions, step context, and the persisted state envelope.
pub mod action;

/// Operation row accessors.
pub mod dao;

/// The engine facade and the action registry.
pub mod engine;

/// Error types.
pub mod error;

/// Bounded worker pool.
pub mod executor;

/// Failure-injection checkpoints.
pub mod failpoint;

/// Idempotency ledger.
pub mod ledger;

/// Embedded migrations.
pub mod migrations;

/// Operation records and outcomes.
pub mod operation;

/// Bounded retries for transient store failures.
pub mod retry;

/// Per-operation runner.
pub mod runner;

/// Step results.
pub mod step;

pub use action::{OperationAction, StepContext};
pub use engine::{ActionRegistry, EngineConfig, OperationEngine, OperationSpec};
pub use error::{OperationError, Result};
pub use failpoint::{ArmedFailPoints, FailPoints, InjectedFailure, NoFailPoints};
pub use ledger::LedgerEntry;
pub use operation::{
    IdempotencyKey, OperationFailure, OperationHandle, OperationOutcome, OperationRecord, codes,
};
pub use retry::{RetryConfig, Transient, with_retries};
pub use step::StepResult;
