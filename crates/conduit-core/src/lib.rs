// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Conduit Core - Channel Rendezvous Service
//!
//! This crate coordinates the data plane of workflow executions. Workflow slots
//! bind to named channels as producers or consumers; Core matches them, tells
//! consumers where to read from, and fails transfers over to another producer
//! when one breaks. All state lives in SQLite, and every multi-step side effect
//! runs as a durable operation of [`conduit_operations`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐        ┌──────────────────────────┐
//! │     Workflow service     │        │      Workflow slots      │
//! │ create/destroy channels  │        │ bind, unbind, report     │
//! └────────────┬─────────────┘        └────────────┬─────────────┘
//!              │ /v1/channels, /v1/executions      │ /v1/slots
//!              ▼                                   ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         conduit-core                            │
//! │   channel_handlers          slot_handlers          status       │
//! │        │                        │                               │
//! │        └──────► ChannelLocks ◄──┘   idempotency ledger          │
//! │                      │                                          │
//! │              conduit-operations engine                          │
//! │        destroy_channels          start_transfer                 │
//! └──────────────────────┬──────────────────────┬───────────────────┘
//!                        │                      │ startTransfer push
//!                        ▼                      ▼
//!                 ┌─────────────┐        ┌──────────────┐
//!                 │   SQLite    │        │ consumer slot │
//!                 └─────────────┘        └──────────────┘
//! ```
//!
//! # Slot Protocol
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `bind` | Register a producer or consumer; returns the counterpart if one is known |
//! | `unbind` | Remove a peer with no transfers in flight |
//! | `transferFailed` | Mark a transfer FAILED and get a replacement producer |
//! | `transferCompleted` | Mark a transfer COMPLETED; storage consumers become backup producers |
//! | `getChannelsStatus` | Snapshot of the ALIVE channels of an execution |
//!
//! Every mutating request may carry an idempotency key. A retried request with
//! the same key and body gets the first reply; the same key with another body
//! is an `IDEMPOTENCY_CONFLICT`.
//!
//! # Transfer State Machine
//!
//! ```text
//!      producer bind            consumer bind
//!            │                        │
//!            ▼                        │
//!       ┌─────────┐  start_transfer   │
//!       │ PENDING │───────────┐       │
//!       └────┬────┘           ▼       ▼
//!            │             ┌──────────┐  transferCompleted  ┌───────────┐
//!            │             │  ACTIVE  │────────────────────►│ COMPLETED │
//!            │             └────┬─────┘                     └───────────┘
//!   push rejected/expired       │ transferFailed
//!            │                  ▼
//!            │             ┌──────────┐
//!            └────────────►│  FAILED  │──► replaced_by (new ACTIVE transfer)
//!                          └──────────┘
//! ```
//!
//! A consumer has at most one PENDING or ACTIVE transfer at any time.
//!
//! # Channel Lifecycle
//!
//! | Status | Description |
//! |--------|-------------|
//! | `ALIVE` | Accepts binds |
//! | `DESTROYING` | No binds; in-flight transfers may still complete or fail. Deleted once none are left |
//! | `DESTROYED` | Reserved; destroyed channels are deleted |
//!
//! A channel becomes unrecoverable when a transfer into its storage consumer
//! fails, or when no producer is left for a consumer. It is then destroyed and
//! its execution aborted, and the failing request gets `CHANNEL_UNRECOVERABLE`.
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `CONDUIT_DATABASE_URL` | Yes | - | SQLite connection string |
//! | `CONDUIT_HTTP_PORT` | No | `8122` | HTTP API port |
//! | `CONDUIT_INSTANCE_ID` | No | hostname | Owner of created operations |
//! | `CONDUIT_MAX_CONCURRENT_OPERATIONS` | No | `16` | Engine worker pool size |
//! | `CONDUIT_PRODUCER_RETRY_BUDGET` | No | `2` | Failures a producer survives |
//! | `CONDUIT_OPERATION_DEADLINE_SECS` | No | `600` | Operation deadline |
//! | `CONDUIT_WORKFLOW_URL` | No | - | Workflow service base URL |
//!
//! # Modules
//!
//! - [`slot_handlers`]: Slot protocol handlers
//! - [`channel_handlers`]: Private channel API handlers
//! - [`actions`]: Durable operations run by the engine
//! - [`db`]: SQLite persistence for channels, peers and transfers
//! - [`runtime`]: Embeddable runtime wiring everything together

#![deny(missing_docs)]

/// Authorization collaborator.
pub mod access;

/// Durable operations: start-transfer pushes and channel destruction.
pub mod actions;

/// Private channel API handlers (create, destroy, status, operations).
pub mod channel_handlers;

/// Retention of idempotency keys and finished operations.
pub mod cleanup_worker;

/// Server configuration loaded from environment variables.
pub mod config;

/// SQLite database operations for channels, peers, and transfers.
pub mod db;

/// Error types with stable error codes.
pub mod error;

/// JSON/HTTP routes for the handlers.
#[cfg(feature = "http")]
pub mod http;

/// Per-channel lock manager.
pub mod lock;

/// Database migrations, including the operation engine's.
pub mod migrations;

/// Channel, peer, and transfer types.
pub mod model;

/// Consumer push collaborator.
pub mod notifier;

/// Embeddable runtime.
pub mod runtime;

/// Slot protocol handlers (bind, unbind, transfer outcomes, status).
pub mod slot_handlers;

/// Channel status projection.
pub mod status;

/// Workflow service collaborators.
pub mod workflow;
