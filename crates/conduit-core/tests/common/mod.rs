// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for conduit-core integration tests.
//!
//! Provides a TestContext with a temporary SQLite store, recording
//! collaborators, and an armed failure-injection hook.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use conduit_core::access::StaticAccess;
use conduit_core::actions::{self, ActionDeps};
use conduit_core::channel_handlers::{self, ChannelHandlerState, CreateChannelRequest};
use conduit_core::db::{channels, peers, transfers};
use conduit_core::error::{CallError, ChannelError};
use conduit_core::lock::ChannelLocks;
use conduit_core::model::{Channel, Peer, PeerDescription, Transfer};
use conduit_core::notifier::{StartTransfer, TransferNotifier};
use conduit_core::slot_handlers::{
    self, BindRequest, BindResponse, SlotHandlerState, TransferCompletedRequest,
    TransferCompletedResponse, TransferFailedRequest, TransferFailedResponse,
};
use conduit_core::workflow::{OperationTeardown, WorkflowClient};
use conduit_operations::{
    ArmedFailPoints, EngineConfig, FailPoints, NoFailPoints, OperationEngine, OperationRecord,
    RetryConfig,
};

pub const OWNER: &str = "user-1";
pub const EXECUTION: &str = "exec-1";
pub const INSTANCE: &str = "conduit-test";

/// Records `startTransfer` pushes; can fail transiently or reject.
#[derive(Default)]
pub struct RecordingNotifier {
    delivered: Mutex<Vec<StartTransfer>>,
    attempts: AtomicU32,
    transient_failures: AtomicU32,
    reject: AtomicBool,
}

impl RecordingNotifier {
    /// Fail the next `n` pushes with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    /// Reject every push with a permanent error.
    pub fn reject_all(&self) {
        self.reject.store(true, Ordering::SeqCst);
    }

    /// Accept pushes again after [`reject_all`](Self::reject_all).
    pub fn accept_all(&self) {
        self.reject.store(false, Ordering::SeqCst);
    }

    pub fn delivered(&self) -> Vec<StartTransfer> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransferNotifier for RecordingNotifier {
    async fn start_transfer(&self, request: &StartTransfer) -> Result<(), CallError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.reject.load(Ordering::SeqCst) {
            return Err(CallError::Permanent("slot is gone".to_string()));
        }
        let pending = self.transient_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.transient_failures.store(pending - 1, Ordering::SeqCst);
            return Err(CallError::Transient("connection refused".to_string()));
        }
        self.delivered.lock().unwrap().push(request.clone());
        Ok(())
    }
}

/// Records workflow aborts; can fail transiently.
#[derive(Default)]
pub struct RecordingWorkflow {
    aborts: Mutex<Vec<(String, String)>>,
    transient_failures: AtomicU32,
}

impl RecordingWorkflow {
    pub fn fail_next(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    pub fn aborts(&self) -> Vec<(String, String)> {
        self.aborts.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkflowClient for RecordingWorkflow {
    async fn abort_execution(&self, execution_id: &str, reason: &str) -> Result<(), CallError> {
        let pending = self.transient_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.transient_failures.store(pending - 1, Ordering::SeqCst);
            return Err(CallError::Transient("workflow service unavailable".to_string()));
        }
        self.aborts
            .lock()
            .unwrap()
            .push((execution_id.to_string(), reason.to_string()));
        Ok(())
    }
}

/// Store, engine, and handlers wired against recording collaborators.
pub struct TestContext {
    pub pool: SqlitePool,
    pub locks: ChannelLocks,
    pub notifier: Arc<RecordingNotifier>,
    pub workflow: Arc<RecordingWorkflow>,
    pub fail_points: Arc<ArmedFailPoints>,
    pub engine: OperationEngine,
    pub slots: SlotHandlerState,
    pub channels: ChannelHandlerState,
    _temp_dir: tempfile::TempDir,
}

impl TestContext {
    /// Context with the default producer retry budget.
    pub async fn new() -> Self {
        Self::with_budget(slot_handlers::DEFAULT_PRODUCER_RETRY_BUDGET).await
    }

    /// Context whose producers survive `budget` failures.
    pub async fn with_budget(budget: i64) -> Self {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let url = format!(
            "sqlite:{}?mode=rwc",
            temp_dir.path().join("conduit.db").display()
        );
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await
            .expect("Failed to open SQLite store");
        conduit_core::migrations::run(&pool)
            .await
            .expect("Failed to run migrations");

        let locks = ChannelLocks::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let workflow = Arc::new(RecordingWorkflow::default());
        let fail_points = Arc::new(ArmedFailPoints::new());

        let engine = build_engine(
            &pool,
            &locks,
            notifier.clone(),
            workflow.clone(),
            fail_points.clone(),
        );

        let mut slots = SlotHandlerState::new(
            pool.clone(),
            engine.clone(),
            locks.clone(),
            Arc::new(StaticAccess),
            Arc::new(OperationTeardown::new(engine.clone(), Duration::from_secs(60))),
        );
        slots.producer_retry_budget = budget;
        slots.retry = RetryConfig::no_retry();

        let mut channels = ChannelHandlerState::new(pool.clone(), engine.clone(), locks.clone());
        channels.producer_retry_budget = budget;
        channels.retry = RetryConfig::no_retry();

        Self {
            pool,
            locks,
            notifier,
            workflow,
            fail_points,
            engine,
            slots,
            channels,
            _temp_dir: temp_dir,
        }
    }

    /// A fresh engine over the same store, as after a process restart.
    pub fn restarted_engine(&self) -> OperationEngine {
        build_engine(
            &self.pool,
            &self.locks,
            self.notifier.clone(),
            self.workflow.clone(),
            Arc::new(NoFailPoints),
        )
    }

    /// Wait until the engine has nothing scheduled or running.
    pub async fn settle(&self) {
        settle(&self.engine).await;
    }

    /// Create a channel of [`EXECUTION`] owned by [`OWNER`].
    pub async fn create_channel(
        &self,
        name: &str,
        storage_producer: Option<&str>,
        storage_consumer: Option<&str>,
    ) -> String {
        channel_handlers::handle_create_channel(
            &self.channels,
            CreateChannelRequest {
                execution_id: EXECUTION.to_string(),
                workflow_name: "wf".to_string(),
                user_id: OWNER.to_string(),
                name: name.to_string(),
                data_scheme: json!({ "format": "csv" }),
                storage_producer_uri: storage_producer.map(str::to_string),
                storage_consumer_uri: storage_consumer.map(str::to_string),
                idempotency_key: None,
            },
        )
        .await
        .expect("Failed to create channel")
        .channel_id
    }

    pub async fn bind(
        &self,
        channel_id: &str,
        peer_id: &str,
        role: &str,
        description: PeerDescription,
        idempotency_key: Option<&str>,
    ) -> Result<BindResponse, ChannelError> {
        slot_handlers::handle_bind(
            &self.slots,
            BindRequest {
                channel_id: channel_id.to_string(),
                peer_id: peer_id.to_string(),
                role: Some(role.to_string()),
                description,
                idempotency_key: idempotency_key.map(str::to_string),
                subject: OWNER.to_string(),
            },
        )
        .await
    }

    pub async fn transfer_failed(
        &self,
        channel_id: &str,
        transfer_id: &str,
        idempotency_key: Option<&str>,
    ) -> Result<TransferFailedResponse, ChannelError> {
        slot_handlers::handle_transfer_failed(
            &self.slots,
            TransferFailedRequest {
                channel_id: channel_id.to_string(),
                transfer_id: transfer_id.to_string(),
                description: "connection reset".to_string(),
                idempotency_key: idempotency_key.map(str::to_string),
                subject: OWNER.to_string(),
            },
        )
        .await
    }

    pub async fn transfer_completed(
        &self,
        channel_id: &str,
        transfer_id: &str,
        idempotency_key: Option<&str>,
    ) -> Result<TransferCompletedResponse, ChannelError> {
        slot_handlers::handle_transfer_completed(
            &self.slots,
            TransferCompletedRequest {
                channel_id: channel_id.to_string(),
                transfer_id: transfer_id.to_string(),
                idempotency_key: idempotency_key.map(str::to_string),
                subject: OWNER.to_string(),
            },
        )
        .await
    }

    pub async fn channel(&self, channel_id: &str) -> Option<Channel> {
        let mut conn = self.pool.acquire().await.unwrap();
        channels::get(&mut conn, channel_id).await.unwrap()
    }

    pub async fn peer(&self, channel_id: &str, peer_id: &str) -> Option<Peer> {
        let mut conn = self.pool.acquire().await.unwrap();
        peers::get(&mut conn, channel_id, peer_id).await.unwrap()
    }

    pub async fn peers(&self, channel_id: &str) -> Vec<Peer> {
        let mut conn = self.pool.acquire().await.unwrap();
        peers::list(&mut conn, channel_id).await.unwrap()
    }

    pub async fn transfers(&self, channel_id: &str) -> Vec<Transfer> {
        let mut conn = self.pool.acquire().await.unwrap();
        transfers::list(&mut conn, channel_id).await.unwrap()
    }

    pub async fn operation(&self, id: &str) -> OperationRecord {
        self.engine
            .get(id)
            .await
            .expect("Failed to load operation")
            .expect("Operation should exist")
    }

    /// Every operation of `kind`, oldest first.
    pub async fn operations_of_kind(&self, kind: &str) -> Vec<OperationRecord> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT id FROM operations WHERE kind = ? ORDER BY created_at, id")
                .bind(kind)
                .fetch_all(&self.pool)
                .await
                .unwrap();
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            records.push(self.operation(&id).await);
        }
        records
    }
}

fn build_engine(
    pool: &SqlitePool,
    locks: &ChannelLocks,
    notifier: Arc<RecordingNotifier>,
    workflow: Arc<RecordingWorkflow>,
    fail_points: Arc<dyn FailPoints>,
) -> OperationEngine {
    let mut deps = ActionDeps::new(locks.clone(), notifier, workflow);
    deps.restart_delay = Duration::from_millis(5);
    OperationEngine::with_fail_points(
        pool.clone(),
        EngineConfig {
            owner: INSTANCE.to_string(),
            max_concurrent: 4,
        },
        actions::registry(&deps),
        fail_points,
    )
}

/// Wait for an engine to go idle, failing the test after a generous timeout.
pub async fn settle(engine: &OperationEngine) {
    tokio::time::timeout(Duration::from_secs(10), engine.wait_idle())
        .await
        .expect("engine did not become idle");
}

pub fn slot(url: &str) -> PeerDescription {
    PeerDescription::Slot {
        peer_url: url.to_string(),
    }
}

pub fn storage(uri: &str) -> PeerDescription {
    PeerDescription::Storage {
        storage_uri: uri.to_string(),
    }
}
