// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for conduit-operations tests.
//!
//! Provides an in-memory store, a fake external disk service, and a
//! `ProvisionDiskAction` that drives the fake service through the engine.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{SqliteConnection, SqlitePool};

use conduit_operations::{
    ActionRegistry, EngineConfig, FailPoints, OperationAction, OperationEngine, OperationRecord,
    Result, StepContext, StepResult,
};

/// Create an in-memory SQLite pool with the engine schema.
pub async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool");

    conduit_operations::migrations::run_sqlite(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

/// External disk service with asynchronous, idempotent create calls.
#[derive(Default)]
pub struct FakeCloud {
    inner: Mutex<CloudState>,
}

#[derive(Default)]
struct CloudState {
    /// request id -> (cloud operation id, polls remaining until ready)
    operations: HashMap<String, (String, u32)>,
    disks: Vec<String>,
    start_calls: u32,
    polls: u32,
    cleanups: Vec<String>,
    polls_until_ready: u32,
}

impl FakeCloud {
    pub fn new(polls_until_ready: u32) -> Arc<Self> {
        let cloud = Self::default();
        cloud.inner.lock().unwrap().polls_until_ready = polls_until_ready;
        Arc::new(cloud)
    }

    /// Start creating a disk; the same request id returns the same cloud operation.
    pub fn start_create(&self, request_id: &str) -> String {
        let mut inner = self.inner.lock().unwrap();
        inner.start_calls += 1;
        let polls = inner.polls_until_ready;
        inner
            .operations
            .entry(request_id.to_string())
            .or_insert_with(|| (format!("cloud-op-{request_id}"), polls))
            .0
            .clone()
    }

    /// Poll a cloud operation; returns the disk id once ready.
    pub fn poll(&self, cloud_op_id: &str) -> Option<String> {
        let mut inner = self.inner.lock().unwrap();
        inner.polls += 1;
        let entry = inner
            .operations
            .values_mut()
            .find(|(op_id, _)| op_id == cloud_op_id)?;
        if entry.1 > 0 {
            entry.1 -= 1;
            return None;
        }
        let disk_id = cloud_op_id.replace("cloud-op-", "disk-");
        if !inner.disks.contains(&disk_id) {
            inner.disks.push(disk_id.clone());
        }
        Some(disk_id)
    }

    pub fn cleanup(&self, request_id: &str) {
        self.inner
            .lock()
            .unwrap()
            .cleanups
            .push(request_id.to_string());
    }

    pub fn disks(&self) -> Vec<String> {
        self.inner.lock().unwrap().disks.clone()
    }

    pub fn start_calls(&self) -> u32 {
        self.inner.lock().unwrap().start_calls
    }

    pub fn polls(&self) -> u32 {
        self.inner.lock().unwrap().polls
    }

    pub fn cleanups(&self) -> Vec<String> {
        self.inner.lock().unwrap().cleanups.clone()
    }
}

/// Persisted state of [`ProvisionDiskAction`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionState {
    pub request_id: String,
    pub cloud_op_id: Option<String>,
    pub disk_id: Option<String>,
}

impl ProvisionState {
    pub fn new(request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            cloud_op_id: None,
            disk_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ProvisionStep {
    StartCreate,
    AwaitDisk,
    Complete,
}

pub const AFTER_START_CREATE: &str = "provision.after_start_create";
pub const AFTER_DISK_READY: &str = "provision.after_disk_ready";
pub const AFTER_COMPLETE: &str = "provision.after_complete";

/// Every checkpoint of [`ProvisionDiskAction`], in execution order.
pub const ALL_FAIL_POINTS: &[&str] = &[AFTER_START_CREATE, AFTER_DISK_READY, AFTER_COMPLETE];

pub struct ProvisionDiskAction {
    pub state: ProvisionState,
    pub cloud: Arc<FakeCloud>,
    pub poll_interval: Duration,
}

#[async_trait]
impl OperationAction for ProvisionDiskAction {
    type State = ProvisionState;
    type Step = ProvisionStep;
    const KIND: &'static str = "provision_disk";

    fn steps(&self) -> &'static [ProvisionStep] {
        &[
            ProvisionStep::StartCreate,
            ProvisionStep::AwaitDisk,
            ProvisionStep::Complete,
        ]
    }

    fn state(&self) -> &ProvisionState {
        &self.state
    }

    async fn execute(&mut self, step: ProvisionStep, ctx: &StepContext) -> Result<StepResult> {
        match step {
            ProvisionStep::StartCreate => {
                if self.state.cloud_op_id.is_some() {
                    return Ok(StepResult::AlreadyDone);
                }
                let op_id = self.cloud.start_create(&self.state.request_id);
                self.state.cloud_op_id = Some(op_id);
                ctx.fail_point(AFTER_START_CREATE)?;
                Ok(StepResult::Continue)
            }
            ProvisionStep::AwaitDisk => {
                if self.state.disk_id.is_some() {
                    return Ok(StepResult::AlreadyDone);
                }
                let op_id = self.state.cloud_op_id.clone().unwrap_or_default();
                match self.cloud.poll(&op_id) {
                    Some(disk_id) => {
                        self.state.disk_id = Some(disk_id);
                        ctx.fail_point(AFTER_DISK_READY)?;
                        Ok(StepResult::Continue)
                    }
                    None => Ok(StepResult::restart_after(self.poll_interval)),
                }
            }
            ProvisionStep::Complete => {
                let mut tx = ctx.pool().begin().await?;
                ctx.complete(&mut tx, &serde_json::json!({ "disk_id": self.state.disk_id }))
                    .await?;
                tx.commit().await?;
                ctx.fail_point(AFTER_COMPLETE)?;
                Ok(StepResult::Finish)
            }
        }
    }

    async fn on_expired(&mut self, _conn: &mut SqliteConnection) -> Result<()> {
        self.cloud.cleanup(&self.state.request_id);
        Ok(())
    }
}

/// Registry that rebuilds [`ProvisionDiskAction`] against `cloud`.
pub fn registry(cloud: Arc<FakeCloud>) -> ActionRegistry {
    let mut registry = ActionRegistry::new();
    registry.register::<ProvisionDiskAction, _>(move |state| ProvisionDiskAction {
        state,
        cloud: cloud.clone(),
        poll_interval: Duration::from_millis(5),
    });
    registry
}

/// Engine owned by `owner`, optionally with a failure-injection hook.
pub fn engine(
    pool: &SqlitePool,
    owner: &str,
    cloud: Arc<FakeCloud>,
    fail_points: Option<Arc<dyn FailPoints>>,
) -> OperationEngine {
    let config = EngineConfig {
        owner: owner.to_string(),
        max_concurrent: 4,
    };
    match fail_points {
        Some(points) => {
            OperationEngine::with_fail_points(pool.clone(), config, registry(cloud), points)
        }
        None => OperationEngine::new(pool.clone(), config, registry(cloud)),
    }
}

/// Wait for the engine to go idle, failing the test after a generous timeout.
pub async fn settle(engine: &OperationEngine) {
    tokio::time::timeout(Duration::from_secs(10), engine.wait_idle())
        .await
        .expect("engine did not become idle");
}

/// Load an operation that must exist.
pub async fn load(engine: &OperationEngine, id: &str) -> OperationRecord {
    engine
        .get(id)
        .await
        .expect("Failed to load operation")
        .expect("Operation should exist")
}
