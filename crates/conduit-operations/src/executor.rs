// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded worker pool for operation runners.
//!
//! Every run of a runner is a separate tokio task that first waits out its delay,
//! then takes a permit from a semaphore sized by `max_concurrent`. A runner that
//! asks to be rescheduled is submitted again as a new task; nothing recurses.
//! An operation id is in flight at most once per executor.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore, watch};
use tracing::{debug, info};

/// What the executor should do after a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunNext {
    /// Submit the runner again after the delay.
    Reschedule(Duration),
    /// The runner is done (finished, failed, or terminated).
    Stop,
}

/// A unit of work the executor can drive.
#[async_trait]
pub trait Runnable: Send {
    /// Id of the operation this runner drives.
    fn operation_id(&self) -> &str;

    /// Run until the next scheduling decision.
    async fn run(&mut self) -> RunNext;
}

struct ExecutorInner {
    permits: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
    in_flight: Mutex<HashSet<String>>,
    idle: Notify,
}

/// Handle to the worker pool. Cheap to clone.
#[derive(Clone)]
pub struct OperationsExecutor {
    inner: Arc<ExecutorInner>,
}

impl std::fmt::Debug for OperationsExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationsExecutor")
            .field("available_permits", &self.inner.permits.available_permits())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl OperationsExecutor {
    /// Create a pool running at most `max_concurrent` runners at a time.
    pub fn new(max_concurrent: usize) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ExecutorInner {
                permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
                shutdown_tx,
                in_flight: Mutex::new(HashSet::new()),
                idle: Notify::new(),
            }),
        }
    }

    /// Submit a runner for immediate execution.
    ///
    /// Returns `false` if a runner for the same operation is already in flight or
    /// the executor is shut down.
    pub fn submit(&self, runner: Box<dyn Runnable>) -> bool {
        if *self.inner.shutdown_tx.borrow() {
            return false;
        }
        let id = runner.operation_id().to_string();
        {
            let mut in_flight = self.inner.in_flight.lock().unwrap_or_else(|p| p.into_inner());
            if !in_flight.insert(id.clone()) {
                debug!(operation_id = %id, "Operation already in flight, skipping submit");
                return false;
            }
        }
        Self::spawn(self.inner.clone(), runner, Duration::ZERO);
        true
    }

    /// Number of operations currently scheduled or running.
    pub fn in_flight(&self) -> usize {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    /// Whether the operation is scheduled or running.
    pub fn is_in_flight(&self, operation_id: &str) -> bool {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(operation_id)
    }

    /// Wait until no operation is scheduled or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting work and abandon delayed runs.
    ///
    /// Runs that already hold a permit finish their current step. Abandoned
    /// operations stay unfinished in the store and are recovered on next start.
    pub fn shutdown(&self) {
        info!(in_flight = self.in_flight(), "Operations executor shutting down");
        // send() drops the value when nobody is subscribed; submit must still see it
        self.inner.shutdown_tx.send_replace(true);
        self.inner.permits.close();
    }

    fn spawn(inner: Arc<ExecutorInner>, mut runner: Box<dyn Runnable>, delay: Duration) {
        tokio::spawn(async move {
            let mut shutdown = inner.shutdown_tx.subscribe();

            if !delay.is_zero() {
                tokio::select! {
                    _ = shutdown.changed() => {
                        Self::release(&inner, runner.operation_id());
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let permit = match inner.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    Self::release(&inner, runner.operation_id());
                    return;
                }
            };

            let next = runner.run().await;
            drop(permit);

            match next {
                RunNext::Reschedule(after) if !*shutdown.borrow() => {
                    debug!(
                        operation_id = %runner.operation_id(),
                        delay_ms = after.as_millis() as u64,
                        "Rescheduling operation"
                    );
                    Self::spawn(inner, runner, after);
                }
                _ => Self::release(&inner, runner.operation_id()),
            }
        });
    }

    fn release(inner: &ExecutorInner, operation_id: &str) {
        let empty = {
            let mut in_flight = inner.in_flight.lock().unwrap_or_else(|p| p.into_inner());
            in_flight.remove(operation_id);
            in_flight.is_empty()
        };
        if empty {
            inner.idle.notify_waiters();
        }
    }
}
