// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable operations: channel destruction, start-transfer pushes, and
//! resumption after a crash at every checkpoint.

mod common;

use std::time::Duration;

use conduit_core::actions::destroy::{AFTER_ABORT, AFTER_CHANNEL, AFTER_COMPLETE};
use conduit_core::actions::start_transfer::{AFTER_ACTIVATE, AFTER_NOTIFY, EXPIRED_DESCRIPTION};
use conduit_core::actions::{DestroyChannelsAction, StartTransferAction};
use conduit_core::channel_handlers::{self, DestroyAllRequest, DestroyChannelRequest};
use conduit_core::model::{LifeStatus, TransferState};
use conduit_operations::{OperationAction, OperationOutcome, codes};
use serde_json::json;

use common::*;

async fn destroy_all(ctx: &TestContext, key: Option<&str>) -> String {
    channel_handlers::handle_destroy_all(
        &ctx.channels,
        DestroyAllRequest {
            execution_id: EXECUTION.to_string(),
            idempotency_key: key.map(str::to_string),
        },
    )
    .await
    .expect("Failed to schedule destruction")
    .id
}

/// Consumer waiting, then a producer: one start_transfer operation.
async fn pending_push(ctx: &TestContext) -> String {
    let channel = ctx.create_channel("out", None, None).await;
    ctx.bind(&channel, "c1", "CONSUMER", slot("http://c1"), None)
        .await
        .unwrap();
    ctx.bind(&channel, "p1", "PRODUCER", slot("http://p1"), Some("bind-p1"))
        .await
        .unwrap();
    channel
}

// ============================================================================
// Destroy
// ============================================================================

#[tokio::test]
async fn test_destroy_channel_deletes_everything() {
    let ctx = TestContext::new().await;
    let channel = ctx.create_channel("out", None, Some("s3://bucket/out")).await;
    let bound = ctx
        .bind(&channel, "p1", "PRODUCER", slot("http://p1"), None)
        .await
        .unwrap();
    ctx.transfer_completed(&channel, &bound.transfer_id.unwrap(), None)
        .await
        .unwrap();

    let handle = channel_handlers::handle_destroy_channel(
        &ctx.channels,
        DestroyChannelRequest {
            channel_id: channel.clone(),
            idempotency_key: Some("destroy-1".to_string()),
        },
    )
    .await
    .unwrap();
    ctx.settle().await;

    assert!(ctx.channel(&channel).await.is_none());
    assert!(ctx.peers(&channel).await.is_empty());
    assert!(ctx.transfers(&channel).await.is_empty());
    assert!(ctx.workflow.aborts().is_empty());

    let polled = channel_handlers::handle_get_operation(&ctx.channels, &handle.id)
        .await
        .unwrap();
    assert!(polled.done);
    assert_eq!(polled.response, Some(json!({ "destroyed": [channel.clone()] })));

    // The keyed retry finds the same operation even though the channel is gone
    let retried = channel_handlers::handle_destroy_channel(
        &ctx.channels,
        DestroyChannelRequest {
            channel_id: channel.clone(),
            idempotency_key: Some("destroy-1".to_string()),
        },
    )
    .await
    .unwrap();
    assert_eq!(retried.id, handle.id);

    let err = channel_handlers::handle_destroy_channel(
        &ctx.channels,
        DestroyChannelRequest {
            channel_id: channel,
            idempotency_key: None,
        },
    )
    .await
    .unwrap_err();
    assert_eq!(err.error_code(), "CHANNEL_NOT_FOUND");
}

#[tokio::test]
async fn test_destroy_waits_for_transfers_in_flight() {
    let ctx = TestContext::new().await;
    let channel = ctx.create_channel("out", None, None).await;
    ctx.bind(&channel, "p1", "PRODUCER", slot("http://p1"), None)
        .await
        .unwrap();
    let to_c1 = ctx
        .bind(&channel, "c1", "CONSUMER", slot("http://c1"), None)
        .await
        .unwrap()
        .transfer_id
        .unwrap();
    let to_c2 = ctx
        .bind(&channel, "c2", "CONSUMER", slot("http://c2"), None)
        .await
        .unwrap()
        .transfer_id
        .unwrap();

    let handle = channel_handlers::handle_destroy_channel(
        &ctx.channels,
        DestroyChannelRequest {
            channel_id: channel.clone(),
            idempotency_key: Some("destroy-1".to_string()),
        },
    )
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // 1. Both transfers are still ACTIVE, so the channel stays
    assert_eq!(
        ctx.channel(&channel).await.unwrap().life_status,
        LifeStatus::Destroying
    );
    assert!(!ctx.operation(&handle.id).await.done);

    // 2. The slots can still report; a failure gets no replacement
    ctx.transfer_completed(&channel, &to_c1, Some("done-1"))
        .await
        .unwrap();
    let err = ctx
        .transfer_failed(&channel, &to_c2, Some("fail-1"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "CHANNEL_UNRECOVERABLE");
    assert_eq!(ctx.transfers(&channel).await.len(), 2);

    // 3. Nothing in flight: the destroy goes through
    ctx.settle().await;
    assert!(ctx.channel(&channel).await.is_none());
    let ops = ctx.operations_of_kind(DestroyChannelsAction::KIND).await;
    assert_eq!(ops.len(), 1);
    assert_eq!(
        ops[0].outcome(),
        OperationOutcome::Succeeded(json!({ "destroyed": [channel] }))
    );
    assert!(ctx.workflow.aborts().is_empty());
}

#[tokio::test]
async fn test_expired_destroy_deletes_channel_with_transfers_in_flight() {
    let mut ctx = TestContext::new().await;
    ctx.channels.operation_deadline = Duration::from_millis(50);
    let channel = ctx.create_channel("out", None, None).await;
    ctx.bind(&channel, "p1", "PRODUCER", slot("http://p1"), None)
        .await
        .unwrap();
    ctx.bind(&channel, "c1", "CONSUMER", slot("http://c1"), None)
        .await
        .unwrap();

    let handle = channel_handlers::handle_destroy_channel(
        &ctx.channels,
        DestroyChannelRequest {
            channel_id: channel.clone(),
            idempotency_key: None,
        },
    )
    .await
    .unwrap();
    ctx.settle().await;

    assert!(ctx.channel(&channel).await.is_none());
    assert!(ctx.transfers(&channel).await.is_empty());
    match ctx.operation(&handle.id).await.outcome() {
        OperationOutcome::Failed(failure) => assert_eq!(failure.code, codes::DEADLINE_EXCEEDED),
        other => panic!("expected expiry, got {:?}", other),
    }
}

#[tokio::test]
async fn test_destroy_all_resumes_after_crash_between_channels() {
    let ctx = TestContext::new().await;
    let first = ctx.create_channel("a", None, None).await;
    let second = ctx.create_channel("b", None, None).await;
    ctx.fail_points.arm(AFTER_CHANNEL);

    let op = destroy_all(&ctx, None).await;
    ctx.settle().await;

    // 1. Crashed after the first channel; the second stays DESTROYING
    assert_eq!(ctx.fail_points.fired(), vec![AFTER_CHANNEL.to_string()]);
    assert!(!ctx.operation(&op).await.done);
    assert!(ctx.channel(&first).await.is_none());
    assert_eq!(
        ctx.channel(&second).await.unwrap().life_status,
        LifeStatus::Destroying
    );

    // 2. A DESTROYING channel accepts nothing
    let err = ctx
        .bind(&second, "p1", "PRODUCER", slot("http://p1"), None)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "INVALID_CHANNEL_STATE");
    let err = channel_handlers::handle_destroy_channel(
        &ctx.channels,
        DestroyChannelRequest {
            channel_id: second.clone(),
            idempotency_key: None,
        },
    )
    .await
    .unwrap_err();
    assert_eq!(err.error_code(), "INVALID_CHANNEL_STATE");
    let err = channel_handlers::handle_channel_status(&ctx.channels, &second)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "CHANNEL_NOT_FOUND");

    // 3. A restarted engine picks up the rest
    let restarted = ctx.restarted_engine();
    assert_eq!(restarted.recover().await.unwrap(), 1);
    settle(&restarted).await;

    assert!(ctx.channel(&second).await.is_none());
    assert_eq!(
        ctx.operation(&op).await.outcome(),
        OperationOutcome::Succeeded(json!({ "destroyed": [first, second] }))
    );
}

#[tokio::test]
async fn test_destroy_all_without_channels_finishes_empty() {
    let ctx = TestContext::new().await;
    let op = destroy_all(&ctx, Some("all-1")).await;
    ctx.settle().await;

    assert_eq!(
        ctx.operation(&op).await.outcome(),
        OperationOutcome::Succeeded(json!({ "destroyed": [] }))
    );
    assert_eq!(destroy_all(&ctx, Some("all-1")).await, op);
}

#[tokio::test]
async fn test_teardown_abort_is_repeated_after_crash() {
    let ctx = TestContext::new().await;
    ctx.fail_points.arm(AFTER_ABORT);
    let channel = ctx.create_channel("out", None, Some("s3://bucket/out")).await;
    let bound = ctx
        .bind(&channel, "p1", "PRODUCER", slot("http://p1"), None)
        .await
        .unwrap();

    ctx.transfer_failed(&channel, &bound.transfer_id.unwrap(), None)
        .await
        .unwrap_err();
    ctx.settle().await;

    let ops = ctx.operations_of_kind(DestroyChannelsAction::KIND).await;
    assert_eq!(ops.len(), 1);
    assert!(!ops[0].done);
    assert_eq!(ctx.workflow.aborts().len(), 1);

    let restarted = ctx.restarted_engine();
    restarted.recover().await.unwrap();
    settle(&restarted).await;

    // At-least-once: the abort was not recorded before the crash
    assert_eq!(ctx.workflow.aborts().len(), 2);
    assert!(ctx.operation(&ops[0].id).await.done);
    assert!(ctx.channel(&channel).await.is_none());
}

#[tokio::test]
async fn test_crash_after_completion_leaves_nothing_to_recover() {
    let ctx = TestContext::new().await;
    ctx.fail_points.arm(AFTER_COMPLETE);
    let channel = ctx.create_channel("out", None, None).await;

    let op = destroy_all(&ctx, None).await;
    ctx.settle().await;
    assert_eq!(ctx.fail_points.fired(), vec![AFTER_COMPLETE.to_string()]);

    let restarted = ctx.restarted_engine();
    assert_eq!(restarted.recover().await.unwrap(), 0);
    assert_eq!(
        ctx.operation(&op).await.outcome(),
        OperationOutcome::Succeeded(json!({ "destroyed": [channel] }))
    );
}

// ============================================================================
// Start transfer
// ============================================================================

#[tokio::test]
async fn test_push_is_retried_after_transient_failures() {
    let ctx = TestContext::new().await;
    ctx.notifier.fail_next(3);
    let channel = pending_push(&ctx).await;
    ctx.settle().await;

    assert_eq!(ctx.notifier.attempts(), 4);
    assert_eq!(ctx.notifier.delivered().len(), 1);
    assert_eq!(ctx.transfers(&channel).await[0].state, TransferState::Active);
}

#[tokio::test]
async fn test_rejected_push_fails_transfer() {
    let ctx = TestContext::new().await;
    ctx.notifier.reject_all();
    let channel = pending_push(&ctx).await;
    ctx.settle().await;

    let transfer = &ctx.transfers(&channel).await[0];
    assert_eq!(transfer.state, TransferState::Failed);
    assert!(
        transfer
            .error_description
            .as_deref()
            .is_some_and(|d| d.starts_with("start transfer rejected"))
    );

    let ops = ctx.operations_of_kind(StartTransferAction::KIND).await;
    match ops[0].outcome() {
        OperationOutcome::Failed(failure) => assert_eq!(failure.code, codes::FAILED_PRECONDITION),
        other => panic!("expected failure, got {:?}", other),
    }

    // The consumer waits again and the next producer is matched with it
    assert!(!ctx.peer(&channel, "c1").await.unwrap().connected);
    ctx.notifier.accept_all();
    ctx.bind(&channel, "p2", "PRODUCER", slot("http://p2"), None)
        .await
        .unwrap();
    ctx.settle().await;

    let transfers = ctx.transfers(&channel).await;
    let retried: Vec<_> = transfers.iter().filter(|t| t.from_peer_id == "p2").collect();
    assert_eq!(retried.len(), 1);
    assert_eq!(retried[0].to_peer_id, "c1");
    assert_eq!(retried[0].state, TransferState::Active);
    assert!(ctx.peer(&channel, "c1").await.unwrap().connected);
}

#[tokio::test]
async fn test_push_past_deadline_expires_transfer() {
    let mut ctx = TestContext::new().await;
    ctx.slots.operation_deadline = Duration::from_millis(50);
    ctx.notifier.fail_next(u32::MAX);
    let channel = pending_push(&ctx).await;
    ctx.settle().await;

    let transfer = &ctx.transfers(&channel).await[0];
    assert_eq!(transfer.state, TransferState::Failed);
    assert_eq!(transfer.error_description.as_deref(), Some(EXPIRED_DESCRIPTION));

    assert!(!ctx.peer(&channel, "c1").await.unwrap().connected);

    let ops = ctx.operations_of_kind(StartTransferAction::KIND).await;
    match ops[0].outcome() {
        OperationOutcome::Failed(failure) => assert_eq!(failure.code, codes::DEADLINE_EXCEEDED),
        other => panic!("expected expiry, got {:?}", other),
    }
}

#[tokio::test]
async fn test_push_is_repeated_after_crash_before_activation() {
    let ctx = TestContext::new().await;
    ctx.fail_points.arm(AFTER_NOTIFY);
    let channel = pending_push(&ctx).await;
    ctx.settle().await;

    assert_eq!(ctx.notifier.delivered().len(), 1);
    assert_eq!(ctx.transfers(&channel).await[0].state, TransferState::Pending);

    let restarted = ctx.restarted_engine();
    assert_eq!(restarted.recover().await.unwrap(), 1);
    settle(&restarted).await;

    assert_eq!(ctx.notifier.delivered().len(), 2);
    assert_eq!(ctx.transfers(&channel).await[0].state, TransferState::Active);
    let ops = ctx.operations_of_kind(StartTransferAction::KIND).await;
    assert!(ops[0].done);
}

#[tokio::test]
async fn test_crash_after_activation_is_final() {
    let ctx = TestContext::new().await;
    ctx.fail_points.arm(AFTER_ACTIVATE);
    let channel = pending_push(&ctx).await;
    ctx.settle().await;

    let restarted = ctx.restarted_engine();
    assert_eq!(restarted.recover().await.unwrap(), 0);
    assert_eq!(ctx.notifier.delivered().len(), 1);
    assert_eq!(ctx.transfers(&channel).await[0].state, TransferState::Active);
}

#[tokio::test]
async fn test_pending_transfer_cannot_complete_before_push() {
    let ctx = TestContext::new().await;
    ctx.fail_points.arm(AFTER_NOTIFY);
    let channel = pending_push(&ctx).await;
    ctx.settle().await;

    // Still PENDING: the push was never acknowledged
    let transfer_id = ctx.transfers(&channel).await[0].id.clone();
    let err = ctx
        .transfer_completed(&channel, &transfer_id, None)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "INVALID_TRANSFER_STATE");

    let restarted = ctx.restarted_engine();
    restarted.recover().await.unwrap();
    settle(&restarted).await;

    let ops = ctx.operations_of_kind(StartTransferAction::KIND).await;
    assert_eq!(
        ops[0].outcome(),
        OperationOutcome::Succeeded(json!({ "transferId": transfer_id, "activated": true }))
    );
}
