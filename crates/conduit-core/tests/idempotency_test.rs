// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retried requests, duplicate peers, unbind, and concurrent binds.

mod common;

use conduit_core::model::TransferState;
use conduit_core::slot_handlers::{self, UnbindRequest};
use futures::future::join_all;

use common::*;

async fn unbind(ctx: &TestContext, channel_id: &str, peer_id: &str) -> Result<(), String> {
    slot_handlers::handle_unbind(
        &ctx.slots,
        UnbindRequest {
            channel_id: channel_id.to_string(),
            peer_id: peer_id.to_string(),
            subject: OWNER.to_string(),
        },
    )
    .await
    .map(|_| ())
    .map_err(|e| e.error_code().to_string())
}

#[tokio::test]
async fn test_bind_replay_returns_first_response() {
    let ctx = TestContext::new().await;
    let channel = ctx.create_channel("out", None, None).await;
    ctx.bind(&channel, "p1", "PRODUCER", slot("http://p1"), None)
        .await
        .unwrap();

    let first = ctx
        .bind(&channel, "c1", "CONSUMER", slot("http://c1"), Some("bind-c1"))
        .await
        .unwrap();
    let second = ctx
        .bind(&channel, "c1", "CONSUMER", slot("http://c1"), Some("bind-c1"))
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(ctx.transfers(&channel).await.len(), 1);
}

#[tokio::test]
async fn test_keyless_repeat_bind_reuses_in_flight_transfer() {
    let ctx = TestContext::new().await;
    let channel = ctx.create_channel("out", None, None).await;
    ctx.bind(&channel, "p1", "PRODUCER", slot("http://p1"), None)
        .await
        .unwrap();

    let first = ctx
        .bind(&channel, "c1", "CONSUMER", slot("http://c1"), None)
        .await
        .unwrap();
    let second = ctx
        .bind(&channel, "c1", "CONSUMER", slot("http://c1"), None)
        .await
        .unwrap();

    assert_eq!(first.transfer_id, second.transfer_id);
    assert_eq!(ctx.transfers(&channel).await.len(), 1);
}

#[tokio::test]
async fn test_reused_key_with_other_body_conflicts() {
    let ctx = TestContext::new().await;
    let channel = ctx.create_channel("out", None, None).await;

    ctx.bind(&channel, "p1", "PRODUCER", slot("http://p1"), Some("k1"))
        .await
        .unwrap();
    let err = ctx
        .bind(&channel, "p2", "PRODUCER", slot("http://p2"), Some("k1"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "IDEMPOTENCY_CONFLICT");
    assert!(ctx.peer(&channel, "p2").await.is_none());
}

#[tokio::test]
async fn test_same_peer_from_another_request_already_exists() {
    let ctx = TestContext::new().await;
    let channel = ctx.create_channel("out", None, None).await;

    ctx.bind(&channel, "p1", "PRODUCER", slot("http://p1"), Some("k1"))
        .await
        .unwrap();
    let err = ctx
        .bind(&channel, "p1", "PRODUCER", slot("http://p1-new"), Some("k2"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "PEER_ALREADY_EXISTS");

    let err = ctx
        .bind(&channel, "p1", "CONSUMER", slot("http://p1"), None)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "PEER_ALREADY_EXISTS");
}

#[tokio::test]
async fn test_transfer_reports_replay() {
    let ctx = TestContext::new().await;
    let channel = ctx.create_channel("out", None, None).await;
    ctx.bind(&channel, "p1", "PRODUCER", slot("http://p1"), None)
        .await
        .unwrap();
    ctx.bind(&channel, "p2", "PRODUCER", slot("http://p2"), None)
        .await
        .unwrap();
    let bound = ctx
        .bind(&channel, "c1", "CONSUMER", slot("http://c1"), None)
        .await
        .unwrap();
    let transfer_id = bound.transfer_id.unwrap();

    let failed = ctx
        .transfer_failed(&channel, &transfer_id, Some("fail-1"))
        .await
        .unwrap();
    let replayed = ctx
        .transfer_failed(&channel, &transfer_id, Some("fail-1"))
        .await
        .unwrap();
    assert_eq!(failed.new_transfer_id, replayed.new_transfer_id);
    assert_eq!(failed.new_peer, replayed.new_peer);
    assert_eq!(ctx.transfers(&channel).await.len(), 2);

    // A different key for the same failure is a new report of a FAILED transfer
    let err = ctx
        .transfer_failed(&channel, &transfer_id, Some("fail-2"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "INVALID_TRANSFER_STATE");

    ctx.transfer_completed(&channel, &failed.new_transfer_id, Some("done-1"))
        .await
        .unwrap();
    ctx.transfer_completed(&channel, &failed.new_transfer_id, Some("done-1"))
        .await
        .unwrap();
    let transfers = ctx.transfers(&channel).await;
    let replacement = transfers
        .iter()
        .find(|t| t.id == failed.new_transfer_id)
        .unwrap();
    assert_eq!(replacement.state, TransferState::Completed);
    assert_eq!(
        replacement.state_change_idempotency_key.as_deref(),
        Some("done-1")
    );
}

#[tokio::test]
async fn test_unbind_waits_for_transfers_in_flight() {
    let ctx = TestContext::new().await;
    let channel = ctx.create_channel("out", None, None).await;
    ctx.bind(&channel, "p1", "PRODUCER", slot("http://p1"), None)
        .await
        .unwrap();
    let bound = ctx
        .bind(&channel, "c1", "CONSUMER", slot("http://c1"), None)
        .await
        .unwrap();

    assert_eq!(unbind(&ctx, &channel, "p1").await, Err("UNAVAILABLE".to_string()));
    assert_eq!(unbind(&ctx, &channel, "c1").await, Err("UNAVAILABLE".to_string()));

    ctx.transfer_completed(&channel, &bound.transfer_id.unwrap(), None)
        .await
        .unwrap();

    assert_eq!(unbind(&ctx, &channel, "c1").await, Ok(()));
    assert_eq!(unbind(&ctx, &channel, "p1").await, Ok(()));
    assert!(ctx.peers(&channel).await.is_empty());
    assert_eq!(
        unbind(&ctx, &channel, "p1").await,
        Err("PEER_NOT_FOUND".to_string())
    );
}

#[tokio::test]
async fn test_concurrent_binds_get_one_transfer_each() {
    let ctx = TestContext::new().await;
    let channel = ctx.create_channel("out", None, None).await;

    let consumers: Vec<String> = (0..6).map(|i| format!("c{}", i)).collect();
    let binds = consumers.iter().map(|id| {
        let url = format!("http://{}", id);
        let ctx = &ctx;
        let channel = &channel;
        async move { ctx.bind(channel, id, "CONSUMER", slot(&url), None).await }
    });
    let producer = ctx.bind(&channel, "p1", "PRODUCER", slot("http://p1"), None);

    let (results, producer) = tokio::join!(join_all(binds), producer);
    producer.unwrap();
    for result in results {
        result.unwrap();
    }
    ctx.settle().await;

    // Whichever side won the race, each consumer ends with exactly one ACTIVE transfer
    let transfers = ctx.transfers(&channel).await;
    assert_eq!(transfers.len(), consumers.len());
    for consumer in &consumers {
        let to_consumer: Vec<_> = transfers.iter().filter(|t| &t.to_peer_id == consumer).collect();
        assert_eq!(to_consumer.len(), 1, "consumer {}", consumer);
        assert_eq!(to_consumer[0].state, TransferState::Active);
        assert!(ctx.peer(&channel, consumer).await.unwrap().connected);
    }
}
