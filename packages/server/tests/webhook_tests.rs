//! Webhook idempotency and lease release semantics.

mod common;

use common::{fixtures, TestHarness};
use dispatcher_core::domains::calls::models::{CallLog, CallMetadata, CallStatus};
use dispatcher_core::domains::calls::webhook::{StatusWebhook, WebhookMetadata, WebhookProcessor};
use dispatcher_core::domains::campaign::lease::ForceReleased;
use test_context::test_context;

fn terminal(status: &str, call_log_id: uuid::Uuid, token: Option<String>) -> StatusWebhook {
    StatusWebhook {
        call_sid: None,
        status: status.to_string(),
        call_log_id: Some(call_log_id),
        duration_sec: Some(30),
        failure_reason: None,
        metadata: WebhookMetadata {
            lease_token: token,
            call_id: Some(call_log_id.to_string()),
            campaign_id: None,
            voicemail_detected: false,
        },
    }
}

/// An answered call upgrades its pre-dial lease; the same terminal
/// webhook delivered twice produces a single release and no drift.
#[test_context(TestHarness)]
#[tokio::test]
async fn duplicate_terminal_webhook_releases_once(harness: &mut TestHarness) {
    let campaign = fixtures::create_campaign(&harness.db_pool, 3).await.unwrap();
    let contacts = fixtures::create_contacts(&harness.db_pool, campaign.id, 1)
        .await
        .unwrap();
    let id = campaign.id.to_string();
    harness.deps.leases.set_limit(&id, 3).await.unwrap();

    // Simulate the worker's pre-dial acquisition.
    let log = fixtures::create_call_log(
        &harness.db_pool,
        Some(campaign.id),
        Some(contacts[0].id),
        CallStatus::Ringing,
        CallMetadata::default(),
    )
    .await
    .unwrap();
    let call_id = log.id.to_string();
    let pre_token = harness
        .deps
        .leases
        .acquire_pre_dial(&id, &call_id)
        .await
        .unwrap()
        .expect("slot available");
    let metadata = CallMetadata {
        pre_lease_token: Some(pre_token),
        call_id: Some(call_id.clone()),
        campaign_id: Some(campaign.id),
        ..Default::default()
    };
    CallLog::update_metadata(log.id, &metadata, &harness.db_pool)
        .await
        .unwrap();

    let processor = WebhookProcessor::new(harness.deps.clone());

    // Answer: pre-dial becomes active, token persisted.
    processor
        .process(StatusWebhook {
            call_sid: None,
            status: "in-progress".to_string(),
            call_log_id: Some(log.id),
            duration_sec: None,
            failure_reason: None,
            metadata: WebhookMetadata::default(),
        })
        .await
        .unwrap();
    let upgraded = CallLog::find_by_id(log.id, &harness.db_pool)
        .await
        .unwrap()
        .unwrap();
    assert!(upgraded.metadata.lease_token.is_some(), "active token persisted");
    assert!(upgraded.metadata.pre_lease_token.is_none());
    let members = harness.deps.leases.members(&id).await.unwrap();
    assert_eq!(members, vec![call_id.clone()], "member switched to active form");

    // First terminal webhook releases the active lease.
    let first = processor
        .process(terminal("completed", log.id, upgraded.metadata.lease_token.clone()))
        .await
        .unwrap();
    assert_eq!(first.released, ForceReleased::Active);
    assert_eq!(harness.deps.leases.member_count(&id).await.unwrap(), 0);

    // The duplicate is a no-op.
    let second = processor
        .process(terminal("completed", log.id, upgraded.metadata.lease_token.clone()))
        .await
        .unwrap();
    assert_eq!(second.released, ForceReleased::Nothing);
    assert_eq!(harness.deps.leases.member_count(&id).await.unwrap(), 0);
}

/// A webhook presenting the wrong token must not release the lease.
#[test_context(TestHarness)]
#[tokio::test]
async fn mismatched_token_does_not_release(harness: &mut TestHarness) {
    let campaign = fixtures::create_campaign(&harness.db_pool, 2).await.unwrap();
    let id = campaign.id.to_string();
    harness.deps.leases.set_limit(&id, 2).await.unwrap();

    let log = fixtures::create_call_log(
        &harness.db_pool,
        Some(campaign.id),
        None,
        CallStatus::Ringing,
        CallMetadata::default(),
    )
    .await
    .unwrap();
    let call_id = log.id.to_string();
    let pre_token = harness
        .deps
        .leases
        .acquire_pre_dial(&id, &call_id)
        .await
        .unwrap()
        .expect("slot available");
    CallLog::update_metadata(
        log.id,
        &CallMetadata {
            pre_lease_token: Some(pre_token),
            call_id: Some(call_id),
            campaign_id: Some(campaign.id),
            ..Default::default()
        },
        &harness.db_pool,
    )
    .await
    .unwrap();

    let processor = WebhookProcessor::new(harness.deps.clone());
    let outcome = processor
        .process(terminal("failed", log.id, Some("wrong-token".to_string())))
        .await
        .unwrap();
    assert_eq!(outcome.released, ForceReleased::Nothing);
    assert_eq!(
        harness.deps.leases.member_count(&id).await.unwrap(),
        1,
        "lease survives a stale webhook"
    );
}

/// A busy terminal webhook schedules exactly one retry even when
/// delivered twice (unique attempt constraint).
#[test_context(TestHarness)]
#[tokio::test]
async fn duplicate_busy_webhook_schedules_one_retry(harness: &mut TestHarness) {
    let campaign = fixtures::create_campaign(&harness.db_pool, 2).await.unwrap();
    let contacts = fixtures::create_contacts(&harness.db_pool, campaign.id, 1)
        .await
        .unwrap();
    let id = campaign.id.to_string();
    harness.deps.leases.set_limit(&id, 2).await.unwrap();

    let log = fixtures::create_call_log(
        &harness.db_pool,
        Some(campaign.id),
        Some(contacts[0].id),
        CallStatus::Ringing,
        CallMetadata {
            campaign_id: Some(campaign.id),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let processor = WebhookProcessor::new(harness.deps.clone());
    let first = processor
        .process(terminal("busy", log.id, None))
        .await
        .unwrap();
    assert!(first.retry_scheduled, "busy is retryable");

    let second = processor
        .process(terminal("busy", log.id, None))
        .await
        .unwrap();
    assert!(!second.retry_scheduled, "duplicate does not double-schedule");

    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM retry_attempts WHERE original_call_log_id = $1")
            .bind(log.id)
            .fetch_one(&harness.db_pool)
            .await
            .unwrap();
    assert_eq!(count, 1);
}
