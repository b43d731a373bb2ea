//! Cold-start recovery: reconstruction from the document store,
//! blocking semantics, and progressive unblock.

mod common;

use common::{fixtures, TestHarness};
use dispatcher_core::domains::calls::models::{CallMetadata, CallStatus};
use dispatcher_core::domains::campaign::cold_start::ColdStartState;
use dispatcher_core::domains::campaign::keys;
use dispatcher_core::domains::campaign::promoter::Promoter;
use dispatcher_core::domains::campaign::service::CampaignService;
use test_context::test_context;

/// Two in-progress call logs with an empty registry: first access
/// rebuilds both members and, having recovered min(limit, 2) leases,
/// settles immediately.
#[test_context(TestHarness)]
#[tokio::test]
async fn reconstruction_rebuilds_leases_from_call_logs(harness: &mut TestHarness) {
    let campaign = fixtures::create_campaign(&harness.db_pool, 3).await.unwrap();
    let id = campaign.id.to_string();
    harness.deps.leases.set_limit(&id, 3).await.unwrap();

    let mut live_ids = Vec::new();
    for _ in 0..2 {
        let log = fixtures::create_call_log(
            &harness.db_pool,
            Some(campaign.id),
            None,
            CallStatus::InProgress,
            CallMetadata::default(),
        )
        .await
        .unwrap();
        live_ids.push(log.id.to_string());
    }

    let state = harness
        .deps
        .cold_start
        .ensure_ready(campaign.id)
        .await
        .unwrap();
    assert_eq!(state, ColdStartState::Done, "2 recovered ≥ min(limit, 2)");

    let mut members = harness.deps.leases.members(&id).await.unwrap();
    members.sort();
    live_ids.sort();
    assert_eq!(members, live_ids, "lease set mirrors live call logs");

    // Recovered leases carry the sentinel token until real traffic
    // replaces it.
    let mut conn = harness.deps.kv.conn();
    let value: Option<String> = redis::cmd("GET")
        .arg(keys::lease(&id, &live_ids[0]))
        .query_async(&mut conn)
        .await
        .unwrap();
    assert_eq!(value.as_deref(), Some("recovered"));
}

/// A partial recovery (fewer than min(limit, 2) live calls) blocks:
/// promotions are refused and renewals of recovered leases are denied.
#[test_context(TestHarness)]
#[tokio::test]
async fn partial_recovery_blocks_promotions(harness: &mut TestHarness) {
    let campaign = fixtures::create_campaign(&harness.db_pool, 3).await.unwrap();
    let id = campaign.id.to_string();
    harness.deps.leases.set_limit(&id, 3).await.unwrap();

    let log = fixtures::create_call_log(
        &harness.db_pool,
        Some(campaign.id),
        None,
        CallStatus::InProgress,
        CallMetadata::default(),
    )
    .await
    .unwrap();

    let state = harness
        .deps
        .cold_start
        .ensure_ready(campaign.id)
        .await
        .unwrap();
    assert_eq!(state, ColdStartState::Blocking);
    assert!(harness.deps.cold_start.is_blocking(&id).await.unwrap());

    // Promotion is refused while blocking.
    fixtures::create_contacts(&harness.db_pool, campaign.id, 2)
        .await
        .unwrap();
    let service = CampaignService::new(harness.deps.clone());
    service.start(campaign.id).await.unwrap();
    let promoter = Promoter::new(harness.deps.clone(), harness.leader.clone());
    let batch = promoter.try_promote(campaign.id).await.unwrap();
    assert!(batch.is_none(), "no promotions during cold start");

    // Renewal of the recovered lease is refused while blocking.
    let renewed = harness
        .deps
        .leases
        .renew(&id, &log.id.to_string(), "recovered", 0)
        .await
        .unwrap();
    assert!(!renewed, "renewals refused during cold start");

    // The first real upgrade unblocks immediately.
    harness.deps.cold_start.mark_done(&id).await.unwrap();
    assert!(!harness.deps.cold_start.is_blocking(&id).await.unwrap());
    let batch = promoter.try_promote(campaign.id).await.unwrap();
    assert!(batch.is_some(), "promotions flow after unblock");
}

/// A campaign with no live calls settles without ever blocking.
#[test_context(TestHarness)]
#[tokio::test]
async fn empty_recovery_settles_immediately(harness: &mut TestHarness) {
    let campaign = fixtures::create_campaign(&harness.db_pool, 2).await.unwrap();
    let id = campaign.id.to_string();
    harness.deps.leases.set_limit(&id, 2).await.unwrap();

    let state = harness
        .deps
        .cold_start
        .ensure_ready(campaign.id)
        .await
        .unwrap();
    assert_eq!(state, ColdStartState::Done);
    assert_eq!(harness.deps.leases.member_count(&id).await.unwrap(), 0);
}
