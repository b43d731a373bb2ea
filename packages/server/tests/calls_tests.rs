//! Immediate outbound calls: adhoc capacity accounting, breaker
//! behavior, and vendor cancel.
//!
//! The adhoc bucket is a process-wide singleton, so the scenarios run
//! as stages of one test rather than racing each other in parallel.

mod common;

use common::TestHarness;
use dispatcher_core::common::AppError;
use dispatcher_core::domains::calls::outgoing::{OutgoingCallParams, OutgoingCallService};
use dispatcher_core::domains::calls::telephony::MockDialOutcome;
use dispatcher_core::kernel::ADHOC_CAMPAIGN;
use test_context::test_context;
use uuid::Uuid;

fn params(phone: &str) -> OutgoingCallParams {
    OutgoingCallParams {
        phone_number: phone.to_string(),
        user_id: Uuid::new_v4(),
        agent_id: Uuid::new_v4(),
        campaign_id: None,
        contact_id: None,
        call_log_id: None,
        pre_lease_token: None,
        skip_slot_acquisition: false,
        is_retry: false,
    }
}

async fn reset_adhoc(harness: &TestHarness) {
    harness
        .deps
        .leases
        .clear_all(ADHOC_CAMPAIGN)
        .await
        .unwrap();
    let mut conn = harness.deps.kv.conn();
    for key in [
        dispatcher_core::domains::campaign::keys::breaker_failures(ADHOC_CAMPAIGN),
        dispatcher_core::domains::campaign::keys::circuit(ADHOC_CAMPAIGN),
    ] {
        redis::cmd("DEL")
            .arg(key)
            .query_async::<()>(&mut conn)
            .await
            .unwrap();
    }
    harness
        .deps
        .leases
        .set_limit(ADHOC_CAMPAIGN, 2)
        .await
        .unwrap();
}

#[test_context(TestHarness)]
#[tokio::test]
async fn adhoc_bucket_enforces_capacity_breaker_and_cancel(harness: &mut TestHarness) {
    let service = OutgoingCallService::new(harness.deps.clone());

    // Stage 1, capacity: the adhoc limit is 2; the third concurrent
    // call gets the capacity error and no slot leaks.
    reset_adhoc(harness).await;
    service.initiate_call(params("+14155550001")).await.unwrap();
    service.initiate_call(params("+14155550002")).await.unwrap();
    let third = service.initiate_call(params("+14155550003")).await;
    assert!(
        matches!(third, Err(AppError::CapacityExceeded)),
        "expected CONCURRENT_LIMIT_REACHED, got {third:?}"
    );
    assert_eq!(
        harness.deps.leases.member_count(ADHOC_CAMPAIGN).await.unwrap(),
        2
    );

    // Stage 2, validation: a bad number is rejected before any slot
    // is touched.
    reset_adhoc(harness).await;
    let invalid = service.initiate_call(params("not-a-number")).await;
    assert!(matches!(invalid, Err(AppError::Validation { .. })));
    assert_eq!(
        harness.deps.leases.member_count(ADHOC_CAMPAIGN).await.unwrap(),
        0
    );

    // Stage 3, breaker: repeated carrier 5xx trips the circuit, failed
    // dials release their briefly-held slots, and an open circuit turns
    // initiations away outright.
    harness
        .telephony
        .set_outcome(MockDialOutcome::Unavailable)
        .await;
    for n in 0..6 {
        let result = service
            .initiate_call(params(&format!("+1415666{:04}", n)))
            .await;
        assert!(matches!(result, Err(AppError::UpstreamUnavailable(_))));
    }
    assert!(harness.deps.breaker.is_open(ADHOC_CAMPAIGN).await.unwrap());
    assert_eq!(
        harness.deps.leases.member_count(ADHOC_CAMPAIGN).await.unwrap(),
        0,
        "failed dials never leak slots"
    );

    harness.telephony.set_outcome(MockDialOutcome::Accept).await;
    let while_open = service.initiate_call(params("+14155550009")).await;
    assert!(
        matches!(while_open, Err(AppError::UpstreamUnavailable(_))),
        "breaker short-circuits initiation"
    );

    // Stage 4, cancel: reaches the vendor with the recorded sid.
    reset_adhoc(harness).await;
    let call_log_id = service.initiate_call(params("+14155551234")).await.unwrap();
    service.cancel_call(call_log_id).await.unwrap();
    let cancelled = harness.telephony.cancelled().await;
    assert_eq!(cancelled.len(), 1);
    assert!(cancelled[0].starts_with("mock-sid-"));
}
