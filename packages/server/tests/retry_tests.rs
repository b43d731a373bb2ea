//! Retry classification and scheduling laws.

mod common;

use chrono::{Datelike, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use common::{fixtures, TestHarness};
use dispatcher_core::domains::calls::models::{CallMetadata, CallStatus, FailureReason};
use dispatcher_core::domains::retry::service::RetryManager;
use test_context::test_context;

/// `busy`, first attempt: retry in 10 min ± 10% (before off-peak
/// clamping).
#[test_context(TestHarness)]
#[tokio::test]
async fn busy_retry_lands_in_the_jitter_band(harness: &mut TestHarness) {
    let campaign = fixtures::create_campaign(&harness.db_pool, 2).await.unwrap();
    let contacts = fixtures::create_contacts(&harness.db_pool, campaign.id, 1)
        .await
        .unwrap();
    let log = fixtures::create_call_log(
        &harness.db_pool,
        Some(campaign.id),
        Some(contacts[0].id),
        CallStatus::Busy,
        CallMetadata::default(),
    )
    .await
    .unwrap();

    let manager = RetryManager::without_off_peak(harness.deps.clone());
    let before = Utc::now();
    let attempt = manager
        .maybe_schedule_retry(&log, Some(&contacts[0]), FailureReason::Busy, false)
        .await
        .unwrap()
        .expect("busy is retryable");

    let delay_ms = (attempt.scheduled_for - before).num_milliseconds() as f64;
    let base = 10.0 * 60.0 * 1000.0;
    assert!(
        delay_ms >= base * 0.9 && delay_ms <= base * 1.1 + 2_000.0,
        "delay {delay_ms}ms outside the ±10% band"
    );
    assert_eq!(attempt.attempt_number, 1);

    // The retry job exists, high priority, keyed by the attempt.
    let job = dispatcher_core::kernel::jobs::Job::find_live_by_key(
        &format!("retry-{}", attempt.id),
        &harness.db_pool,
    )
    .await
    .unwrap()
    .expect("retry job enqueued");
    assert_eq!(job.priority, dispatcher_core::kernel::jobs::JobPriority::High);
}

/// With off-peak honoring on, the retry time lands inside the weekday
/// 10:00–16:00 window of the configured timezone.
#[test_context(TestHarness)]
#[tokio::test]
async fn off_peak_clamp_lands_in_window(harness: &mut TestHarness) {
    let campaign = fixtures::create_campaign(&harness.db_pool, 2).await.unwrap();
    let contacts = fixtures::create_contacts(&harness.db_pool, campaign.id, 1)
        .await
        .unwrap();
    let log = fixtures::create_call_log(
        &harness.db_pool,
        Some(campaign.id),
        Some(contacts[0].id),
        CallStatus::NoAnswer,
        CallMetadata::default(),
    )
    .await
    .unwrap();

    let manager = RetryManager::new(harness.deps.clone());
    let attempt = manager
        .maybe_schedule_retry(&log, Some(&contacts[0]), FailureReason::NoAnswer, false)
        .await
        .unwrap()
        .expect("no_answer is retryable");

    let tz: Tz = "Asia/Kolkata".parse().unwrap();
    let local = attempt.scheduled_for.with_timezone(&tz);
    assert!(
        !matches!(local.weekday(), Weekday::Sat | Weekday::Sun),
        "retry on a weekend"
    );
    assert!(
        (10..16).contains(&local.hour()),
        "retry at {} outside the off-peak window",
        local.hour()
    );
}

/// Kinds that are never retried.
#[test_context(TestHarness)]
#[tokio::test]
async fn terminal_kinds_do_not_retry(harness: &mut TestHarness) {
    let campaign = fixtures::create_campaign(&harness.db_pool, 2).await.unwrap();
    let contacts = fixtures::create_contacts(&harness.db_pool, campaign.id, 1)
        .await
        .unwrap();
    let log = fixtures::create_call_log(
        &harness.db_pool,
        Some(campaign.id),
        Some(contacts[0].id),
        CallStatus::Failed,
        CallMetadata::default(),
    )
    .await
    .unwrap();

    let manager = RetryManager::without_off_peak(harness.deps.clone());
    for reason in [
        FailureReason::InvalidNumber,
        FailureReason::Blocked,
        FailureReason::ComplianceBlock,
    ] {
        let attempt = manager
            .maybe_schedule_retry(&log, Some(&contacts[0]), reason, false)
            .await
            .unwrap();
        assert!(attempt.is_none(), "{reason:?} must not retry");
    }
}

/// A failed retry is not auto-retried (cascade guard) unless forced.
#[test_context(TestHarness)]
#[tokio::test]
async fn failed_retry_is_not_auto_retried(harness: &mut TestHarness) {
    let campaign = fixtures::create_campaign(&harness.db_pool, 2).await.unwrap();
    let contacts = fixtures::create_contacts(&harness.db_pool, campaign.id, 1)
        .await
        .unwrap();
    let log = fixtures::create_call_log(
        &harness.db_pool,
        Some(campaign.id),
        Some(contacts[0].id),
        CallStatus::Busy,
        CallMetadata {
            is_retry: true,
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let manager = RetryManager::without_off_peak(harness.deps.clone());
    let auto = manager
        .maybe_schedule_retry(&log, Some(&contacts[0]), FailureReason::Busy, false)
        .await
        .unwrap();
    assert!(auto.is_none());

    let forced = manager
        .maybe_schedule_retry(&log, Some(&contacts[0]), FailureReason::Busy, true)
        .await
        .unwrap();
    assert!(forced.is_some(), "forced retries bypass the cascade guard");
}

/// The attempt budget for a kind caps scheduling.
#[test_context(TestHarness)]
#[tokio::test]
async fn retry_budget_is_capped_per_kind(harness: &mut TestHarness) {
    let campaign = fixtures::create_campaign(&harness.db_pool, 2).await.unwrap();
    let contacts = fixtures::create_contacts(&harness.db_pool, campaign.id, 1)
        .await
        .unwrap();

    // call_rejected allows a single retry.
    sqlx::query("UPDATE contacts SET retry_count = 1 WHERE id = $1")
        .bind(contacts[0].id)
        .execute(&harness.db_pool)
        .await
        .unwrap();
    let contact = dispatcher_core::domains::campaign::models::Contact::find_by_id(
        contacts[0].id,
        &harness.db_pool,
    )
    .await
    .unwrap()
    .unwrap();

    let log = fixtures::create_call_log(
        &harness.db_pool,
        Some(campaign.id),
        Some(contact.id),
        CallStatus::Canceled,
        CallMetadata::default(),
    )
    .await
    .unwrap();

    let manager = RetryManager::without_off_peak(harness.deps.clone());
    let attempt = manager
        .maybe_schedule_retry(&log, Some(&contact), FailureReason::CallRejected, false)
        .await
        .unwrap();
    assert!(attempt.is_none(), "budget of 1 already spent");
}
