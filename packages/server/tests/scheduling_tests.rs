//! Scheduler: business-hours adjustment, cancel/reschedule guards, and
//! recurrence expansion.

mod common;

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use common::TestHarness;
use dispatcher_core::domains::scheduling::models::{
    Recurring, RecurrenceFrequency, ScheduledCallStatus,
};
use dispatcher_core::domains::scheduling::service::{
    ScheduleCallRequest, ScheduledCallHandler, SchedulingService,
};
use dispatcher_core::kernel::jobs::{Job, JobHandler};
use test_context::test_context;
use uuid::Uuid;

fn kolkata(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
    let tz: Tz = "Asia/Kolkata".parse().unwrap();
    tz.with_ymd_and_hms(y, m, d, h, 0, 0)
        .unwrap()
        .with_timezone(&Utc)
}

/// Unique per call so assertions filtered by number never see rows
/// from sibling tests on the shared database.
fn unique_phone() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .subsec_nanos() as u64;
    format!("+91{:010}", 9_000_000_000u64 + nanos % 999_999_999)
}

fn base_request(scheduled_for: DateTime<Utc>) -> ScheduleCallRequest {
    ScheduleCallRequest {
        phone_number: unique_phone(),
        agent_id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        scheduled_for,
        timezone: Some("Asia/Kolkata".to_string()),
        business_hours: None,
        recurring: None,
        respect_business_hours: None,
        priority: None,
    }
}

/// Saturday 15:00 IST with 09:00–18:00 Mon–Fri hours lands on Monday
/// 09:00 IST.
#[test_context(TestHarness)]
#[tokio::test]
async fn saturday_adjusts_to_monday_morning(harness: &mut TestHarness) {
    let service = SchedulingService::new(harness.deps.clone());
    // 2026-08-08 is a Saturday.
    let call = service
        .schedule(base_request(kolkata(2026, 8, 8, 15)))
        .await
        .unwrap();

    let tz: Tz = "Asia/Kolkata".parse().unwrap();
    let local = call.scheduled_for.with_timezone(&tz);
    assert_eq!(local.weekday(), Weekday::Mon);
    assert_eq!((local.hour(), local.minute()), (9, 0));

    // The delayed job fires at the adjusted time.
    let job = Job::find_live_by_key(&call.job_key, &harness.db_pool)
        .await
        .unwrap()
        .expect("delayed job enqueued");
    assert_eq!(job.run_at, Some(call.scheduled_for));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn rejects_bad_timezone_and_past_times(harness: &mut TestHarness) {
    let service = SchedulingService::new(harness.deps.clone());

    let mut bad_tz = base_request(Utc::now() + chrono::Duration::hours(2));
    bad_tz.timezone = Some("Mars/Olympus".to_string());
    assert!(service.schedule(bad_tz).await.is_err());

    let past = base_request(Utc::now() - chrono::Duration::hours(1));
    assert!(service.schedule(past).await.is_err());
}

/// Cancel is idempotent and guarded: pending → cancelled, a second
/// cancel is a no-op, and the delayed job is gone.
#[test_context(TestHarness)]
#[tokio::test]
async fn cancel_is_idempotent(harness: &mut TestHarness) {
    let service = SchedulingService::new(harness.deps.clone());
    let call = service
        .schedule(base_request(kolkata(2026, 8, 10, 11)))
        .await
        .unwrap();

    let first = service.cancel(call.id).await.unwrap();
    assert_eq!(first.status, ScheduledCallStatus::Cancelled);
    let second = service.cancel(call.id).await.unwrap();
    assert_eq!(second.status, ScheduledCallStatus::Cancelled);

    assert!(Job::find_live_by_key(&call.job_key, &harness.db_pool)
        .await
        .unwrap()
        .is_none());
}

#[test_context(TestHarness)]
#[tokio::test]
async fn reschedule_moves_the_job(harness: &mut TestHarness) {
    let service = SchedulingService::new(harness.deps.clone());
    let call = service
        .schedule(base_request(kolkata(2026, 8, 10, 11)))
        .await
        .unwrap();

    let moved = service
        .reschedule(call.id, kolkata(2026, 8, 11, 14))
        .await
        .unwrap();
    assert_eq!(moved.scheduled_for, kolkata(2026, 8, 11, 14));

    let job = Job::find_live_by_key(&call.job_key, &harness.db_pool)
        .await
        .unwrap()
        .expect("replacement job enqueued");
    assert_eq!(job.run_at, Some(moved.scheduled_for));
}

/// The delayed-job runner picks a due scheduled call up by itself and
/// places the call. A promoted job fires without waiting for its
/// original run time.
#[test_context(TestHarness)]
#[tokio::test]
async fn runner_fires_promoted_scheduled_call(harness: &mut TestHarness) {
    use dispatcher_core::kernel::jobs::{JobRunner, JobRunnerConfig};
    use dispatcher_core::server::app::build_job_registry;
    use std::sync::Arc;

    let service = SchedulingService::new(harness.deps.clone());
    let call = service
        .schedule(base_request(kolkata(2026, 8, 12, 11)))
        .await
        .unwrap();

    // Move the far-future job to run now (delayed-job promote).
    assert!(harness.deps.job_queue.promote(&call.job_key).await.unwrap());

    let runner = JobRunner::with_config(
        Arc::new(build_job_registry()),
        harness.deps.clone(),
        JobRunnerConfig {
            batch_size: 5,
            poll_interval: std::time::Duration::from_millis(100),
            worker_id: "test-runner".to_string(),
        },
    );
    let shutdown = runner.shutdown_handle();
    let task = tokio::spawn(runner.run());

    let fired = harness
        .wait_for(|| async { harness.telephony.initiated_count().await >= 1 })
        .await;
    shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
    let _ = task.await;
    assert!(fired, "runner executed the promoted job");

    let done = dispatcher_core::domains::scheduling::models::ScheduledCall::find_by_id(
        call.id,
        &harness.db_pool,
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(done.status, ScheduledCallStatus::Completed);
}

/// Firing a daily recurring call creates its successor with the next
/// occurrence count, until max occurrences.
#[test_context(TestHarness)]
#[tokio::test]
async fn recurring_call_spawns_successor(harness: &mut TestHarness) {
    let service = SchedulingService::new(harness.deps.clone());
    let mut req = base_request(kolkata(2026, 8, 10, 11));
    req.recurring = Some(Recurring {
        frequency: RecurrenceFrequency::Daily,
        interval: 1,
        end_date: None,
        max_occurrences: Some(3),
        current_occurrence: 0,
    });
    let call = service.schedule(req).await.unwrap();

    // Fire the job by hand.
    let job = Job::find_live_by_key(&call.job_key, &harness.db_pool)
        .await
        .unwrap()
        .unwrap();
    ScheduledCallHandler
        .execute(&job, harness.deps.clone())
        .await
        .unwrap();

    assert_eq!(harness.telephony.initiated_count().await, 1);

    let fired = dispatcher_core::domains::scheduling::models::ScheduledCall::find_by_id(
        call.id,
        &harness.db_pool,
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(fired.status, ScheduledCallStatus::Completed);

    let (successors,): (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FROM scheduled_calls
        WHERE phone_number = $1 AND status = 'pending'
        "#,
    )
    .bind(&call.phone_number)
    .fetch_one(&harness.db_pool)
    .await
    .unwrap();
    assert_eq!(successors, 1, "one successor scheduled");
}
