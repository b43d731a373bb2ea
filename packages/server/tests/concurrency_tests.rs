//! Campaign concurrency: capacity cap under burst, pause/resume, and
//! the capacity invariant under load.

mod common;

use common::{fixtures, TestHarness};
use dispatcher_core::domains::calls::webhook::{StatusWebhook, WebhookMetadata, WebhookProcessor};
use dispatcher_core::domains::campaign::promoter::Promoter;
use dispatcher_core::domains::campaign::service::CampaignService;
use dispatcher_core::domains::campaign::worker::CampaignWorker;
use test_context::test_context;
use uuid::Uuid;

async fn settle_initiated_calls(
    harness: &TestHarness,
    settled: &mut std::collections::HashSet<Uuid>,
) -> anyhow::Result<()> {
    let processor = WebhookProcessor::new(harness.deps.clone());
    for req in harness.telephony.initiated().await {
        let Some(call_log_id) = req.custom_field.as_deref().and_then(|f| f.parse().ok()) else {
            continue;
        };
        if !settled.insert(call_log_id) {
            continue;
        }
        processor
            .process(StatusWebhook {
                call_sid: None,
                status: "completed".to_string(),
                call_log_id: Some(call_log_id),
                duration_sec: Some(12),
                failure_reason: None,
                metadata: WebhookMetadata::default(),
            })
            .await?;
    }
    Ok(())
}

/// Burst of 10 contacts against limit 3: every sampled instant holds
/// `|leases| + reserved ≤ 3`, and exactly 10 initiations happen.
#[test_context(TestHarness)]
#[tokio::test]
async fn capacity_cap_under_burst(harness: &mut TestHarness) {
    let campaign = fixtures::create_campaign(&harness.db_pool, 3).await.unwrap();
    let contacts = fixtures::create_contacts(&harness.db_pool, campaign.id, 10)
        .await
        .unwrap();
    assert_eq!(contacts.len(), 10);

    let service = CampaignService::new(harness.deps.clone());
    let enqueued = service.start(campaign.id).await.unwrap();
    assert_eq!(enqueued, 10);

    let promoter = Promoter::new(harness.deps.clone(), harness.leader.clone());
    let worker = CampaignWorker::new(harness.deps.clone(), campaign.id, harness.leader.clone());
    let worker_task = tokio::spawn(worker.run());

    let id = campaign.id.to_string();
    let mut settled = std::collections::HashSet::new();
    let mut max_observed = 0i64;

    for _ in 0..400 {
        promoter.try_promote(campaign.id).await.unwrap();

        let inflight = harness.deps.leases.member_count(&id).await.unwrap();
        let reserved = harness.deps.ledger.reserved_count(&id).await.unwrap();
        max_observed = max_observed.max(inflight + reserved);
        assert!(
            inflight + reserved <= 3,
            "capacity invariant violated: {inflight} + {reserved} > 3"
        );

        settle_initiated_calls(harness, &mut settled).await.unwrap();
        if harness.telephony.initiated_count().await == 10 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    worker_task.abort();

    assert_eq!(
        harness.telephony.initiated_count().await,
        10,
        "every contact dials exactly once"
    );
    assert!(max_observed > 0, "the pipeline actually used slots");

    // Drain the remaining webhooks; the campaign should complete.
    settle_initiated_calls(harness, &mut settled).await.unwrap();
    let done = harness
        .wait_for(|| async {
            dispatcher_core::domains::campaign::models::Campaign::find_by_id(
                campaign.id,
                &harness.db_pool,
            )
            .await
            .ok()
            .flatten()
            .map(|c| {
                c.status == dispatcher_core::domains::campaign::models::CampaignStatus::Completed
            })
            .unwrap_or(false)
        })
        .await;
    assert!(done, "campaign completes after all contacts settle");
}

/// Pause stops promotion; resume restarts it. Existing state is
/// untouched by the pause.
#[test_context(TestHarness)]
#[tokio::test]
async fn pause_blocks_promotion_and_resume_restores_it(harness: &mut TestHarness) {
    let campaign = fixtures::create_campaign(&harness.db_pool, 2).await.unwrap();
    fixtures::create_contacts(&harness.db_pool, campaign.id, 4)
        .await
        .unwrap();

    let service = CampaignService::new(harness.deps.clone());
    service.start(campaign.id).await.unwrap();
    service.pause(campaign.id).await.unwrap();

    let promoter = Promoter::new(harness.deps.clone(), harness.leader.clone());
    let batch = promoter.try_promote(campaign.id).await.unwrap();
    assert!(batch.is_none(), "no promotion while paused");

    let id = campaign.id.to_string();
    assert_eq!(harness.deps.ledger.reserved_count(&id).await.unwrap(), 0);

    service.resume(campaign.id).await.unwrap();
    let batch = promoter.try_promote(campaign.id).await.unwrap().unwrap();
    assert_eq!(batch.count, 2, "resume promotes up to the limit");
}

/// Duplicate enqueues of the same contact are swallowed: one dial job,
/// one dispatch.
#[test_context(TestHarness)]
#[tokio::test]
async fn duplicate_enqueue_is_swallowed(harness: &mut TestHarness) {
    let campaign = fixtures::create_campaign(&harness.db_pool, 2).await.unwrap();
    let contacts = fixtures::create_contacts(&harness.db_pool, campaign.id, 1)
        .await
        .unwrap();

    let service = CampaignService::new(harness.deps.clone());
    service.start(campaign.id).await.unwrap();

    // Second enqueue of the same contact: contact-level dedup hits.
    let again = service
        .enqueue_contact(
            campaign.id,
            contacts[0].id,
            dispatcher_core::domains::campaign::waitlist::Priority::Normal,
        )
        .await
        .unwrap();
    assert!(!again, "duplicate enqueue reports as swallowed");

    let id = campaign.id.to_string();
    let (high, normal) = harness.deps.waitlist.lengths(&id).await.unwrap();
    assert_eq!(high + normal, 1, "waitlist holds a single entry");
}
