//! Background sweeps that keep the concurrency state honest.
//!
//! - Lease janitor: drops set members whose lease key expired.
//! - Orphaned-reservation reaper: pushes aged ledger entries back to
//!   their origin waitlist and clamps the counter.
//! - Waitlist compactor: drops entries whose job is gone or settled.
//! - Reconciler: counter := |ledger| when they disagree (ledger wins).
//! - Invariant monitor: spot-checks `|leases| + reserved ≤ limit`.
//!
//! Every sweep has a wall-clock budget and resumes next tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;

use super::models::Campaign;
use super::waitlist::Priority;
use crate::kernel::jobs::{Job, JobStatus};
use crate::kernel::ServerDeps;

const LEASE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const LEASE_SWEEP_BUDGET: Duration = Duration::from_secs(5);
const LEASE_SWEEP_MAX_CAMPAIGNS: usize = 100;
const COMPACT_INTERVAL: Duration = Duration::from_secs(120);
const COMPACT_SAMPLE: i64 = 1_000;
const COMPACT_BUDGET: Duration = Duration::from_secs(2);
const RECONCILE_INTERVAL: Duration = Duration::from_secs(900);
const RECONCILE_RESAMPLE_DELAY: Duration = Duration::from_millis(150);
const RECONCILE_ALERT_DRIFT: i64 = 5;
const INVARIANT_INTERVAL: Duration = Duration::from_secs(30);

pub struct Janitor {
    deps: Arc<ServerDeps>,
    leader: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
}

impl Janitor {
    pub fn new(deps: Arc<ServerDeps>, leader: Arc<AtomicBool>) -> Self {
        Self {
            deps,
            leader,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub async fn run(self: Arc<Self>) {
        let lease = Arc::clone(&self);
        let compact = Arc::clone(&self);
        let reconcile = Arc::clone(&self);
        let invariant = Arc::clone(&self);
        tokio::join!(
            lease.loop_tick(LEASE_SWEEP_INTERVAL, "lease-sweep", |j| async move {
                j.lease_sweep_tick().await
            }),
            compact.loop_tick(COMPACT_INTERVAL, "compactor", |j| async move {
                j.compactor_tick().await
            }),
            reconcile.loop_tick(RECONCILE_INTERVAL, "reconciler", |j| async move {
                j.reconciler_tick().await
            }),
            invariant.loop_tick(INVARIANT_INTERVAL, "invariant-monitor", |j| async move {
                j.invariant_tick().await
            }),
        );
    }

    async fn loop_tick<F, Fut>(self: Arc<Self>, interval: Duration, name: &'static str, tick: F)
    where
        F: Fn(Arc<Self>) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        loop {
            tokio::time::sleep(interval).await;
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            if !self.leader.load(Ordering::SeqCst) {
                continue;
            }
            if let Err(e) = tick(Arc::clone(&self)).await {
                tracing::error!(sweep = name, error = %e, "janitor tick failed");
            }
        }
    }

    /// Stale members and orphaned reservations, one pass.
    pub async fn lease_sweep_tick(&self) -> Result<()> {
        let started = Instant::now();
        let campaigns = Campaign::find_active(&self.deps.db_pool).await?;

        for campaign in campaigns.iter().take(LEASE_SWEEP_MAX_CAMPAIGNS) {
            if started.elapsed() > LEASE_SWEEP_BUDGET {
                tracing::debug!("lease sweep budget exhausted; resuming next tick");
                break;
            }
            let id = campaign.id.to_string();

            // Campaigns mid-recovery own their lease set exclusively.
            if self.deps.cold_start.is_blocking(&id).await? {
                continue;
            }

            for member in self.deps.leases.members(&id).await? {
                if !self.deps.leases.member_alive(&id, &member).await? {
                    self.deps.leases.remove_member(&id, &member).await?;
                    tracing::info!(
                        campaign_id = %campaign.id,
                        member,
                        "removed stale lease member"
                    );
                }
            }

            let now_ms = Utc::now().timestamp_millis();
            for entry in self.deps.ledger.orphans(&id, now_ms).await? {
                if self.deps.ledger.requeue_orphan(&id, &entry).await? {
                    tracing::warn!(
                        campaign_id = %campaign.id,
                        job_key = entry.job_key,
                        age_ms = now_ms - entry.reserved_at_ms,
                        "orphaned reservation pushed back to waitlist"
                    );
                }
            }
        }
        Ok(())
    }

    /// Drop waitlist entries whose job record is gone or settled.
    pub async fn compactor_tick(&self) -> Result<()> {
        let started = Instant::now();
        let campaigns = Campaign::find_active(&self.deps.db_pool).await?;

        for campaign in campaigns {
            if started.elapsed() > COMPACT_BUDGET {
                break;
            }
            let id = campaign.id.to_string();
            for priority in [Priority::High, Priority::Normal] {
                for job_key in self.deps.waitlist.sample(&id, priority, COMPACT_SAMPLE).await? {
                    let job = Job::find_live_by_key(&job_key, &self.deps.db_pool).await?;
                    let drop = match &job {
                        None => true,
                        Some(job) => !matches!(job.status, JobStatus::Waiting | JobStatus::Pending),
                    };
                    if drop {
                        self.deps.waitlist.remove(&id, priority, &job_key).await?;
                        self.deps.waitlist.clear_marker(&id, &job_key).await?;
                        tracing::debug!(
                            campaign_id = %campaign.id,
                            job_key,
                            "compacted dead waitlist entry"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Counter↔ledger reconciliation. Two samples of the ledger taken
    /// briefly apart stop a live promotion from being mistaken for
    /// drift; the smaller sample wins on persistent disagreement.
    pub async fn reconciler_tick(&self) -> Result<()> {
        let campaigns = Campaign::find_active(&self.deps.db_pool).await?;
        for campaign in campaigns {
            let id = campaign.id.to_string();
            let counter = self.deps.ledger.reserved_count(&id).await?;
            let first = self.deps.ledger.ledger_count(&id).await?;
            if counter == first {
                continue;
            }
            tokio::time::sleep(RECONCILE_RESAMPLE_DELAY).await;
            let second = self.deps.ledger.ledger_count(&id).await?;
            if counter == second {
                continue;
            }

            let target = first.min(second);
            let drift = (counter - target).abs();
            self.deps.ledger.set_reserved(&id, target).await?;
            if drift > RECONCILE_ALERT_DRIFT {
                tracing::error!(
                    campaign_id = %campaign.id,
                    counter,
                    ledger = target,
                    drift,
                    "reservation counter drift exceeded alert threshold"
                );
            } else {
                tracing::info!(
                    campaign_id = %campaign.id,
                    counter,
                    ledger = target,
                    "reconciled reservation counter"
                );
            }
        }
        Ok(())
    }

    /// Capacity invariant spot-check; violations feed the breaker.
    pub async fn invariant_tick(&self) -> Result<()> {
        let campaigns = Campaign::find_active(&self.deps.db_pool).await?;
        for campaign in campaigns {
            let id = campaign.id.to_string();
            let limit = self.deps.leases.limit(&id).await?;
            if limit == 0 {
                continue;
            }
            let inflight = self.deps.leases.member_count(&id).await?;
            let reserved = self.deps.ledger.reserved_count(&id).await?;
            if inflight + reserved > limit {
                tracing::error!(
                    campaign_id = %campaign.id,
                    inflight,
                    reserved,
                    limit,
                    "capacity invariant violated"
                );
                self.deps.breaker.record_failure(&id).await?;
            }
        }
        Ok(())
    }
}
