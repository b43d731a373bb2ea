//! Campaign worker: consumes promoted dial jobs one at a time per
//! campaign, acquires the pre-dial lease, and hands the call to the
//! telephony collaborator.
//!
//! ```text
//! READY ── verify gate ──▶ RESERVED ── acquirePreDial ──▶ PRE_DIAL
//!          (seq, age ≤ 15s)           │
//!                                     ├─ initiate ─ answered(webhook) ─▶ ACTIVE ─▶ DONE
//!                                     │                  (renew every 10 s until upgrade)
//!                                     └─ failed ─▶ release, claim reservation, retry classify
//! ```
//!
//! Concurrency 1 per campaign keeps the limit check in the promotion
//! script from racing local dispatch; a process-wide rate limiter caps
//! carrier dispatches.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use super::cold_start::ColdStartState;
use super::keys;
use super::lease::{PRE_DIAL_MAX_SECS, RENEW_QUANTUM_SECS};
use super::models::{Campaign, CampaignStatus, Contact, ContactStatus};
use super::service::{dial_job_key, CAMPAIGN_DIAL_JOB_TYPE};
use super::waitlist::Priority;
use crate::common::AppError;
use crate::domains::calls::models::FailureReason;
use crate::domains::calls::outgoing::{OutgoingCallParams, OutgoingCallService};
use crate::kernel::jobs::Job;
use crate::kernel::kv::slot_channel;
use crate::kernel::ServerDeps;

/// Promotions older than this are rejected and repaired.
const PROMOTION_MAX_AGE_MS: i64 = 15_000;
/// Gate violations tolerated before the hard-sync path re-parks the job.
const MAX_GATE_REPAIRS: i32 = 5;
const IDLE_POLL: Duration = Duration::from_millis(750);
const SUPERVISE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DialJobArgs {
    campaign_id: Uuid,
    contact_id: Uuid,
    #[serde(default)]
    promote_seq: Option<i64>,
    #[serde(default)]
    promoted_at: Option<i64>,
    #[serde(default)]
    gate_repairs: i32,
}

/// How one dial job ended, from the run loop's point of view.
enum DialOutcome {
    /// Work finished (dialed, or dropped legitimately).
    Done,
    /// Job was re-parked into the waitlist; leave its row alone.
    Reparked,
    /// Error; the runner-side accounting decides the retry.
    Retry(AppError),
}

/// Spawns and reaps one `CampaignWorker` per active campaign while this
/// instance is the leader.
pub struct CampaignWorkerPool {
    deps: Arc<ServerDeps>,
    leader: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
}

impl CampaignWorkerPool {
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

    pub async fn run(self) {
        let mut workers: HashMap<Uuid, tokio::task::JoinHandle<()>> = HashMap::new();
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                for (_, handle) in workers.drain() {
                    handle.abort();
                }
                return;
            }
            workers.retain(|_, handle| !handle.is_finished());

            if self.leader.load(Ordering::SeqCst) {
                match Campaign::find_active(&self.deps.db_pool).await {
                    Ok(campaigns) => {
                        let active: Vec<Uuid> = campaigns.iter().map(|c| c.id).collect();
                        for campaign_id in &active {
                            workers.entry(*campaign_id).or_insert_with(|| {
                                let worker = CampaignWorker {
                                    deps: self.deps.clone(),
                                    campaign_id: *campaign_id,
                                    leader: self.leader.clone(),
                                    shutdown: self.shutdown.clone(),
                                };
                                tokio::spawn(worker.run())
                            });
                        }
                        workers.retain(|id, handle| {
                            if active.contains(id) {
                                true
                            } else {
                                handle.abort();
                                false
                            }
                        });
                    }
                    Err(e) => tracing::error!(error = %e, "worker pool: campaign list failed"),
                }
            }
            tokio::time::sleep(SUPERVISE_INTERVAL).await;
        }
    }
}

pub struct CampaignWorker {
    deps: Arc<ServerDeps>,
    campaign_id: Uuid,
    leader: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
}

impl CampaignWorker {
    pub fn new(deps: Arc<ServerDeps>, campaign_id: Uuid, leader: Arc<AtomicBool>) -> Self {
        Self {
            deps,
            campaign_id,
            leader,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn run(self) {
        let worker_id = format!("campaign-worker-{}", self.campaign_id);
        tracing::info!(campaign_id = %self.campaign_id, "campaign worker starting");
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            if !self.leader.load(Ordering::SeqCst) {
                tokio::time::sleep(IDLE_POLL).await;
                continue;
            }

            let job = match self
                .deps
                .job_queue
                .claim_dial_job(&worker_id, CAMPAIGN_DIAL_JOB_TYPE, self.campaign_id)
                .await
            {
                Ok(job) => job,
                Err(e) => {
                    tracing::error!(campaign_id = %self.campaign_id, error = %e, "dial job claim failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            let Some(job) = job else {
                tokio::time::sleep(IDLE_POLL).await;
                continue;
            };

            match self.process(&job).await {
                Ok(DialOutcome::Done) => {
                    if let Err(e) = self.deps.job_queue.mark_succeeded(job.id).await {
                        tracing::error!(job_id = %job.id, error = %e, "failed to mark dial job done");
                    }
                }
                Ok(DialOutcome::Reparked) => {}
                Ok(DialOutcome::Retry(e)) | Err(DialOutcomeError(e)) => {
                    let retryable = e.is_retryable();
                    if let Err(mark_err) = self
                        .deps
                        .job_queue
                        .mark_failed(job.id, &e.to_string(), retryable)
                        .await
                    {
                        tracing::error!(job_id = %job.id, error = %mark_err, "failed to mark dial job failed");
                    }
                }
            }
        }
        tracing::info!(campaign_id = %self.campaign_id, "campaign worker stopped");
    }

    async fn process(&self, job: &Job) -> Result<DialOutcome, DialOutcomeError> {
        let args: DialJobArgs = job
            .parse_args()
            .map_err(|e| AppError::Fatal(e.context("bad dial job args")))?;
        let id = args.campaign_id.to_string();
        let job_key = dial_job_key(args.contact_id);

        // Pre-checks: the job is dropped (reservation reclaimed) when
        // its contact or campaign no longer wants a call.
        let contact = Contact::find_by_id(args.contact_id, &self.deps.db_pool)
            .await
            .map_err(AppError::Fatal)?;
        let Some(contact) = contact else {
            self.drop_job(&id, &job_key, "contact missing").await?;
            return Ok(DialOutcome::Done);
        };
        if contact.status.is_terminal() {
            self.drop_job(&id, &job_key, "contact already settled").await?;
            return Ok(DialOutcome::Done);
        }

        let campaign = Campaign::find_by_id(args.campaign_id, &self.deps.db_pool)
            .await
            .map_err(AppError::Fatal)?;
        let Some(campaign) = campaign else {
            self.drop_job(&id, &job_key, "campaign missing").await?;
            return Ok(DialOutcome::Done);
        };
        if campaign.status != CampaignStatus::Active {
            return Ok(DialOutcome::Retry(AppError::Transient(
                "campaign not active".to_string(),
            )));
        }

        if self
            .deps
            .cold_start
            .ensure_ready(args.campaign_id)
            .await
            .map_err(AppError::Fatal)?
            == ColdStartState::Blocking
        {
            return Ok(DialOutcome::Retry(AppError::Transient(
                "cold-start recovery in progress".to_string(),
            )));
        }

        // Promotion-gate guards.
        if let Some(violation) = self.gate_violation(&id, &args).await? {
            return self.repair_gate(job, &id, &job_key, &args, violation).await;
        }

        self.deps.dial_limiter.acquire().await;

        // Two-phase lease: pre-dial slot first, reservation claimed on
        // success.
        let call_log_id = Uuid::new_v4();
        let call_id = call_log_id.to_string();
        let pre_token = self
            .deps
            .leases
            .acquire_pre_dial(&id, &call_id)
            .await
            .map_err(AppError::Fatal)?;
        let Some(pre_token) = pre_token else {
            self.deps
                .ledger
                .claim(&id, &job_key)
                .await
                .map_err(AppError::Fatal)?;
            self.publish_slot(&id).await?;
            tracing::warn!(
                metric = "no_slot_delays",
                campaign_id = %args.campaign_id,
                job_key,
                "no slot available at dial time"
            );
            return Ok(DialOutcome::Retry(AppError::CapacityExceeded));
        };
        self.deps
            .ledger
            .claim(&id, &job_key)
            .await
            .map_err(AppError::Fatal)?;

        Contact::mark_calling(args.contact_id, call_log_id, &self.deps.db_pool)
            .await
            .map_err(AppError::Fatal)?;

        let outgoing = OutgoingCallService::new(self.deps.clone());
        let result = outgoing
            .initiate_call(OutgoingCallParams {
                phone_number: contact.phone_number.clone(),
                user_id: campaign.user_id,
                agent_id: campaign.agent_id,
                campaign_id: Some(args.campaign_id),
                contact_id: Some(args.contact_id),
                call_log_id: Some(call_log_id),
                pre_lease_token: Some(pre_token.clone()),
                skip_slot_acquisition: true,
                is_retry: false,
            })
            .await;

        match result {
            Ok(_) => {
                self.spawn_pre_dial_renewal(id.clone(), call_id, pre_token);
                Ok(DialOutcome::Done)
            }
            Err(e) => {
                // The dial window failed: give the slot back, then let
                // the classification decide what happens to the contact.
                let member = keys::pre_dial_member(&call_id);
                self.deps
                    .leases
                    .release(&id, &member, &pre_token, true)
                    .await
                    .map_err(AppError::Fatal)?;

                match &e {
                    AppError::Validation { .. } => {
                        self.settle_failed_contact(
                            args.campaign_id,
                            args.contact_id,
                            FailureReason::InvalidNumber,
                        )
                        .await?;
                        Ok(DialOutcome::Done)
                    }
                    _ => {
                        if matches!(e, AppError::UpstreamUnavailable(_)) {
                            self.deps
                                .breaker
                                .record_failure(&id)
                                .await
                                .map_err(AppError::Fatal)?;
                        }
                        Contact::reset_to_pending(args.contact_id, &self.deps.db_pool)
                            .await
                            .map_err(AppError::Fatal)?;
                        Ok(DialOutcome::Retry(e))
                    }
                }
            }
        }
    }

    /// Which gate rule, if any, rejects this job.
    async fn gate_violation(
        &self,
        id: &str,
        args: &DialJobArgs,
    ) -> Result<Option<&'static str>, DialOutcomeError> {
        let Some(seq) = args.promote_seq else {
            return Ok(Some("missing promotion gate"));
        };
        if seq < 0 {
            // Hard-sync sentinel that never got re-promoted.
            return Ok(Some("sentinel promotion gate"));
        }
        if let Some(gate) = self
            .deps
            .ledger
            .current_gate(id)
            .await
            .map_err(AppError::Fatal)?
        {
            if seq < gate {
                return Ok(Some("stale promotion gate"));
            }
        }
        match args.promoted_at {
            Some(at) if Utc::now().timestamp_millis() - at <= PROMOTION_MAX_AGE_MS => Ok(None),
            _ => Ok(Some("expired promotion")),
        }
    }

    /// Gate repair: bounded retries, then the hard-sync path pushes the
    /// job back through the waitlist for a fresh promotion epoch.
    async fn repair_gate(
        &self,
        job: &Job,
        id: &str,
        job_key: &str,
        args: &DialJobArgs,
        violation: &'static str,
    ) -> Result<DialOutcome, DialOutcomeError> {
        let repairs = args.gate_repairs + 1;
        if repairs < MAX_GATE_REPAIRS {
            self.deps
                .job_queue
                .patch_args(job.id, &json!({ "gateRepairs": repairs }))
                .await
                .map_err(AppError::Fatal)?;
            tracing::debug!(
                metric = "gate_repairs",
                campaign_id = %args.campaign_id,
                job_key,
                repairs,
                violation,
                "gate violation; retrying"
            );
            return Ok(DialOutcome::Retry(AppError::Transient(format!(
                "gate violation: {violation}"
            ))));
        }

        // Free the reservation (if one is still held) and re-enter the
        // waitlist under the sentinel epoch.
        self.deps
            .ledger
            .claim(id, job_key)
            .await
            .map_err(AppError::Fatal)?;
        self.deps
            .job_queue
            .repark(
                job.id,
                &json!({ "promoteSeq": -1, "promotedAt": null, "gateRepairs": 0 }),
            )
            .await
            .map_err(AppError::Fatal)?;
        self.deps
            .waitlist
            .requeue_front(id, job_key, Priority::Normal)
            .await
            .map_err(AppError::Fatal)?;
        tracing::warn!(
            metric = "gate_hard_sync",
            campaign_id = %args.campaign_id,
            job_key,
            violation,
            "gate repair budget exhausted; job re-parked"
        );
        Ok(DialOutcome::Reparked)
    }

    async fn drop_job(
        &self,
        id: &str,
        job_key: &str,
        why: &'static str,
    ) -> Result<(), DialOutcomeError> {
        self.deps
            .ledger
            .claim(id, job_key)
            .await
            .map_err(AppError::Fatal)?;
        self.deps
            .waitlist
            .clear_marker(id, job_key)
            .await
            .map_err(AppError::Fatal)?;
        tracing::debug!(campaign_id = id, job_key, why, "dial job dropped");
        Ok(())
    }

    async fn settle_failed_contact(
        &self,
        campaign_id: Uuid,
        contact_id: Uuid,
        reason: FailureReason,
    ) -> Result<(), DialOutcomeError> {
        Contact::mark_outcome(
            contact_id,
            ContactStatus::Failed,
            Some(reason),
            &self.deps.db_pool,
        )
        .await
        .map_err(AppError::Fatal)?;
        Campaign::record_contact_outcome(campaign_id, ContactStatus::Failed, &self.deps.db_pool)
            .await
            .map_err(AppError::Fatal)?;
        if Campaign::all_contacts_settled(campaign_id, &self.deps.db_pool)
            .await
            .map_err(AppError::Fatal)?
        {
            Campaign::set_status(campaign_id, CampaignStatus::Completed, &self.deps.db_pool)
                .await
                .map_err(AppError::Fatal)?;
        }
        Ok(())
    }

    async fn publish_slot(&self, id: &str) -> Result<(), DialOutcomeError> {
        let mut conn = self.deps.kv.conn();
        redis::cmd("PUBLISH")
            .arg(slot_channel(id))
            .arg("reservation-released")
            .query_async::<()>(&mut conn)
            .await
            .map_err(AppError::from)?;
        Ok(())
    }

    /// Keep the pre-dial lease alive while the carrier rings, up to the
    /// hard cap. The loop ends when the lease is upgraded, released, or
    /// expired; renewal then reports false.
    fn spawn_pre_dial_renewal(&self, id: String, call_id: String, token: String) {
        let leases = self.deps.leases.clone();
        tokio::spawn(async move {
            let member = keys::pre_dial_member(&call_id);
            loop {
                tokio::time::sleep(Duration::from_secs(RENEW_QUANTUM_SECS as u64)).await;
                match leases.renew(&id, &member, &token, PRE_DIAL_MAX_SECS).await {
                    Ok(true) => {}
                    Ok(false) => return,
                    Err(e) => {
                        tracing::debug!(error = %e, member, "pre-dial renewal errored; stopping");
                        return;
                    }
                }
            }
        });
    }
}

/// Newtype so `?` on infrastructure errors maps into the retry path.
struct DialOutcomeError(AppError);

impl From<AppError> for DialOutcomeError {
    fn from(e: AppError) -> Self {
        Self(e)
    }
}
