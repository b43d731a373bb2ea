//! Stuck-call monitor.
//!
//! A call that rings forever means a lost webhook or a wedged carrier
//! leg. Calls still ringing past the threshold get a best-effort status
//! fetch from the vendor; when that is unavailable they are closed as
//! no-answer and their lease force-released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;

use crate::domains::calls::models::{CallLog, CallStatus, FailureReason};
use crate::domains::campaign::models::{Campaign, Contact, ContactStatus};
use crate::kernel::{ServerDeps, ADHOC_CAMPAIGN};

const SWEEP_INTERVAL: Duration = Duration::from_secs(120);
const STUCK_THRESHOLD: chrono::Duration = chrono::Duration::minutes(3);
const SWEEP_LIMIT: i64 = 200;

pub struct StuckCallMonitor {
    deps: Arc<ServerDeps>,
    leader: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
}

impl StuckCallMonitor {
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
        loop {
            tokio::time::sleep(SWEEP_INTERVAL).await;
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            if !self.leader.load(Ordering::SeqCst) {
                continue;
            }
            if let Err(e) = self.tick().await {
                tracing::error!(error = %e, "stuck-call sweep failed");
            }
        }
    }

    pub async fn tick(&self) -> Result<()> {
        let cutoff = Utc::now() - STUCK_THRESHOLD;
        let stuck = CallLog::find_stuck(cutoff, SWEEP_LIMIT, &self.deps.db_pool).await?;

        for log in stuck {
            // Best effort: maybe the vendor knows the real outcome.
            let vendor_status = match &log.vendor_sid {
                Some(sid) => self.deps.telephony.fetch_status(sid).await.ok(),
                None => None,
            };

            let (status, duration) = match &vendor_status {
                Some(v) => match CallStatus::from_webhook(&v.status) {
                    Some(s) if s.is_terminal() => (s, v.duration_sec),
                    // Vendor says it is genuinely still live; leave it.
                    Some(_) => continue,
                    None => (CallStatus::NoAnswer, None),
                },
                None => (CallStatus::NoAnswer, None),
            };

            let reason = match status {
                CallStatus::NoAnswer => Some(FailureReason::NoAnswer),
                CallStatus::Busy => Some(FailureReason::Busy),
                CallStatus::Failed => Some(FailureReason::NetworkError),
                _ => None,
            };
            let closed =
                CallLog::close(log.id, status, duration, reason, &self.deps.db_pool).await?;
            if !closed {
                continue;
            }

            let bucket = log
                .campaign_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| ADHOC_CAMPAIGN.to_string());
            self.deps
                .leases
                .force_release(&bucket, &log.id.to_string(), true)
                .await?;

            let contact_outcome = if status == CallStatus::Completed {
                ContactStatus::Completed
            } else {
                ContactStatus::Failed
            };
            if let Some(contact_id) = log.contact_id {
                Contact::mark_outcome(contact_id, contact_outcome, reason, &self.deps.db_pool)
                    .await?;
            }
            if let Some(campaign_id) = log.campaign_id {
                Campaign::record_contact_outcome(campaign_id, contact_outcome, &self.deps.db_pool)
                    .await?;
            }

            tracing::warn!(
                call_log_id = %log.id,
                final_status = ?status,
                vendor_confirmed = vendor_status.is_some(),
                "reconciled stuck call"
            );
        }
        Ok(())
    }
}
