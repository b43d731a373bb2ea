//! Campaign lifecycle operations: start, pause, resume, contact
//! enqueue/cancel.

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use super::keys;
use super::models::{Campaign, CampaignStatus, Contact};
use super::waitlist::{EnqueueOutcome, Priority};
use crate::common::AppError;
use crate::kernel::jobs::JobSpec;
use crate::kernel::kv::slot_channel;
use crate::kernel::ServerDeps;

pub const CAMPAIGN_DIAL_JOB_TYPE: &str = "campaign-dial";

pub fn dial_job_key(contact_id: Uuid) -> String {
    format!("dial-{}", contact_id)
}

#[derive(Clone)]
pub struct CampaignService {
    deps: Arc<ServerDeps>,
}

impl CampaignService {
    pub fn new(deps: Arc<ServerDeps>) -> Self {
        Self { deps }
    }

    /// Activate a campaign: seed the limit key and enqueue every
    /// pending contact into the dial pipeline.
    pub async fn start(&self, campaign_id: Uuid) -> Result<usize, AppError> {
        let Some(campaign) = Campaign::find_by_id(campaign_id, &self.deps.db_pool).await? else {
            return Err(AppError::NotFound("campaign".to_string()));
        };
        if campaign.concurrent_limit < 1 {
            return Err(AppError::validation("concurrentLimit", "must be ≥ 1"));
        }

        let id = campaign_id.to_string();
        self.deps
            .leases
            .set_limit(&id, campaign.concurrent_limit as i64)
            .await?;
        Campaign::set_status(campaign_id, CampaignStatus::Active, &self.deps.db_pool).await?;

        let contacts = Contact::find_pending(campaign_id, &self.deps.db_pool).await?;
        let mut enqueued = 0;
        for contact in &contacts {
            if self
                .enqueue_contact(campaign_id, contact.id, Priority::Normal)
                .await?
            {
                enqueued += 1;
            }
        }
        tracing::info!(campaign_id = %campaign_id, enqueued, "campaign started");
        Ok(enqueued)
    }

    /// Park a dial job for the contact and put its key on the waitlist.
    /// Returns false when the enqueue was a duplicate.
    pub async fn enqueue_contact(
        &self,
        campaign_id: Uuid,
        contact_id: Uuid,
        priority: Priority,
    ) -> Result<bool, AppError> {
        let id = campaign_id.to_string();
        let job_key = dial_job_key(contact_id);

        let args = json!({
            "campaignId": campaign_id.to_string(),
            "contactId": contact_id.to_string(),
        });
        self.deps
            .job_queue
            .park(JobSpec::new(&job_key, CAMPAIGN_DIAL_JOB_TYPE, args).max_attempts(5))
            .await?;

        let outcome = self
            .deps
            .waitlist
            .enqueue(&id, &job_key, Some(&contact_id.to_string()), priority)
            .await?;
        Ok(outcome == EnqueueOutcome::Enqueued)
    }

    /// Pause: the `paused` key gates the promoter; live calls finish
    /// normally.
    pub async fn pause(&self, campaign_id: Uuid) -> Result<(), AppError> {
        let id = campaign_id.to_string();
        let mut conn = self.deps.kv.conn();
        redis::cmd("SET")
            .arg(keys::paused(&id))
            .arg("1")
            .query_async::<()>(&mut conn)
            .await
            .map_err(AppError::from)?;
        Campaign::set_status(campaign_id, CampaignStatus::Paused, &self.deps.db_pool).await?;
        tracing::info!(campaign_id = %campaign_id, "campaign paused");
        Ok(())
    }

    /// Resume: drop the pause gate and nudge the promoter.
    pub async fn resume(&self, campaign_id: Uuid) -> Result<(), AppError> {
        let id = campaign_id.to_string();
        let mut conn = self.deps.kv.conn();
        redis::cmd("DEL")
            .arg(keys::paused(&id))
            .query_async::<()>(&mut conn)
            .await
            .map_err(AppError::from)?;
        Campaign::set_status(campaign_id, CampaignStatus::Active, &self.deps.db_pool).await?;
        redis::cmd("PUBLISH")
            .arg(slot_channel(&id))
            .arg("resume")
            .query_async::<()>(&mut conn)
            .await
            .map_err(AppError::from)?;
        tracing::info!(campaign_id = %campaign_id, "campaign resumed");
        Ok(())
    }

    pub async fn is_paused(&self, campaign_id: &str) -> Result<bool, AppError> {
        let mut conn = self.deps.kv.conn();
        let exists: i64 = redis::cmd("EXISTS")
            .arg(keys::paused(campaign_id))
            .query_async(&mut conn)
            .await
            .map_err(AppError::from)?;
        Ok(exists == 1)
    }

    /// Cancel a contact: terminal status, marker cleared, parked job
    /// cancelled. A job already promoted aborts in the worker pre-check.
    pub async fn cancel_contact(&self, contact_id: Uuid) -> Result<bool, AppError> {
        let Some(contact) = Contact::find_by_id(contact_id, &self.deps.db_pool).await? else {
            return Err(AppError::NotFound("contact".to_string()));
        };
        let cancelled = Contact::cancel(contact_id, &self.deps.db_pool).await?;
        if cancelled {
            let id = contact.campaign_id.to_string();
            let job_key = dial_job_key(contact_id);
            self.deps.waitlist.clear_marker(&id, &job_key).await?;
            self.deps.job_queue.cancel(&job_key).await?;
        }
        Ok(cancelled)
    }
}
