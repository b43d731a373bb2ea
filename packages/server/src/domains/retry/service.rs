//! Retry manager: classifies failed calls and schedules retry dials.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::models::{RetryAttempt, RetryStatus};
use super::policy::{clamp_to_off_peak, compute_delay, policy_for};
use crate::common::AppError;
use crate::domains::calls::models::{CallLog, FailureReason};
use crate::domains::calls::outgoing::{OutgoingCallParams, OutgoingCallService};
use crate::domains::campaign::models::Contact;
use crate::kernel::jobs::{Job, JobHandler, JobPriority, JobSpec};
use crate::kernel::ServerDeps;

pub const RETRY_DIAL_JOB_TYPE: &str = "retry-dial";

pub fn retry_job_key(retry_attempt_id: Uuid) -> String {
    format!("retry-{}", retry_attempt_id)
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetryDialArgs {
    retry_attempt_id: Uuid,
    contact_id: Option<Uuid>,
    campaign_id: Option<Uuid>,
}

#[derive(Clone)]
pub struct RetryManager {
    deps: Arc<ServerDeps>,
    /// When set, retry times are clamped into the off-peak window.
    honor_off_peak: bool,
}

impl RetryManager {
    pub fn new(deps: Arc<ServerDeps>) -> Self {
        Self {
            deps,
            honor_off_peak: true,
        }
    }

    pub fn without_off_peak(deps: Arc<ServerDeps>) -> Self {
        Self {
            deps,
            honor_off_peak: false,
        }
    }

    /// Classify a failed call and, when the kind is retryable and the
    /// attempt budget allows, persist a retry attempt and enqueue the
    /// retry dial. Returns the attempt, or `None` when no retry is due.
    ///
    /// A failed retry is never auto-retried (cascade guard) unless
    /// `forced`.
    pub async fn maybe_schedule_retry(
        &self,
        call_log: &CallLog,
        contact: Option<&Contact>,
        reason: FailureReason,
        forced: bool,
    ) -> Result<Option<RetryAttempt>> {
        if call_log.metadata.is_retry && !forced {
            tracing::debug!(call_log_id = %call_log.id, "not retrying a failed retry");
            return Ok(None);
        }

        let Some(policy) = policy_for(reason) else {
            return Ok(None);
        };

        let prior_attempts = contact.map(|c| c.retry_count).unwrap_or(0);
        if prior_attempts >= policy.max_attempts {
            tracing::debug!(
                call_log_id = %call_log.id,
                ?reason,
                prior_attempts,
                "retry budget exhausted"
            );
            return Ok(None);
        }

        let attempt_number = prior_attempts + 1;
        let delay = compute_delay(&policy, attempt_number);
        let mut scheduled_for = Utc::now() + delay;
        if self.honor_off_peak {
            let tz: Tz = self
                .deps
                .config
                .default_timezone
                .parse()
                .unwrap_or(chrono_tz::UTC);
            scheduled_for = clamp_to_off_peak(scheduled_for, tz);
        }

        let Some(attempt) = RetryAttempt::insert(
            call_log.id,
            contact.map(|c| c.id),
            attempt_number,
            scheduled_for,
            reason,
            &self.deps.db_pool,
        )
        .await?
        else {
            // The (call log, attempt) pair exists: a duplicate webhook
            // already scheduled this retry.
            return Ok(None);
        };

        let args = serde_json::to_value(RetryDialArgs {
            retry_attempt_id: attempt.id,
            contact_id: contact.map(|c| c.id),
            campaign_id: call_log.campaign_id,
        })?;
        self.deps
            .job_queue
            .enqueue(
                JobSpec::new(retry_job_key(attempt.id), RETRY_DIAL_JOB_TYPE, args)
                    .priority(JobPriority::High)
                    .run_at(scheduled_for)
                    .max_attempts(self.deps.config.queue_retry_attempts),
            )
            .await?;

        if let Some(contact) = contact {
            Contact::bump_retry(contact.id, scheduled_for, &self.deps.db_pool).await?;
        }

        tracing::info!(
            call_log_id = %call_log.id,
            retry_attempt_id = %attempt.id,
            attempt_number,
            ?reason,
            scheduled_for = %scheduled_for,
            "retry scheduled"
        );
        Ok(Some(attempt))
    }

    /// Cancel a pending retry and its job.
    pub async fn cancel(&self, retry_attempt_id: Uuid) -> Result<bool> {
        let cancelled = RetryAttempt::transition_from_pending(
            retry_attempt_id,
            RetryStatus::Cancelled,
            &self.deps.db_pool,
        )
        .await?;
        if cancelled {
            self.deps
                .job_queue
                .cancel(&retry_job_key(retry_attempt_id))
                .await?;
        }
        Ok(cancelled)
    }
}

/// Fires when a retry attempt's scheduled time arrives.
pub struct RetryDialHandler;

#[async_trait]
impl JobHandler for RetryDialHandler {
    fn job_type(&self) -> &'static str {
        RETRY_DIAL_JOB_TYPE
    }

    async fn execute(&self, job: &Job, deps: Arc<ServerDeps>) -> Result<(), AppError> {
        let args: RetryDialArgs = job
            .parse_args()
            .map_err(|e| AppError::Fatal(e.context("bad retry-dial args")))?;

        let Some(attempt) =
            RetryAttempt::find_by_id(args.retry_attempt_id, &deps.db_pool).await?
        else {
            tracing::warn!(retry_attempt_id = %args.retry_attempt_id, "retry attempt vanished");
            return Ok(());
        };
        if !RetryAttempt::transition_from_pending(
            attempt.id,
            RetryStatus::Processing,
            &deps.db_pool,
        )
        .await?
        {
            // Cancelled or already handled.
            return Ok(());
        }

        // A cancelled contact aborts the retry without dialing.
        let contact = match args.contact_id {
            Some(id) => Contact::find_by_id(id, &deps.db_pool).await?,
            None => None,
        };
        if let Some(contact) = &contact {
            if contact.status == crate::domains::campaign::models::ContactStatus::Skipped {
                RetryAttempt::settle(attempt.id, RetryStatus::Cancelled, &deps.db_pool).await?;
                return Ok(());
            }
        }

        let original = CallLog::find_by_id(attempt.original_call_log_id, &deps.db_pool).await?;
        let Some(original) = original else {
            RetryAttempt::settle(attempt.id, RetryStatus::Failed, &deps.db_pool).await?;
            return Err(AppError::NotFound("original call log".to_string()));
        };

        let outgoing = OutgoingCallService::new(deps.clone());
        let result = outgoing
            .initiate_call(OutgoingCallParams {
                phone_number: original.to_phone.clone(),
                user_id: original.user_id,
                agent_id: original.agent_id,
                campaign_id: original.campaign_id,
                contact_id: args.contact_id,
                call_log_id: None,
                pre_lease_token: None,
                skip_slot_acquisition: false,
                is_retry: true,
            })
            .await;

        match result {
            Ok(call_log_id) => {
                if let Some(contact) = &contact {
                    Contact::mark_calling(contact.id, call_log_id, &deps.db_pool).await?;
                }
                RetryAttempt::settle(attempt.id, RetryStatus::Completed, &deps.db_pool).await?;
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                // Roll the attempt back so the runner's next try finds it.
                sqlx::query(
                    "UPDATE retry_attempts SET status = 'pending', updated_at = NOW() WHERE id = $1",
                )
                .bind(attempt.id)
                .execute(&deps.db_pool)
                .await
                .map_err(anyhow::Error::from)?;
                Err(e)
            }
            Err(e) => {
                RetryAttempt::settle(attempt.id, RetryStatus::Failed, &deps.db_pool).await?;
                Err(e)
            }
        }
    }
}
