//! Scheduled-call service: persistence, business-hours adjustment,
//! recurrence expansion, and the job handler that fires due calls.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Months, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::business_hours::adjust_forward;
use super::models::{
    BusinessHours, Recurring, RecurrenceFrequency, ScheduledCall, ScheduledCallStatus,
};
use crate::common::{phone::is_e164, AppError};
use crate::domains::calls::outgoing::{OutgoingCallParams, OutgoingCallService};
use crate::kernel::jobs::{Job, JobHandler, JobPriority, JobSpec};
use crate::kernel::ServerDeps;

pub const SCHEDULED_CALL_JOB_TYPE: &str = "scheduled-call";

pub fn scheduled_job_key(id: Uuid) -> String {
    format!("sched-{}", id)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleCallRequest {
    pub phone_number: String,
    pub agent_id: Uuid,
    pub user_id: Uuid,
    pub scheduled_for: DateTime<Utc>,
    pub timezone: Option<String>,
    pub business_hours: Option<BusinessHours>,
    pub recurring: Option<Recurring>,
    /// Defaults to true; explicit false skips the adjustment.
    pub respect_business_hours: Option<bool>,
    pub priority: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScheduledCallArgs {
    scheduled_call_id: Uuid,
}

#[derive(Clone)]
pub struct SchedulingService {
    deps: Arc<ServerDeps>,
}

impl SchedulingService {
    pub fn new(deps: Arc<ServerDeps>) -> Self {
        Self { deps }
    }

    fn default_business_hours(&self, timezone: &str) -> BusinessHours {
        BusinessHours {
            start: self.deps.config.business_hours_start,
            end: self.deps.config.business_hours_end,
            timezone: timezone.to_string(),
            days_of_week: vec![1, 2, 3, 4, 5],
        }
    }

    /// Validate, adjust, persist, and hand the call to the delayed-job
    /// runner.
    pub async fn schedule(&self, req: ScheduleCallRequest) -> Result<ScheduledCall, AppError> {
        if !is_e164(&req.phone_number) {
            return Err(AppError::validation("phoneNumber", "must be E.164"));
        }

        let timezone = req
            .timezone
            .clone()
            .unwrap_or_else(|| self.deps.config.default_timezone.clone());
        if timezone.parse::<Tz>().is_err() {
            return Err(AppError::validation("timezone", "unknown IANA timezone"));
        }

        if req.scheduled_for <= Utc::now() {
            return Err(AppError::validation(
                "scheduledFor",
                "must be in the future",
            ));
        }

        if let Some(recurring) = &req.recurring {
            if recurring.interval < 1 {
                return Err(AppError::validation("recurring.interval", "must be ≥ 1"));
            }
        }

        let respect = req.respect_business_hours.unwrap_or(true);
        let hours = req
            .business_hours
            .clone()
            .unwrap_or_else(|| self.default_business_hours(&timezone));
        let scheduled_for = if respect {
            adjust_forward(req.scheduled_for, &hours)
        } else {
            req.scheduled_for
        };

        let id = Uuid::new_v4();
        let call = ScheduledCall {
            id,
            phone_number: req.phone_number,
            agent_id: req.agent_id,
            user_id: req.user_id,
            scheduled_for,
            timezone,
            status: ScheduledCallStatus::Pending,
            business_hours: respect.then(|| sqlx::types::Json(hours)),
            recurring: req.recurring.map(sqlx::types::Json),
            job_key: scheduled_job_key(id),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        call.insert(&self.deps.db_pool).await?;

        let priority = match req.priority.as_deref() {
            Some("high") => JobPriority::High,
            _ => JobPriority::Normal,
        };
        let args = serde_json::to_value(ScheduledCallArgs {
            scheduled_call_id: id,
        })
        .map_err(anyhow::Error::from)?;
        self.deps
            .job_queue
            .enqueue(
                JobSpec::new(&call.job_key, SCHEDULED_CALL_JOB_TYPE, args)
                    .priority(priority)
                    .run_at(scheduled_for)
                    .max_attempts(self.deps.config.queue_retry_attempts),
            )
            .await?;

        tracing::info!(
            scheduled_call_id = %id,
            scheduled_for = %scheduled_for,
            "call scheduled"
        );
        Ok(call)
    }

    /// Idempotent cancel; only `pending` records transition.
    pub async fn cancel(&self, id: Uuid) -> Result<ScheduledCall, AppError> {
        let Some(call) = ScheduledCall::find_by_id(id, &self.deps.db_pool).await? else {
            return Err(AppError::NotFound("scheduled call".to_string()));
        };
        match call.status {
            ScheduledCallStatus::Pending => {
                ScheduledCall::transition_from_pending(
                    id,
                    ScheduledCallStatus::Cancelled,
                    &self.deps.db_pool,
                )
                .await?;
                self.deps.job_queue.cancel(&call.job_key).await?;
                ScheduledCall::find_by_id(id, &self.deps.db_pool)
                    .await?
                    .ok_or_else(|| AppError::NotFound("scheduled call".to_string()))
            }
            // Repeated cancel is a no-op.
            ScheduledCallStatus::Cancelled => Ok(call),
            _ => Err(AppError::Conflict(format!(
                "scheduled call is {:?}",
                call.status
            ))),
        }
    }

    /// Move a pending call to a new time, re-running validation and
    /// business-hours adjustment.
    pub async fn reschedule(
        &self,
        id: Uuid,
        new_time: DateTime<Utc>,
    ) -> Result<ScheduledCall, AppError> {
        let Some(call) = ScheduledCall::find_by_id(id, &self.deps.db_pool).await? else {
            return Err(AppError::NotFound("scheduled call".to_string()));
        };
        if call.status != ScheduledCallStatus::Pending {
            return Err(AppError::Conflict(format!(
                "scheduled call is {:?}",
                call.status
            )));
        }
        if new_time <= Utc::now() {
            return Err(AppError::validation(
                "scheduledFor",
                "must be in the future",
            ));
        }

        let adjusted = match &call.business_hours {
            Some(hours) => adjust_forward(new_time, hours),
            None => new_time,
        };
        ScheduledCall::update_scheduled_for(id, adjusted, &self.deps.db_pool).await?;

        // Replace the delayed job: cancel the live one, enqueue anew
        // under the same key (the key is only unique among live jobs).
        self.deps.job_queue.cancel(&call.job_key).await?;
        let args = serde_json::to_value(ScheduledCallArgs {
            scheduled_call_id: id,
        })
        .map_err(anyhow::Error::from)?;
        self.deps
            .job_queue
            .enqueue(
                JobSpec::new(&call.job_key, SCHEDULED_CALL_JOB_TYPE, args)
                    .run_at(adjusted)
                    .max_attempts(self.deps.config.queue_retry_attempts),
            )
            .await?;

        ScheduledCall::find_by_id(id, &self.deps.db_pool)
            .await?
            .ok_or_else(|| AppError::NotFound("scheduled call".to_string()))
    }

    /// Create the follow-up occurrence of a recurring call, if the
    /// recurrence has room left.
    async fn spawn_successor(&self, call: &ScheduledCall) -> Result<Option<ScheduledCall>> {
        let Some(recurring) = &call.recurring else {
            return Ok(None);
        };
        let recurring = &recurring.0;

        let next_time = next_occurrence(call.scheduled_for, recurring.frequency, recurring.interval);
        let next_count = recurring.current_occurrence + 1;

        if let Some(end) = recurring.end_date {
            if next_time > end {
                return Ok(None);
            }
        }
        if let Some(max) = recurring.max_occurrences {
            if next_count >= max {
                return Ok(None);
            }
        }

        let adjusted = match &call.business_hours {
            Some(hours) => adjust_forward(next_time, hours),
            None => next_time,
        };

        let id = Uuid::new_v4();
        let successor = ScheduledCall {
            id,
            phone_number: call.phone_number.clone(),
            agent_id: call.agent_id,
            user_id: call.user_id,
            scheduled_for: adjusted,
            timezone: call.timezone.clone(),
            status: ScheduledCallStatus::Pending,
            business_hours: call.business_hours.clone(),
            recurring: Some(sqlx::types::Json(Recurring {
                current_occurrence: next_count,
                ..recurring.clone()
            })),
            job_key: scheduled_job_key(id),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        successor.insert(&self.deps.db_pool).await?;

        let args = serde_json::to_value(ScheduledCallArgs {
            scheduled_call_id: id,
        })?;
        self.deps
            .job_queue
            .enqueue(
                JobSpec::new(&successor.job_key, SCHEDULED_CALL_JOB_TYPE, args).run_at(adjusted),
            )
            .await?;

        tracing::info!(
            scheduled_call_id = %call.id,
            successor_id = %id,
            occurrence = next_count,
            scheduled_for = %adjusted,
            "recurring successor created"
        );
        Ok(Some(successor))
    }
}

pub fn next_occurrence(
    from: DateTime<Utc>,
    frequency: RecurrenceFrequency,
    interval: u32,
) -> DateTime<Utc> {
    match frequency {
        RecurrenceFrequency::Daily => from + Duration::days(interval as i64),
        RecurrenceFrequency::Weekly => from + Duration::weeks(interval as i64),
        RecurrenceFrequency::Monthly => from
            .checked_add_months(Months::new(interval))
            .unwrap_or(from),
    }
}

/// Fires when a scheduled call's time arrives.
pub struct ScheduledCallHandler;

#[async_trait]
impl JobHandler for ScheduledCallHandler {
    fn job_type(&self) -> &'static str {
        SCHEDULED_CALL_JOB_TYPE
    }

    async fn execute(&self, job: &Job, deps: Arc<ServerDeps>) -> Result<(), AppError> {
        let args: ScheduledCallArgs = job
            .parse_args()
            .map_err(|e| AppError::Fatal(e.context("bad scheduled-call args")))?;

        let Some(call) = ScheduledCall::find_by_id(args.scheduled_call_id, &deps.db_pool).await?
        else {
            tracing::warn!(scheduled_call_id = %args.scheduled_call_id, "scheduled call vanished");
            return Ok(());
        };
        // Re-read and guard: a cancel or reschedule that raced the
        // firing wins.
        if !ScheduledCall::transition_from_pending(
            call.id,
            ScheduledCallStatus::Processing,
            &deps.db_pool,
        )
        .await?
        {
            tracing::debug!(scheduled_call_id = %call.id, status = ?call.status, "skipping non-pending scheduled call");
            return Ok(());
        }

        let service = SchedulingService::new(deps.clone());
        let outgoing = OutgoingCallService::new(deps.clone());
        let result = outgoing
            .initiate_call(OutgoingCallParams {
                phone_number: call.phone_number.clone(),
                user_id: call.user_id,
                agent_id: call.agent_id,
                campaign_id: None,
                contact_id: None,
                call_log_id: None,
                pre_lease_token: None,
                skip_slot_acquisition: false,
                is_retry: false,
            })
            .await;

        match result {
            Ok(_call_log_id) => {
                ScheduledCall::settle(call.id, ScheduledCallStatus::Completed, &deps.db_pool)
                    .await?;
                service.spawn_successor(&call).await?;
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                // Back to pending so the runner retry can re-claim it.
                sqlx::query(
                    "UPDATE scheduled_calls SET status = 'pending', updated_at = NOW() WHERE id = $1",
                )
                .bind(call.id)
                .execute(&deps.db_pool)
                .await
                .map_err(anyhow::Error::from)?;
                Err(e)
            }
            Err(e) => {
                ScheduledCall::settle(call.id, ScheduledCallStatus::Failed, &deps.db_pool).await?;
                // A failed one-shot still advances the recurrence.
                service.spawn_successor(&call).await?;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monthly_recurrence_adds_calendar_months() {
        let from = Utc::now();
        let next = next_occurrence(from, RecurrenceFrequency::Monthly, 2);
        assert!(next > from);
        let days = (next - from).num_days();
        assert!((59..=62).contains(&days), "got {days} days");
    }

    #[test]
    fn weekly_recurrence_is_exact() {
        let from = Utc::now();
        let next = next_occurrence(from, RecurrenceFrequency::Weekly, 3);
        assert_eq!((next - from).num_days(), 21);
    }
}
