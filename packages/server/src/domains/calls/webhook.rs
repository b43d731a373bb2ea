//! Carrier status-webhook processing.
//!
//! Webhooks are the authoritative end-of-life signal for leases: a
//! terminal status force-releases the slot (token-checked for late
//! duplicates), settles the contact, classifies the failure for retry,
//! and checks campaign completion. An `in-progress` status upgrades the
//! pre-dial lease to an active one.

use std::sync::Arc;

use serde::Deserialize;
use uuid::Uuid;

use super::models::{CallLog, CallMetadata, CallStatus, FailureReason};
use crate::common::AppError;
use crate::domains::campaign::lease::ForceReleased;
use crate::domains::campaign::models::{Campaign, CampaignStatus, Contact, ContactStatus};
use crate::domains::retry::service::RetryManager;
use crate::kernel::{ServerDeps, ADHOC_CAMPAIGN};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookMetadata {
    pub lease_token: Option<String>,
    pub call_id: Option<String>,
    pub campaign_id: Option<Uuid>,
    #[serde(default)]
    pub voicemail_detected: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusWebhook {
    pub call_sid: Option<String>,
    pub status: String,
    pub call_log_id: Option<Uuid>,
    pub duration_sec: Option<i32>,
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub metadata: WebhookMetadata,
}

#[derive(Debug, Clone)]
pub struct WebhookOutcome {
    pub call_log_id: Uuid,
    pub status: CallStatus,
    pub released: ForceReleased,
    pub retry_scheduled: bool,
}

#[derive(Clone)]
pub struct WebhookProcessor {
    deps: Arc<ServerDeps>,
}

impl WebhookProcessor {
    pub fn new(deps: Arc<ServerDeps>) -> Self {
        Self { deps }
    }

    pub async fn process(&self, payload: StatusWebhook) -> Result<WebhookOutcome, AppError> {
        let log = self.resolve_call_log(&payload).await?;
        let Some(status) = CallStatus::from_webhook(&payload.status) else {
            return Err(AppError::validation("status", "unknown call status"));
        };

        if status == CallStatus::InProgress {
            self.handle_answer(&log).await?;
            return Ok(WebhookOutcome {
                call_log_id: log.id,
                status,
                released: ForceReleased::Nothing,
                retry_scheduled: false,
            });
        }
        if !status.is_terminal() {
            return Ok(WebhookOutcome {
                call_log_id: log.id,
                status,
                released: ForceReleased::Nothing,
                retry_scheduled: false,
            });
        }

        self.settle_terminal(&log, status, &payload).await
    }

    async fn resolve_call_log(&self, payload: &StatusWebhook) -> Result<CallLog, AppError> {
        if let Some(id) = payload.call_log_id {
            if let Some(log) = CallLog::find_by_id(id, &self.deps.db_pool).await? {
                return Ok(log);
            }
        }
        if let Some(sid) = &payload.call_sid {
            if let Some(log) = CallLog::find_by_vendor_sid(sid, &self.deps.db_pool).await? {
                return Ok(log);
            }
        }
        Err(AppError::NotFound("call log".to_string()))
    }

    fn bucket(log: &CallLog) -> String {
        log.campaign_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| ADHOC_CAMPAIGN.to_string())
    }

    /// Carrier answered: exchange pre-dial for active and persist the
    /// new token so terminal webhooks can prove ownership.
    async fn handle_answer(&self, log: &CallLog) -> Result<(), AppError> {
        let bucket = Self::bucket(log);
        let call_id = log.id.to_string();

        if let Some(pre_token) = &log.metadata.pre_lease_token {
            match self
                .deps
                .leases
                .upgrade_to_active(&bucket, &call_id, pre_token)
                .await?
            {
                Some(active_token) => {
                    let metadata = CallMetadata {
                        lease_token: Some(active_token),
                        pre_lease_token: None,
                        ..log.metadata.0.clone()
                    };
                    CallLog::update_metadata(log.id, &metadata, &self.deps.db_pool).await?;
                    // Real upgrade traffic proves the registry is sane
                    // again after a cold start.
                    self.deps.cold_start.mark_done(&bucket).await?;
                }
                None => {
                    tracing::warn!(
                        metric = "upgrade_failed",
                        call_log_id = %log.id,
                        "pre-dial lease gone at answer; call continues unleased"
                    );
                }
            }
        }
        CallLog::mark_in_progress(log.id, &self.deps.db_pool).await?;
        Ok(())
    }

    async fn settle_terminal(
        &self,
        log: &CallLog,
        status: CallStatus,
        payload: &StatusWebhook,
    ) -> Result<WebhookOutcome, AppError> {
        let bucket = Self::bucket(log);
        let voicemail = payload.metadata.voicemail_detected;
        let (contact_status, failure_reason) =
            classify_terminal(status, payload.failure_reason.as_deref(), voicemail);

        let closed = CallLog::close(
            log.id,
            status,
            payload.duration_sec,
            failure_reason,
            &self.deps.db_pool,
        )
        .await?;

        // Token check: a payload that presents a token must present the
        // right one, or it is a stale duplicate and must not release.
        let released = if self.token_mismatch(log, payload) {
            tracing::warn!(
                call_log_id = %log.id,
                "webhook lease token mismatch; skipping release"
            );
            ForceReleased::Nothing
        } else {
            self.deps
                .leases
                .force_release(&bucket, &log.id.to_string(), true)
                .await?
        };

        let mut retry_scheduled = false;
        if closed {
            retry_scheduled = self
                .settle_contact(log, contact_status, failure_reason, voicemail)
                .await?;
        } else {
            tracing::debug!(call_log_id = %log.id, "duplicate terminal webhook");
        }

        Ok(WebhookOutcome {
            call_log_id: log.id,
            status,
            released,
            retry_scheduled,
        })
    }

    fn token_mismatch(&self, log: &CallLog, payload: &StatusWebhook) -> bool {
        let Some(provided) = &payload.metadata.lease_token else {
            // Vendor-originated webhooks carry no token; trust them.
            return false;
        };
        let active = log.metadata.lease_token.as_deref();
        let pre = log.metadata.pre_lease_token.as_deref();
        Some(provided.as_str()) != active && Some(provided.as_str()) != pre
    }

    /// Update the contact, run retry classification, bump campaign
    /// counters, and complete the campaign when nothing is left.
    async fn settle_contact(
        &self,
        log: &CallLog,
        contact_status: ContactStatus,
        failure_reason: Option<FailureReason>,
        voicemail: bool,
    ) -> Result<bool, AppError> {
        let Some(contact_id) = log.contact_id else {
            return Ok(false);
        };
        let Some(contact) = Contact::find_by_id(contact_id, &self.deps.db_pool).await? else {
            return Ok(false);
        };

        let effective_status = if voicemail {
            ContactStatus::Voicemail
        } else {
            contact_status
        };
        Contact::mark_outcome(
            contact_id,
            effective_status,
            failure_reason,
            &self.deps.db_pool,
        )
        .await?;

        let mut retry_scheduled = false;
        if let Some(reason) = failure_reason {
            let retry = RetryManager::new(self.deps.clone())
                .maybe_schedule_retry(log, Some(&contact), reason, false)
                .await?;
            retry_scheduled = retry.is_some();
        }

        if let Some(campaign_id) = log.campaign_id {
            Campaign::record_contact_outcome(campaign_id, effective_status, &self.deps.db_pool)
                .await?;
            if !retry_scheduled
                && Campaign::all_contacts_settled(campaign_id, &self.deps.db_pool).await?
            {
                if Campaign::set_status(campaign_id, CampaignStatus::Completed, &self.deps.db_pool)
                    .await?
                {
                    tracing::info!(campaign_id = %campaign_id, "campaign completed");
                }
            }
        }
        Ok(retry_scheduled)
    }
}

/// Map a terminal call status (plus carrier detail) onto the contact
/// outcome and retry-classification kind.
fn classify_terminal(
    status: CallStatus,
    failure_reason: Option<&str>,
    voicemail: bool,
) -> (ContactStatus, Option<FailureReason>) {
    match status {
        CallStatus::Completed if voicemail => (ContactStatus::Voicemail, Some(FailureReason::Voicemail)),
        CallStatus::Completed => (ContactStatus::Completed, None),
        CallStatus::NoAnswer => (ContactStatus::Failed, Some(FailureReason::NoAnswer)),
        CallStatus::Busy => (ContactStatus::Failed, Some(FailureReason::Busy)),
        CallStatus::Canceled => (ContactStatus::Failed, Some(FailureReason::CallRejected)),
        CallStatus::Failed => {
            let reason = failure_reason
                .and_then(FailureReason::parse)
                .unwrap_or(FailureReason::NetworkError);
            (ContactStatus::Failed, Some(reason))
        }
        // Non-terminal statuses never reach here.
        _ => (ContactStatus::Failed, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_with_voicemail_classifies_as_voicemail() {
        let (status, reason) = classify_terminal(CallStatus::Completed, None, true);
        assert_eq!(status, ContactStatus::Voicemail);
        assert_eq!(reason, Some(FailureReason::Voicemail));
    }

    #[test]
    fn failed_parses_carrier_reason() {
        let (_, reason) = classify_terminal(CallStatus::Failed, Some("rate_limited"), false);
        assert_eq!(reason, Some(FailureReason::RateLimited));
    }

    #[test]
    fn failed_with_unknown_reason_defaults_to_network_error() {
        let (_, reason) = classify_terminal(CallStatus::Failed, Some("gremlins"), false);
        assert_eq!(reason, Some(FailureReason::NetworkError));
    }
}
