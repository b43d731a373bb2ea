//! Outgoing-call collaborator.
//!
//! Single entry point for starting an outbound call. Campaign workers
//! arrive holding a pre-dial lease (`skip_slot_acquisition`), so this
//! service must not touch the lease registry for them; every other
//! caller gets accounting against the adhoc bucket or the campaign.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use super::models::{CallDirection, CallLog, CallMetadata, CallStatus, FailureReason};
use super::telephony::InitiateCallRequest;
use crate::common::{phone::is_e164, AppError};
use crate::kernel::{ServerDeps, ADHOC_CAMPAIGN};

#[derive(Debug, Clone)]
pub struct OutgoingCallParams {
    pub phone_number: String,
    pub user_id: Uuid,
    pub agent_id: Uuid,
    pub campaign_id: Option<Uuid>,
    pub contact_id: Option<Uuid>,
    /// Pre-allocated call-log id (the campaign worker already used it
    /// as the lease member).
    pub call_log_id: Option<Uuid>,
    /// Token of the pre-dial lease the caller holds.
    pub pre_lease_token: Option<String>,
    /// True when the caller owns the slot; the service must not acquire.
    pub skip_slot_acquisition: bool,
    pub is_retry: bool,
}

#[derive(Clone)]
pub struct OutgoingCallService {
    deps: Arc<ServerDeps>,
}

impl OutgoingCallService {
    pub fn new(deps: Arc<ServerDeps>) -> Self {
        Self { deps }
    }

    fn slot_bucket(campaign_id: Option<Uuid>) -> String {
        campaign_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| ADHOC_CAMPAIGN.to_string())
    }

    fn status_callback(&self) -> String {
        format!(
            "{}/exotel/webhook/status",
            self.deps.config.webhook_base_url.trim_end_matches('/')
        )
    }

    /// Start an outbound call; returns the call-log id.
    pub async fn initiate_call(&self, params: OutgoingCallParams) -> Result<Uuid, AppError> {
        if !is_e164(&params.phone_number) {
            return Err(AppError::validation("phoneNumber", "must be E.164"));
        }

        let bucket = Self::slot_bucket(params.campaign_id);
        if self.deps.breaker.is_open(&bucket).await? {
            return Err(AppError::UpstreamUnavailable(
                "circuit breaker open".to_string(),
            ));
        }

        let call_log_id = params.call_log_id.unwrap_or_else(Uuid::new_v4);
        let call_id = call_log_id.to_string();

        // Slot accounting, unless the caller is already the slot holder.
        let acquired_token = if params.skip_slot_acquisition {
            None
        } else {
            match self.deps.leases.acquire_pre_dial(&bucket, &call_id).await? {
                Some(token) => Some(token),
                None => return Err(AppError::CapacityExceeded),
            }
        };

        let metadata = CallMetadata {
            lease_token: None,
            pre_lease_token: params.pre_lease_token.clone().or(acquired_token.clone()),
            call_id: Some(call_id.clone()),
            campaign_id: params.campaign_id,
            voicemail_detected: false,
            is_retry: params.is_retry,
        };
        let log = CallLog {
            id: call_log_id,
            direction: CallDirection::Outbound,
            from_phone: self.deps.config.caller_phone.clone(),
            to_phone: params.phone_number.clone(),
            status: CallStatus::Initiated,
            duration_sec: None,
            started_at: None,
            ended_at: None,
            campaign_id: params.campaign_id,
            contact_id: params.contact_id,
            user_id: params.user_id,
            agent_id: params.agent_id,
            vendor_sid: None,
            failure_reason: None,
            metadata: sqlx::types::Json(metadata),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        log.insert(&self.deps.db_pool).await?;

        let request = InitiateCallRequest {
            to: params.phone_number.clone(),
            status_callback: Some(self.status_callback()),
            custom_field: Some(call_id.clone()),
        };
        match self.deps.telephony.initiate(&request).await {
            Ok(vendor_sid) => {
                CallLog::set_vendor_sid(call_log_id, &vendor_sid, &self.deps.db_pool).await?;
                Ok(call_log_id)
            }
            Err(e) => {
                // Give the slot back before surfacing the failure.
                if let Some(token) = acquired_token {
                    let member = crate::domains::campaign::keys::pre_dial_member(&call_id);
                    self.deps
                        .leases
                        .release(&bucket, &member, &token, true)
                        .await?;
                }
                let reason = match &e {
                    AppError::Validation { .. } => FailureReason::InvalidNumber,
                    AppError::UpstreamUnavailable(_) => {
                        self.deps.breaker.record_failure(&bucket).await?;
                        FailureReason::ApiUnavailable
                    }
                    _ => FailureReason::NetworkError,
                };
                CallLog::close(
                    call_log_id,
                    CallStatus::Failed,
                    None,
                    Some(reason),
                    &self.deps.db_pool,
                )
                .await?;
                Err(e)
            }
        }
    }

    /// Cancel a live call at the vendor, if it has one.
    pub async fn cancel_call(&self, call_log_id: Uuid) -> Result<(), AppError> {
        let Some(log) = CallLog::find_by_id(call_log_id, &self.deps.db_pool).await? else {
            return Err(AppError::NotFound("call log".to_string()));
        };
        if let Some(sid) = &log.vendor_sid {
            self.deps.telephony.cancel(sid).await?;
        }
        Ok(())
    }
}
