//! Telephony collaborator contract and adapters.
//!
//! The core only needs three operations from the vendor: initiate,
//! cancel, and a best-effort status fetch. Everything else arrives via
//! status webhooks.

use std::sync::Arc;

use async_trait::async_trait;
use exotel::{ConnectCallRequest, ExotelError, ExotelService};
use tokio::sync::Mutex;

use crate::common::AppError;

#[derive(Debug, Clone)]
pub struct InitiateCallRequest {
    /// Destination in E.164.
    pub to: String,
    /// Webhook URL for status callbacks.
    pub status_callback: Option<String>,
    /// Opaque correlation payload echoed back by the vendor.
    pub custom_field: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VendorCallStatus {
    pub status: String,
    pub duration_sec: Option<i32>,
    pub recording_url: Option<String>,
}

#[async_trait]
pub trait TelephonyClient: Send + Sync {
    /// Start an outbound call; returns the vendor call sid.
    async fn initiate(&self, req: &InitiateCallRequest) -> Result<String, AppError>;

    async fn cancel(&self, vendor_sid: &str) -> Result<(), AppError>;

    async fn fetch_status(&self, vendor_sid: &str) -> Result<VendorCallStatus, AppError>;
}

// ============================================================================
// Exotel adapter
// ============================================================================

pub struct ExotelTelephony {
    service: ExotelService,
}

impl ExotelTelephony {
    pub fn new(service: ExotelService) -> Self {
        Self { service }
    }

    fn map_error(err: ExotelError) -> AppError {
        match err {
            // 4xx: the request itself is bad (invalid number, blocked
            // destination); never retried.
            ExotelError::Api { status, body } if (400..500).contains(&status) && status != 429 => {
                AppError::validation("phoneNumber", format!("carrier rejected ({status}): {body}"))
            }
            ExotelError::Api { status: 429, .. } => {
                AppError::Transient("carrier rate limited".to_string())
            }
            ExotelError::Api { status, .. } => {
                AppError::UpstreamUnavailable(format!("carrier returned {status}"))
            }
            ExotelError::Http(e) => AppError::Transient(format!("carrier request failed: {e}")),
            ExotelError::Parse(e) => AppError::UpstreamUnavailable(format!("carrier response: {e}")),
        }
    }
}

#[async_trait]
impl TelephonyClient for ExotelTelephony {
    async fn initiate(&self, req: &InitiateCallRequest) -> Result<String, AppError> {
        let call = self
            .service
            .connect_call(&ConnectCallRequest {
                to: req.to.clone(),
                status_callback: req.status_callback.clone(),
                url: None,
                custom_field: req.custom_field.clone(),
            })
            .await
            .map_err(Self::map_error)?;
        Ok(call.sid)
    }

    async fn cancel(&self, vendor_sid: &str) -> Result<(), AppError> {
        self.service
            .hangup_call(vendor_sid)
            .await
            .map_err(Self::map_error)
    }

    async fn fetch_status(&self, vendor_sid: &str) -> Result<VendorCallStatus, AppError> {
        let call = self
            .service
            .get_call(vendor_sid)
            .await
            .map_err(Self::map_error)?;
        Ok(VendorCallStatus {
            status: call.status.clone(),
            duration_sec: call.duration_secs().map(|d| d as i32),
            recording_url: call.recording_url,
        })
    }
}

// ============================================================================
// Test double
// ============================================================================

/// Scripted behavior for the next initiate calls.
#[derive(Debug, Clone)]
pub enum MockDialOutcome {
    Accept,
    RejectInvalidNumber,
    Unavailable,
}

/// In-memory telephony client for tests: records every initiate and
/// hands out deterministic vendor sids.
#[derive(Default)]
pub struct MockTelephony {
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    initiated: Vec<InitiateCallRequest>,
    cancelled: Vec<String>,
    outcome: Option<MockDialOutcome>,
    statuses: std::collections::HashMap<String, VendorCallStatus>,
    counter: u64,
}

impl MockTelephony {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn initiated(&self) -> Vec<InitiateCallRequest> {
        self.state.lock().await.initiated.clone()
    }

    pub async fn initiated_count(&self) -> usize {
        self.state.lock().await.initiated.len()
    }

    pub async fn cancelled(&self) -> Vec<String> {
        self.state.lock().await.cancelled.clone()
    }

    pub async fn set_outcome(&self, outcome: MockDialOutcome) {
        self.state.lock().await.outcome = Some(outcome);
    }

    pub async fn set_status(&self, vendor_sid: &str, status: VendorCallStatus) {
        self.state
            .lock()
            .await
            .statuses
            .insert(vendor_sid.to_string(), status);
    }
}

#[async_trait]
impl TelephonyClient for MockTelephony {
    async fn initiate(&self, req: &InitiateCallRequest) -> Result<String, AppError> {
        let mut state = self.state.lock().await;
        match state.outcome.clone().unwrap_or(MockDialOutcome::Accept) {
            MockDialOutcome::Accept => {
                state.initiated.push(req.clone());
                state.counter += 1;
                Ok(format!("mock-sid-{}", state.counter))
            }
            MockDialOutcome::RejectInvalidNumber => Err(AppError::validation(
                "phoneNumber",
                "carrier rejected (400): invalid number",
            )),
            MockDialOutcome::Unavailable => {
                Err(AppError::UpstreamUnavailable("carrier returned 503".to_string()))
            }
        }
    }

    async fn cancel(&self, vendor_sid: &str) -> Result<(), AppError> {
        self.state.lock().await.cancelled.push(vendor_sid.to_string());
        Ok(())
    }

    async fn fetch_status(&self, vendor_sid: &str) -> Result<VendorCallStatus, AppError> {
        self.state
            .lock()
            .await
            .statuses
            .get(vendor_sid)
            .cloned()
            .ok_or_else(|| AppError::UpstreamUnavailable("status not available".to_string()))
    }
}
