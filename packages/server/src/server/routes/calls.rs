//! Immediate outbound-call endpoint.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::common::AppError;
use crate::domains::calls::outgoing::{OutgoingCallParams, OutgoingCallService};
use crate::server::app::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundCallBody {
    pub phone_number: String,
    pub agent_id: Uuid,
    pub user_id: Uuid,
    pub campaign_id: Option<Uuid>,
}

/// `POST /calls/outbound`: dial now. Campaign-less calls count against
/// the adhoc concurrency bucket: 429 when it is full, 503 while the
/// breaker is open.
pub async fn outbound_handler(
    State(state): State<AppState>,
    Json(body): Json<OutboundCallBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let service = OutgoingCallService::new(state.deps.clone());
    let call_log_id = service
        .initiate_call(OutgoingCallParams {
            phone_number: body.phone_number,
            user_id: body.user_id,
            agent_id: body.agent_id,
            campaign_id: body.campaign_id,
            contact_id: None,
            call_log_id: None,
            pre_lease_token: None,
            skip_slot_acquisition: false,
            is_retry: false,
        })
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "callLogId": call_log_id })),
    ))
}
