//! Scheduled-call endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::common::AppError;
use crate::domains::scheduling::service::{ScheduleCallRequest, SchedulingService};
use crate::server::app::AppState;

/// Carrier-compatible error codes for the two validation failures the
/// contract names explicitly.
fn map_validation(err: AppError) -> Response {
    if let AppError::Validation { field, message } = &err {
        let code = match field.as_str() {
            "timezone" => Some("INVALID_TIMEZONE"),
            "scheduledFor" => Some("INVALID_SCHEDULED_TIME"),
            _ => None,
        };
        if let Some(code) = code {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": code, "message": message })),
            )
                .into_response();
        }
    }
    err.into_response()
}

pub async fn schedule_handler(
    State(state): State<AppState>,
    Json(body): Json<ScheduleCallRequest>,
) -> Response {
    let service = SchedulingService::new(state.deps.clone());
    match service.schedule(body).await {
        Ok(call) => (
            StatusCode::CREATED,
            Json(json!({
                "scheduledCallId": call.id,
                "scheduledFor": call.scheduled_for,
            })),
        )
            .into_response(),
        Err(e) => map_validation(e),
    }
}

pub async fn cancel_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let service = SchedulingService::new(state.deps.clone());
    let call = service.cancel(id).await?;
    Ok(Json(json!({
        "scheduledCallId": call.id,
        "status": call.status,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RescheduleBody {
    scheduled_for: DateTime<Utc>,
}

pub async fn reschedule_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<RescheduleBody>,
) -> Response {
    let service = SchedulingService::new(state.deps.clone());
    match service.reschedule(id, body.scheduled_for).await {
        Ok(call) => Json(json!({
            "scheduledCallId": call.id,
            "scheduledFor": call.scheduled_for,
        }))
        .into_response(),
        Err(e) => map_validation(e),
    }
}
