//! Carrier status-webhook endpoint.

use axum::extract::State;
use axum::Json;
use serde_json::json;

use crate::common::AppError;
use crate::domains::calls::webhook::{StatusWebhook, WebhookProcessor};
use crate::server::app::AppState;

/// `POST /exotel/webhook/status`. Must be idempotent: duplicates are
/// token-checked and release at most once.
pub async fn status_handler(
    State(state): State<AppState>,
    Json(payload): Json<StatusWebhook>,
) -> Result<Json<serde_json::Value>, AppError> {
    let processor = WebhookProcessor::new(state.deps.clone());
    let outcome = processor.process(payload).await?;
    Ok(Json(json!({
        "callLogId": outcome.call_log_id,
        "status": outcome.status,
        "retryScheduled": outcome.retry_scheduled,
    })))
}
