//! Operator maintenance endpoints.

use axum::extract::{Path, State};
use axum::Json;
use serde_json::json;

use crate::common::AppError;
use crate::server::app::AppState;

/// `POST /maintenance/cleanup-slots/:campaignId`: walk the lease set
/// and delete every member and lease key. Returns before/after counts.
pub async fn cleanup_slots_handler(
    State(state): State<AppState>,
    Path(campaign_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let before = state
        .deps
        .leases
        .clear_all(&campaign_id)
        .await
        .map_err(AppError::Fatal)?;
    let after = state
        .deps
        .leases
        .member_count(&campaign_id)
        .await
        .map_err(AppError::Fatal)?;
    tracing::info!(campaign_id, before, after, "operator slot cleanup");
    Ok(Json(json!({ "before": before, "after": after })))
}
