//! Call-log records and the closed status/failure enumerations.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "call_direction", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "call_status", rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum CallStatus {
    Initiated,
    Ringing,
    InProgress,
    Completed,
    Failed,
    NoAnswer,
    Busy,
    Canceled,
}

impl CallStatus {
    /// Terminal statuses release the lease and settle the contact.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Completed
                | CallStatus::Failed
                | CallStatus::NoAnswer
                | CallStatus::Busy
                | CallStatus::Canceled
        )
    }

    /// Parse a carrier webhook status string.
    pub fn from_webhook(raw: &str) -> Option<Self> {
        match raw {
            "initiated" | "queued" => Some(CallStatus::Initiated),
            "ringing" => Some(CallStatus::Ringing),
            "in-progress" | "answered" => Some(CallStatus::InProgress),
            "completed" => Some(CallStatus::Completed),
            "failed" => Some(CallStatus::Failed),
            "no-answer" => Some(CallStatus::NoAnswer),
            "busy" => Some(CallStatus::Busy),
            "canceled" | "cancelled" => Some(CallStatus::Canceled),
            _ => None,
        }
    }
}

/// Closed set of failure kinds used for retry classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "failure_reason", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NoAnswer,
    Busy,
    Voicemail,
    InvalidNumber,
    NetworkError,
    RateLimited,
    ApiUnavailable,
    CallRejected,
    Blocked,
    ComplianceBlock,
}

impl FailureReason {
    /// Parse the snake_case wire form (`"no_answer"`, `"busy"`, …).
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(raw.to_string())).ok()
    }
}

/// Opaque per-call metadata kept as JSON, mirroring what the carrier
/// webhook needs to echo back.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallMetadata {
    /// Token of the active lease; webhook releases must present it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_token: Option<String>,
    /// Token of the pre-dial lease, dropped on upgrade.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_lease_token: Option<String>,
    /// Lease member id (the call-log id for campaign calls).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub voicemail_detected: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_retry: bool,
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct CallLog {
    pub id: Uuid,
    pub direction: CallDirection,
    pub from_phone: String,
    pub to_phone: String,
    pub status: CallStatus,
    pub duration_sec: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub campaign_id: Option<Uuid>,
    pub contact_id: Option<Uuid>,
    pub user_id: Uuid,
    pub agent_id: Uuid,
    /// Vendor-side call sid once the carrier accepted the call.
    pub vendor_sid: Option<String>,
    pub failure_reason: Option<FailureReason>,
    pub metadata: sqlx::types::Json<CallMetadata>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const CALL_LOG_COLUMNS: &str = r#"
    id, direction, from_phone, to_phone, status, duration_sec,
    started_at, ended_at, campaign_id, contact_id, user_id, agent_id,
    vendor_sid, failure_reason, metadata, created_at, updated_at
"#;

impl CallLog {
    pub async fn insert(&self, pool: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO call_logs (
                id, direction, from_phone, to_phone, status, duration_sec,
                started_at, ended_at, campaign_id, contact_id, user_id,
                agent_id, vendor_sid, failure_reason, metadata, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(self.id)
        .bind(self.direction)
        .bind(&self.from_phone)
        .bind(&self.to_phone)
        .bind(self.status)
        .bind(self.duration_sec)
        .bind(self.started_at)
        .bind(self.ended_at)
        .bind(self.campaign_id)
        .bind(self.contact_id)
        .bind(self.user_id)
        .bind(self.agent_id)
        .bind(&self.vendor_sid)
        .bind(self.failure_reason)
        .bind(&self.metadata)
        .bind(self.created_at)
        .bind(self.updated_at)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn find_by_id(id: Uuid, pool: &PgPool) -> Result<Option<Self>> {
        let log = sqlx::query_as::<_, Self>(&format!(
            "SELECT {CALL_LOG_COLUMNS} FROM call_logs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(log)
    }

    pub async fn find_by_vendor_sid(sid: &str, pool: &PgPool) -> Result<Option<Self>> {
        let log = sqlx::query_as::<_, Self>(&format!(
            "SELECT {CALL_LOG_COLUMNS} FROM call_logs WHERE vendor_sid = $1"
        ))
        .bind(sid)
        .fetch_optional(pool)
        .await?;
        Ok(log)
    }

    /// Calls that have not reached a terminal status for a campaign.
    /// The cold-start guard rebuilds the lease set from these.
    pub async fn find_live_for_campaign(campaign_id: Uuid, pool: &PgPool) -> Result<Vec<Self>> {
        let logs = sqlx::query_as::<_, Self>(&format!(
            r#"
            SELECT {CALL_LOG_COLUMNS} FROM call_logs
            WHERE campaign_id = $1
              AND status IN ('initiated', 'ringing', 'in-progress')
            "#
        ))
        .bind(campaign_id)
        .fetch_all(pool)
        .await?;
        Ok(logs)
    }

    /// Ringing calls with no end timestamp older than the threshold:
    /// candidates for stuck-call reconciliation.
    pub async fn find_stuck(
        older_than: DateTime<Utc>,
        limit: i64,
        pool: &PgPool,
    ) -> Result<Vec<Self>> {
        let logs = sqlx::query_as::<_, Self>(&format!(
            r#"
            SELECT {CALL_LOG_COLUMNS} FROM call_logs
            WHERE status IN ('initiated', 'ringing')
              AND ended_at IS NULL
              AND created_at < $1
            ORDER BY created_at
            LIMIT $2
            "#
        ))
        .bind(older_than)
        .bind(limit)
        .fetch_all(pool)
        .await?;
        Ok(logs)
    }

    pub async fn set_vendor_sid(id: Uuid, sid: &str, pool: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE call_logs
            SET vendor_sid = $1, status = 'ringing', started_at = COALESCE(started_at, NOW()),
                updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(sid)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn update_metadata(id: Uuid, metadata: &CallMetadata, pool: &PgPool) -> Result<()> {
        sqlx::query("UPDATE call_logs SET metadata = $1, updated_at = NOW() WHERE id = $2")
            .bind(sqlx::types::Json(metadata))
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Close the call with a terminal status. Returns false when the row
    /// was already terminal, which keeps duplicate webhooks idempotent.
    pub async fn close(
        id: Uuid,
        status: CallStatus,
        duration_sec: Option<i32>,
        failure_reason: Option<FailureReason>,
        pool: &PgPool,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE call_logs
            SET status = $1,
                duration_sec = COALESCE($2, duration_sec),
                failure_reason = COALESCE($3, failure_reason),
                ended_at = COALESCE(ended_at, NOW()),
                updated_at = NOW()
            WHERE id = $4
              AND status IN ('initiated', 'ringing', 'in-progress')
            "#,
        )
        .bind(status)
        .bind(duration_sec)
        .bind(failure_reason)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_in_progress(id: Uuid, pool: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE call_logs
            SET status = 'in-progress', started_at = COALESCE(started_at, NOW()), updated_at = NOW()
            WHERE id = $1 AND status IN ('initiated', 'ringing')
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_status_parsing() {
        assert_eq!(CallStatus::from_webhook("in-progress"), Some(CallStatus::InProgress));
        assert_eq!(CallStatus::from_webhook("no-answer"), Some(CallStatus::NoAnswer));
        assert_eq!(CallStatus::from_webhook("cancelled"), Some(CallStatus::Canceled));
        assert_eq!(CallStatus::from_webhook("weird"), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(CallStatus::Completed.is_terminal());
        assert!(CallStatus::Busy.is_terminal());
        assert!(!CallStatus::Ringing.is_terminal());
        assert!(!CallStatus::InProgress.is_terminal());
    }
}
