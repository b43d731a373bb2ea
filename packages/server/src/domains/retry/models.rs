//! Retry-attempt records.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::domains::calls::models::FailureReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "retry_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RetryStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub id: Uuid,
    pub original_call_log_id: Uuid,
    pub contact_id: Option<Uuid>,
    /// 1-based; unique together with the original call log.
    pub attempt_number: i32,
    pub scheduled_for: DateTime<Utc>,
    pub status: RetryStatus,
    pub failure_reason: FailureReason,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const RETRY_COLUMNS: &str = r#"
    id, original_call_log_id, contact_id, attempt_number, scheduled_for,
    status, failure_reason, created_at, updated_at
"#;

impl RetryAttempt {
    /// Insert a new attempt. Returns `None` when the unique
    /// `(original_call_log_id, attempt_number)` pair already exists:
    /// the duplicate-webhook guard.
    pub async fn insert(
        original_call_log_id: Uuid,
        contact_id: Option<Uuid>,
        attempt_number: i32,
        scheduled_for: DateTime<Utc>,
        failure_reason: FailureReason,
        pool: &PgPool,
    ) -> Result<Option<Self>> {
        let attempt = sqlx::query_as::<_, Self>(&format!(
            r#"
            INSERT INTO retry_attempts (
                id, original_call_log_id, contact_id, attempt_number,
                scheduled_for, status, failure_reason
            )
            VALUES ($1, $2, $3, $4, $5, 'pending', $6)
            ON CONFLICT (original_call_log_id, attempt_number) DO NOTHING
            RETURNING {RETRY_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(original_call_log_id)
        .bind(contact_id)
        .bind(attempt_number)
        .bind(scheduled_for)
        .bind(failure_reason)
        .fetch_optional(pool)
        .await?;
        Ok(attempt)
    }

    pub async fn find_by_id(id: Uuid, pool: &PgPool) -> Result<Option<Self>> {
        let attempt = sqlx::query_as::<_, Self>(&format!(
            "SELECT {RETRY_COLUMNS} FROM retry_attempts WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(attempt)
    }

    /// Guarded transition out of `pending`. Returns false if another
    /// path settled the attempt first.
    pub async fn transition_from_pending(
        id: Uuid,
        to: RetryStatus,
        pool: &PgPool,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE retry_attempts
            SET status = $1, updated_at = NOW()
            WHERE id = $2 AND status = 'pending'
            "#,
        )
        .bind(to)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn settle(id: Uuid, to: RetryStatus, pool: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE retry_attempts
            SET status = $1, updated_at = NOW()
            WHERE id = $2 AND status = 'processing'
            "#,
        )
        .bind(to)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }
}
