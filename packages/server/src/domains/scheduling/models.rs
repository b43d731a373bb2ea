//! Scheduled-call records.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "scheduled_call_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ScheduledCallStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecurrenceFrequency {
    Daily,
    Weekly,
    Monthly,
}

/// Business-hours window a scheduled call must land in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusinessHours {
    /// Local start hour, inclusive.
    pub start: u32,
    /// Local end hour, exclusive.
    pub end: u32,
    pub timezone: String,
    /// Allowed weekdays, 0 = Sunday … 6 = Saturday.
    pub days_of_week: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recurring {
    pub frequency: RecurrenceFrequency,
    /// Every `interval` days/weeks/months, ≥ 1.
    pub interval: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_occurrences: Option<u32>,
    #[serde(default)]
    pub current_occurrence: u32,
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledCall {
    pub id: Uuid,
    pub phone_number: String,
    pub agent_id: Uuid,
    pub user_id: Uuid,
    pub scheduled_for: DateTime<Utc>,
    pub timezone: String,
    pub status: ScheduledCallStatus,
    pub business_hours: Option<sqlx::types::Json<BusinessHours>>,
    pub recurring: Option<sqlx::types::Json<Recurring>>,
    /// Delayed-job key that fires this call.
    pub job_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const SCHEDULED_COLUMNS: &str = r#"
    id, phone_number, agent_id, user_id, scheduled_for, timezone, status,
    business_hours, recurring, job_key, created_at, updated_at
"#;

impl ScheduledCall {
    pub async fn insert(&self, pool: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduled_calls (
                id, phone_number, agent_id, user_id, scheduled_for, timezone,
                status, business_hours, recurring, job_key
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(self.id)
        .bind(&self.phone_number)
        .bind(self.agent_id)
        .bind(self.user_id)
        .bind(self.scheduled_for)
        .bind(&self.timezone)
        .bind(self.status)
        .bind(&self.business_hours)
        .bind(&self.recurring)
        .bind(&self.job_key)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn find_by_id(id: Uuid, pool: &PgPool) -> Result<Option<Self>> {
        let call = sqlx::query_as::<_, Self>(&format!(
            "SELECT {SCHEDULED_COLUMNS} FROM scheduled_calls WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(call)
    }

    /// Guarded transition out of `pending`; the only legal exits are
    /// cancel, reschedule, and the runner picking it up.
    pub async fn transition_from_pending(
        id: Uuid,
        to: ScheduledCallStatus,
        pool: &PgPool,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_calls
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

    pub async fn settle(id: Uuid, to: ScheduledCallStatus, pool: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scheduled_calls
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

    pub async fn update_scheduled_for(
        id: Uuid,
        scheduled_for: DateTime<Utc>,
        pool: &PgPool,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_calls
            SET scheduled_for = $1, updated_at = NOW()
            WHERE id = $2 AND status = 'pending'
            "#,
        )
        .bind(scheduled_for)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
