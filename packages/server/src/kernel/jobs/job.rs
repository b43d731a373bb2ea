//! Job model for the delayed-job runner.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Parked in a campaign waitlist; not claimable until promoted.
    Waiting,
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_priority", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    High,
    #[default]
    Normal,
}

impl JobPriority {
    /// Integer for DB ordering (lower = higher priority).
    pub fn as_i16(&self) -> i16 {
        match self {
            JobPriority::High => 0,
            JobPriority::Normal => 1,
        }
    }
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    /// Caller-supplied idempotent identity, e.g. `dial-<contactId>` or
    /// `retry-<retryAttemptId>`.
    pub job_key: String,
    pub job_type: String,
    pub args: serde_json::Value,
    pub priority: JobPriority,
    pub status: JobStatus,
    /// Absent means "run as soon as claimed".
    pub run_at: Option<DateTime<Utc>>,
    pub max_attempts: i32,
    pub attempt_count: i32,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const JOB_COLUMNS: &str = r#"
    id, job_key, job_type, args, priority, status, run_at, max_attempts,
    attempt_count, lease_expires_at, worker_id, last_error, created_at, updated_at
"#;

impl Job {
    pub async fn find_by_id(id: Uuid, pool: &PgPool) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(job)
    }

    /// The live (waiting/pending/running) job for an idempotency key.
    pub async fn find_live_by_key(job_key: &str, pool: &PgPool) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE job_key = $1 AND status IN ('waiting', 'pending', 'running')
            LIMIT 1
            "#
        ))
        .bind(job_key)
        .fetch_optional(pool)
        .await?;
        Ok(job)
    }

    pub fn parse_args<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.args.clone())?)
    }
}
