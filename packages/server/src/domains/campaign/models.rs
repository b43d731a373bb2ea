//! Campaign and contact records in the document store.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::domains::calls::models::FailureReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "campaign_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Active,
    Paused,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "contact_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ContactStatus {
    Pending,
    Calling,
    Completed,
    Voicemail,
    Failed,
    Skipped,
}

impl ContactStatus {
    /// Terminal states never re-enter the dial pipeline.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ContactStatus::Completed
                | ContactStatus::Voicemail
                | ContactStatus::Failed
                | ContactStatus::Skipped
        )
    }
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub name: String,
    pub status: CampaignStatus,
    pub concurrent_limit: i32,
    /// Dialing context handed to the outgoing-call collaborator
    pub user_id: Uuid,
    pub agent_id: Uuid,
    pub phone_id: Uuid,
    // Best-effort counters; the lease registry is authoritative for
    // active_calls.
    pub total_contacts: i32,
    pub active_calls: i32,
    pub queued_calls: i32,
    pub completed_calls: i32,
    pub failed_calls: i32,
    pub voicemail_calls: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const CAMPAIGN_COLUMNS: &str = r#"
    id, name, status, concurrent_limit, user_id, agent_id, phone_id,
    total_contacts, active_calls, queued_calls, completed_calls,
    failed_calls, voicemail_calls, created_at, updated_at
"#;

impl Campaign {
    pub async fn find_by_id(id: Uuid, pool: &PgPool) -> Result<Option<Self>> {
        let campaign = sqlx::query_as::<_, Self>(&format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(campaign)
    }

    pub async fn find_active(pool: &PgPool) -> Result<Vec<Self>> {
        let campaigns = sqlx::query_as::<_, Self>(&format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE status = 'active' ORDER BY created_at"
        ))
        .fetch_all(pool)
        .await?;
        Ok(campaigns)
    }

    pub async fn set_status(id: Uuid, status: CampaignStatus, pool: &PgPool) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE campaigns SET status = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(status)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Bump the denormalized per-status counters after a contact reaches
    /// a terminal state. Drift here is cosmetic; the lease registry is
    /// the authority for live concurrency.
    pub async fn record_contact_outcome(
        id: Uuid,
        outcome: ContactStatus,
        pool: &PgPool,
    ) -> Result<()> {
        let column = match outcome {
            ContactStatus::Completed => "completed_calls",
            ContactStatus::Failed | ContactStatus::Skipped => "failed_calls",
            ContactStatus::Voicemail => "voicemail_calls",
            _ => return Ok(()),
        };
        sqlx::query(&format!(
            "UPDATE campaigns SET {column} = {column} + 1, updated_at = NOW() WHERE id = $1"
        ))
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// True when no contact can still produce a call.
    pub async fn all_contacts_settled(id: Uuid, pool: &PgPool) -> Result<bool> {
        let (open,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM contacts
            WHERE campaign_id = $1 AND status IN ('pending', 'calling')
            "#,
        )
        .bind(id)
        .fetch_one(pool)
        .await?;
        Ok(open == 0)
    }
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub phone_number: String,
    pub name: Option<String>,
    pub status: ContactStatus,
    pub retry_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<FailureReason>,
    pub call_log_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const CONTACT_COLUMNS: &str = r#"
    id, campaign_id, phone_number, name, status, retry_count,
    next_retry_at, failure_reason, call_log_id, created_at, updated_at
"#;

impl Contact {
    pub async fn find_by_id(id: Uuid, pool: &PgPool) -> Result<Option<Self>> {
        let contact = sqlx::query_as::<_, Self>(&format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(contact)
    }

    pub async fn find_pending(campaign_id: Uuid, pool: &PgPool) -> Result<Vec<Self>> {
        let contacts = sqlx::query_as::<_, Self>(&format!(
            r#"
            SELECT {CONTACT_COLUMNS} FROM contacts
            WHERE campaign_id = $1 AND status = 'pending'
            ORDER BY created_at
            "#
        ))
        .bind(campaign_id)
        .fetch_all(pool)
        .await?;
        Ok(contacts)
    }

    pub async fn mark_calling(id: Uuid, call_log_id: Uuid, pool: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE contacts
            SET status = 'calling', call_log_id = $1, updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(call_log_id)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn mark_outcome(
        id: Uuid,
        status: ContactStatus,
        failure_reason: Option<FailureReason>,
        pool: &PgPool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE contacts
            SET status = $1, failure_reason = $2, updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(status)
        .bind(failure_reason)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Cancel a contact that has not finished dialing. The guard on
    /// status makes cancel idempotent; already-terminal contacts are
    /// left alone.
    pub async fn cancel(id: Uuid, pool: &PgPool) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE contacts
            SET status = 'skipped', updated_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'calling')
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Undo a `calling` transition after a failed dial window so a
    /// later attempt can pick the contact up again.
    pub async fn reset_to_pending(id: Uuid, pool: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE contacts
            SET status = 'pending', updated_at = NOW()
            WHERE id = $1 AND status = 'calling'
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn bump_retry(
        id: Uuid,
        next_retry_at: DateTime<Utc>,
        pool: &PgPool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE contacts
            SET retry_count = retry_count + 1,
                next_retry_at = $1,
                status = 'pending',
                updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(next_retry_at)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }
}
