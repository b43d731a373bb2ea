//! Database fixtures for integration tests.

use anyhow::Result;
use dispatcher_core::domains::calls::models::{CallDirection, CallLog, CallMetadata, CallStatus};
use dispatcher_core::domains::campaign::models::{Campaign, Contact};
use sqlx::PgPool;
use uuid::Uuid;

pub async fn create_campaign(pool: &PgPool, concurrent_limit: i32) -> Result<Campaign> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO campaigns (id, name, status, concurrent_limit, user_id, agent_id, phone_id)
        VALUES ($1, $2, 'draft', $3, $4, $5, $6)
        "#,
    )
    .bind(id)
    .bind(format!("test-campaign-{id}"))
    .bind(concurrent_limit)
    .bind(Uuid::new_v4())
    .bind(Uuid::new_v4())
    .bind(Uuid::new_v4())
    .execute(pool)
    .await?;
    Ok(Campaign::find_by_id(id, pool).await?.expect("campaign just inserted"))
}

pub async fn create_contacts(pool: &PgPool, campaign_id: Uuid, count: usize) -> Result<Vec<Contact>> {
    let mut contacts = Vec::with_capacity(count);
    for n in 0..count {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO contacts (id, campaign_id, phone_number, name, status)
            VALUES ($1, $2, $3, $4, 'pending')
            "#,
        )
        .bind(id)
        .bind(campaign_id)
        .bind(format!("+9198765{:05}", n))
        .bind(format!("contact-{n}"))
        .execute(pool)
        .await?;
        contacts.push(Contact::find_by_id(id, pool).await?.expect("contact just inserted"));
    }
    sqlx::query("UPDATE campaigns SET total_contacts = $1 WHERE id = $2")
        .bind(count as i32)
        .bind(campaign_id)
        .execute(pool)
        .await?;
    Ok(contacts)
}

/// Insert a call log directly (cold-start and webhook scenarios).
pub async fn create_call_log(
    pool: &PgPool,
    campaign_id: Option<Uuid>,
    contact_id: Option<Uuid>,
    status: CallStatus,
    metadata: CallMetadata,
) -> Result<CallLog> {
    let id = Uuid::new_v4();
    let log = CallLog {
        id,
        direction: CallDirection::Outbound,
        from_phone: "+15005550006".to_string(),
        to_phone: "+919876500000".to_string(),
        status,
        duration_sec: None,
        started_at: Some(chrono::Utc::now()),
        ended_at: None,
        campaign_id,
        contact_id,
        user_id: Uuid::new_v4(),
        agent_id: Uuid::new_v4(),
        vendor_sid: Some(format!("fixture-sid-{id}")),
        failure_reason: None,
        metadata: sqlx::types::Json(metadata),
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    };
    log.insert(pool).await?;
    Ok(log)
}
