//! Cold-start guard.
//!
//! After a key-value store restart the lease registry is empty while
//! real calls may still be live. The first access to a campaign
//! reconstructs membership from non-terminal call logs in the document
//! store and blocks promotions until recovery settles, so a burst of
//! promotions cannot double-book slots that answered calls still hold.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

use crate::domains::calls::models::{CallLog, CallStatus};
use crate::domains::campaign::keys;
use crate::domains::campaign::lease::{LeaseRegistry, ACTIVE_MAX_SECS, PRE_DIAL_MAX_SECS};
use crate::kernel::kv::KvStore;

pub const BLOCKING_TTL_SECS: i64 = 90;
pub const GRACE_SECS: u64 = 60;
pub const DONE_TTL_SECS: i64 = 86_400;

/// Sentinel value for reconstructed lease keys; a real token replaces
/// it on the first legitimate upgrade or renewal cycle.
pub const RECOVERED_TOKEN: &str = "recovered";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColdStartState {
    /// Recovery in flight; promotions and dials must back off.
    Blocking,
    Done,
}

#[derive(Clone)]
pub struct ColdStartGuard {
    kv: KvStore,
    leases: LeaseRegistry,
    pool: PgPool,
}

impl ColdStartGuard {
    pub fn new(kv: KvStore, leases: LeaseRegistry, pool: PgPool) -> Self {
        Self { kv, leases, pool }
    }

    pub async fn is_blocking(&self, campaign_id: &str) -> Result<bool> {
        let mut conn = self.kv.conn();
        let state: Option<String> = redis::cmd("GET")
            .arg(keys::cold_start(campaign_id))
            .query_async(&mut conn)
            .await?;
        Ok(state.as_deref() == Some("blocking"))
    }

    /// Called by the webhook path on the first successful upgrade:
    /// real traffic proves the registry is consistent again.
    pub async fn mark_done(&self, campaign_id: &str) -> Result<()> {
        let mut conn = self.kv.conn();
        redis::cmd("SET")
            .arg(keys::cold_start(campaign_id))
            .arg("done")
            .arg("EX")
            .arg(DONE_TTL_SECS)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Ensure the campaign's lease state is trustworthy. Returns the
    /// guard state; callers treat `Blocking` as a transient error.
    pub async fn ensure_ready(self: &Arc<Self>, campaign_id: Uuid) -> Result<ColdStartState> {
        let id = campaign_id.to_string();
        let mut conn = self.kv.conn();

        let state: Option<String> = redis::cmd("GET")
            .arg(keys::cold_start(&id))
            .query_async(&mut conn)
            .await?;
        match state.as_deref() {
            Some("done") => return Ok(ColdStartState::Done),
            Some(_) => return Ok(ColdStartState::Blocking),
            None => {}
        }

        // First access since a restart (or ever). Only one instance
        // runs recovery; losers of the NX race observe blocking.
        let won: Option<String> = redis::cmd("SET")
            .arg(keys::cold_start(&id))
            .arg("blocking")
            .arg("NX")
            .arg("EX")
            .arg(BLOCKING_TTL_SECS)
            .query_async(&mut conn)
            .await?;
        if won.is_none() {
            return Ok(ColdStartState::Blocking);
        }

        let rebuilt = self.reconstruct(campaign_id, &id).await?;
        let limit = self.leases.limit(&id).await?;

        // Nothing live to recover, or enough of the set came back:
        // unblock immediately.
        if rebuilt == 0 || rebuilt >= limit.min(2) {
            self.mark_done(&id).await?;
            tracing::info!(campaign_id = %campaign_id, rebuilt, "cold start settled immediately");
            return Ok(ColdStartState::Done);
        }

        tracing::warn!(
            campaign_id = %campaign_id,
            rebuilt,
            "cold start blocking; reconcile after grace period"
        );
        let guard = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(GRACE_SECS)).await;
            if let Err(e) = guard.reconcile_recovered(campaign_id).await {
                tracing::error!(campaign_id = %campaign_id, error = %e, "cold start reconcile failed");
            }
        });
        Ok(ColdStartState::Blocking)
    }

    /// Rebuild the lease set from non-terminal call logs. In-progress
    /// calls become active members; ringing/initiated calls become
    /// pre-dial members. Returns how many leases were reconstructed.
    async fn reconstruct(&self, campaign_id: Uuid, id: &str) -> Result<i64> {
        let live = CallLog::find_live_for_campaign(campaign_id, &self.pool).await?;
        let mut rebuilt = 0i64;
        let mut conn = self.kv.conn();

        for log in live {
            let call_id = log.id.to_string();
            let (member, ttl) = match log.status {
                CallStatus::InProgress => (call_id.clone(), ACTIVE_MAX_SECS),
                _ => (keys::pre_dial_member(&call_id), PRE_DIAL_MAX_SECS),
            };
            redis::cmd("SADD")
                .arg(keys::leases(id))
                .arg(&member)
                .query_async::<()>(&mut conn)
                .await?;
            redis::cmd("SET")
                .arg(keys::lease(id, &member))
                .arg(RECOVERED_TOKEN)
                .arg("EX")
                .arg(ttl)
                .query_async::<()>(&mut conn)
                .await?;
            rebuilt += 1;
        }
        Ok(rebuilt)
    }

    /// After the grace period, any lease still holding the recovered
    /// sentinel belongs to a call that never re-confirmed itself; drop
    /// it and open the campaign back up.
    async fn reconcile_recovered(&self, campaign_id: Uuid) -> Result<()> {
        let id = campaign_id.to_string();
        let mut conn = self.kv.conn();

        for member in self.leases.members(&id).await? {
            let value: Option<String> = redis::cmd("GET")
                .arg(keys::lease(&id, &member))
                .query_async(&mut conn)
                .await?;
            match value.as_deref() {
                Some(RECOVERED_TOKEN) => {
                    let call_id = member.strip_prefix("pre-").unwrap_or(&member);
                    self.leases.force_release(&id, call_id, false).await?;
                    tracing::info!(campaign_id = %campaign_id, member, "dropped unconfirmed recovered lease");
                }
                Some(_) => {}
                // Expired on its own; the janitor clears the member.
                None => {}
            }
        }
        self.mark_done(&id).await?;
        Ok(())
    }
}
