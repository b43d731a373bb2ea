//! Promoter: moves waitlisted dial jobs into the worker-ready state
//! under the capacity invariant.
//!
//! One promoter at a time per campaign (`promote-mutex`). Two triggers:
//! the `slot-available` pub/sub channel, and a jittered fallback poller
//! for lost notifications.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use rand::Rng;
use serde_json::json;
use uuid::Uuid;

use super::cold_start::ColdStartState;
use super::keys;
use super::ledger::{PromotionBatch, DEFAULT_PROMOTE_BATCH};
use super::models::Campaign;
use crate::kernel::kv::{campaign_from_channel, SLOT_CHANNEL_PATTERN};
use crate::kernel::ServerDeps;

const MUTEX_TTL_SECS: i64 = 5;
const MUTEX_RENEW_INTERVAL: Duration = Duration::from_secs(2);
const POLL_BASE_SECS: u64 = 5;
const POLL_JITTER_SECS: u64 = 3;

pub struct Promoter {
    deps: Arc<ServerDeps>,
    leader: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    instance_id: String,
}

impl Promoter {
    pub fn new(deps: Arc<ServerDeps>, leader: Arc<AtomicBool>) -> Self {
        let instance_id = deps.config.instance_id.clone();
        Self {
            deps,
            leader,
            shutdown: Arc::new(AtomicBool::new(false)),
            instance_id,
        }
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Run both triggers until shutdown.
    pub async fn run(self: Arc<Self>) {
        let listener = Arc::clone(&self);
        let poller = Arc::clone(&self);
        tokio::join!(listener.run_listener(), poller.run_poller());
    }

    /// Pub/sub trigger: react to slot-available messages.
    async fn run_listener(self: Arc<Self>) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            let mut pubsub = match self.deps.kv.pubsub().await {
                Ok(p) => p,
                Err(e) => {
                    tracing::error!(error = %e, "promoter pub/sub connect failed");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
            };
            if let Err(e) = pubsub.psubscribe(SLOT_CHANNEL_PATTERN).await {
                tracing::error!(error = %e, "promoter psubscribe failed");
                tokio::time::sleep(Duration::from_secs(2)).await;
                continue;
            }

            let mut stream = pubsub.on_message();
            while let Some(message) = stream.next().await {
                if self.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                let channel = message.get_channel_name().to_string();
                let Some(campaign_id) = campaign_from_channel(&channel) else {
                    continue;
                };
                let Ok(campaign_id) = campaign_id.parse::<Uuid>() else {
                    // The adhoc bucket publishes too; nothing to promote.
                    continue;
                };
                if let Err(e) = self.try_promote(campaign_id).await {
                    tracing::error!(campaign_id = %campaign_id, error = %e, "promotion attempt failed");
                }
            }
            // Stream ended (connection dropped); reconnect.
            tracing::warn!("promoter pub/sub stream closed; reconnecting");
        }
    }

    /// Fallback poller: every active campaign, 5 s ± 3 s jitter.
    async fn run_poller(self: Arc<Self>) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            let sleep_secs = POLL_BASE_SECS - POLL_JITTER_SECS
                + rand::thread_rng().gen_range(0..=POLL_JITTER_SECS * 2);
            tokio::time::sleep(Duration::from_secs(sleep_secs.max(1))).await;

            if !self.leader.load(Ordering::SeqCst) {
                continue;
            }
            let campaigns = match Campaign::find_active(&self.deps.db_pool).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!(error = %e, "promoter poll: campaign list failed");
                    continue;
                }
            };
            for campaign in campaigns {
                if self.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                if let Err(e) = self.try_promote(campaign.id).await {
                    tracing::error!(campaign_id = %campaign.id, error = %e, "promotion attempt failed");
                }
            }
        }
    }

    /// One promotion attempt. Returns the batch, or `None` when the
    /// attempt was skipped (not leader, paused, blocked, mutex held).
    pub async fn try_promote(&self, campaign_id: Uuid) -> Result<Option<PromotionBatch>> {
        if !self.leader.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let id = campaign_id.to_string();

        if self.deps.cold_start.ensure_ready(campaign_id).await? == ColdStartState::Blocking {
            return Ok(None);
        }

        let mut conn = self.deps.kv.conn();
        let paused: i64 = redis::cmd("EXISTS")
            .arg(keys::paused(&id))
            .query_async(&mut conn)
            .await?;
        if paused == 1 {
            return Ok(None);
        }

        // An open breaker throttles rather than halts: quarter batches.
        let batch_size = self
            .deps
            .breaker
            .adjust_batch(&id, DEFAULT_PROMOTE_BATCH)
            .await?;

        if !self.acquire_mutex(&id).await? {
            return Ok(None);
        }

        // Keep the mutex alive while we work through the batch.
        let renewer = self.spawn_mutex_renewer(id.clone());
        let result = self.promote_locked(campaign_id, &id, batch_size).await;
        renewer.abort();
        self.release_mutex(&id).await?;

        match result {
            Ok(batch) => {
                self.deps.breaker.record_success(&id).await?;
                Ok(Some(batch))
            }
            Err(e) => {
                self.deps.breaker.record_failure(&id).await?;
                Err(e)
            }
        }
    }

    async fn promote_locked(
        &self,
        campaign_id: Uuid,
        id: &str,
        batch_size: i64,
    ) -> Result<PromotionBatch> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let batch = self
            .deps
            .ledger
            .pop_reserve_promote(id, batch_size, now_ms)
            .await?;

        for job_key in &batch.promoted {
            let patch = json!({
                "promoteSeq": batch.seq,
                "promotedAt": now_ms,
            });
            let moved = self.deps.job_queue.promote_waiting(job_key, &patch).await?;
            if !moved {
                // Job record is gone; free the reservation right away.
                self.deps.ledger.claim(id, job_key).await?;
                tracing::warn!(
                    campaign_id = %campaign_id,
                    job_key,
                    "promoted job has no record; reservation reclaimed"
                );
            }
        }
        for job_key in &batch.pushed_back {
            tracing::debug!(
                metric = "stale_marker_demotion",
                campaign_id = %campaign_id,
                job_key,
                "popped job without marker; demoted"
            );
        }

        if batch.count > 0 {
            tracing::debug!(
                campaign_id = %campaign_id,
                promoted = batch.count,
                seq = batch.seq,
                "promotion batch issued"
            );
        }
        Ok(batch)
    }

    async fn acquire_mutex(&self, id: &str) -> Result<bool> {
        let mut conn = self.deps.kv.conn();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(keys::promote_mutex(id))
            .arg(&self.instance_id)
            .arg("NX")
            .arg("EX")
            .arg(MUTEX_TTL_SECS)
            .query_async(&mut conn)
            .await?;
        Ok(acquired.is_some())
    }

    fn spawn_mutex_renewer(&self, id: String) -> tokio::task::JoinHandle<()> {
        let kv = self.deps.kv.clone();
        let instance = self.instance_id.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(MUTEX_RENEW_INTERVAL).await;
                let mut conn = kv.conn();
                let script = redis::Script::new(
                    r#"
                    if redis.call('GET', KEYS[1]) == ARGV[1] then
                        redis.call('EXPIRE', KEYS[1], tonumber(ARGV[2]))
                        return 1
                    end
                    return 0
                    "#,
                );
                let renewed: Result<i64, _> = script
                    .key(keys::promote_mutex(&id))
                    .arg(&instance)
                    .arg(MUTEX_TTL_SECS)
                    .invoke_async(&mut conn)
                    .await;
                if !matches!(renewed, Ok(1)) {
                    return;
                }
            }
        })
    }

    async fn release_mutex(&self, id: &str) -> Result<()> {
        let mut conn = self.deps.kv.conn();
        let script = redis::Script::new(
            r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('DEL', KEYS[1])
            end
            return 0
            "#,
        );
        let _: i64 = script
            .key(keys::promote_mutex(id))
            .arg(&self.instance_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}
