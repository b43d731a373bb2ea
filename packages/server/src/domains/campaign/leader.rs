//! Lease-based leader election over the key-value store.
//!
//! Exactly one instance runs the promoter, campaign workers, and
//! janitors. A short-TTL key names the current leader; holders renew
//! it, and a restart of the leader hands ownership to whichever
//! instance claims the expired key first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use lazy_static::lazy_static;
use redis::Script;

use crate::kernel::kv::KvStore;

const LEADER_KEY: &str = "dispatcher:leader";
const LEADER_TTL_SECS: i64 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(5);

lazy_static! {
    /// Claim the key if free, or refresh it if we already hold it.
    /// KEYS: leader. ARGV: instanceId, ttl.
    static ref CLAIM_OR_RENEW: Script = Script::new(
        r#"
        local current = redis.call('GET', KEYS[1])
        if current == ARGV[1] then
            redis.call('EXPIRE', KEYS[1], tonumber(ARGV[2]))
            return 1
        end
        if not current then
            redis.call('SET', KEYS[1], ARGV[1], 'EX', tonumber(ARGV[2]))
            return 1
        end
        return 0
        "#,
    );
}

pub struct LeaderElection {
    kv: KvStore,
    instance_id: String,
    is_leader: Arc<AtomicBool>,
}

impl LeaderElection {
    pub fn new(kv: KvStore, instance_id: String) -> Self {
        Self {
            kv,
            instance_id,
            is_leader: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag observed by the background loops; flips as leadership moves.
    pub fn leader_flag(&self) -> Arc<AtomicBool> {
        self.is_leader.clone()
    }

    pub async fn try_acquire(&self) -> Result<bool> {
        let mut conn = self.kv.conn();
        let held: i64 = CLAIM_OR_RENEW
            .key(LEADER_KEY)
            .arg(&self.instance_id)
            .arg(LEADER_TTL_SECS)
            .invoke_async(&mut conn)
            .await?;
        Ok(held == 1)
    }

    /// Run the claim/renew loop until the process exits.
    pub async fn run(self) {
        let mut was_leader = false;
        loop {
            match self.try_acquire().await {
                Ok(held) => {
                    if held != was_leader {
                        if held {
                            tracing::info!(instance = %self.instance_id, "acquired dispatcher leadership");
                        } else {
                            tracing::warn!(instance = %self.instance_id, "lost dispatcher leadership");
                        }
                        was_leader = held;
                    }
                    self.is_leader.store(held, Ordering::SeqCst);
                }
                Err(e) => {
                    // Fail closed: no KV, no leadership.
                    self.is_leader.store(false, Ordering::SeqCst);
                    was_leader = false;
                    tracing::error!(error = %e, "leader election tick failed");
                }
            }
            tokio::time::sleep(RENEW_INTERVAL).await;
        }
    }
}
