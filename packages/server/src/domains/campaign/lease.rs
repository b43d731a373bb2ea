//! Per-campaign lease registry.
//!
//! A slot is held either by a short pre-dial lease (carrier request
//! outstanding, call unanswered) or by a long active lease (answered
//! call). Membership lives in the `leases` set; each member has a
//! `lease:<member>` key whose presence means the lease is alive and
//! whose value is the holder's token. Every mutation is a single Lua
//! script so `|leases|` can never race past the limit.

use anyhow::Result;
use lazy_static::lazy_static;
use rand::Rng;
use redis::Script;
use uuid::Uuid;

use crate::domains::campaign::keys;
use crate::kernel::kv::{slot_channel, KvStore};

pub const PRE_DIAL_BASE_SECS: i64 = 15;
pub const PRE_DIAL_JITTER_SECS: i64 = 5;
/// Upper bound on a pre-dial lease's remaining TTL, renewals included.
pub const PRE_DIAL_MAX_SECS: i64 = 45;
pub const RENEW_QUANTUM_SECS: i64 = 10;
pub const ACTIVE_MIN_SECS: i64 = 180;
pub const ACTIVE_MAX_SECS: i64 = 240;

lazy_static! {
    /// KEYS: limit, leases, lease:<member>
    /// ARGV: member, token, ttl
    static ref ACQUIRE_PRE_DIAL: Script = Script::new(
        r#"
        local limit = tonumber(redis.call('GET', KEYS[1]) or '0')
        if limit <= 0 then
            return false
        end
        if redis.call('SCARD', KEYS[2]) >= limit then
            return false
        end
        redis.call('SADD', KEYS[2], ARGV[1])
        redis.call('SET', KEYS[3], ARGV[2], 'EX', tonumber(ARGV[3]))
        return ARGV[2]
        "#,
    );

    /// KEYS: lease:pre-<callId>, leases, lease:<callId>
    /// ARGV: preToken, preMember, member, activeToken, ttl
    static ref UPGRADE_TO_ACTIVE: Script = Script::new(
        r#"
        local current = redis.call('GET', KEYS[1])
        if not current or current ~= ARGV[1] then
            return false
        end
        redis.call('DEL', KEYS[1])
        redis.call('SREM', KEYS[2], ARGV[2])
        redis.call('SADD', KEYS[2], ARGV[3])
        redis.call('SET', KEYS[3], ARGV[4], 'EX', tonumber(ARGV[5]))
        return ARGV[4]
        "#,
    );

    /// KEYS: lease:<member>, leases
    /// ARGV: member, token, publishFlag, channel
    static ref RELEASE: Script = Script::new(
        r#"
        local current = redis.call('GET', KEYS[1])
        if not current or current ~= ARGV[2] then
            return 0
        end
        redis.call('DEL', KEYS[1])
        redis.call('SREM', KEYS[2], ARGV[1])
        if ARGV[3] == '1' then
            redis.call('PUBLISH', ARGV[4], ARGV[1])
        end
        return 1
        "#,
    );

    /// Webhook path: no token check, clears both variants.
    /// KEYS: lease:<callId>, lease:pre-<callId>, leases
    /// ARGV: member, preMember, publishFlag, channel
    /// Returns 1 (active released), 2 (pre-dial released), 0 (neither).
    static ref FORCE_RELEASE: Script = Script::new(
        r#"
        local released = 0
        if redis.call('DEL', KEYS[1]) == 1 then
            released = 1
        end
        if redis.call('DEL', KEYS[2]) == 1 then
            if released == 0 then
                released = 2
            end
        end
        redis.call('SREM', KEYS[3], ARGV[1], ARGV[2])
        if released > 0 and ARGV[3] == '1' then
            redis.call('PUBLISH', ARGV[4], ARGV[1])
        end
        return released
        "#,
    );

    /// Renewal refuses to run while cold-start recovery is blocking,
    /// so recovered leases cannot be resurrected mid-reconstruction.
    /// KEYS: lease:<member>, cold-start
    /// ARGV: token, quantum, maxTtl (0 = uncapped)
    static ref RENEW: Script = Script::new(
        r#"
        if redis.call('GET', KEYS[2]) == 'blocking' then
            return 0
        end
        local current = redis.call('GET', KEYS[1])
        if not current or current ~= ARGV[1] then
            return 0
        end
        local ttl = redis.call('TTL', KEYS[1])
        if ttl < 0 then
            ttl = 0
        end
        local extended = ttl + tonumber(ARGV[2])
        local cap = tonumber(ARGV[3])
        if cap > 0 and extended > cap then
            extended = cap
        end
        if extended <= ttl then
            return 0
        end
        redis.call('EXPIRE', KEYS[1], extended)
        return 1
        "#,
    );
}

/// What a force-release actually removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceReleased {
    Nothing,
    Active,
    PreDial,
}

#[derive(Clone)]
pub struct LeaseRegistry {
    kv: KvStore,
}

impl LeaseRegistry {
    pub fn new(kv: KvStore) -> Self {
        Self { kv }
    }

    /// Seed the configured concurrent limit for a campaign.
    pub async fn set_limit(&self, campaign_id: &str, limit: i64) -> Result<()> {
        let mut conn = self.kv.conn();
        redis::cmd("SET")
            .arg(keys::limit(campaign_id))
            .arg(limit)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn limit(&self, campaign_id: &str) -> Result<i64> {
        let mut conn = self.kv.conn();
        let limit: Option<i64> = redis::cmd("GET")
            .arg(keys::limit(campaign_id))
            .query_async(&mut conn)
            .await?;
        Ok(limit.unwrap_or(0))
    }

    /// Try to take a pre-dial slot for `call_id`. Returns the lease
    /// token, or `None` when the campaign is at capacity.
    pub async fn acquire_pre_dial(&self, campaign_id: &str, call_id: &str) -> Result<Option<String>> {
        let member = keys::pre_dial_member(call_id);
        let token = Uuid::new_v4().to_string();
        let ttl = PRE_DIAL_BASE_SECS + rand::thread_rng().gen_range(0..=PRE_DIAL_JITTER_SECS);

        let mut conn = self.kv.conn();
        let granted: Option<String> = ACQUIRE_PRE_DIAL
            .key(keys::limit(campaign_id))
            .key(keys::leases(campaign_id))
            .key(keys::lease(campaign_id, &member))
            .arg(&member)
            .arg(&token)
            .arg(ttl)
            .invoke_async(&mut conn)
            .await?;
        Ok(granted)
    }

    /// Exchange a pre-dial lease for an active one on carrier answer.
    /// Fails atomically (returns `None`) when the pre-dial token no
    /// longer matches, i.e. the lease expired or was force-released.
    pub async fn upgrade_to_active(
        &self,
        campaign_id: &str,
        call_id: &str,
        pre_token: &str,
    ) -> Result<Option<String>> {
        let pre_member = keys::pre_dial_member(call_id);
        let active_token = Uuid::new_v4().to_string();
        let ttl = ACTIVE_MIN_SECS + rand::thread_rng().gen_range(0..=(ACTIVE_MAX_SECS - ACTIVE_MIN_SECS));

        let mut conn = self.kv.conn();
        let granted: Option<String> = UPGRADE_TO_ACTIVE
            .key(keys::lease(campaign_id, &pre_member))
            .key(keys::leases(campaign_id))
            .key(keys::lease(campaign_id, call_id))
            .arg(pre_token)
            .arg(&pre_member)
            .arg(call_id)
            .arg(&active_token)
            .arg(ttl)
            .invoke_async(&mut conn)
            .await?;
        Ok(granted)
    }

    /// Compare-and-delete release. A token mismatch is a no-op so
    /// retried webhooks stay idempotent; a missing key counts as
    /// already released.
    pub async fn release(
        &self,
        campaign_id: &str,
        member: &str,
        token: &str,
        publish: bool,
    ) -> Result<bool> {
        let mut conn = self.kv.conn();
        let released: i64 = RELEASE
            .key(keys::lease(campaign_id, member))
            .key(keys::leases(campaign_id))
            .arg(member)
            .arg(token)
            .arg(if publish { "1" } else { "0" })
            .arg(slot_channel(campaign_id))
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    /// Webhook/janitor path: removes both the active and pre-dial
    /// variants without a token check.
    pub async fn force_release(
        &self,
        campaign_id: &str,
        call_id: &str,
        publish: bool,
    ) -> Result<ForceReleased> {
        let pre_member = keys::pre_dial_member(call_id);
        let mut conn = self.kv.conn();
        let released: i64 = FORCE_RELEASE
            .key(keys::lease(campaign_id, call_id))
            .key(keys::lease(campaign_id, &pre_member))
            .key(keys::leases(campaign_id))
            .arg(call_id)
            .arg(&pre_member)
            .arg(if publish { "1" } else { "0" })
            .arg(slot_channel(campaign_id))
            .invoke_async(&mut conn)
            .await?;
        Ok(match released {
            1 => ForceReleased::Active,
            2 => ForceReleased::PreDial,
            _ => ForceReleased::Nothing,
        })
    }

    /// Extend a lease's TTL by the renewal quantum. `max_ttl_secs`
    /// bounds the remaining TTL after renewal (pre-dial cap); pass 0
    /// for active leases.
    pub async fn renew(
        &self,
        campaign_id: &str,
        member: &str,
        token: &str,
        max_ttl_secs: i64,
    ) -> Result<bool> {
        let mut conn = self.kv.conn();
        let extended: i64 = RENEW
            .key(keys::lease(campaign_id, member))
            .key(keys::cold_start(campaign_id))
            .arg(token)
            .arg(RENEW_QUANTUM_SECS)
            .arg(max_ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    pub async fn members(&self, campaign_id: &str) -> Result<Vec<String>> {
        let mut conn = self.kv.conn();
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(keys::leases(campaign_id))
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    pub async fn member_count(&self, campaign_id: &str) -> Result<i64> {
        let mut conn = self.kv.conn();
        let count: i64 = redis::cmd("SCARD")
            .arg(keys::leases(campaign_id))
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    /// True when `lease:<member>` still exists for the given member.
    pub async fn member_alive(&self, campaign_id: &str, member: &str) -> Result<bool> {
        let mut conn = self.kv.conn();
        let exists: i64 = redis::cmd("EXISTS")
            .arg(keys::lease(campaign_id, member))
            .query_async(&mut conn)
            .await?;
        Ok(exists == 1)
    }

    /// Drop a stray member whose lease key is gone (janitor path).
    pub async fn remove_member(&self, campaign_id: &str, member: &str) -> Result<()> {
        let mut conn = self.kv.conn();
        redis::cmd("SREM")
            .arg(keys::leases(campaign_id))
            .arg(member)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Operator sweep: delete every member and lease key. Returns the
    /// member count before the sweep.
    pub async fn clear_all(&self, campaign_id: &str) -> Result<i64> {
        let members = self.members(campaign_id).await?;
        let before = members.len() as i64;
        let mut conn = self.kv.conn();
        for member in &members {
            redis::cmd("DEL")
                .arg(keys::lease(campaign_id, member))
                .query_async::<()>(&mut conn)
                .await?;
        }
        redis::cmd("DEL")
            .arg(keys::leases(campaign_id))
            .query_async::<()>(&mut conn)
            .await?;
        Ok(before)
    }
}
