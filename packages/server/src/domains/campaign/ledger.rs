//! Reservation ledger.
//!
//! The promoter's promise that a slot exists for a job key. The sorted
//! set (`origin:jobKey` scored by reservation epoch ms) is the source
//! of truth; the integer counter is a cache the janitor reconciles back
//! onto it. The whole pop-reserve-promote cycle is one script so the
//! capacity check can never interleave with another promoter.

use anyhow::Result;
use lazy_static::lazy_static;
use redis::Script;

use crate::domains::campaign::keys;
use crate::domains::campaign::waitlist::{Priority, MARKER_TTL_SECS};
use crate::kernel::kv::KvStore;

pub const RESERVATION_TTL_SECS: i64 = 70;
pub const GATE_TTL_SECS: i64 = 20;
pub const ORPHAN_AGE_SECS: i64 = 60;
pub const DEFAULT_PROMOTE_BATCH: i64 = 50;

lazy_static! {
    /// KEYS: limit, leases, reserved, ledger, wl:high, wl:normal,
    ///       fairness, gate:seq, gate
    /// ARGV: maxBatch, reservedTtl, gateTtl, nowMs, keyPrefix
    ///
    /// Fairness: the counter picks the leading queue per pop,
    /// `fair % 3 < 2` biasing 2:1 toward high. Marker-less pops are
    /// demoted (returned in the push-back list) instead of reserved.
    /// The gate only advances on non-empty batches, so an idle poll
    /// cannot invalidate promotions that are still in flight.
    static ref POP_RESERVE_PROMOTE: Script = Script::new(
        r#"
        local limit = tonumber(redis.call('GET', KEYS[1]) or '0')
        local inflight = redis.call('SCARD', KEYS[2])
        local reserved = tonumber(redis.call('GET', KEYS[3]) or '0')
        local available = limit - inflight - reserved
        if available < 0 then
            available = 0
        end
        local take = math.min(available, tonumber(ARGV[1]))
        local promoted = {}
        local pushback = {}
        local taken = 0
        while taken < take do
            local fair = redis.call('INCR', KEYS[7])
            local lead, trail, lead_origin, trail_origin
            if (fair % 3) < 2 then
                lead = KEYS[5]; trail = KEYS[6]; lead_origin = 'H'; trail_origin = 'N'
            else
                lead = KEYS[6]; trail = KEYS[5]; lead_origin = 'N'; trail_origin = 'H'
            end
            local job = redis.call('LPOP', lead)
            local origin = lead_origin
            if not job then
                job = redis.call('LPOP', trail)
                origin = trail_origin
            end
            if not job then
                break
            end
            local marker = ARGV[5] .. 'waitlist:marker:' .. job
            if redis.call('EXISTS', marker) == 0 then
                table.insert(pushback, job)
            else
                redis.call('DEL', marker)
                redis.call('ZADD', KEYS[4], tonumber(ARGV[4]), origin .. ':' .. job)
                table.insert(promoted, job)
                taken = taken + 1
            end
        end
        local seq
        if taken > 0 then
            redis.call('INCRBY', KEYS[3], taken)
            redis.call('EXPIRE', KEYS[3], tonumber(ARGV[2]))
            seq = redis.call('INCR', KEYS[8])
            redis.call('SET', KEYS[9], seq, 'EX', tonumber(ARGV[3]))
        else
            seq = tonumber(redis.call('GET', KEYS[8]) or '0')
        end
        return {taken, seq, promoted, pushback}
        "#,
    );

    /// Worker claims a reservation once it holds a lease (or drops a
    /// job with no record). KEYS: ledger, reserved. ARGV: jobKey.
    static ref CLAIM_RESERVATION: Script = Script::new(
        r#"
        local removed = redis.call('ZREM', KEYS[1], 'H:' .. ARGV[1])
        if removed == 0 then
            removed = redis.call('ZREM', KEYS[1], 'N:' .. ARGV[1])
        end
        if removed > 0 then
            local value = redis.call('DECRBY', KEYS[2], removed)
            if tonumber(value) < 0 then
                redis.call('SET', KEYS[2], '0', 'KEEPTTL')
            end
        end
        return removed
        "#,
    );

    /// Clamp-at-zero decrement. KEYS: reserved. ARGV: amount.
    static ref DECR_RESERVED: Script = Script::new(
        r#"
        local value = redis.call('DECRBY', KEYS[1], tonumber(ARGV[1]))
        if tonumber(value) < 0 then
            redis.call('SET', KEYS[1], '0', 'KEEPTTL')
            return 0
        end
        return value
        "#,
    );

    /// Janitor path: push an aged reservation back to its origin
    /// waitlist, restoring the marker the promotion deleted.
    /// KEYS: ledger, reserved, waitlist, marker
    /// ARGV: entry, jobKey, markerTtl
    static ref REQUEUE_ORPHAN: Script = Script::new(
        r#"
        local removed = redis.call('ZREM', KEYS[1], ARGV[1])
        if removed == 0 then
            return 0
        end
        local value = redis.call('DECRBY', KEYS[2], 1)
        if tonumber(value) < 0 then
            redis.call('SET', KEYS[2], '0', 'KEEPTTL')
        end
        redis.call('SET', KEYS[4], '1', 'EX', tonumber(ARGV[3]))
        redis.call('LPUSH', KEYS[3], ARGV[2])
        return 1
        "#,
    );
}

/// Result of one pop-reserve-promote call.
#[derive(Debug, Clone)]
pub struct PromotionBatch {
    pub count: i64,
    /// Monotonic promotion epoch for this batch.
    pub seq: i64,
    pub promoted: Vec<String>,
    /// Popped but demoted because their marker was gone.
    pub pushed_back: Vec<String>,
}

/// A ledger entry split into its parts.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub raw: String,
    pub origin: Priority,
    pub job_key: String,
    pub reserved_at_ms: i64,
}

#[derive(Clone)]
pub struct ReservationLedger {
    kv: KvStore,
}

impl ReservationLedger {
    pub fn new(kv: KvStore) -> Self {
        Self { kv }
    }

    pub async fn pop_reserve_promote(
        &self,
        campaign_id: &str,
        max_batch: i64,
        now_ms: i64,
    ) -> Result<PromotionBatch> {
        let mut conn = self.kv.conn();
        let (count, seq, promoted, pushed_back): (i64, i64, Vec<String>, Vec<String>) =
            POP_RESERVE_PROMOTE
                .key(keys::limit(campaign_id))
                .key(keys::leases(campaign_id))
                .key(keys::reserved(campaign_id))
                .key(keys::ledger(campaign_id))
                .key(keys::waitlist(campaign_id, Priority::High))
                .key(keys::waitlist(campaign_id, Priority::Normal))
                .key(keys::fairness(campaign_id))
                .key(keys::promote_gate_seq(campaign_id))
                .key(keys::promote_gate(campaign_id))
                .arg(max_batch)
                .arg(RESERVATION_TTL_SECS)
                .arg(GATE_TTL_SECS)
                .arg(now_ms)
                .arg(keys::prefix(campaign_id))
                .invoke_async(&mut conn)
                .await?;
        Ok(PromotionBatch {
            count,
            seq,
            promoted,
            pushed_back,
        })
    }

    /// Remove a job's reservation and decrement the counter. Returns
    /// true when an entry was actually claimed.
    pub async fn claim(&self, campaign_id: &str, job_key: &str) -> Result<bool> {
        let mut conn = self.kv.conn();
        let removed: i64 = CLAIM_RESERVATION
            .key(keys::ledger(campaign_id))
            .key(keys::reserved(campaign_id))
            .arg(job_key)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    pub async fn reserved_count(&self, campaign_id: &str) -> Result<i64> {
        let mut conn = self.kv.conn();
        let count: Option<i64> = redis::cmd("GET")
            .arg(keys::reserved(campaign_id))
            .query_async(&mut conn)
            .await?;
        Ok(count.unwrap_or(0))
    }

    pub async fn ledger_count(&self, campaign_id: &str) -> Result<i64> {
        let mut conn = self.kv.conn();
        let count: i64 = redis::cmd("ZCARD")
            .arg(keys::ledger(campaign_id))
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    /// Reservations older than the orphan threshold.
    pub async fn orphans(&self, campaign_id: &str, now_ms: i64) -> Result<Vec<LedgerEntry>> {
        let cutoff = now_ms - ORPHAN_AGE_SECS * 1_000;
        let mut conn = self.kv.conn();
        let raw: Vec<(String, i64)> = redis::cmd("ZRANGEBYSCORE")
            .arg(keys::ledger(campaign_id))
            .arg("-inf")
            .arg(cutoff)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;

        let mut entries = Vec::with_capacity(raw.len());
        for (entry, score) in raw {
            let Some((origin_code, job_key)) = entry.split_once(':') else {
                tracing::warn!(campaign_id, entry, "malformed ledger entry");
                continue;
            };
            let Some(origin) = Priority::from_origin_code(origin_code) else {
                tracing::warn!(campaign_id, entry, "unknown ledger origin");
                continue;
            };
            entries.push(LedgerEntry {
                raw: entry.clone(),
                origin,
                job_key: job_key.to_string(),
                reserved_at_ms: score,
            });
        }
        Ok(entries)
    }

    /// Push an orphaned reservation back onto its origin waitlist.
    pub async fn requeue_orphan(&self, campaign_id: &str, entry: &LedgerEntry) -> Result<bool> {
        let mut conn = self.kv.conn();
        let requeued: i64 = REQUEUE_ORPHAN
            .key(keys::ledger(campaign_id))
            .key(keys::reserved(campaign_id))
            .key(keys::waitlist(campaign_id, entry.origin))
            .key(keys::waitlist_marker(campaign_id, &entry.job_key))
            .arg(&entry.raw)
            .arg(&entry.job_key)
            .arg(MARKER_TTL_SECS)
            .invoke_async(&mut conn)
            .await?;
        Ok(requeued == 1)
    }

    /// Reconciler overwrite: counter := ledger cardinality.
    pub async fn set_reserved(&self, campaign_id: &str, value: i64) -> Result<()> {
        let mut conn = self.kv.conn();
        redis::cmd("SET")
            .arg(keys::reserved(campaign_id))
            .arg(value)
            .arg("EX")
            .arg(RESERVATION_TTL_SECS)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Current promotion gate value, if the gate key is still live.
    pub async fn current_gate(&self, campaign_id: &str) -> Result<Option<i64>> {
        let mut conn = self.kv.conn();
        let gate: Option<i64> = redis::cmd("GET")
            .arg(keys::promote_gate(campaign_id))
            .query_async(&mut conn)
            .await?;
        Ok(gate)
    }
}
