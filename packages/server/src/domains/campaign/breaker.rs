//! Per-campaign circuit breaker over the key-value store.
//!
//! Failures increment a 60 s windowed counter; past the threshold the
//! `circuit` key opens for 60 s. While open, the promoter shrinks its
//! batch and the outgoing-call surface returns 503.

use anyhow::Result;
use lazy_static::lazy_static;
use redis::Script;

use crate::domains::campaign::keys;
use crate::kernel::kv::KvStore;

pub const FAILURE_THRESHOLD: i64 = 5;
pub const WINDOW_SECS: i64 = 60;
pub const OPEN_SECS: i64 = 60;

lazy_static! {
    /// KEYS: cb:fail, circuit. ARGV: threshold, windowSecs, openSecs.
    /// Returns the failure count after the increment.
    static ref RECORD_FAILURE: Script = Script::new(
        r#"
        local count = redis.call('INCR', KEYS[1])
        redis.call('EXPIRE', KEYS[1], tonumber(ARGV[2]))
        if count > tonumber(ARGV[1]) then
            redis.call('SET', KEYS[2], 'open', 'EX', tonumber(ARGV[3]))
        end
        return count
        "#,
    );

    /// KEYS: cb:fail, circuit. Decrements; at zero clears both keys.
    static ref RECORD_SUCCESS: Script = Script::new(
        r#"
        local count = redis.call('DECR', KEYS[1])
        if count <= 0 then
            redis.call('DEL', KEYS[1])
            redis.call('DEL', KEYS[2])
            return 0
        end
        return count
        "#,
    );
}

#[derive(Clone)]
pub struct CircuitBreaker {
    kv: KvStore,
}

impl CircuitBreaker {
    pub fn new(kv: KvStore) -> Self {
        Self { kv }
    }

    pub async fn record_failure(&self, campaign_id: &str) -> Result<i64> {
        let mut conn = self.kv.conn();
        let count: i64 = RECORD_FAILURE
            .key(keys::breaker_failures(campaign_id))
            .key(keys::circuit(campaign_id))
            .arg(FAILURE_THRESHOLD)
            .arg(WINDOW_SECS)
            .arg(OPEN_SECS)
            .invoke_async(&mut conn)
            .await?;
        if count == FAILURE_THRESHOLD + 1 {
            tracing::warn!(campaign_id, failures = count, "circuit breaker opened");
        }
        Ok(count)
    }

    pub async fn record_success(&self, campaign_id: &str) -> Result<()> {
        let mut conn = self.kv.conn();
        let _: i64 = RECORD_SUCCESS
            .key(keys::breaker_failures(campaign_id))
            .key(keys::circuit(campaign_id))
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn is_open(&self, campaign_id: &str) -> Result<bool> {
        let mut conn = self.kv.conn();
        let exists: i64 = redis::cmd("EXISTS")
            .arg(keys::circuit(campaign_id))
            .query_async(&mut conn)
            .await?;
        Ok(exists == 1)
    }

    /// Promotion batch size under the current breaker state: an open
    /// circuit quarters the batch (floor 1).
    pub async fn adjust_batch(&self, campaign_id: &str, default_batch: i64) -> Result<i64> {
        if self.is_open(campaign_id).await? {
            Ok((default_batch / 4).max(1))
        } else {
            Ok(default_batch)
        }
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn quartered_batch_floors_at_one() {
        assert_eq!((50i64 / 4).max(1), 12);
        assert_eq!((3i64 / 4).max(1), 1);
    }
}
