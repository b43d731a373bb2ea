//! Per-campaign dial waitlists.
//!
//! Two FIFO queues (`high`, `normal`) of job keys. A per-job marker key
//! (`SET NX`) makes enqueue idempotent, and a contact-level seen set
//! swallows duplicate enqueues of the same contact.

use anyhow::Result;

use crate::domains::campaign::keys;
use crate::kernel::kv::KvStore;

pub const MARKER_TTL_SECS: i64 = 3_600;
pub const SEEN_TTL_SECS: i64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Normal,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
        }
    }

    /// Single-letter origin code stored in ledger entries.
    pub fn origin_code(&self) -> &'static str {
        match self {
            Priority::High => "H",
            Priority::Normal => "N",
        }
    }

    pub fn from_origin_code(code: &str) -> Option<Self> {
        match code {
            "H" => Some(Priority::High),
            "N" => Some(Priority::Normal),
            _ => None,
        }
    }
}

/// Outcome of an enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// The job key already carries a live marker.
    DuplicateJob,
    /// The contact was already enqueued inside the dedup window.
    DuplicateContact,
}

#[derive(Clone)]
pub struct Waitlist {
    kv: KvStore,
}

impl Waitlist {
    pub fn new(kv: KvStore) -> Self {
        Self { kv }
    }

    /// Idempotent enqueue: contact dedup, then marker CAS, then push.
    /// Duplicates are swallowed; the caller only logs a metric.
    pub async fn enqueue(
        &self,
        campaign_id: &str,
        job_key: &str,
        contact_id: Option<&str>,
        priority: Priority,
    ) -> Result<EnqueueOutcome> {
        let mut conn = self.kv.conn();

        if let Some(contact_id) = contact_id {
            let added: i64 = redis::cmd("SADD")
                .arg(keys::waitlist_seen(campaign_id))
                .arg(contact_id)
                .query_async(&mut conn)
                .await?;
            redis::cmd("EXPIRE")
                .arg(keys::waitlist_seen(campaign_id))
                .arg(SEEN_TTL_SECS)
                .query_async::<()>(&mut conn)
                .await?;
            if added == 0 {
                tracing::warn!(
                    metric = "duplicate_enqueue",
                    campaign_id,
                    contact_id,
                    "contact already enqueued; swallowing"
                );
                return Ok(EnqueueOutcome::DuplicateContact);
            }
        }

        let marker_set: Option<String> = redis::cmd("SET")
            .arg(keys::waitlist_marker(campaign_id, job_key))
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(MARKER_TTL_SECS)
            .query_async(&mut conn)
            .await?;
        if marker_set.is_none() {
            tracing::warn!(
                metric = "duplicate_enqueue",
                campaign_id,
                job_key,
                "marker already present; swallowing"
            );
            return Ok(EnqueueOutcome::DuplicateJob);
        }

        redis::cmd("RPUSH")
            .arg(keys::waitlist(campaign_id, priority))
            .arg(job_key)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(EnqueueOutcome::Enqueued)
    }

    /// Push an orphaned job back to the front of its original queue.
    /// The marker must be restored too, since the promotion script demotes
    /// marker-less entries.
    pub async fn requeue_front(
        &self,
        campaign_id: &str,
        job_key: &str,
        priority: Priority,
    ) -> Result<()> {
        let mut conn = self.kv.conn();
        redis::cmd("SET")
            .arg(keys::waitlist_marker(campaign_id, job_key))
            .arg("1")
            .arg("EX")
            .arg(MARKER_TTL_SECS)
            .query_async::<()>(&mut conn)
            .await?;
        redis::cmd("LPUSH")
            .arg(keys::waitlist(campaign_id, priority))
            .arg(job_key)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Cleared on job state transitions so a finished job can be
    /// legitimately re-enqueued later.
    pub async fn clear_marker(&self, campaign_id: &str, job_key: &str) -> Result<()> {
        let mut conn = self.kv.conn();
        redis::cmd("DEL")
            .arg(keys::waitlist_marker(campaign_id, job_key))
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn lengths(&self, campaign_id: &str) -> Result<(i64, i64)> {
        let mut conn = self.kv.conn();
        let high: i64 = redis::cmd("LLEN")
            .arg(keys::waitlist(campaign_id, Priority::High))
            .query_async(&mut conn)
            .await?;
        let normal: i64 = redis::cmd("LLEN")
            .arg(keys::waitlist(campaign_id, Priority::Normal))
            .query_async(&mut conn)
            .await?;
        Ok((high, normal))
    }

    /// First `count` entries of a queue, for the compactor's sampling.
    pub async fn sample(
        &self,
        campaign_id: &str,
        priority: Priority,
        count: i64,
    ) -> Result<Vec<String>> {
        let mut conn = self.kv.conn();
        let entries: Vec<String> = redis::cmd("LRANGE")
            .arg(keys::waitlist(campaign_id, priority))
            .arg(0)
            .arg(count - 1)
            .query_async(&mut conn)
            .await?;
        Ok(entries)
    }

    /// Remove a specific entry (compactor path, after a state check).
    pub async fn remove(
        &self,
        campaign_id: &str,
        priority: Priority,
        job_key: &str,
    ) -> Result<i64> {
        let mut conn = self.kv.conn();
        let removed: i64 = redis::cmd("LREM")
            .arg(keys::waitlist(campaign_id, priority))
            .arg(1)
            .arg(job_key)
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_codes_round_trip() {
        assert_eq!(Priority::High.origin_code(), "H");
        assert_eq!(Priority::from_origin_code("N"), Some(Priority::Normal));
        assert_eq!(Priority::from_origin_code("X"), None);
    }
}
