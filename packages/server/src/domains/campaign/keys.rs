//! Key layout for per-campaign concurrency state.
//!
//! Every key is prefixed `campaign:{<id>}:`. The braces are a cluster
//! hash tag, so all keys of one campaign land on the same shard and the
//! multi-key scripts in `lease.rs`/`ledger.rs` stay atomic.

use crate::domains::campaign::waitlist::Priority;

pub fn prefix(campaign_id: &str) -> String {
    format!("campaign:{{{}}}:", campaign_id)
}

/// Configured concurrent-call limit.
pub fn limit(campaign_id: &str) -> String {
    format!("{}limit", prefix(campaign_id))
}

/// Set of lease members: active `callId` or pre-dial `pre-<callId>`.
pub fn leases(campaign_id: &str) -> String {
    format!("{}leases", prefix(campaign_id))
}

/// Per-member lease key holding the token; presence ↔ lease alive.
pub fn lease(campaign_id: &str, member: &str) -> String {
    format!("{}lease:{}", prefix(campaign_id), member)
}

pub fn reserved(campaign_id: &str) -> String {
    format!("{}reserved", prefix(campaign_id))
}

/// Sorted set of `origin:jobId` scored by reservation epoch millis.
pub fn ledger(campaign_id: &str) -> String {
    format!("{}reserved:ledger", prefix(campaign_id))
}

pub fn waitlist(campaign_id: &str, priority: Priority) -> String {
    format!("{}waitlist:{}", prefix(campaign_id), priority.as_str())
}

pub fn waitlist_marker(campaign_id: &str, job_key: &str) -> String {
    format!("{}waitlist:marker:{}", prefix(campaign_id), job_key)
}

/// Contact-level dedup set.
pub fn waitlist_seen(campaign_id: &str) -> String {
    format!("{}waitlist:seen", prefix(campaign_id))
}

pub fn promote_gate(campaign_id: &str) -> String {
    format!("{}promote-gate", prefix(campaign_id))
}

pub fn promote_gate_seq(campaign_id: &str) -> String {
    format!("{}promote-gate:seq", prefix(campaign_id))
}

pub fn promote_mutex(campaign_id: &str) -> String {
    format!("{}promote-mutex", prefix(campaign_id))
}

pub fn fairness(campaign_id: &str) -> String {
    format!("{}fairness", prefix(campaign_id))
}

pub fn paused(campaign_id: &str) -> String {
    format!("{}paused", prefix(campaign_id))
}

pub fn cold_start(campaign_id: &str) -> String {
    format!("{}cold-start", prefix(campaign_id))
}

pub fn breaker_failures(campaign_id: &str) -> String {
    format!("{}cb:fail", prefix(campaign_id))
}

pub fn circuit(campaign_id: &str) -> String {
    format!("{}circuit", prefix(campaign_id))
}

/// Lease-set member name for a call in the pre-dial window.
pub fn pre_dial_member(call_id: &str) -> String {
    format!("pre-{}", call_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_share_the_hash_tag() {
        let id = "7a1d";
        for key in [
            limit(id),
            leases(id),
            lease(id, "abc"),
            reserved(id),
            ledger(id),
            waitlist(id, Priority::High),
            waitlist_marker(id, "dial-1"),
            promote_gate(id),
            promote_mutex(id),
            cold_start(id),
        ] {
            assert!(key.starts_with("campaign:{7a1d}:"), "bad key {key}");
        }
    }

    #[test]
    fn pre_dial_member_shape() {
        assert_eq!(pre_dial_member("c1"), "pre-c1");
    }
}
