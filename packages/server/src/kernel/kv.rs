//! Key-value store abstraction over Redis.
//!
//! All campaign concurrency state lives here: lease sets, reservation
//! ledgers, waitlists, gates, and the slot-available pub/sub channel.
//! Multi-key invariants are enforced by Lua scripts that execute in a
//! single round trip; the `{campaignId}` hash tag keeps every key of a
//! campaign on one cluster shard so those scripts stay atomic.

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::Client;

/// Shared handle to the key-value store.
///
/// `ConnectionManager` multiplexes one reconnecting connection; pub/sub
/// needs dedicated connections, which are minted from the raw client.
#[derive(Clone)]
pub struct KvStore {
    manager: ConnectionManager,
    client: Client,
}

impl KvStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url).context("invalid KV_URL")?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .context("failed to connect to key-value store")?;
        Ok(Self { manager, client })
    }

    /// A cheap clone of the multiplexed connection for commands/scripts.
    pub fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// A dedicated pub/sub connection (psubscribe etc.).
    pub async fn pubsub(&self) -> Result<redis::aio::PubSub> {
        self.client
            .get_async_pubsub()
            .await
            .context("failed to open pub/sub connection")
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn();
        redis::cmd("PING")
            .query_async::<()>(&mut conn)
            .await
            .context("kv ping failed")?;
        Ok(())
    }
}

/// The pub/sub channel a campaign's slot-available notifications use.
pub fn slot_channel(campaign_id: &str) -> String {
    format!("campaign:{{{}}}:slot-available", campaign_id)
}

/// Pattern matching every campaign's slot-available channel.
pub const SLOT_CHANNEL_PATTERN: &str = "campaign:*:slot-available";

/// Extract the campaign id out of a slot-available channel name.
pub fn campaign_from_channel(channel: &str) -> Option<&str> {
    channel
        .strip_prefix("campaign:{")?
        .strip_suffix("}:slot-available")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_round_trip() {
        let ch = slot_channel("c-123");
        assert_eq!(ch, "campaign:{c-123}:slot-available");
        assert_eq!(campaign_from_channel(&ch), Some("c-123"));
        assert_eq!(campaign_from_channel("campaign:{x}:paused"), None);
    }
}
