//! Process-lifetime dependencies shared by handlers, workers, and
//! background loops.

use std::sync::Arc;

use anyhow::Result;
use sqlx::PgPool;

use crate::config::Config;
use crate::domains::calls::telephony::TelephonyClient;
use crate::domains::campaign::breaker::CircuitBreaker;
use crate::domains::campaign::cold_start::ColdStartGuard;
use crate::domains::campaign::lease::LeaseRegistry;
use crate::domains::campaign::ledger::ReservationLedger;
use crate::domains::campaign::waitlist::Waitlist;
use crate::kernel::jobs::PostgresJobQueue;
use crate::kernel::kv::KvStore;
use crate::kernel::rate_limit::RateLimiter;

/// Reserved pseudo-campaign id for campaign-less outbound calls; they
/// share the lease registry machinery under this bucket.
pub const ADHOC_CAMPAIGN: &str = "adhoc";

/// Global carrier dial rate (dispatches per second).
pub const DISPATCH_RATE_PER_SEC: u32 = 10;

pub struct ServerDeps {
    pub config: Config,
    pub db_pool: PgPool,
    pub kv: KvStore,
    pub telephony: Arc<dyn TelephonyClient>,
    pub job_queue: Arc<PostgresJobQueue>,
    pub leases: LeaseRegistry,
    pub ledger: ReservationLedger,
    pub waitlist: Waitlist,
    pub breaker: CircuitBreaker,
    pub cold_start: Arc<ColdStartGuard>,
    pub dial_limiter: Arc<RateLimiter>,
}

impl ServerDeps {
    pub async fn new(
        config: Config,
        db_pool: PgPool,
        kv: KvStore,
        telephony: Arc<dyn TelephonyClient>,
    ) -> Result<Arc<Self>> {
        let leases = LeaseRegistry::new(kv.clone());
        let cold_start = Arc::new(ColdStartGuard::new(
            kv.clone(),
            leases.clone(),
            db_pool.clone(),
        ));
        let job_queue = Arc::new(PostgresJobQueue::new(
            db_pool.clone(),
            config.queue_retry_backoff_ms,
        ));

        // Seed the adhoc bucket so campaign-less calls get accounting.
        leases
            .set_limit(ADHOC_CAMPAIGN, config.adhoc_concurrent_limit)
            .await?;

        Ok(Arc::new(Self {
            ledger: ReservationLedger::new(kv.clone()),
            waitlist: Waitlist::new(kv.clone()),
            breaker: CircuitBreaker::new(kv.clone()),
            dial_limiter: Arc::new(RateLimiter::new(DISPATCH_RATE_PER_SEC)),
            cold_start,
            leases,
            job_queue,
            telephony,
            kv,
            db_pool,
            config,
        }))
    }
}
