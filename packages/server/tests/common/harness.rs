//! Test harness with testcontainers for integration testing.
//!
//! Containers (Postgres + Redis) are started once and shared across all
//! tests; migrations run once. Each test gets fresh `ServerDeps` wired
//! to a mock telephony client.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use dispatcher_core::config::Config;
use dispatcher_core::domains::calls::telephony::MockTelephony;
use dispatcher_core::kernel::{KvStore, ServerDeps};
use sqlx::PgPool;
use test_context::AsyncTestContext;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;

/// Shared test infrastructure that persists across all tests.
struct SharedTestInfra {
    db_url: String,
    kv_url: String,
    _postgres: ContainerAsync<Postgres>,
    _redis: ContainerAsync<Redis>,
}

static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        // Respect RUST_LOG; run tests with
        // RUST_LOG=debug cargo test -- --nocapture
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .start()
            .await
            .context("Failed to start Postgres container")?;
        let pg_host = postgres.get_host().await?;
        let pg_port = postgres.get_host_port_ipv4(5432).await?;
        let db_url = format!("postgresql://postgres:postgres@{pg_host}:{pg_port}/postgres");

        let redis = Redis::default()
            .start()
            .await
            .context("Failed to start Redis container")?;
        let redis_host = redis.get_host().await?;
        let redis_port = redis.get_host_port_ipv4(6379).await?;
        let kv_url = format!("redis://{redis_host}:{redis_port}");

        let pool = PgPool::connect(&db_url)
            .await
            .context("Failed to connect for migrations")?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            db_url,
            kv_url,
            _postgres: postgres,
            _redis: redis,
        })
    }

    async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("Failed to initialize shared test infrastructure")
            })
            .await
    }
}

fn test_config(db_url: &str, kv_url: &str) -> Config {
    Config {
        kv_url: kv_url.to_string(),
        docstore_uri: db_url.to_string(),
        jwt_secret: "0123456789abcdef0123456789abcdef".to_string(),
        port: 0,
        frontend_url: "http://localhost:3000".to_string(),
        default_timezone: "Asia/Kolkata".to_string(),
        business_hours_start: 9,
        business_hours_end: 18,
        queue_retry_attempts: 3,
        queue_retry_backoff_ms: 50,
        instance_id: "test-0".to_string(),
        // Headroom for tests that place adhoc calls concurrently; the
        // capacity-specific test pins its own limit.
        adhoc_concurrent_limit: 4,
        caller_phone: "+15005550006".to_string(),
        webhook_base_url: "http://localhost:8080".to_string(),
    }
}

/// Per-test harness over the shared containers.
pub struct TestHarness {
    pub deps: Arc<ServerDeps>,
    pub db_pool: PgPool,
    pub telephony: Arc<MockTelephony>,
    /// Pre-set leader flag for driving background components directly.
    pub leader: Arc<AtomicBool>,
}

impl TestHarness {
    pub async fn new() -> Result<Self> {
        let infra = SharedTestInfra::get().await;

        let db_pool = PgPool::connect(&infra.db_url)
            .await
            .context("Failed to connect to test database")?;
        let kv = KvStore::connect(&infra.kv_url).await?;
        let telephony = MockTelephony::new();

        let deps = ServerDeps::new(
            test_config(&infra.db_url, &infra.kv_url),
            db_pool.clone(),
            kv,
            telephony.clone(),
        )
        .await?;

        Ok(Self {
            deps,
            db_pool,
            telephony,
            leader: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Poll a condition every 25 ms for up to ~5 s.
    pub async fn wait_for<F, Fut>(&self, condition: F) -> bool
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if condition().await {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
            tokio::task::yield_now().await;
        }
        false
    }
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        Self::new().await.expect("Failed to create test harness")
    }

    async fn teardown(self) {
        self.db_pool.close().await;
    }
}
