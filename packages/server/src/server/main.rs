//! Dispatcher server entry point.

use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use exotel::{ExotelOptions, ExotelService};
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use dispatcher_core::config::Config;
use dispatcher_core::domains::calls::telephony::ExotelTelephony;
use dispatcher_core::kernel::{KvStore, ServerDeps};
use dispatcher_core::server::app::{build_router, spawn_background_services};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .init();

    let config = Config::from_env()?;

    let db_pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&config.docstore_uri)
        .await
        .context("failed to connect to document store")?;
    sqlx::migrate!("./migrations")
        .run(&db_pool)
        .await
        .context("failed to run migrations")?;

    let kv = KvStore::connect(&config.kv_url).await?;

    let telephony = Arc::new(ExotelTelephony::new(ExotelService::new(ExotelOptions {
        account_sid: env::var("EXOTEL_ACCOUNT_SID").context("EXOTEL_ACCOUNT_SID must be set")?,
        api_key: env::var("EXOTEL_API_KEY").context("EXOTEL_API_KEY must be set")?,
        api_token: env::var("EXOTEL_API_TOKEN").context("EXOTEL_API_TOKEN must be set")?,
        subdomain: env::var("EXOTEL_SUBDOMAIN").unwrap_or_else(|_| "api.exotel.com".to_string()),
        caller_id: config.caller_phone.clone(),
    })));

    let port = config.port;
    let deps = ServerDeps::new(config, db_pool, kv, telephony).await?;

    let services = spawn_background_services(deps.clone());
    let app = build_router(deps);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind port {port}"))?;
    info!(port, "dispatcher listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received; draining background services");
            services.shutdown();
        })
        .await
        .context("server error")?;

    Ok(())
}
