//! Application setup: router, state, and the background service fleet.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::domains::campaign::janitor::Janitor;
use crate::domains::campaign::leader::LeaderElection;
use crate::domains::campaign::promoter::Promoter;
use crate::domains::campaign::stuck::StuckCallMonitor;
use crate::domains::campaign::worker::CampaignWorkerPool;
use crate::domains::retry::service::RetryDialHandler;
use crate::domains::scheduling::service::ScheduledCallHandler;
use crate::kernel::jobs::{JobRegistry, JobRunner};
use crate::kernel::ServerDeps;
use crate::server::middleware::operator_auth_middleware;
use crate::server::routes::{
    cancel_handler, cleanup_slots_handler, health_handler, outbound_handler, reschedule_handler,
    schedule_handler, status_handler,
};

#[derive(Clone)]
pub struct AppState {
    pub deps: Arc<ServerDeps>,
}

pub fn build_router(deps: Arc<ServerDeps>) -> Router {
    let cors = match deps.config.frontend_url.parse::<HeaderValue>() {
        Ok(origin) => CorsLayer::new()
            .allow_origin(origin)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([AUTHORIZATION, CONTENT_TYPE]),
        Err(_) => CorsLayer::permissive(),
    };

    let state = AppState { deps };

    // Operator surface requires a bearer token; collaborator-facing
    // endpoints authenticate by other means (webhook tokens).
    let maintenance = Router::new()
        .route(
            "/maintenance/cleanup-slots/:campaign_id",
            post(cleanup_slots_handler),
        )
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            operator_auth_middleware,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .route("/scheduling/schedule", post(schedule_handler))
        .route("/scheduling/:id/cancel", post(cancel_handler))
        .route("/scheduling/:id/reschedule", post(reschedule_handler))
        .route("/calls/outbound", post(outbound_handler))
        .route("/exotel/webhook/status", post(status_handler))
        .merge(maintenance)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// The delayed-job registry: scheduled calls and retry dials. Campaign
/// dial jobs are claimed by the campaign workers, not this runner.
pub fn build_job_registry() -> JobRegistry {
    JobRegistry::new()
        .register(Arc::new(ScheduledCallHandler))
        .register(Arc::new(RetryDialHandler))
}

/// Handles to every background loop, for graceful shutdown.
pub struct BackgroundServices {
    shutdown_flags: Vec<Arc<AtomicBool>>,
    pub leader_flag: Arc<AtomicBool>,
}

impl BackgroundServices {
    pub fn shutdown(&self) {
        for flag in &self.shutdown_flags {
            flag.store(true, Ordering::SeqCst);
        }
    }
}

/// Spawn the dispatcher fleet: leader election, promoter, campaign
/// workers, janitors, stuck-call monitor, and the job runner.
pub fn spawn_background_services(deps: Arc<ServerDeps>) -> BackgroundServices {
    let election = LeaderElection::new(deps.kv.clone(), deps.config.instance_id.clone());
    let leader_flag = election.leader_flag();
    tokio::spawn(election.run());

    let promoter = Arc::new(Promoter::new(deps.clone(), leader_flag.clone()));
    let promoter_shutdown = promoter.shutdown_handle();
    tokio::spawn(promoter.run());

    let worker_pool = CampaignWorkerPool::new(deps.clone(), leader_flag.clone());
    let pool_shutdown = worker_pool.shutdown_handle();
    tokio::spawn(worker_pool.run());

    let janitor = Arc::new(Janitor::new(deps.clone(), leader_flag.clone()));
    let janitor_shutdown = janitor.shutdown_handle();
    tokio::spawn(janitor.run());

    let stuck = StuckCallMonitor::new(deps.clone(), leader_flag.clone());
    let stuck_shutdown = stuck.shutdown_handle();
    tokio::spawn(stuck.run());

    let runner = JobRunner::new(Arc::new(build_job_registry()), deps);
    let runner_shutdown = runner.shutdown_handle();
    tokio::spawn(runner.run());

    BackgroundServices {
        shutdown_flags: vec![
            promoter_shutdown,
            pool_shutdown,
            janitor_shutdown,
            stuck_shutdown,
            runner_shutdown,
        ],
        leader_flag,
    }
}
