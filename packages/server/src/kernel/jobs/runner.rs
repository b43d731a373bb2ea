//! Background service that executes delayed jobs.
//!
//! ```text
//! JobRunner
//!     │
//!     ├─► claim due jobs (FOR UPDATE SKIP LOCKED)
//!     ├─► execute via JobRegistry
//!     └─► mark succeeded / failed (queue handles retry backoff)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::registry::SharedJobRegistry;
use crate::kernel::ServerDeps;

#[derive(Debug, Clone)]
pub struct JobRunnerConfig {
    pub batch_size: i64,
    pub poll_interval: Duration,
    pub worker_id: String,
}

impl Default for JobRunnerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval: Duration::from_secs(2),
            worker_id: format!("runner-{}", Uuid::new_v4()),
        }
    }
}

pub struct JobRunner {
    registry: SharedJobRegistry,
    deps: Arc<ServerDeps>,
    config: JobRunnerConfig,
    shutdown: Arc<AtomicBool>,
}

impl JobRunner {
    pub fn new(registry: SharedJobRegistry, deps: Arc<ServerDeps>) -> Self {
        Self {
            registry,
            deps,
            config: JobRunnerConfig::default(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_config(
        registry: SharedJobRegistry,
        deps: Arc<ServerDeps>,
        config: JobRunnerConfig,
    ) -> Self {
        Self {
            registry,
            deps,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Store `true` here to stop the loop after the current batch.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub async fn run(self) -> Result<()> {
        let job_types = self.registry.job_types();
        info!(
            worker_id = %self.config.worker_id,
            batch_size = self.config.batch_size,
            types = ?job_types,
            "job runner starting"
        );

        let mut last_reap = Instant::now();
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            // Stalled-job sweep piggybacks on the poll loop.
            if last_reap.elapsed() > Duration::from_secs(30) {
                if let Err(e) = self.deps.job_queue.reap_stalled().await {
                    error!(error = %e, "stalled-job reap failed");
                }
                last_reap = Instant::now();
            }

            let jobs = match self
                .deps
                .job_queue
                .claim(&self.config.worker_id, self.config.batch_size, &job_types)
                .await
            {
                Ok(jobs) => jobs,
                Err(e) => {
                    error!(error = %e, "failed to claim jobs");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            if jobs.is_empty() {
                tokio::time::sleep(self.config.poll_interval).await;
                continue;
            }

            debug!(count = jobs.len(), "claimed jobs");

            for job in jobs {
                if self.shutdown.load(Ordering::SeqCst) {
                    break;
                }

                let job_id = job.id;
                let job_type = job.job_type.clone();
                debug!(job_id = %job_id, job_type = %job_type, "executing job");

                match self.registry.execute(&job, self.deps.clone()).await {
                    Ok(()) => {
                        debug!(job_id = %job_id, job_type = %job_type, "job succeeded");
                        if let Err(e) = self.deps.job_queue.mark_succeeded(job_id).await {
                            error!(job_id = %job_id, error = %e, "failed to mark job succeeded");
                        }
                    }
                    Err(e) => {
                        warn!(job_id = %job_id, job_type = %job_type, error = %e, "job failed");
                        let retryable = e.is_retryable();
                        if let Err(mark_err) = self
                            .deps
                            .job_queue
                            .mark_failed(job_id, &e.to_string(), retryable)
                            .await
                        {
                            error!(job_id = %job_id, error = %mark_err, "failed to mark job failed");
                        }
                    }
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "job runner stopped");
        Ok(())
    }
}
