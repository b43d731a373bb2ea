//! Registry mapping job types to their handlers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::job::Job;
use crate::common::AppError;
use crate::kernel::ServerDeps;

/// A handler for one job type.
///
/// Errors decide retries: `AppError::is_retryable` failures are
/// re-queued by the runner with backoff, the rest fail the job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> &'static str;
    async fn execute(&self, job: &Job, deps: Arc<ServerDeps>) -> Result<(), AppError>;
}

#[derive(Default)]
pub struct JobRegistry {
    handlers: HashMap<&'static str, Arc<dyn JobHandler>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(handler.job_type(), handler);
        self
    }

    /// Job types this registry can execute; the runner claims only these.
    pub fn job_types(&self) -> Vec<String> {
        self.handlers.keys().map(|t| t.to_string()).collect()
    }

    pub async fn execute(&self, job: &Job, deps: Arc<ServerDeps>) -> Result<(), AppError> {
        let Some(handler) = self.handlers.get(job.job_type.as_str()) else {
            return Err(AppError::Fatal(anyhow::anyhow!(
                "no handler registered for job type {}",
                job.job_type
            )));
        };
        handler.execute(job, deps).await
    }
}

pub type SharedJobRegistry = Arc<JobRegistry>;
