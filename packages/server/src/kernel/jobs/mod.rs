//! Delayed-job runner: the persistence and execution substrate for
//! scheduled calls, retries, and campaign dial jobs.

pub mod job;
pub mod queue;
pub mod registry;
pub mod runner;

pub use job::{Job, JobPriority, JobStatus};
pub use queue::{EnqueueResult, JobSpec, PostgresJobQueue};
pub use registry::{JobHandler, JobRegistry, SharedJobRegistry};
pub use runner::{JobRunner, JobRunnerConfig};
