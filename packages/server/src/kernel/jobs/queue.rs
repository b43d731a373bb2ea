//! PostgreSQL-backed delayed-job queue.
//!
//! Stores jobs for the runner and the campaign workers: delayed or
//! immediate, idempotent by `job_key`, claimed with `FOR UPDATE SKIP
//! LOCKED`, retried in place with exponential backoff.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::job::{Job, JobPriority, JobStatus, JOB_COLUMNS};

/// Result of an enqueue that handles idempotency.
#[derive(Debug, Clone)]
pub enum EnqueueResult {
    Created(Uuid),
    /// A live job with the same key already exists.
    Duplicate(Uuid),
}

impl EnqueueResult {
    pub fn job_id(&self) -> Uuid {
        match self {
            EnqueueResult::Created(id) | EnqueueResult::Duplicate(id) => *id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueResult::Created(_))
    }
}

/// What to insert; the queue owns ids, attempts, and timestamps.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub job_key: String,
    pub job_type: String,
    pub args: serde_json::Value,
    pub priority: JobPriority,
    pub run_at: Option<DateTime<Utc>>,
    pub max_attempts: i32,
}

impl JobSpec {
    pub fn new(
        job_key: impl Into<String>,
        job_type: impl Into<String>,
        args: serde_json::Value,
    ) -> Self {
        Self {
            job_key: job_key.into(),
            job_type: job_type.into(),
            args,
            priority: JobPriority::Normal,
            run_at: None,
            max_attempts: 3,
        }
    }

    pub fn priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }

    pub fn max_attempts(mut self, max: i32) -> Self {
        self.max_attempts = max;
        self
    }
}

pub struct PostgresJobQueue {
    pool: PgPool,
    lease_secs: i64,
    retry_backoff_ms: i64,
}

impl PostgresJobQueue {
    pub fn new(pool: PgPool, retry_backoff_ms: i64) -> Self {
        Self {
            pool,
            lease_secs: 60,
            retry_backoff_ms,
        }
    }

    async fn insert(&self, spec: JobSpec, status: JobStatus) -> Result<EnqueueResult> {
        // The partial unique index on live job keys backs this up; the
        // pre-check keeps the common duplicate path quiet.
        if let Some(existing) = Job::find_live_by_key(&spec.job_key, &self.pool).await? {
            return Ok(EnqueueResult::Duplicate(existing.id));
        }

        let id = Uuid::new_v4();
        let inserted = sqlx::query(
            r#"
            INSERT INTO jobs (id, job_key, job_type, args, priority, status, run_at, max_attempts)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(id)
        .bind(&spec.job_key)
        .bind(&spec.job_type)
        .bind(&spec.args)
        .bind(spec.priority)
        .bind(status)
        .bind(spec.run_at)
        .bind(spec.max_attempts)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 0 {
            // Lost the race to a concurrent enqueue of the same key.
            let existing = Job::find_live_by_key(&spec.job_key, &self.pool).await?;
            return Ok(match existing {
                Some(job) => EnqueueResult::Duplicate(job.id),
                None => EnqueueResult::Duplicate(id),
            });
        }
        Ok(EnqueueResult::Created(id))
    }

    /// Enqueue for execution as soon as a worker claims it.
    pub async fn enqueue(&self, spec: JobSpec) -> Result<EnqueueResult> {
        self.insert(spec, JobStatus::Pending).await
    }

    /// Enqueue in the parked state; the promoter releases it later.
    pub async fn park(&self, spec: JobSpec) -> Result<EnqueueResult> {
        self.insert(spec, JobStatus::Waiting).await
    }

    /// Release a parked (or re-promote a pending) job for immediate
    /// execution, merging `args_patch` into its args. Returns false
    /// when no live job carries the key.
    pub async fn promote_waiting(
        &self,
        job_key: &str,
        args_patch: &serde_json::Value,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                args = args || $1,
                run_at = NULL,
                updated_at = NOW()
            WHERE job_key = $2 AND status IN ('waiting', 'pending')
            "#,
        )
        .bind(args_patch)
        .bind(job_key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Move a scheduled job to run now (delayed-job promote).
    pub async fn promote(&self, job_key: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET run_at = NULL, updated_at = NOW()
            WHERE job_key = $1 AND status = 'pending'
            "#,
        )
        .bind(job_key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Claim up to `limit` due jobs of the given types.
    pub async fn claim(
        &self,
        worker_id: &str,
        limit: i64,
        job_types: &[String],
    ) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE jobs
            SET status = 'running',
                worker_id = $1,
                attempt_count = attempt_count + 1,
                lease_expires_at = NOW() + ($2 || ' seconds')::INTERVAL,
                updated_at = NOW()
            WHERE id IN (
                SELECT id FROM jobs
                WHERE status = 'pending'
                  AND job_type = ANY($3)
                  AND (run_at IS NULL OR run_at <= NOW())
                ORDER BY priority, run_at NULLS FIRST, created_at
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(worker_id)
        .bind(self.lease_secs.to_string())
        .bind(job_types)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    /// Claim the next due dial job for one campaign. Campaign workers
    /// are concurrency-1, so this claims a single row.
    pub async fn claim_dial_job(
        &self,
        worker_id: &str,
        job_type: &str,
        campaign_id: Uuid,
    ) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE jobs
            SET status = 'running',
                worker_id = $1,
                attempt_count = attempt_count + 1,
                lease_expires_at = NOW() + ($2 || ' seconds')::INTERVAL,
                updated_at = NOW()
            WHERE id = (
                SELECT id FROM jobs
                WHERE status = 'pending'
                  AND job_type = $3
                  AND args->>'campaignId' = $4
                  AND (run_at IS NULL OR run_at <= NOW())
                ORDER BY priority, run_at NULLS FIRST, created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(worker_id)
        .bind(self.lease_secs.to_string())
        .bind(job_type)
        .bind(campaign_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    /// Merge fields into a job's args regardless of its status.
    pub async fn patch_args(&self, job_id: Uuid, patch: &serde_json::Value) -> Result<()> {
        sqlx::query("UPDATE jobs SET args = args || $1, updated_at = NOW() WHERE id = $2")
            .bind(patch)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Put a running job back into the parked state (hard-sync path):
    /// it re-enters the dial pipeline via the waitlist.
    pub async fn repark(&self, job_id: Uuid, args_patch: &serde_json::Value) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'waiting',
                args = args || $1,
                run_at = NULL,
                worker_id = NULL,
                lease_expires_at = NULL,
                attempt_count = 0,
                updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(args_patch)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_succeeded(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'succeeded', lease_expires_at = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a failed execution. Retryable failures with attempts left
    /// go back to pending with exponential backoff; the rest fail hard.
    pub async fn mark_failed(&self, job_id: Uuid, error: &str, retryable: bool) -> Result<()> {
        let Some(job) = Job::find_by_id(job_id, &self.pool).await? else {
            return Ok(());
        };

        if retryable && job.attempt_count < job.max_attempts {
            let backoff_ms =
                self.retry_backoff_ms * 2i64.pow((job.attempt_count - 1).max(0) as u32);
            let retry_at = Utc::now() + Duration::milliseconds(backoff_ms);
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'pending',
                    run_at = $1,
                    last_error = $2,
                    lease_expires_at = NULL,
                    updated_at = NOW()
                WHERE id = $3
                "#,
            )
            .bind(retry_at)
            .bind(error)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
            tracing::debug!(
                job_id = %job_id,
                attempt = job.attempt_count,
                retry_at = %retry_at,
                "job scheduled for retry"
            );
        } else {
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'failed',
                    last_error = $1,
                    lease_expires_at = NULL,
                    updated_at = NOW()
                WHERE id = $2
                "#,
            )
            .bind(error)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// Cancel a job that has not started running. Idempotent.
    pub async fn cancel(&self, job_key: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled', updated_at = NOW()
            WHERE job_key = $1 AND status IN ('waiting', 'pending')
            "#,
        )
        .bind(job_key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Extend the lease of a long-running job.
    pub async fn heartbeat(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET lease_expires_at = NOW() + ($1 || ' seconds')::INTERVAL, updated_at = NOW()
            WHERE id = $2 AND status = 'running'
            "#,
        )
        .bind(self.lease_secs.to_string())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Return stalled jobs (expired lease) to the pending pool.
    pub async fn reap_stalled(&self) -> Result<u64> {
        let reaped = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                worker_id = NULL,
                lease_expires_at = NULL,
                last_error = 'stalled: lease expired',
                updated_at = NOW()
            WHERE status = 'running' AND lease_expires_at < NOW()
            "#,
        )
        .execute(&self.pool)
        .await?
        .rows_affected();
        if reaped > 0 {
            tracing::warn!(count = reaped, "reaped stalled jobs");
        }
        Ok(reaped)
    }
}
