use crate::poller::JobApi;
use crate::upload;
use crate::{Job, JobId, JobRequest, Status};
use anyhow::{anyhow, Error};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Executor;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

const JOB_COLUMNS: &str = "id, status, file_names, processed_files, total_files, \
    error_message, extracted_data, created_at";

#[derive(Clone)]
pub struct DbHandle {
    pool: Arc<PgPool>,
}

impl DbHandle {
    #[instrument(name = "db.new", skip_all)]
    pub async fn new(url: &str) -> Result<Self, Error> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;

        (&pool).execute(include_str!("setup.sql")).await?;

        Ok(DbHandle {
            pool: Arc::new(pool),
        })
    }

    #[instrument(name = "db.submit_job", skip_all, fields(job_id))]
    pub async fn submit_job(&self, request: &JobRequest) -> Result<JobId, Error> {
        upload::check_limits(&request.files)?;
        debug!("Submitting job {:?}", request);
        let id = Uuid::new_v4();
        let file_names = request.file_names();
        sqlx::query(
            "INSERT INTO ocr_jobs (id, status, file_names, total_files) \
            VALUES ($1, $2, $3, $4)",
        )
        .bind(id)
        .bind(Status::Pending)
        .bind(&file_names)
        .bind(file_names.len() as i32)
        .execute(&*self.pool)
        .await?;

        tracing::Span::current().record("job_id", tracing::field::display(id));
        Ok(id)
    }

    #[instrument(name = "db.get_job", skip_all, fields(job_id = %id))]
    pub async fn get_job(&self, id: JobId) -> Result<Job, Error> {
        sqlx::query_as::<_, Job>(&format!("SELECT {JOB_COLUMNS} FROM ocr_jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?
            .ok_or_else(|| anyhow!("job {} not found", id))
    }

    #[instrument(name = "db.list_jobs", skip_all, fields(limit = %limit))]
    pub async fn list_jobs(&self, limit: i64) -> Result<Vec<Job>, Error> {
        Ok(sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM ocr_jobs ORDER BY created_at DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?)
    }

    #[instrument(name = "db.delete_job", skip_all, fields(job_id = %id))]
    pub async fn delete_job(&self, id: JobId) -> Result<(), Error> {
        let result = sqlx::query("DELETE FROM ocr_jobs WHERE id = $1")
            .bind(id)
            .execute(&*self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("job {} not found", id));
        }
        Ok(())
    }

    /// Claim up to `num` pending jobs for server `owner`, moving them to
    /// `processing` so no other server picks them up.
    #[instrument(name = "db.claim_pending_jobs", skip_all, fields(owner = %owner, limit = %num))]
    pub async fn claim_pending_jobs(&self, owner: Uuid, num: i64) -> Result<Vec<Job>, Error> {
        Ok(sqlx::query_as::<_, Job>(&format!(
            "UPDATE ocr_jobs \
                SET status = 'processing', owner = $1, started_at = now(), updated_at = now() \
            WHERE id IN ( \
                SELECT id FROM ocr_jobs WHERE status = 'pending' \
                ORDER BY created_at ASC LIMIT $2 \
                FOR UPDATE SKIP LOCKED) \
            RETURNING {JOB_COLUMNS}"
        ))
        .bind(owner)
        .bind(num)
        .fetch_all(&*self.pool)
        .await?)
    }

    /// Refresh `updated_at` on every job `owner` is processing.
    #[instrument(name = "db.renew_leases", skip_all, fields(owner = %owner))]
    pub async fn renew_leases(&self, owner: Uuid) -> Result<u64, Error> {
        let result = sqlx::query(
            "UPDATE ocr_jobs SET updated_at = now() \
            WHERE status = 'processing' AND owner = $1",
        )
        .bind(owner)
        .execute(&*self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Put `processing` jobs whose owner stopped renewing for `stale_after`
    /// back in the queue. Jobs of live servers are left alone.
    #[instrument(name = "db.requeue_stale_jobs", skip_all, fields(stale_after = ?stale_after))]
    pub async fn requeue_stale_jobs(&self, stale_after: Duration) -> Result<u64, Error> {
        let result = sqlx::query(
            "UPDATE ocr_jobs \
                SET status = 'pending', owner = NULL, processed_files = 0, started_at = NULL, updated_at = now() \
            WHERE status = 'processing' AND updated_at < now() - make_interval(secs => $1)",
        )
        .bind(stale_after.as_secs_f64())
        .execute(&*self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Returns `false` when `owner` no longer holds the job.
    #[instrument(name = "db.record_progress", skip_all, fields(job_id = %id, processed = processed))]
    pub async fn record_progress(&self, owner: Uuid, id: JobId, processed: i32) -> Result<bool, Error> {
        let result = sqlx::query(
            "UPDATE ocr_jobs \
                SET processed_files = $1, updated_at = now() \
            WHERE id = $2 AND owner = $3 AND status = 'processing'",
        )
        .bind(processed)
        .bind(id)
        .bind(owner)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(name = "db.set_completed", skip_all, fields(job_id = %id))]
    pub async fn complete_job(&self, owner: Uuid, id: JobId, data: &serde_json::Value) -> Result<bool, Error> {
        let result = sqlx::query(
            "UPDATE ocr_jobs \
                SET status = 'completed', \
                processed_files = total_files, \
                extracted_data = $1, \
                duration = extract(epoch from now() - started_at), \
                updated_at = now() \
            WHERE id = $2 AND owner = $3 AND status = 'processing'",
        )
        .bind(data)
        .bind(id)
        .bind(owner)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(name = "db.set_failed", skip_all, fields(job_id = %id, error = %msg))]
    pub async fn fail_job(&self, owner: Uuid, id: JobId, msg: &str) -> Result<bool, Error> {
        let result = sqlx::query(
            "UPDATE ocr_jobs \
                SET status = 'failed', \
                duration = extract(epoch from now() - started_at), \
                error_message = $1, \
                updated_at = now() \
            WHERE id = $2 AND owner = $3 AND status = 'processing'",
        )
        .bind(msg)
        .bind(id)
        .bind(owner)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl JobApi for DbHandle {
    async fn submit(&self, request: &JobRequest) -> Result<JobId, Error> {
        self.submit_job(request).await
    }

    async fn status(&self, job_id: JobId) -> Result<Job, Error> {
        self.get_job(job_id).await
    }
}
