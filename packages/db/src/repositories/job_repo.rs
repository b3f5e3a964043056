//! Job repository: the durable half of the queue backend.

use chrono::{DateTime, Duration, Utc};
use realtime_core::{Job, JobId, JobResult, JobStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{DbError, get_db};

/// Repository for job persistence operations.
pub struct JobRepository;

/// Stored shape of a job. The job id lives in `job_id` so it never collides
/// with the SurrealDB record id.
#[derive(Debug, Serialize, Deserialize)]
struct JobRow {
    job_id: JobId,
    queue: String,
    job_type: String,
    payload: Value,
    status: JobStatus,
    #[serde(default)]
    attempts: u32,
    max_retries: u32,
    timeout_secs: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result_expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result_expires_ms: Option<i64>,
}

impl From<&Job> for JobRow {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            queue: job.queue.clone(),
            job_type: job.job_type.clone(),
            payload: job.payload.clone(),
            status: job.status.clone(),
            attempts: job.attempts,
            max_retries: job.max_retries,
            timeout_secs: job.timeout_secs,
            created_at: job.created_at,
            updated_at: job.updated_at,
            result_expires_at: job.result_expires_at,
            result_expires_ms: job.result_expires_at.map(|t| t.timestamp_millis()),
        }
    }
}

impl JobRow {
    fn into_job(self) -> Job {
        Job {
            id: self.job_id,
            queue: self.queue,
            job_type: self.job_type,
            payload: self.payload,
            status: self.status,
            attempts: self.attempts,
            max_retries: self.max_retries,
            timeout_secs: self.timeout_secs,
            created_at: self.created_at,
            updated_at: self.updated_at,
            result_expires_at: self.result_expires_at,
        }
    }
}

/// Archived outcome of a terminal job.
#[derive(Debug, Serialize, Deserialize)]
struct HistoryRow {
    job_id: JobId,
    queue: String,
    job_type: String,
    final_status: String,
    attempts: u32,
    duration_ms: Option<u64>,
    error: Option<String>,
    result: Option<JobResult>,
    created_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
}

fn sorted(rows: Vec<JobRow>) -> Vec<Job> {
    let mut jobs: Vec<Job> = rows.into_iter().map(JobRow::into_job).collect();
    jobs.sort_by_key(|j| (j.created_at, j.id));
    jobs
}

impl JobRepository {
    /// Create a new job in the database.
    pub async fn create(job: &Job) -> Result<Job, DbError> {
        let db = get_db()?;

        let row: Option<JobRow> = db
            .create(("job", job.id.to_string()))
            .content(JobRow::from(job))
            .await?;

        row.map(JobRow::into_job)
            .ok_or_else(|| DbError::Query(format!("Failed to create job {}", job.id)))
    }

    /// Get a job by ID.
    pub async fn get(id: JobId) -> Result<Job, DbError> {
        let db = get_db()?;

        let row: Option<JobRow> = db.select(("job", id.to_string())).await?;

        row.map(JobRow::into_job)
            .ok_or_else(|| DbError::NotFound(format!("Job not found: {}", id)))
    }

    /// Overwrite a stored job, stamping `updated_at`.
    pub async fn save(job: &Job) -> Result<Job, DbError> {
        let db = get_db()?;

        let mut updated = job.clone();
        updated.updated_at = Utc::now();

        let row: Option<JobRow> = db
            .update(("job", job.id.to_string()))
            .content(JobRow::from(&updated))
            .await?;

        row.map(JobRow::into_job)
            .ok_or_else(|| DbError::NotFound(format!("Job not found: {}", job.id)))
    }

    /// Jobs of a queue that were accepted but never finished, oldest first.
    ///
    /// Used when a queue actor starts, to take back work left over by a
    /// previous process.
    pub async fn unfinished_for_queue(queue: &str) -> Result<Vec<Job>, DbError> {
        let db = get_db()?;

        let mut response = db
            .query(r#"SELECT * FROM job WHERE queue = $queue AND status.status IN ["pending", "running"]"#)
            .bind(("queue", queue.to_string()))
            .await?;

        let rows: Vec<JobRow> = response.take(0)?;
        Ok(sorted(rows))
    }

    /// Store `job`, already marked running, if the stored row is still
    /// pending.
    ///
    /// Every process sharing the store races through here, so `None` means
    /// another worker claimed the job first and it must not run.
    pub async fn claim(job: &Job) -> Result<Option<Job>, DbError> {
        Self::save_if(job, r#"status.status = "pending""#, Vec::new()).await
    }

    /// Store `job`, reset to pending, if the running row it was read from is
    /// still held by the same worker and attempt.
    ///
    /// `None` means the job changed hands since it was read.
    pub async fn release(job: &Job, held_by: &str, attempts: u32) -> Result<Option<Job>, DbError> {
        Self::save_if(
            job,
            r#"status.status = "running" AND status.worker_id = $worker AND attempts = $attempts"#,
            vec![
                ("worker", Value::String(held_by.to_string())),
                ("attempts", Value::from(attempts)),
            ],
        )
        .await
    }

    async fn save_if(
        job: &Job,
        condition: &str,
        bindings: Vec<(&'static str, Value)>,
    ) -> Result<Option<Job>, DbError> {
        let db = get_db()?;

        let mut updated = job.clone();
        updated.updated_at = Utc::now();

        let mut query = db
            .query(format!(
                r#"UPDATE type::thing("job", $id) CONTENT $row WHERE {condition} RETURN AFTER"#
            ))
            .bind(("id", job.id.to_string()))
            .bind(("row", JobRow::from(&updated)));
        for binding in bindings {
            query = query.bind(binding);
        }

        let mut response = query.await?;
        let rows: Vec<JobRow> = response.take(0)?;
        Ok(rows.into_iter().next().map(JobRow::into_job))
    }

    /// Copy a terminal job's outcome to `job_history` and schedule the job row
    /// for expiry `retention` after it finished.
    ///
    /// The job row stays readable until then so that result lookups keep
    /// working. Non-terminal jobs are returned unchanged.
    pub async fn archive(job: &Job, retention: Duration) -> Result<Job, DbError> {
        let db = get_db()?;

        let Some(finished_at) = job.status.finished_at() else {
            return Ok(job.clone());
        };

        let (duration_ms, error, result) = match &job.status {
            JobStatus::Completed {
                started_at,
                completed_at,
                result,
            } => (
                u64::try_from((*completed_at - *started_at).num_milliseconds()).ok(),
                None,
                Some(result.clone()),
            ),
            JobStatus::Failed { error, .. } => (None, Some(error.clone()), None),
            _ => (None, None, None),
        };

        let history = HistoryRow {
            job_id: job.id,
            queue: job.queue.clone(),
            job_type: job.job_type.clone(),
            final_status: job.status.as_str().to_string(),
            attempts: job.attempts,
            duration_ms,
            error,
            result,
            created_at: job.created_at,
            completed_at: finished_at,
        };

        let _: Option<HistoryRow> = db.create("job_history").content(history).await?;

        let mut expiring = job.clone();
        expiring.result_expires_at = Some(finished_at + retention);
        Self::save(&expiring).await
    }

    /// Delete job rows whose result expired at or before `now`.
    ///
    /// Returns the number of rows removed.
    pub async fn purge_expired(now: DateTime<Utc>) -> Result<usize, DbError> {
        let db = get_db()?;

        let mut response = db
            .query(
                "DELETE job WHERE type::is::number(result_expires_ms) AND result_expires_ms <= $now RETURN BEFORE",
            )
            .bind(("now", now.timestamp_millis()))
            .await?;

        let removed: Vec<JobRow> = response.take(0)?;
        Ok(removed.len())
    }
}
