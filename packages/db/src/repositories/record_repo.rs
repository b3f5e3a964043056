//! Job record repository: the domain store the reconciler keeps in step with
//! the queue backend.

use chrono::{DateTime, Utc};
use realtime_core::{JobId, JobRecord, JobResult, RecordId, RecordState, Stage, Subject, TaskStatus};
use serde::{Deserialize, Serialize};

use crate::{DbError, get_db};

/// Repository for job record persistence.
pub struct RecordRepository;

#[derive(Debug, Serialize, Deserialize)]
struct RecordRow {
    record_id: RecordId,
    subject: Subject,
    state: RecordState,
    #[serde(default)]
    task_id: Option<JobId>,
    #[serde(default)]
    task_status: Option<TaskStatus>,
    #[serde(default)]
    result: Option<JobResult>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    source_path: Option<String>,
    #[serde(default)]
    hazard_path: Option<String>,
    #[serde(default)]
    hazard_layer_exists: bool,
    #[serde(default)]
    analysis_task_id: Option<JobId>,
    #[serde(default)]
    analysis_task_status: Option<TaskStatus>,
    #[serde(default)]
    analysis_result: Option<JobResult>,
    #[serde(default)]
    analysis_error: Option<String>,
    #[serde(default)]
    impact_path: Option<String>,
    #[serde(default)]
    impact_layer_exists: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<&JobRecord> for RecordRow {
    fn from(r: &JobRecord) -> Self {
        Self {
            record_id: r.id,
            subject: r.subject.clone(),
            state: r.state,
            task_id: r.task_id,
            task_status: r.task_status,
            result: r.result.clone(),
            error: r.error.clone(),
            source_path: r.source_path.clone(),
            hazard_path: r.hazard_path.clone(),
            hazard_layer_exists: r.hazard_layer_exists,
            analysis_task_id: r.analysis_task_id,
            analysis_task_status: r.analysis_task_status,
            analysis_result: r.analysis_result.clone(),
            analysis_error: r.analysis_error.clone(),
            impact_path: r.impact_path.clone(),
            impact_layer_exists: r.impact_layer_exists,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

impl RecordRow {
    fn into_record(self) -> JobRecord {
        JobRecord {
            id: self.record_id,
            subject: self.subject,
            state: self.state,
            task_id: self.task_id,
            task_status: self.task_status,
            result: self.result,
            error: self.error,
            source_path: self.source_path,
            hazard_path: self.hazard_path,
            hazard_layer_exists: self.hazard_layer_exists,
            analysis_task_id: self.analysis_task_id,
            analysis_task_status: self.analysis_task_status,
            analysis_result: self.analysis_result,
            analysis_error: self.analysis_error,
            impact_path: self.impact_path,
            impact_layer_exists: self.impact_layer_exists,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

impl RecordRepository {
    /// Insert `record` unless a record for the same subject already exists.
    ///
    /// Returns the stored record and whether it was newly created. The unique
    /// subject index settles concurrent inserts: the loser reads back the
    /// winner's row.
    pub async fn create_or_get(record: &JobRecord) -> Result<(JobRecord, bool), DbError> {
        if let Some(existing) = Self::find_by_subject(&record.subject.key).await? {
            return Ok((existing, false));
        }

        let db = get_db()?;
        let created: Result<Option<RecordRow>, surrealdb::Error> = db
            .create(("job_record", record.id.to_string()))
            .content(RecordRow::from(record))
            .await;

        match created {
            Ok(Some(row)) => Ok((row.into_record(), true)),
            Ok(None) => Err(DbError::Query(format!(
                "Failed to create record for '{}'",
                record.subject.key
            ))),
            Err(e) => match Self::find_by_subject(&record.subject.key).await? {
                Some(existing) => Ok((existing, false)),
                None => Err(e.into()),
            },
        }
    }

    pub async fn get(id: RecordId) -> Result<JobRecord, DbError> {
        let db = get_db()?;

        let row: Option<RecordRow> = db.select(("job_record", id.to_string())).await?;

        row.map(RecordRow::into_record)
            .ok_or_else(|| DbError::NotFound(format!("Record not found: {}", id)))
    }

    pub async fn find_by_subject(key: &str) -> Result<Option<JobRecord>, DbError> {
        let db = get_db()?;

        let mut response = db
            .query("SELECT * FROM job_record WHERE subject.key = $key LIMIT 1")
            .bind(("key", key.to_string()))
            .await?;

        let rows: Vec<RecordRow> = response.take(0)?;
        Ok(rows.into_iter().next().map(RecordRow::into_record))
    }

    /// The record owning a job, and which of its stages the job runs.
    pub async fn find_by_task(task_id: JobId) -> Result<Option<(JobRecord, Stage)>, DbError> {
        let db = get_db()?;

        let mut response = db
            .query("SELECT * FROM job_record WHERE task_id = $task OR analysis_task_id = $task LIMIT 1")
            .bind(("task", task_id.to_string()))
            .await?;

        let rows: Vec<RecordRow> = response.take(0)?;
        Ok(rows.into_iter().next().map(|row| {
            let record = row.into_record();
            let stage = if record.task_id == Some(task_id) {
                Stage::Hazard
            } else {
                Stage::Analysis
            };
            (record, stage)
        }))
    }

    /// Overwrite a stored record.
    pub async fn save(record: &JobRecord) -> Result<JobRecord, DbError> {
        let db = get_db()?;

        let row: Option<RecordRow> = db
            .update(("job_record", record.id.to_string()))
            .content(RecordRow::from(record))
            .await?;

        row.map(RecordRow::into_record)
            .ok_or_else(|| DbError::NotFound(format!("Record not found: {}", record.id)))
    }

    /// Reserve dispatching `stage` of a record until `until`.
    ///
    /// Succeeds only while the stage was never dispatched and no reservation
    /// newer than `now` exists, so processes sharing the store never enqueue
    /// the same stage twice. Saving the record after the dispatch drops the
    /// reservation; a failed dispatch leaves it to lapse.
    pub async fn claim_dispatch(
        id: RecordId,
        stage: Stage,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let db = get_db()?;

        let undispatched = match stage {
            Stage::Hazard => r#"state = "CREATED""#,
            Stage::Analysis => "!type::is::string(analysis_task_id)",
        };
        let mut response = db
            .query(format!(
                r#"UPDATE type::thing("job_record", $id) SET dispatch_claimed_until_ms = $until
                WHERE {undispatched}
                    AND (!type::is::number(dispatch_claimed_until_ms) OR dispatch_claimed_until_ms <= $now)
                RETURN AFTER"#
            ))
            .bind(("id", id.to_string()))
            .bind(("until", until.timestamp_millis()))
            .bind(("now", now.timestamp_millis()))
            .await?;

        let rows: Vec<RecordRow> = response.take(0)?;
        Ok(!rows.is_empty())
    }

    /// Records that still need attention, oldest first: never dispatched, a
    /// stage without a terminal status, or a finished earthquake hazard layer
    /// whose analysis was never dispatched. Settled records are never loaded.
    pub async fn list_unsettled() -> Result<Vec<JobRecord>, DbError> {
        let db = get_db()?;

        let mut response = db
            .query(
                r#"
                SELECT * FROM job_record
                WHERE state = "CREATED"
                    OR (type::is::string(task_id) AND task_status NOTINSIDE ["SUCCESS", "FAILURE"])
                    OR (type::is::string(analysis_task_id)
                        AND analysis_task_status NOTINSIDE ["SUCCESS", "FAILURE"])
                    OR (subject.kind = "earthquake" AND state = "SUCCESS"
                        AND hazard_layer_exists = true AND !type::is::string(analysis_task_id))
                "#,
            )
            .await?;

        let rows: Vec<RecordRow> = response.take(0)?;
        Ok(Self::sorted(rows))
    }

    pub async fn delete(id: RecordId) -> Result<(), DbError> {
        let db = get_db()?;

        let _: Option<RecordRow> = db.delete(("job_record", id.to_string())).await?;

        Ok(())
    }

    fn sorted(rows: Vec<RecordRow>) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = rows.into_iter().map(RecordRow::into_record).collect();
        records.sort_by_key(|r| r.created_at);
        records
    }
}
