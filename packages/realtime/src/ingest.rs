//! Turning new hazard events into records and jobs.
//!
//! Ingestion is idempotent by subject: submitting an event whose record
//! already went past `Created` returns that record and dispatches nothing.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use db::repositories::RecordRepository;
use realtime_core::{JobRecord, RecordState, Stage, Subject, SubjectKind, job_types};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};

use crate::dispatch::Dispatcher;
use crate::error::PipelineError;

/// How long a process may take to enqueue a stage it reserved before
/// another process may try.
const DISPATCH_CLAIM_SECS: i64 = 60;

/// A volcanic ash forecast to turn into an ash-fall hazard layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AshEvent {
    pub volcano: String,
    pub event_time: DateTime<Utc>,
    /// Offset of the volcano's local time from UTC, in minutes.
    pub tz_offset_minutes: i32,
    /// Raw hazard raster delivered with the forecast.
    pub hazard_file: PathBuf,
}

impl AshEvent {
    pub fn subject(&self) -> Subject {
        let mut subject = Subject::ash(&self.volcano, self.event_time);
        subject
            .attributes
            .insert("tz_offset_minutes".into(), Value::from(self.tz_offset_minutes));
        subject
    }

    /// Rebuild the event from its record.
    pub fn from_record(record: &JobRecord) -> Option<Self> {
        let subject = &record.subject;
        if subject.kind != SubjectKind::Ash {
            return None;
        }
        Some(Self {
            volcano: subject.attribute("volcano")?.to_string(),
            event_time: subject
                .attribute("event_time")?
                .parse::<DateTime<Utc>>()
                .ok()?,
            tz_offset_minutes: subject
                .attributes
                .get("tz_offset_minutes")
                .and_then(Value::as_i64)
                .and_then(|m| i32::try_from(m).ok())
                .unwrap_or(0),
            hazard_file: PathBuf::from(record.source_path.as_deref()?),
        })
    }
}

/// A shake grid for one earthquake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShakeEvent {
    pub shake_id: String,
    /// `initial` for grids from the monitored directory.
    pub source_type: String,
    pub grid_path: PathBuf,
}

impl ShakeEvent {
    pub fn initial(shake_id: impl Into<String>, grid_path: impl Into<PathBuf>) -> Self {
        Self {
            shake_id: shake_id.into(),
            source_type: "initial".to_string(),
            grid_path: grid_path.into(),
        }
    }

    pub fn subject(&self) -> Subject {
        Subject::earthquake(&self.shake_id, &self.source_type)
    }

    pub fn from_record(record: &JobRecord) -> Option<Self> {
        let subject = &record.subject;
        if subject.kind != SubjectKind::Earthquake {
            return None;
        }
        Some(Self {
            shake_id: subject.attribute("shake_id")?.to_string(),
            source_type: subject.attribute("source_type")?.to_string(),
            grid_path: PathBuf::from(record.source_path.as_deref()?),
        })
    }
}

/// Arguments of an impact analysis job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub hazard_path: PathBuf,
}

/// Outcome of a submission.
#[derive(Debug, Clone)]
pub struct Submission {
    pub record: JobRecord,
    /// A job was enqueued by this call.
    pub dispatched: bool,
}

/// Creates records and dispatches their jobs.
///
/// Every read-modify-write of a record in this process goes through
/// [`Ingestor::lock_records`], so the event tracker, the reconciler and new
/// submissions never overwrite each other's updates. Dispatching a stage is
/// additionally reserved in the store, which keeps processes sharing it from
/// enqueueing the same job twice.
#[derive(Clone)]
pub struct Ingestor {
    dispatcher: Dispatcher,
    records: Arc<Mutex<()>>,
}

impl Ingestor {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            records: Arc::new(Mutex::new(())),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub async fn lock_records(&self) -> MutexGuard<'_, ()> {
        self.records.lock().await
    }

    pub async fn submit_ash(&self, event: AshEvent) -> Result<Submission, PipelineError> {
        let record = JobRecord::new(event.subject())
            .with_source_path(event.hazard_file.display().to_string());
        self.submit(record).await
    }

    pub async fn submit_earthquake(&self, event: ShakeEvent) -> Result<Submission, PipelineError> {
        let record = JobRecord::new(event.subject())
            .with_source_path(event.grid_path.display().to_string());
        self.submit(record).await
    }

    async fn submit(&self, record: JobRecord) -> Result<Submission, PipelineError> {
        let _lock = self.lock_records().await;

        let (mut record, created) = RecordRepository::create_or_get(&record).await?;
        if record.state != RecordState::Created {
            tracing::debug!(
                subject = %record.subject.key,
                state = ?record.state,
                "Event already ingested"
            );
            return Ok(Submission {
                record,
                dispatched: false,
            });
        }
        if created {
            tracing::info!(subject = %record.subject.key, record_id = %record.id, "New event");
        }

        let dispatched = self.dispatch_primary(&mut record).await?;
        Ok(Submission { record, dispatched })
    }

    /// Reserve a stage of `record` for dispatch by this process.
    async fn claim(&self, record: &mut JobRecord, stage: Stage) -> Result<bool, PipelineError> {
        let now = Utc::now();
        let until = now + Duration::seconds(DISPATCH_CLAIM_SECS);
        if RecordRepository::claim_dispatch(record.id, stage, now, until).await? {
            return Ok(true);
        }
        tracing::debug!(subject = %record.subject.key, ?stage, "Stage is being dispatched elsewhere");
        *record = RecordRepository::get(record.id).await?;
        Ok(false)
    }

    /// Enqueue the hazard job of a record still in `Created` and store its
    /// handle. The caller holds the record lock.
    ///
    /// Returns `false`, with `record` re-read, when another process holds the
    /// dispatch.
    pub(crate) async fn dispatch_primary(&self, record: &mut JobRecord) -> Result<bool, PipelineError> {
        let (job_type, payload) = primary_job(record)?;
        if !self.claim(record, Stage::Hazard).await? {
            return Ok(false);
        }
        let job = self.dispatcher.dispatch(job_type, payload).await?;
        record.mark_enqueued(job.id)?;
        *record = RecordRepository::save(record).await?;
        tracing::info!(
            subject = %record.subject.key,
            task_id = %job.id,
            queue = %job.queue,
            "Hazard job enqueued"
        );
        Ok(true)
    }

    /// Enqueue the impact analysis of an earthquake whose hazard layer exists.
    /// The caller holds the record lock.
    pub(crate) async fn dispatch_analysis(&self, record: &mut JobRecord) -> Result<bool, PipelineError> {
        let hazard_path = record
            .hazard_path
            .clone()
            .ok_or(realtime_core::TransitionError::HazardNotReady { record: record.id })?;
        let payload = serde_json::to_value(AnalysisRequest {
            hazard_path: PathBuf::from(hazard_path),
        })
        .map_err(|e| PipelineError::Config(e.to_string()))?;

        if !self.claim(record, Stage::Analysis).await? {
            return Ok(false);
        }
        let job = self.dispatcher.dispatch(job_types::RUN_ANALYSIS, payload).await?;
        record.mark_analysis_enqueued(job.id)?;
        *record = RecordRepository::save(record).await?;
        tracing::info!(
            subject = %record.subject.key,
            task_id = %job.id,
            "Analysis job enqueued"
        );
        Ok(true)
    }
}

/// Job type and arguments of a record's hazard job.
fn primary_job(record: &JobRecord) -> Result<(&'static str, Value), PipelineError> {
    let incomplete = || PipelineError::Config(format!("record {} lacks its event attributes", record.id));
    let (job_type, payload) = match record.subject.kind {
        SubjectKind::Ash => {
            let event = AshEvent::from_record(record).ok_or_else(incomplete)?;
            (job_types::PROCESS_ASH, serde_json::to_value(event))
        }
        SubjectKind::Earthquake => {
            let event = ShakeEvent::from_record(record).ok_or_else(incomplete)?;
            (job_types::PROCESS_SHAKE, serde_json::to_value(event))
        }
    };
    let payload = payload.map_err(|e| PipelineError::Config(e.to_string()))?;
    Ok((job_type, payload))
}
