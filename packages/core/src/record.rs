//! Job records: the persisted row tracking one unit of domain work.
//!
//! A record is created synchronously when an ash event or a shake grid is
//! ingested, carries the handle of the job processing it, and is moved to a
//! terminal state by the completion tracker or the reconciler. Status only
//! moves forward; a terminal stage is never rewritten to anything else.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ulid::Ulid;

use crate::job::{Job, JobId, JobResult, JobStatus};

/// Unique identifier for a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub Ulid);

impl RecordId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of domain object a record processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Ash,
    Earthquake,
}

/// Reference to the domain object a record processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    pub kind: SubjectKind,
    /// Identity used for idempotent ingestion.
    pub key: String,
    /// Domain attributes (volcano name, shake id, source type, ...).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
}

impl Subject {
    /// An ash event is identified by its volcano and event time.
    pub fn ash(volcano: &str, event_time: DateTime<Utc>) -> Self {
        let mut attributes = Map::new();
        attributes.insert("volcano".into(), Value::String(volcano.to_string()));
        attributes.insert("event_time".into(), Value::String(event_time.to_rfc3339()));
        Self {
            kind: SubjectKind::Ash,
            key: format!("ash:{}:{}", volcano, event_time.format("%Y%m%d%H%M%S")),
            attributes,
        }
    }

    /// A shake event is identified by its shake id and source type.
    pub fn earthquake(shake_id: &str, source_type: &str) -> Self {
        let mut attributes = Map::new();
        attributes.insert("shake_id".into(), Value::String(shake_id.to_string()));
        attributes.insert("source_type".into(), Value::String(source_type.to_string()));
        Self {
            kind: SubjectKind::Earthquake,
            key: format!("earthquake:{}:{}", shake_id, source_type),
            attributes,
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(Value::as_str)
    }
}

/// Status of the job behind a record stage, as the backend reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Started,
    Success,
    Failure,
    Retry,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Started => "STARTED",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failure => "FAILURE",
            TaskStatus::Retry => "RETRY",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a record's primary job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordState {
    /// Domain object persisted, nothing dispatched yet.
    Created,
    /// Job submitted; `task_id` stored.
    Enqueued,
    /// A worker claimed the job.
    Running,
    Success,
    Failure,
}

impl RecordState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RecordState::Success | RecordState::Failure)
    }

    fn from_status(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Pending => RecordState::Enqueued,
            TaskStatus::Started | TaskStatus::Retry => RecordState::Running,
            TaskStatus::Success => RecordState::Success,
            TaskStatus::Failure => RecordState::Failure,
        }
    }
}

/// Which job of a record is meant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// The job ingesting the event and producing the hazard layer.
    Hazard,
    /// The downstream impact analysis of an earthquake hazard layer.
    Analysis,
}

/// A point-in-time view of a job: its status and, once terminal, its
/// result payload or failure diagnostic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Observation {
    pub fn pending() -> Self {
        Self::status(TaskStatus::Pending)
    }

    pub fn status(status: TaskStatus) -> Self {
        Self {
            status,
            result: None,
            error: None,
        }
    }

    /// Translate a backend job into an observation.
    pub fn from_job(job: &Job) -> Self {
        match &job.status {
            JobStatus::Pending if job.is_retrying() => Self::status(TaskStatus::Retry),
            JobStatus::Pending => Self::status(TaskStatus::Pending),
            JobStatus::Running { .. } => Self::status(TaskStatus::Started),
            JobStatus::Completed { result, .. } => Self {
                status: TaskStatus::Success,
                result: Some(result.clone()),
                error: None,
            },
            JobStatus::Failed { error, .. } => Self {
                status: TaskStatus::Failure,
                result: None,
                error: Some(error.clone()),
            },
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("record {record} has no {stage:?} job")]
    NotEnqueued { record: RecordId, stage: Stage },
    #[error("record {record} is already {state:?}, cannot enqueue again")]
    AlreadyEnqueued { record: RecordId, state: RecordState },
    #[error("record {record} {stage:?} is terminal ({current}), refusing {requested}")]
    TerminalOverwrite {
        record: RecordId,
        stage: Stage,
        current: TaskStatus,
        requested: TaskStatus,
    },
    #[error("record {record} has no successful hazard layer to analyse")]
    HazardNotReady { record: RecordId },
}

/// Persisted row tracking one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: RecordId,
    pub subject: Subject,
    pub state: RecordState,
    pub task_id: Option<JobId>,
    pub task_status: Option<TaskStatus>,
    pub result: Option<JobResult>,
    pub error: Option<String>,
    /// Input artifact (hazard file, shake grid) the job reads.
    pub source_path: Option<String>,
    pub hazard_path: Option<String>,
    pub hazard_layer_exists: bool,
    pub analysis_task_id: Option<JobId>,
    pub analysis_task_status: Option<TaskStatus>,
    pub analysis_result: Option<JobResult>,
    pub analysis_error: Option<String>,
    pub impact_path: Option<String>,
    pub impact_layer_exists: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(subject: Subject) -> Self {
        let now = Utc::now();
        Self {
            id: RecordId::new(),
            subject,
            state: RecordState::Created,
            task_id: None,
            task_status: None,
            result: None,
            error: None,
            source_path: None,
            hazard_path: None,
            hazard_layer_exists: false,
            analysis_task_id: None,
            analysis_task_status: None,
            analysis_result: None,
            analysis_error: None,
            impact_path: None,
            impact_layer_exists: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_source_path(mut self, path: impl Into<String>) -> Self {
        self.source_path = Some(path.into());
        self
    }

    /// Attach the primary job handle: `Created -> Enqueued`.
    pub fn mark_enqueued(&mut self, task_id: JobId) -> Result<(), TransitionError> {
        if self.state != RecordState::Created {
            return Err(TransitionError::AlreadyEnqueued {
                record: self.id,
                state: self.state,
            });
        }
        self.task_id = Some(task_id);
        self.task_status = Some(TaskStatus::Pending);
        self.state = RecordState::Enqueued;
        self.touch();
        Ok(())
    }

    /// Attach the downstream analysis job handle.
    pub fn mark_analysis_enqueued(&mut self, task_id: JobId) -> Result<(), TransitionError> {
        if self.state != RecordState::Success || !self.hazard_layer_exists {
            return Err(TransitionError::HazardNotReady { record: self.id });
        }
        if self.analysis_task_id.is_some() {
            return Err(TransitionError::AlreadyEnqueued {
                record: self.id,
                state: self.state,
            });
        }
        self.analysis_task_id = Some(task_id);
        self.analysis_task_status = Some(TaskStatus::Pending);
        self.touch();
        Ok(())
    }

    pub fn task_id_for(&self, stage: Stage) -> Option<JobId> {
        match stage {
            Stage::Hazard => self.task_id,
            Stage::Analysis => self.analysis_task_id,
        }
    }

    pub fn status_for(&self, stage: Stage) -> Option<TaskStatus> {
        match stage {
            Stage::Hazard => self.task_status,
            Stage::Analysis => self.analysis_task_status,
        }
    }

    /// What the record itself says about a stage.
    pub fn observation(&self, stage: Stage) -> Option<Observation> {
        let status = self.status_for(stage)?;
        let (result, error) = match stage {
            Stage::Hazard => (self.result.clone(), self.error.clone()),
            Stage::Analysis => (self.analysis_result.clone(), self.analysis_error.clone()),
        };
        Some(Observation {
            status,
            result,
            error,
        })
    }

    /// Stages whose job was dispatched and has not reached a terminal status.
    pub fn unsettled_stages(&self) -> Vec<Stage> {
        [Stage::Hazard, Stage::Analysis]
            .into_iter()
            .filter(|stage| {
                self.task_id_for(*stage).is_some()
                    && !self.status_for(*stage).is_some_and(TaskStatus::is_terminal)
            })
            .collect()
    }

    /// An earthquake whose hazard layer exists but whose analysis was never dispatched.
    pub fn needs_analysis(&self) -> bool {
        self.subject.kind == SubjectKind::Earthquake
            && self.state == RecordState::Success
            && self.hazard_layer_exists
            && self.analysis_task_id.is_none()
    }

    /// Overwrite a stage with backend truth.
    ///
    /// Returns `Ok(true)` when something changed. Re-applying the terminal
    /// status a stage already holds is a no-op; any other change to a terminal
    /// stage is rejected. A `PENDING` observation for a stage that already
    /// started or is retrying is stale and ignored.
    pub fn apply(&mut self, stage: Stage, observed: &Observation) -> Result<bool, TransitionError> {
        if self.task_id_for(stage).is_none() {
            return Err(TransitionError::NotEnqueued {
                record: self.id,
                stage,
            });
        }

        let current = self.status_for(stage);
        if let Some(current) = current
            && current.is_terminal()
        {
            if current == observed.status {
                return Ok(false);
            }
            return Err(TransitionError::TerminalOverwrite {
                record: self.id,
                stage,
                current,
                requested: observed.status,
            });
        }
        // a stage that was seen starting never goes back to waiting
        if current == Some(observed.status)
            || (observed.status == TaskStatus::Pending && current.is_some())
        {
            return Ok(false);
        }

        match stage {
            Stage::Hazard => {
                self.task_status = Some(observed.status);
                self.state = self.state.max(RecordState::from_status(observed.status));
                match observed.status {
                    TaskStatus::Success => {
                        self.result = observed.result.clone();
                        self.hazard_path = observed
                            .result
                            .as_ref()
                            .and_then(|r| r.hazard_path())
                            .map(str::to_string);
                        self.hazard_layer_exists = self.hazard_path.is_some();
                    }
                    TaskStatus::Failure => self.error = observed.error.clone(),
                    _ => {}
                }
            }
            Stage::Analysis => {
                self.analysis_task_status = Some(observed.status);
                match observed.status {
                    TaskStatus::Success => {
                        self.analysis_result = observed.result.clone();
                        self.impact_path = observed
                            .result
                            .as_ref()
                            .and_then(|r| r.impact_path())
                            .map(str::to_string);
                        self.impact_layer_exists = self.impact_path.is_some();
                    }
                    TaskStatus::Failure => self.analysis_error = observed.error.clone(),
                    _ => {}
                }
            }
        }

        self.touch();
        Ok(true)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
