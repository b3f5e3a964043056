//! Keeping job records current from backend events.

use db::repositories::RecordRepository;
use realtime_core::{JobEvent, JobId};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::PipelineError;
use crate::ingest::Ingestor;
use crate::reconcile::{Settled, settle};

/// Follows the supervisor's event stream and syncs the record owning each
/// job that started, finished or went back for a retry.
pub struct CompletionTracker {
    ingestor: Ingestor,
}

impl CompletionTracker {
    pub fn new(ingestor: Ingestor) -> Self {
        Self { ingestor }
    }

    /// Run until the event stream closes.
    pub fn spawn(self, mut events: broadcast::Receiver<JobEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(job_id) = tracked_job(&event) else {
                            continue;
                        };
                        if let Err(e) = self.sync(job_id).await {
                            // the next reconciliation pass retries this record
                            tracing::warn!(%job_id, error = %e, "Could not sync record from event");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Completion tracker lagged, reconciliation will catch up");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::debug!("Completion tracker stopped");
        })
    }

    /// Sync the record whose stage runs `job_id`, if any.
    pub async fn sync(&self, job_id: JobId) -> Result<Option<Settled>, PipelineError> {
        let _lock = self.ingestor.lock_records().await;
        let Some((mut record, stage)) = RecordRepository::find_by_task(job_id).await? else {
            return Ok(None);
        };
        tracing::debug!(subject = %record.subject.key, ?stage, %job_id, "Job event for record");
        settle(&self.ingestor, &mut record).await.map(Some)
    }
}

fn tracked_job(event: &JobEvent) -> Option<JobId> {
    match event {
        JobEvent::JobStarted { job_id, .. }
        | JobEvent::JobCompleted { job_id, .. }
        | JobEvent::JobFailed { job_id, .. }
        | JobEvent::JobRetrying { job_id, .. } => Some(*job_id),
        JobEvent::QueueCreated { .. } | JobEvent::JobEnqueued { .. } => None,
    }
}
