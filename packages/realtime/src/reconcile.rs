//! Catching records up with the queue backend.
//!
//! The tracker keeps records current from the event stream, but events can be
//! missed (process restart, lagging subscriber, a job finishing before its
//! handle was stored). A reconciliation pass reads the backend for every
//! record stage that is not terminal yet and writes what it finds into the
//! record. Data only flows backend to record, and a terminal stage is never
//! reopened.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use db::DbError;
use db::repositories::{JobRepository, RecordRepository};
use realtime_core::{JobRecord, Observation, RecordState, job_types};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::dispatch::Dispatcher;
use crate::error::PipelineError;
use crate::ingest::Ingestor;

/// What a record sync changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Settled {
    /// A stage took a newer status from the backend.
    pub updated: bool,
    /// A follow-up job was enqueued.
    pub dispatched: bool,
}

/// Bring the unsettled stages of `record` up to date with the backend, and
/// enqueue the analysis of an earthquake whose hazard layer now exists.
///
/// The caller holds the record lock.
pub(crate) async fn settle(
    ingestor: &Ingestor,
    record: &mut JobRecord,
) -> Result<Settled, PipelineError> {
    let mut settled = Settled::default();

    for stage in record.unsettled_stages() {
        let Some(task_id) = record.task_id_for(stage) else {
            continue;
        };
        let job = match JobRepository::get(task_id).await {
            Ok(job) => job,
            Err(DbError::NotFound(_)) => {
                tracing::warn!(
                    subject = %record.subject.key,
                    %task_id,
                    ?stage,
                    "Job is unknown to the backend"
                );
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        settled.updated |= record.apply(stage, &Observation::from_job(&job))?;
    }

    if settled.updated {
        *record = RecordRepository::save(record).await?;
        tracing::debug!(
            subject = %record.subject.key,
            state = ?record.state,
            "Record synced from backend"
        );
    }

    if record.needs_analysis() {
        settled.dispatched = ingestor.dispatch_analysis(record).await?;
    }

    Ok(settled)
}

/// Counts consecutive failed passes and raises an operational alert once
/// `threshold` is reached.
#[derive(Debug)]
pub struct FailureAlert {
    threshold: u32,
    consecutive: AtomicU32,
}

impl FailureAlert {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: AtomicU32::new(0),
        }
    }

    /// Record a failed pass. Returns whether the alert fired.
    pub fn failed(&self, error: &dyn std::fmt::Display) -> bool {
        let consecutive = self.consecutive.fetch_add(1, Ordering::SeqCst) + 1;
        if consecutive >= self.threshold {
            tracing::error!(
                consecutive,
                error = %error,
                "ALERT: reconciliation keeps failing, job records may be stale"
            );
            true
        } else {
            tracing::warn!(consecutive, error = %error, "Reconciliation pass failed");
            false
        }
    }

    pub fn succeeded(&self) {
        let previous = self.consecutive.swap(0, Ordering::SeqCst);
        if previous >= self.threshold {
            tracing::info!(failed_passes = previous, "Reconciliation recovered");
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive.load(Ordering::SeqCst)
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub examined: usize,
    pub updated: usize,
    pub dispatched: usize,
    pub errors: usize,
}

#[derive(Clone)]
pub struct Reconciler {
    ingestor: Ingestor,
    alert: Arc<FailureAlert>,
}

impl Reconciler {
    pub fn new(ingestor: Ingestor, alert_after: u32) -> Self {
        Self {
            ingestor,
            alert: Arc::new(FailureAlert::new(alert_after)),
        }
    }

    pub fn alert(&self) -> &FailureAlert {
        &self.alert
    }

    /// One pass over every record that is not settled.
    ///
    /// Per-record failures are counted in the report; the pass as a whole
    /// counts as failed when the store or the backend could not be reached.
    pub async fn run_once(&self) -> Result<ReconcileReport, PipelineError> {
        let records = match RecordRepository::list_unsettled().await {
            Ok(records) => records,
            Err(e) => {
                self.alert.failed(&e);
                return Err(e.into());
            }
        };

        let mut report = ReconcileReport {
            examined: records.len(),
            ..ReconcileReport::default()
        };
        let mut transient: Option<PipelineError> = None;

        for listed in records {
            match self.reconcile_record(&listed).await {
                Ok(settled) => {
                    report.updated += usize::from(settled.updated);
                    report.dispatched += usize::from(settled.dispatched);
                }
                Err(e) => {
                    report.errors += 1;
                    tracing::warn!(subject = %listed.subject.key, error = %e, "Could not reconcile record");
                    if e.is_transient() {
                        transient = Some(e);
                    }
                }
            }
        }

        match transient {
            Some(e) => {
                self.alert.failed(&e);
            }
            None => self.alert.succeeded(),
        }

        tracing::info!(
            examined = report.examined,
            updated = report.updated,
            dispatched = report.dispatched,
            errors = report.errors,
            "Reconciliation pass finished"
        );
        Ok(report)
    }

    async fn reconcile_record(&self, listed: &JobRecord) -> Result<Settled, PipelineError> {
        let _lock = self.ingestor.lock_records().await;
        // re-read under the lock; the listing may be stale by now
        let mut record = RecordRepository::get(listed.id).await?;

        if record.state == RecordState::Created {
            tracing::info!(subject = %record.subject.key, "Re-dispatching record that was never enqueued");
            let dispatched = self.ingestor.dispatch_primary(&mut record).await?;
            return Ok(Settled {
                updated: false,
                dispatched,
            });
        }

        settle(&self.ingestor, &mut record).await
    }
}

/// Enqueue a reconciliation job every `every`, starting immediately.
pub fn schedule(dispatcher: Dispatcher, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match dispatcher
                .dispatch(job_types::CHECK_PROCESSING_TASK, serde_json::json!({}))
                .await
            {
                Ok(job) => tracing::debug!(job_id = %job.id, "Scheduled reconciliation"),
                Err(e) => tracing::warn!(error = %e, "Could not schedule reconciliation"),
            }
        }
    })
}
