//! Booting and stopping the whole pipeline.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use actors::{SupervisorConfig, start_supervisor};
use serde_json::Value;
use storage::ArtifactStore;
use tokio::task::JoinHandle;

use realtime_core::Job;

use crate::config::PipelineConfig;
use crate::dispatch::Dispatcher;
use crate::error::PipelineError;
use crate::ingest::{AshEvent, Ingestor, ShakeEvent, Submission};
use crate::poller::{PollConfig, Poller, StoreStatusSource};
use crate::reconcile::{self, Reconciler};
use crate::tasks::{self, ArtifactProcessor, HazardProcessor, TaskContext};
use crate::tracker::CompletionTracker;
use crate::watcher::ShakeDirWatcher;

/// A running pipeline: queues and workers, the completion tracker, the
/// reconciliation schedule and, when configured, the shake directory watch.
pub struct Pipeline {
    config: PipelineConfig,
    dispatcher: Dispatcher,
    ingestor: Ingestor,
    reconciler: Reconciler,
    tracker: JoinHandle<()>,
    schedule: JoinHandle<()>,
    watcher: Option<ShakeDirWatcher>,
    supervisor: JoinHandle<()>,
}

impl Pipeline {
    /// Start with layers written to the configured artifact stores.
    pub async fn start(config: PipelineConfig) -> Result<Self, PipelineError> {
        let processor = ArtifactProcessor::new(
            ArtifactStore::new(config.ash_storage()).await?,
            ArtifactStore::new(config.earthquake_storage()).await?,
        );
        Self::start_with(config, Arc::new(processor)).await
    }

    /// Start with a custom hazard processor.
    pub async fn start_with(
        config: PipelineConfig,
        processor: Arc<dyn HazardProcessor>,
    ) -> Result<Self, PipelineError> {
        tracing::info!("Starting realtime pipeline");

        db::init(config.db_config()).await?;
        let routing = Arc::new(config.routing_table()?);

        let reconciler_slot = Arc::new(OnceLock::new());
        let handlers = tasks::registry(TaskContext {
            processor,
            reconciler: reconciler_slot.clone(),
        });

        let (supervisor_ref, supervisor) = start_supervisor(
            handlers,
            SupervisorConfig {
                result_expires: config.result_expires_chrono(),
                ..SupervisorConfig::default()
            },
        )
        .await
        .map_err(|e| PipelineError::Backend(format!("failed to start supervisor: {e}")))?;

        let dispatcher = Dispatcher::new(supervisor_ref, routing);
        let ingestor = Ingestor::new(dispatcher.clone());
        let reconciler = Reconciler::new(ingestor.clone(), config.reconcile_alert_after);
        let _ = reconciler_slot.set(reconciler.clone());

        // subscribe before the queues start so restored jobs are tracked too
        let events = dispatcher.subscribe()?;
        dispatcher.ensure_queues().await?;

        let tracker = CompletionTracker::new(ingestor.clone()).spawn(events);
        let schedule = reconcile::schedule(dispatcher.clone(), config.reconcile_interval);

        let watcher = match &config.earthquake_monitored_directory {
            Some(dir) => Some(ShakeDirWatcher::start(dir.clone(), ingestor.clone())?),
            None => None,
        };

        tracing::info!(
            queues = ?dispatcher.routing().queue_names(),
            watching = ?config.earthquake_monitored_directory,
            "Realtime pipeline started"
        );

        Ok(Self {
            config,
            dispatcher,
            ingestor,
            reconciler,
            tracker,
            schedule,
            watcher,
            supervisor,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn ingestor(&self) -> &Ingestor {
        &self.ingestor
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub async fn submit_ash(&self, event: AshEvent) -> Result<Submission, PipelineError> {
        self.ingestor.submit_ash(event).await
    }

    pub async fn submit_earthquake(&self, event: ShakeEvent) -> Result<Submission, PipelineError> {
        self.ingestor.submit_earthquake(event).await
    }

    /// Route and enqueue an arbitrary job.
    pub async fn dispatch(&self, job_type: &str, payload: Value) -> Result<Job, PipelineError> {
        self.dispatcher.dispatch(job_type, payload).await
    }

    /// A poller over the record store and the job backend.
    pub fn poller(&self) -> Poller<StoreStatusSource> {
        self.poller_with(self.config.poll.clone())
    }

    pub fn poller_with(&self, config: PollConfig) -> Poller<StoreStatusSource> {
        Poller::new(StoreStatusSource, config)
    }

    /// Stop watching, stop the workers and wait for the supervisor to exit.
    pub async fn shutdown(self) {
        tracing::info!("Stopping realtime pipeline");
        if let Some(watcher) = self.watcher {
            watcher.stop();
        }
        self.schedule.abort();
        self.dispatcher.shutdown();
        if tokio::time::timeout(Duration::from_secs(10), self.supervisor)
            .await
            .is_err()
        {
            tracing::warn!("Supervisor did not stop in time");
        }
        self.tracker.abort();
    }
}
