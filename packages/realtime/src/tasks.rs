//! Job bodies executed by the workers.
//!
//! Hazard modelling is not done here: it sits behind [`HazardProcessor`].
//! The bodies parse their arguments, call the processor and report the
//! resulting layer path in the `JobResult` payload.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, OnceLock};

use actors::{FnHandler, HandlerFuture, JobHandlerRegistry};
use bytes::Bytes;
use chrono::{FixedOffset, Offset, Utc};
use realtime_core::{Job, JobResult, job_types};
use serde::de::DeserializeOwned;
use storage::{ArtifactStore, StorageError};

use crate::ingest::{AnalysisRequest, AshEvent, ShakeEvent};
use crate::reconcile::Reconciler;

pub type ProcessFuture = Pin<Box<dyn Future<Output = Result<PathBuf, StorageError>> + Send>>;

/// Produces hazard and impact layers. Implementations may call into the
/// non-thread-safe native library; the workers guarantee one call at a time.
pub trait HazardProcessor: Send + Sync + 'static {
    /// Build the ash-fall layer of a forecast and return its path.
    fn ash_hazard(&self, event: AshEvent) -> ProcessFuture;

    /// Build the shaking intensity layer of a shake grid and return its path.
    fn shake_hazard(&self, event: ShakeEvent) -> ProcessFuture;

    /// Run the impact analysis of a hazard layer and return the impact layer path.
    fn impact(&self, hazard_path: PathBuf) -> ProcessFuture;
}

/// Directory of an ash event: local event time and volcano,
/// e.g. `201702211904+0700_Merapi`.
pub fn ash_event_dir(event: &AshEvent) -> String {
    let offset = FixedOffset::east_opt(event.tz_offset_minutes.saturating_mul(60))
        .unwrap_or_else(|| Utc.fix());
    let local = event.event_time.with_timezone(&offset);
    format!("{}_{}", local.format("%Y%m%d%H%M%z"), event.volcano)
}

/// Directory of a shake event, e.g. `20180220163351-initial`.
pub fn shake_event_dir(event: &ShakeEvent) -> String {
    format!("{}-{}", event.shake_id, event.source_type)
}

/// Writes layers through the artifact stores: ash layers under the ash output
/// root, earthquake layers under the earthquake output root.
#[derive(Debug, Clone)]
pub struct ArtifactProcessor {
    ash: ArtifactStore,
    earthquake: ArtifactStore,
}

impl ArtifactProcessor {
    pub fn new(ash: ArtifactStore, earthquake: ArtifactStore) -> Self {
        Self { ash, earthquake }
    }

    /// The store holding a layer, with the layer's key in it.
    fn locate(&self, path: &Path) -> Result<(ArtifactStore, String), StorageError> {
        match self.earthquake.key_for(path) {
            Ok(key) => Ok((self.earthquake.clone(), key)),
            Err(_) => Ok((self.ash.clone(), self.ash.key_for(path)?)),
        }
    }
}

impl HazardProcessor for ArtifactProcessor {
    fn ash_hazard(&self, event: AshEvent) -> ProcessFuture {
        let store = self.ash.clone();
        Box::pin(async move {
            let raster = tokio::fs::read(&event.hazard_file).await?;
            let key = format!("{}/ash_fall.tif", ash_event_dir(&event));
            store.put_bytes(&key, Bytes::from(raster)).await
        })
    }

    fn shake_hazard(&self, event: ShakeEvent) -> ProcessFuture {
        let store = self.earthquake.clone();
        Box::pin(async move {
            let grid = tokio::fs::read(&event.grid_path).await?;
            let dir = shake_event_dir(&event);
            store
                .put_json_value(
                    &format!("{dir}/metadata.json"),
                    &serde_json::json!({
                        "shake_id": event.shake_id,
                        "source_type": event.source_type,
                        "grid_path": event.grid_path,
                    }),
                )
                .await?;
            store.put_bytes(&format!("{dir}/hazard.tif"), Bytes::from(grid)).await
        })
    }

    fn impact(&self, hazard_path: PathBuf) -> ProcessFuture {
        let located = self.locate(&hazard_path);
        Box::pin(async move {
            let (store, key) = located?;
            let hazard = store.get_bytes(&key).await?;
            let impact_key = match key.rsplit_once('/') {
                Some((dir, _)) => format!("{dir}/impact.tif"),
                None => "impact.tif".to_string(),
            };
            store.put_bytes(&impact_key, hazard).await
        })
    }
}

/// What the job bodies need from the running pipeline.
#[derive(Clone)]
pub struct TaskContext {
    pub processor: Arc<dyn HazardProcessor>,
    /// Set once the supervisor is up.
    pub reconciler: Arc<OnceLock<Reconciler>>,
}

/// Handlers for every job type the pipeline runs.
pub fn registry(ctx: TaskContext) -> JobHandlerRegistry {
    let mut handlers = JobHandlerRegistry::new();

    let processor = ctx.processor.clone();
    handlers.register(FnHandler::new(job_types::PROCESS_ASH, move |job: &Job| -> HandlerFuture {
        let processor = processor.clone();
        let event = args::<AshEvent>(job);
        Box::pin(async move {
            let event = event?;
            tracing::info!(volcano = %event.volcano, time = %event.event_time, "Processing ash forecast");
            let path = processor.ash_hazard(event).await.map_err(|e| e.to_string())?;
            Ok(JobResult::success().with("hazard_path", path.display().to_string()))
        })
    }));

    let processor = ctx.processor.clone();
    handlers.register(FnHandler::new(job_types::PROCESS_SHAKE, move |job: &Job| -> HandlerFuture {
        let processor = processor.clone();
        let event = args::<ShakeEvent>(job);
        Box::pin(async move {
            let event = event?;
            tracing::info!(shake_id = %event.shake_id, source = %event.source_type, "Processing shake grid");
            let path = processor.shake_hazard(event).await.map_err(|e| e.to_string())?;
            Ok(JobResult::success().with("hazard_path", path.display().to_string()))
        })
    }));

    let processor = ctx.processor.clone();
    handlers.register(FnHandler::new(job_types::RUN_ANALYSIS, move |job: &Job| -> HandlerFuture {
        let processor = processor.clone();
        let request = args::<AnalysisRequest>(job);
        Box::pin(async move {
            let request = request?;
            tracing::info!(hazard = %request.hazard_path.display(), "Running impact analysis");
            let path = processor
                .impact(request.hazard_path)
                .await
                .map_err(|e| e.to_string())?;
            Ok(JobResult::success().with("impact_path", path.display().to_string()))
        })
    }));

    let reconciler = ctx.reconciler.clone();
    handlers.register(FnHandler::new(
        job_types::CHECK_PROCESSING_TASK,
        move |_: &Job| -> HandlerFuture {
            let reconciler = reconciler.get().cloned();
            Box::pin(async move {
                let reconciler = reconciler.ok_or("pipeline is not running")?;
                let report = reconciler.run_once().await.map_err(|e| e.to_string())?;
                Ok(JobResult::success()
                    .with("examined", report.examined)
                    .with("updated", report.updated)
                    .with("dispatched", report.dispatched)
                    .with("errors", report.errors))
            })
        },
    ));

    handlers.register(FnHandler::new(
        job_types::CHECK_BROKER_CONNECTION,
        |_: &Job| -> HandlerFuture {
            Box::pin(async {
                db::ping().await.map_err(|e| e.to_string())?;
                Ok(JobResult::success())
            })
        },
    ));

    handlers
}

fn args<T: DeserializeOwned>(job: &Job) -> Result<T, String> {
    serde_json::from_value(job.payload.clone())
        .map_err(|e| format!("invalid arguments for {}: {}", job.job_type, e))
}
