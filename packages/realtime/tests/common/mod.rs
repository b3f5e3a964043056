#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use db::repositories::RecordRepository;
use db::{DbConfig, DbError};
use realtime::{ArtifactProcessor, Pipeline, PipelineConfig, PollConfig};
use realtime_core::{JobRecord, RecordId};
use storage::{ArtifactStore, StorageConfig};
use tempfile::TempDir;
use tokio::sync::{Mutex, MutexGuard};

pub const ASH_ROOT: &str = "/home/realtime/ashmaps";

static TEST_LOCK: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

/// Owns the embedded database's background tasks. Every `#[tokio::test]` gets
/// its own runtime, so the shared connection is opened here instead.
static DB_RUNTIME: LazyLock<tokio::runtime::Runtime> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("test-db")
        .enable_all()
        .build()
        .expect("database runtime")
});

pub async fn setup_db() -> Result<MutexGuard<'static, ()>, DbError> {
    let guard = TEST_LOCK.lock().await;
    DB_RUNTIME
        .spawn(db::init(DbConfig::memory()))
        .await
        .expect("database init task")?;
    let db_conn = db::get_db()?;
    db_conn
        .query("DELETE job_history; DELETE job; DELETE queue; DELETE job_record;")
        .await?
        .check()?;
    Ok(guard)
}

/// A running pipeline with ash layers in memory and earthquake layers in a
/// temporary directory.
pub struct Harness {
    pub pipeline: Pipeline,
    pub shake_output: TempDir,
    pub inputs: TempDir,
}

impl Harness {
    pub async fn start() -> Self {
        Self::start_watching(None).await
    }

    pub async fn start_watching(monitored: Option<PathBuf>) -> Self {
        let shake_output = tempfile::tempdir().unwrap();
        let inputs = tempfile::tempdir().unwrap();

        let config = PipelineConfig {
            ash_output_root: PathBuf::from(ASH_ROOT),
            earthquake_output_root: shake_output.path().to_path_buf(),
            earthquake_monitored_directory: monitored,
            // only the pass right after startup runs on its own
            reconcile_interval: Duration::from_secs(3600),
            poll: PollConfig {
                interval: Duration::from_millis(50),
                timeout: Duration::from_secs(10),
                ..PollConfig::default()
            },
            ..PipelineConfig::default()
        };

        let processor = ArtifactProcessor::new(
            ArtifactStore::new(StorageConfig::memory(ASH_ROOT)).await.unwrap(),
            ArtifactStore::new(StorageConfig::filesystem(shake_output.path()))
                .await
                .unwrap(),
        );
        let pipeline = Pipeline::start_with(config, Arc::new(processor))
            .await
            .expect("pipeline starts");

        Self {
            pipeline,
            shake_output,
            inputs,
        }
    }

    /// Write an input file and return its path.
    pub fn input(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.inputs.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    pub async fn shutdown(self) {
        self.pipeline.shutdown().await;
    }
}

/// Drop a shake grid as `<root>/<shake_id>/grid.xml`.
pub fn drop_grid(root: &Path, shake_id: &str) -> PathBuf {
    let dir = root.join(shake_id);
    std::fs::create_dir_all(&dir).unwrap();
    let grid = dir.join("grid.xml");
    std::fs::write(&grid, b"<shakemap_grid event_id=\"20180220163351\"/>").unwrap();
    grid
}

/// Queues holding a job of `job_type`, one entry per job.
pub async fn queues_of(job_type: &str) -> Vec<String> {
    let mut response = db::get_db()
        .unwrap()
        .query("SELECT VALUE queue FROM job WHERE job_type = $job_type")
        .bind(("job_type", job_type.to_string()))
        .await
        .unwrap();
    response.take(0).unwrap()
}

/// Wait until the record for `key` exists and its hazard job is enqueued.
pub async fn enqueued_record(key: &str) -> JobRecord {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(record) = RecordRepository::find_by_subject(key).await.unwrap()
            && record.task_id.is_some()
        {
            return record;
        }
        assert!(tokio::time::Instant::now() < deadline, "{key} was not ingested");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Re-read `id` until `done` holds, running a reconciliation pass between reads.
pub async fn reconcile_until<F>(pipeline: &Pipeline, id: RecordId, done: F) -> JobRecord
where
    F: Fn(&JobRecord) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let record = RecordRepository::get(id).await.unwrap();
        if done(&record) {
            return record;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "record did not settle in time: {record:?}"
        );
        pipeline.reconciler().run_once().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
