use std::sync::LazyLock;

use tokio::sync::{Mutex, MutexGuard};

use db::{DbConfig, DbError};
use realtime_core::JobId;

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

/// Final statuses archived for a job.
pub async fn history_statuses(job_id: JobId) -> Result<Vec<String>, DbError> {
    let mut response = db::get_db()?
        .query("SELECT VALUE final_status FROM job_history WHERE job_id = $job_id")
        .bind(("job_id", job_id.to_string()))
        .await?;
    Ok(response.take(0)?)
}

/// Number of rows in `table`.
pub async fn count(table: &str) -> Result<usize, DbError> {
    let mut response = db::get_db()?
        .query("SELECT count() AS count FROM type::table($table) GROUP ALL")
        .bind(("table", table.to_string()))
        .await?;
    let count: Option<i64> = response.take((0, "count"))?;
    Ok(count.map_or(0, |n| n as usize))
}
