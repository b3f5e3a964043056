//! Database schema definitions using SurrealQL.
//!
//! Tables are schemaless so that nested JSON payloads and results are stored
//! as-is; the indexes carry the constraints that matter.

use crate::{DbError, get_db};

/// Initialize the database schema.
pub async fn init_schema() -> Result<(), DbError> {
    let db = get_db()?;

    tracing::info!("Initializing database schema...");

    db.query(QUEUE_SCHEMA).await?.check()?;
    db.query(JOB_SCHEMA).await?.check()?;
    db.query(JOB_HISTORY_SCHEMA).await?.check()?;
    db.query(JOB_RECORD_SCHEMA).await?.check()?;

    tracing::info!("Database schema initialized");

    Ok(())
}

const QUEUE_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS queue SCHEMALESS;
DEFINE INDEX IF NOT EXISTS queue_name ON queue FIELDS name UNIQUE;
"#;

const JOB_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS job SCHEMALESS;
DEFINE INDEX IF NOT EXISTS job_queue ON job FIELDS queue;
DEFINE INDEX IF NOT EXISTS job_status ON job FIELDS status.status;
DEFINE INDEX IF NOT EXISTS job_type ON job FIELDS job_type;
DEFINE INDEX IF NOT EXISTS job_expires ON job FIELDS result_expires_ms;
DEFINE INDEX IF NOT EXISTS job_queue_status ON job FIELDS queue, status.status;
"#;

const JOB_HISTORY_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS job_history SCHEMALESS;
DEFINE INDEX IF NOT EXISTS history_job ON job_history FIELDS job_id;
DEFINE INDEX IF NOT EXISTS history_queue ON job_history FIELDS queue;
DEFINE INDEX IF NOT EXISTS history_status ON job_history FIELDS final_status;
"#;

const JOB_RECORD_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS job_record SCHEMALESS;
DEFINE INDEX IF NOT EXISTS record_subject ON job_record FIELDS subject.key UNIQUE;
DEFINE INDEX IF NOT EXISTS record_task ON job_record FIELDS task_id;
DEFINE INDEX IF NOT EXISTS record_analysis_task ON job_record FIELDS analysis_task_id;
DEFINE INDEX IF NOT EXISTS record_state ON job_record FIELDS state;
"#;
