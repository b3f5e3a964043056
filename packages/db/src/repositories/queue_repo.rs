//! Queue repository: registered queues and their worker policies.

use chrono::{DateTime, Utc};
use realtime_core::{Queue, QueueId, QueueStats, WorkerPolicy};
use serde::{Deserialize, Serialize};

use crate::{DbError, get_db};

/// Repository for queue persistence operations.
pub struct QueueRepository;

#[derive(Debug, Serialize, Deserialize)]
struct QueueRow {
    queue_id: QueueId,
    name: String,
    policy: WorkerPolicy,
    #[serde(default)]
    stats: QueueStats,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<&Queue> for QueueRow {
    fn from(queue: &Queue) -> Self {
        Self {
            queue_id: queue.id,
            name: queue.name.clone(),
            policy: queue.policy.clone(),
            stats: queue.stats.clone(),
            created_at: queue.created_at,
            updated_at: queue.updated_at,
        }
    }
}

impl QueueRow {
    fn into_queue(self) -> Queue {
        Queue {
            id: self.queue_id,
            name: self.name,
            policy: self.policy,
            stats: self.stats,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

impl QueueRepository {
    /// Create a new queue. Fails if the name is already registered.
    pub async fn create(queue: &Queue) -> Result<Queue, DbError> {
        let db = get_db()?;

        let row: Option<QueueRow> = db
            .create(("queue", queue.id.to_string()))
            .content(QueueRow::from(queue))
            .await?;

        row.map(QueueRow::into_queue)
            .ok_or_else(|| DbError::Query(format!("Failed to create queue '{}'", queue.name)))
    }

    pub async fn get(id: QueueId) -> Result<Queue, DbError> {
        let db = get_db()?;

        let row: Option<QueueRow> = db.select(("queue", id.to_string())).await?;

        row.map(QueueRow::into_queue)
            .ok_or_else(|| DbError::NotFound(format!("Queue not found: {}", id)))
    }

    pub async fn get_by_name(name: &str) -> Result<Queue, DbError> {
        let db = get_db()?;

        let mut response = db
            .query("SELECT * FROM queue WHERE name = $name LIMIT 1")
            .bind(("name", name.to_string()))
            .await?;

        let rows: Vec<QueueRow> = response.take(0)?;

        rows.into_iter()
            .next()
            .map(QueueRow::into_queue)
            .ok_or_else(|| DbError::NotFound(format!("Queue not found: {}", name)))
    }

    /// Register a queue under `name`, or bring an existing one to `policy`.
    pub async fn ensure(name: &str, policy: &WorkerPolicy) -> Result<Queue, DbError> {
        match Self::get_by_name(name).await {
            Ok(existing) if existing.policy == *policy => Ok(existing),
            Ok(existing) => Self::update_policy(existing.id, policy).await,
            Err(DbError::NotFound(_)) => {
                Self::create(&Queue::new(name).with_policy(policy.clone())).await
            }
            Err(e) => Err(e),
        }
    }

    pub async fn update_policy(id: QueueId, policy: &WorkerPolicy) -> Result<Queue, DbError> {
        let mut queue = Self::get(id).await?;
        queue.policy = policy.clone();
        queue.updated_at = Utc::now();
        Self::save(&queue).await
    }

    async fn save(queue: &Queue) -> Result<Queue, DbError> {
        let db = get_db()?;

        let row: Option<QueueRow> = db
            .update(("queue", queue.id.to_string()))
            .content(QueueRow::from(queue))
            .await?;

        row.map(QueueRow::into_queue)
            .ok_or_else(|| DbError::NotFound(format!("Queue not found: {}", queue.id)))
    }

    pub async fn list() -> Result<Vec<Queue>, DbError> {
        let db = get_db()?;

        let rows: Vec<QueueRow> = db.select("queue").await?;

        let mut queues: Vec<Queue> = rows.into_iter().map(QueueRow::into_queue).collect();
        queues.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(queues)
    }

    pub async fn name_exists(name: &str) -> Result<bool, DbError> {
        match Self::get_by_name(name).await {
            Ok(_) => Ok(true),
            Err(DbError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
