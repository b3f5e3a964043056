//! Pipeline configuration from the environment.
//!
//! | Variable | Default |
//! |---|---|
//! | `PIPELINE_BROKER_URL` | `mem://` |
//! | `PIPELINE_DB_NAMESPACE` | `realtime` |
//! | `PIPELINE_DB_DATABASE` | `main` |
//! | `PIPELINE_ROUTING_FILE` | built-in routing table |
//! | `ASH_OUTPUT_ROOT` | `/home/realtime/ashmaps` |
//! | `EARTHQUAKE_OUTPUT_ROOT` | `/home/realtime/shakemaps-processed` |
//! | `EARTHQUAKE_MONITORED_DIRECTORY` | unset (no directory watch) |
//! | `STORAGE_BACKEND` | `filesystem` |
//! | `RECONCILE_INTERVAL_SECS` | `60` |
//! | `RECONCILE_ALERT_AFTER` | `3` |
//! | `RESULT_EXPIRES_SECS` | `86400` |
//! | `POLL_INTERVAL_SECS` | `5` |
//! | `POLL_TIMEOUT_SECS` | `600` |

use std::path::PathBuf;
use std::time::Duration;

use db::DbConfig;
use realtime_core::RoutingTable;
use storage::{StorageConfig, StorageKind};

use crate::error::PipelineError;
use crate::poller::PollConfig;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Endpoint of the store backing the queue backend and the records.
    pub broker_url: String,
    pub db_namespace: String,
    pub db_database: String,
    /// JSON routing table; the built-in table when unset.
    pub routing_file: Option<PathBuf>,
    pub ash_output_root: PathBuf,
    pub earthquake_output_root: PathBuf,
    /// Shake grids dropped here as `<shake_id>/grid.xml` are ingested.
    pub earthquake_monitored_directory: Option<PathBuf>,
    pub storage_backend: StorageKind,
    /// Period of the scheduled reconciliation job.
    pub reconcile_interval: Duration,
    /// Consecutive failed reconciliation passes before an alert is logged.
    pub reconcile_alert_after: u32,
    /// How long terminal job results stay queryable.
    pub result_expires: Duration,
    pub poll: PollConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            broker_url: "mem://".to_string(),
            db_namespace: "realtime".to_string(),
            db_database: "main".to_string(),
            routing_file: None,
            ash_output_root: PathBuf::from("/home/realtime/ashmaps"),
            earthquake_output_root: PathBuf::from("/home/realtime/shakemaps-processed"),
            earthquake_monitored_directory: None,
            storage_backend: StorageKind::Filesystem,
            reconcile_interval: Duration::from_secs(60),
            reconcile_alert_after: 3,
            result_expires: Duration::from_secs(86_400),
            poll: PollConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Build the configuration from process environment variables.
    pub fn from_env() -> Result<Self, PipelineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, PipelineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).and_then(non_empty);
        let mut cfg = Self::default();

        if let Some(url) = var("PIPELINE_BROKER_URL") {
            cfg.broker_url = url;
        }
        if let Some(ns) = var("PIPELINE_DB_NAMESPACE") {
            cfg.db_namespace = ns;
        }
        if let Some(database) = var("PIPELINE_DB_DATABASE") {
            cfg.db_database = database;
        }
        cfg.routing_file = var("PIPELINE_ROUTING_FILE").map(PathBuf::from);
        if let Some(root) = var("ASH_OUTPUT_ROOT") {
            cfg.ash_output_root = PathBuf::from(root);
        }
        if let Some(root) = var("EARTHQUAKE_OUTPUT_ROOT") {
            cfg.earthquake_output_root = PathBuf::from(root);
        }
        cfg.earthquake_monitored_directory =
            var("EARTHQUAKE_MONITORED_DIRECTORY").map(PathBuf::from);
        if let Some(backend) = var("STORAGE_BACKEND") {
            cfg.storage_backend = StorageKind::parse(&backend)?;
        }
        if let Some(secs) = parse_u64(&var, "RECONCILE_INTERVAL_SECS")? {
            cfg.reconcile_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(count) = parse_u64(&var, "RECONCILE_ALERT_AFTER")? {
            cfg.reconcile_alert_after = u32::try_from(count.max(1)).unwrap_or(u32::MAX);
        }
        if let Some(secs) = parse_u64(&var, "RESULT_EXPIRES_SECS")? {
            cfg.result_expires = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_u64(&var, "POLL_INTERVAL_SECS")? {
            cfg.poll.interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parse_u64(&var, "POLL_TIMEOUT_SECS")? {
            cfg.poll.timeout = Duration::from_secs(secs);
        }

        Ok(cfg)
    }

    pub fn db_config(&self) -> DbConfig {
        DbConfig::endpoint(&self.broker_url)
            .with_namespace(&self.db_namespace)
            .with_database(&self.db_database)
    }

    /// Load and validate the routing table.
    pub fn routing_table(&self) -> Result<RoutingTable, PipelineError> {
        let table = match &self.routing_file {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                RoutingTable::from_json(&text)?
            }
            None => RoutingTable::standard(),
        };
        table.validate()?;
        Ok(table)
    }

    pub fn ash_storage(&self) -> StorageConfig {
        StorageConfig {
            kind: self.storage_backend,
            root: self.ash_output_root.clone(),
        }
    }

    pub fn earthquake_storage(&self) -> StorageConfig {
        StorageConfig {
            kind: self.storage_backend,
            root: self.earthquake_output_root.clone(),
        }
    }

    pub fn result_expires_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.result_expires).unwrap_or(chrono::Duration::hours(24))
    }
}

fn parse_u64<F>(var: &F, key: &str) -> Result<Option<u64>, PipelineError>
where
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| PipelineError::Config(format!("{key}={value} is not a whole number"))),
        None => Ok(None),
    }
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
