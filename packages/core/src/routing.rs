//! Static job-type to queue routing.
//!
//! The table is built and validated once at process start and then shared
//! read-only (`Arc<RoutingTable>`). Lookups never fail: job types that are not
//! registered go to the default queue.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::queue::{PolicyError, WorkerPolicy};

/// Job types known to the realtime pipeline.
pub mod job_types {
    pub const GET_KEYWORDS: &str = "inasafe.headless.get_keywords";
    pub const RUN_ANALYSIS: &str = "inasafe.headless.run_analysis";
    pub const RUN_MULTI_EXPOSURE_ANALYSIS: &str = "inasafe.headless.run_multi_exposure_analysis";
    pub const GENERATE_REPORT: &str = "inasafe.headless.generate_report";
    pub const GET_GENERATED_REPORT: &str = "inasafe.headless.get_generated_report";
    pub const GENERATE_CONTOUR: &str = "inasafe.headless.generate_contour";
    pub const CHECK_BROKER_CONNECTION: &str = "inasafe.headless.check_broker_connection";
    pub const PROCESS_ASH: &str = "realtime.process_ash";
    pub const PROCESS_SHAKE: &str = "realtime.process_shake";
    pub const CHECK_PROCESSING_TASK: &str = "realtime.check_processing_task";

    /// Whether jobs of this type call into the native geospatial library.
    /// Only the bookkeeping checks stay out of it.
    pub fn uses_native_library(job_type: &str) -> bool {
        !matches!(job_type, CHECK_PROCESSING_TASK | CHECK_BROKER_CONNECTION)
    }
}

/// Queue names used by the standard table.
pub mod queues {
    pub const DEFAULT: &str = "celery";
    pub const HEADLESS: &str = "inasafe-headless";
    pub const ANALYSIS: &str = "inasafe-headless-analysis";
    pub const REPORTING: &str = "inasafe-headless-reporting";
    pub const CONTOUR: &str = "inasafe-headless-contour";
    pub const REALTIME: &str = "inasafe-realtime";
}

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("default queue name must not be empty")]
    EmptyDefaultQueue,
    #[error("route for job type '{job_type}' has an empty queue name")]
    EmptyQueueName { job_type: String },
    #[error("invalid worker policy for queue '{queue}': {source}")]
    InvalidPolicy {
        queue: String,
        #[source]
        source: PolicyError,
    },
    #[error("queue '{queue}' runs '{job_type}' but is not exclusive")]
    SharedNativeQueue { queue: String, job_type: String },
    #[error("routing table is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Where one job type is dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub queue: String,
}

/// Maps job types to queue names, and queue names to worker policies.
///
/// JSON shape:
///
/// ```json
/// {
///   "default_queue": "celery",
///   "routes": { "inasafe.headless.run_analysis": { "queue": "inasafe-headless-analysis" } },
///   "queues": { "inasafe-headless-analysis": { "concurrency": 1, "prefetch_multiplier": 1, "exclusive": true } }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingTable {
    pub default_queue: String,
    #[serde(default)]
    pub routes: BTreeMap<String, Route>,
    /// Policies per queue; queues without an entry are single threaded.
    #[serde(default)]
    pub queues: BTreeMap<String, WorkerPolicy>,
}

impl RoutingTable {
    /// Empty table that sends everything to `default_queue`.
    pub fn new(default_queue: impl Into<String>) -> Self {
        Self {
            default_queue: default_queue.into(),
            routes: BTreeMap::new(),
            queues: BTreeMap::new(),
        }
    }

    /// Register a job type on a queue.
    pub fn route(mut self, job_type: impl Into<String>, queue: impl Into<String>) -> Self {
        self.routes.insert(job_type.into(), Route { queue: queue.into() });
        self
    }

    /// Set the worker policy for a queue.
    pub fn policy(mut self, queue: impl Into<String>, policy: WorkerPolicy) -> Self {
        self.queues.insert(queue.into(), policy);
        self
    }

    /// The deployment routing: metadata lookups, analysis, reporting and
    /// contour extraction each get their own queue so a slow analysis never
    /// starves metadata queries. Every headless and realtime queue drives the
    /// native library and is single threaded.
    pub fn standard() -> Self {
        use job_types::*;

        Self::new(queues::DEFAULT)
            .route(GET_KEYWORDS, queues::HEADLESS)
            .route(RUN_ANALYSIS, queues::ANALYSIS)
            .route(RUN_MULTI_EXPOSURE_ANALYSIS, queues::ANALYSIS)
            .route(GENERATE_REPORT, queues::REPORTING)
            .route(GET_GENERATED_REPORT, queues::HEADLESS)
            .route(GENERATE_CONTOUR, queues::CONTOUR)
            .route(CHECK_BROKER_CONNECTION, queues::HEADLESS)
            .route(PROCESS_ASH, queues::REALTIME)
            .route(PROCESS_SHAKE, queues::REALTIME)
            .route(CHECK_PROCESSING_TASK, queues::DEFAULT)
            .policy(queues::HEADLESS, WorkerPolicy::single_threaded())
            .policy(queues::ANALYSIS, WorkerPolicy::single_threaded())
            .policy(queues::REPORTING, WorkerPolicy::single_threaded())
            .policy(queues::CONTOUR, WorkerPolicy::single_threaded())
            .policy(queues::REALTIME, WorkerPolicy::single_threaded())
            .policy(queues::DEFAULT, WorkerPolicy::default().with_concurrency(2))
    }

    /// Parse and validate a table from JSON.
    pub fn from_json(json: &str) -> Result<Self, RoutingError> {
        let table: Self = serde_json::from_str(json)?;
        table.validate()?;
        Ok(table)
    }

    pub fn validate(&self) -> Result<(), RoutingError> {
        if self.default_queue.trim().is_empty() {
            return Err(RoutingError::EmptyDefaultQueue);
        }
        for (job_type, route) in &self.routes {
            if route.queue.trim().is_empty() {
                return Err(RoutingError::EmptyQueueName {
                    job_type: job_type.clone(),
                });
            }
        }
        for queue in self.queue_names() {
            self.policy_for(&queue)
                .validate()
                .map_err(|source| RoutingError::InvalidPolicy { queue, source })?;
        }
        for (job_type, route) in &self.routes {
            if job_types::uses_native_library(job_type) && !self.policy_for(&route.queue).exclusive {
                return Err(RoutingError::SharedNativeQueue {
                    queue: route.queue.clone(),
                    job_type: job_type.clone(),
                });
            }
        }
        Ok(())
    }

    /// Queue a job type must be dispatched to.
    pub fn queue_for(&self, job_type: &str) -> &str {
        self.routes
            .get(job_type)
            .map(|r| r.queue.as_str())
            .unwrap_or(self.default_queue.as_str())
    }

    pub fn is_registered(&self, job_type: &str) -> bool {
        self.routes.contains_key(job_type)
    }

    /// Worker policy for a queue. Queues without an explicit policy get the
    /// exclusive single-threaded one.
    pub fn policy_for(&self, queue: &str) -> WorkerPolicy {
        self.queues
            .get(queue)
            .cloned()
            .unwrap_or_else(WorkerPolicy::single_threaded)
    }

    /// Every queue a job can land on, including the default queue.
    pub fn queue_names(&self) -> BTreeSet<String> {
        let mut names: BTreeSet<String> = self.routes.values().map(|r| r.queue.clone()).collect();
        names.extend(self.queues.keys().cloned());
        names.insert(self.default_queue.clone());
        names
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::standard()
    }
}
