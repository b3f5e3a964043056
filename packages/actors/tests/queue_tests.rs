#![allow(clippy::disallowed_methods)]

mod common;

use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use actors::{FnHandler, HandlerFuture, JobHandler, JobHandlerRegistry, SupervisorMessage};
use chrono::{Duration as ChronoDuration, Utc};
use db::repositories::JobRepository;
use realtime_core::{Job, JobEvent, JobResult, JobStatus, WorkerPolicy};
use serde_json::json;

#[derive(Clone, Default)]
struct Occupancy {
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Occupancy {
    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// A job body that records how many bodies run at the same time.
fn tracking_handler(job_type: &str, occupancy: Occupancy, work: Duration) -> impl JobHandler {
    FnHandler::new(job_type, move |_: &Job| -> HandlerFuture {
        let occupancy = occupancy.clone();
        Box::pin(async move {
            let now = occupancy.active.fetch_add(1, Ordering::SeqCst) + 1;
            occupancy.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(work).await;
            occupancy.active.fetch_sub(1, Ordering::SeqCst);
            Ok(JobResult::success())
        })
    })
}

/// Replays the event stream and returns the highest number of jobs that were
/// started and not yet finished.
fn max_in_flight(events: &[JobEvent]) -> usize {
    let mut in_flight: usize = 0;
    let mut max = 0;
    for event in events {
        match event {
            JobEvent::JobStarted { .. } => {
                in_flight += 1;
                max = max.max(in_flight);
            }
            JobEvent::JobCompleted { .. } | JobEvent::JobFailed { .. } => {
                in_flight = in_flight.saturating_sub(1);
            }
            _ => {}
        }
    }
    max
}

#[tokio::test]
async fn test_single_concurrency_queue_runs_one_job_at_a_time() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_db().await?;

    let occupancy = Occupancy::default();
    let mut handlers = JobHandlerRegistry::new();
    handlers.register(tracking_handler(
        "inasafe.headless.run_analysis",
        occupancy.clone(),
        Duration::from_millis(30),
    ));

    let (supervisor, mut events) = common::start(handlers).await;
    common::ensure_queue(&supervisor, "inasafe-headless-analysis", WorkerPolicy::single_threaded())
        .await?;

    for n in 0..4 {
        let job = Job::new(
            "inasafe-headless-analysis",
            "inasafe.headless.run_analysis",
            json!({"n": n}),
        );
        common::enqueue(&supervisor, job).await?;
    }

    let seen = common::until_terminal(&mut events, 4).await;
    assert_eq!(occupancy.peak(), 1);
    assert_eq!(max_in_flight(&seen), 1);
    assert_eq!(
        seen.iter()
            .filter(|e| matches!(e, JobEvent::JobCompleted { .. }))
            .count(),
        4
    );

    common::shutdown(supervisor);
    Ok(())
}

#[tokio::test]
async fn test_exclusive_queues_share_native_library_guard() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_db().await?;

    let occupancy = Occupancy::default();
    let mut handlers = JobHandlerRegistry::new();
    for job_type in ["inasafe.headless.get_keywords", "inasafe.headless.generate_contour"] {
        handlers.register(tracking_handler(
            job_type,
            occupancy.clone(),
            Duration::from_millis(30),
        ));
    }

    let (supervisor, mut events) = common::start(handlers).await;
    common::ensure_queue(&supervisor, "inasafe-headless", WorkerPolicy::single_threaded()).await?;
    common::ensure_queue(&supervisor, "inasafe-headless-contour", WorkerPolicy::single_threaded())
        .await?;

    for _ in 0..2 {
        common::enqueue(
            &supervisor,
            Job::new("inasafe-headless", "inasafe.headless.get_keywords", json!({})),
        )
        .await?;
        common::enqueue(
            &supervisor,
            Job::new(
                "inasafe-headless-contour",
                "inasafe.headless.generate_contour",
                json!({}),
            ),
        )
        .await?;
    }

    common::until_terminal(&mut events, 4).await;
    assert_eq!(occupancy.peak(), 1);

    common::shutdown(supervisor);
    Ok(())
}

#[tokio::test]
async fn test_parallel_queue_respects_reservation_limit() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_db().await?;

    let occupancy = Occupancy::default();
    let mut handlers = JobHandlerRegistry::new();
    handlers.register(tracking_handler(
        "realtime.check_processing_task",
        occupancy.clone(),
        Duration::from_millis(20),
    ));

    let (supervisor, mut events) = common::start(handlers).await;
    common::ensure_queue(&supervisor, "celery", WorkerPolicy::default().with_concurrency(2)).await?;

    for _ in 0..6 {
        common::enqueue(
            &supervisor,
            Job::new("celery", "realtime.check_processing_task", json!({})),
        )
        .await?;
    }

    let seen = common::until_terminal(&mut events, 6).await;
    assert!(occupancy.peak() <= 2);
    assert!(max_in_flight(&seen) <= 2);

    common::shutdown(supervisor);
    Ok(())
}

#[tokio::test]
async fn test_failing_job_body_only_fails_that_job() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_db().await?;

    let mut handlers = JobHandlerRegistry::new();
    handlers.register(FnHandler::new("realtime.process_shake", |job: &Job| -> HandlerFuture {
        let mode = job.arg_str("mode").unwrap_or("ok").to_string();
        Box::pin(async move {
            match mode.as_str() {
                "error" => Err("grid.xml is not a shake grid".to_string()),
                "panic" => panic!("native library crashed"),
                _ => Ok(JobResult::success().with("hazard_path", "/tmp/hazard.tif")),
            }
        })
    }));

    let (supervisor, mut events) = common::start(handlers).await;
    common::ensure_queue(&supervisor, "inasafe-realtime", WorkerPolicy::single_threaded()).await?;

    for mode in ["error", "panic", "ok"] {
        common::enqueue(
            &supervisor,
            Job::new("inasafe-realtime", "realtime.process_shake", json!({"mode": mode})),
        )
        .await?;
    }
    common::enqueue(
        &supervisor,
        Job::new("inasafe-realtime", "realtime.unregistered", json!({})),
    )
    .await?;

    let seen = common::until_terminal(&mut events, 4).await;

    let errors: Vec<&str> = seen
        .iter()
        .filter_map(|e| match e {
            JobEvent::JobFailed { error, will_retry: false, .. } => Some(error.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(errors.len(), 3);
    assert!(errors.contains(&"grid.xml is not a shake grid"));
    assert!(errors.iter().any(|e| e.contains("panicked")));
    assert!(errors.iter().any(|e| e.contains("No handler")));

    let completed = seen
        .iter()
        .find_map(|e| match e {
            JobEvent::JobCompleted { result, .. } => Some(result.clone()),
            _ => None,
        })
        .ok_or("no completed job")?;
    assert_eq!(completed.hazard_path(), Some("/tmp/hazard.tif"));

    common::shutdown(supervisor);
    Ok(())
}

#[tokio::test]
async fn test_failed_job_is_retried_up_to_max_retries() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_db().await?;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut handlers = JobHandlerRegistry::new();
    handlers.register(FnHandler::new("realtime.process_ash", move |_: &Job| -> HandlerFuture {
        let attempt = counter.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            if attempt == 0 {
                Err("broker hiccup".to_string())
            } else {
                Ok(JobResult::success())
            }
        })
    }));

    let (supervisor, mut events) = common::start(handlers).await;
    common::ensure_queue(&supervisor, "inasafe-realtime", WorkerPolicy::single_threaded()).await?;

    let job = common::enqueue(
        &supervisor,
        Job::new("inasafe-realtime", "realtime.process_ash", json!({})).with_max_retries(1),
    )
    .await?;

    let seen = common::until_terminal(&mut events, 1).await;
    assert!(seen.iter().any(|e| matches!(e, JobEvent::JobFailed { will_retry: true, .. })));
    assert!(seen.iter().any(|e| matches!(e, JobEvent::JobRetrying { attempt: 2, .. })));
    assert!(matches!(seen.last(), Some(JobEvent::JobCompleted { .. })));

    let stored = JobRepository::get(job.id).await?;
    assert_eq!(stored.attempts, 2);
    assert!(matches!(stored.status, JobStatus::Completed { .. }));
    assert!(stored.result_expires_at.is_some());
    assert_eq!(common::history_len(job.id).await?, 1);

    common::shutdown(supervisor);
    Ok(())
}

#[tokio::test]
async fn test_unfinished_jobs_are_restored_on_start() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_db().await?;

    let pending = Job::new("inasafe-realtime", "realtime.process_ash", json!({"volcano": "Merapi"}));
    JobRepository::create(&pending).await?;

    // its worker would have timed out long ago
    let mut orphan = Job::new("inasafe-realtime", "realtime.process_ash", json!({"volcano": "Agung"}))
        .with_timeout(60);
    orphan.status = JobStatus::Running {
        started_at: Utc::now() - ChronoDuration::hours(2),
        worker_id: "worker-from-a-dead-process".to_string(),
    };
    orphan.attempts = 1;
    JobRepository::create(&orphan).await?;

    // still within its timeout on a worker of another process
    let mut busy = Job::new("inasafe-realtime", "realtime.process_ash", json!({"volcano": "Sinabung"}));
    busy.status = JobStatus::Running {
        started_at: Utc::now(),
        worker_id: "worker-in-another-process".to_string(),
    };
    busy.attempts = 1;
    JobRepository::create(&busy).await?;

    let ran = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen_volcanoes = ran.clone();
    let mut handlers = JobHandlerRegistry::new();
    handlers.register(FnHandler::new("realtime.process_ash", move |job: &Job| -> HandlerFuture {
        let volcano = job.arg_str("volcano").unwrap_or_default().to_string();
        seen_volcanoes.lock().unwrap().push(volcano);
        Box::pin(async { Ok(JobResult::success()) })
    }));

    let (supervisor, mut events) = common::start(handlers).await;
    common::ensure_queue(&supervisor, "inasafe-realtime", WorkerPolicy::single_threaded()).await?;

    common::until_terminal(&mut events, 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut volcanoes = ran.lock().unwrap().clone();
    volcanoes.sort();
    assert_eq!(volcanoes, vec!["Agung".to_string(), "Merapi".to_string()]);

    let untouched = JobRepository::get(busy.id).await?;
    assert!(
        matches!(untouched.status, JobStatus::Running { ref worker_id, .. } if worker_id == "worker-in-another-process"),
        "{untouched:?}"
    );
    assert_eq!(untouched.attempts, 1);

    let restored = JobRepository::get(pending.id).await?;
    assert!(matches!(restored.status, JobStatus::Completed { .. }));
    let rerun = JobRepository::get(orphan.id).await?;
    assert!(matches!(rerun.status, JobStatus::Completed { .. }));
    assert_eq!(rerun.attempts, 2);

    // the supervisor still answers for jobs it restored
    let (tx, rx) = actors::concurrency::oneshot();
    supervisor.send_message(SupervisorMessage::GetJob {
        job_id: orphan.id,
        reply: tx.into(),
    })?;
    let found = rx.await?.ok_or("job not found")?;
    assert_eq!(found.id, orphan.id);

    common::shutdown(supervisor);
    Ok(())
}

#[tokio::test]
async fn test_job_claimed_elsewhere_is_not_run_twice() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_db().await?;

    let calls = Arc::new(AtomicUsize::new(0));
    let handlers = || {
        let counter = calls.clone();
        let mut handlers = JobHandlerRegistry::new();
        handlers.register(FnHandler::new("realtime.process_ash", move |_: &Job| -> HandlerFuture {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(JobResult::success()) })
        }));
        handlers
    };

    // two processes sharing one store
    let (first, mut first_events) = common::start(handlers()).await;
    let (second, mut second_events) = common::start(handlers()).await;

    let pending = Job::new("inasafe-realtime", "realtime.process_ash", json!({}));
    JobRepository::create(&pending).await?;

    common::ensure_queue(&first, "inasafe-realtime", WorkerPolicy::single_threaded()).await?;
    common::ensure_queue(&second, "inasafe-realtime", WorkerPolicy::single_threaded()).await?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let job = JobRepository::get(pending.id).await?;
        if job.status.is_terminal() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "job never finished: {job:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(JobRepository::get(pending.id).await?.attempts, 1);
    let started = |events: &mut tokio::sync::broadcast::Receiver<JobEvent>| {
        let mut count = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, JobEvent::JobStarted { .. }) {
                count += 1;
            }
        }
        count
    };
    assert_eq!(started(&mut first_events) + started(&mut second_events), 1);

    common::shutdown(first);
    common::shutdown(second);
    Ok(())
}

#[tokio::test]
async fn test_native_job_outcome_is_stored_before_the_next_one_starts() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_db().await?;

    const QUEUES: [&str; 2] = ["inasafe-headless", "inasafe-headless-contour"];

    // every body counts the other native jobs the store still shows as running
    let overlap = Arc::new(AtomicUsize::new(0));
    let mut handlers = JobHandlerRegistry::new();
    for job_type in ["inasafe.headless.get_keywords", "inasafe.headless.generate_contour"] {
        let overlap = overlap.clone();
        handlers.register(FnHandler::new(job_type, move |job: &Job| -> HandlerFuture {
            let overlap = overlap.clone();
            let own = job.id;
            Box::pin(async move {
                let mut others = 0;
                for queue in QUEUES {
                    others += JobRepository::unfinished_for_queue(queue)
                        .await
                        .map_err(|e| e.to_string())?
                        .iter()
                        .filter(|j| j.id != own && matches!(j.status, JobStatus::Running { .. }))
                        .count();
                }
                overlap.fetch_max(others, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(JobResult::success())
            })
        }));
    }

    let (supervisor, mut events) = common::start(handlers).await;
    for queue in QUEUES {
        common::ensure_queue(&supervisor, queue, WorkerPolicy::single_threaded()).await?;
    }

    for _ in 0..4 {
        common::enqueue(
            &supervisor,
            Job::new(QUEUES[0], "inasafe.headless.get_keywords", json!({})),
        )
        .await?;
        common::enqueue(
            &supervisor,
            Job::new(QUEUES[1], "inasafe.headless.generate_contour", json!({})),
        )
        .await?;
    }

    let seen = common::until_terminal(&mut events, 8).await;
    assert_eq!(
        seen.iter()
            .filter(|e| matches!(e, JobEvent::JobCompleted { .. }))
            .count(),
        8
    );
    assert_eq!(overlap.load(Ordering::SeqCst), 0);

    common::shutdown(supervisor);
    Ok(())
}

#[tokio::test]
async fn test_invalid_policy_is_rejected() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_db().await?;

    let (supervisor, _events) = common::start(JobHandlerRegistry::new()).await;

    let invalid = WorkerPolicy::single_threaded().with_concurrency(4);
    let result = common::ensure_queue(&supervisor, "inasafe-headless", invalid).await;
    assert!(result.is_err());

    let unregistered = common::enqueue(&supervisor, Job::new("nowhere", "t", json!({}))).await;
    assert!(unregistered.is_err());

    common::shutdown(supervisor);
    Ok(())
}
