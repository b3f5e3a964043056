//! Monitored directory for shake grids.
//!
//! A shake grid is dropped as `<monitored>/<shake_id>/grid.xml`. Grids already
//! present at startup are picked up by an initial scan; later drops arrive as
//! filesystem events. Both go through ingestion, so seeing the same grid
//! twice is harmless.

use std::path::{Path, PathBuf};

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::PipelineError;
use crate::ingest::{Ingestor, ShakeEvent};

const GRID_FILE: &str = "grid.xml";

/// The shake event a dropped file stands for, if it is a grid exactly one
/// directory below `root`.
pub fn shake_event_for(root: &Path, path: &Path) -> Option<ShakeEvent> {
    let relative = path.strip_prefix(root).ok()?;
    let mut components = relative.components();
    let shake_id = components.next()?.as_os_str().to_str()?;
    let file = components.next()?.as_os_str();
    if components.next().is_some() || file != GRID_FILE || shake_id.is_empty() {
        return None;
    }
    Some(ShakeEvent::initial(shake_id, path))
}

/// Grids present under `root` right now.
pub fn scan(root: &Path) -> std::io::Result<Vec<ShakeEvent>> {
    let mut events = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let dir = entry?.path();
        let grid = dir.join(GRID_FILE);
        if dir.is_dir()
            && grid.is_file()
            && let Some(event) = shake_event_for(root, &grid)
        {
            events.push(event);
        }
    }
    events.sort_by(|a, b| a.shake_id.cmp(&b.shake_id));
    Ok(events)
}

/// Watches the monitored directory and submits every grid it sees.
///
/// Dropping the watcher stops the watch.
pub struct ShakeDirWatcher {
    root: PathBuf,
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl ShakeDirWatcher {
    pub fn start(root: impl Into<PathBuf>, ingestor: Ingestor) -> Result<Self, PipelineError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;

        let (tx, mut rx) = mpsc::channel::<ShakeEvent>(256);

        let filter_root = root.clone();
        let mut watcher = notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
            match res {
                Ok(event) => {
                    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                        return;
                    }
                    for path in &event.paths {
                        if let Some(shake) = shake_event_for(&filter_root, path)
                            && tx.try_send(shake).is_err()
                        {
                            tracing::warn!(path = %path.display(), "Shake event channel full, grid is picked up again at the next start");
                        }
                    }
                }
                Err(e) => tracing::error!("Shake directory watcher error: {}", e),
            }
        })?;
        watcher.watch(&root, RecursiveMode::Recursive)?;
        tracing::info!(root = %root.display(), "Watching for shake grids");

        // watch first, then scan, so a grid dropped in between is not missed
        let initial = scan(&root)?;
        if !initial.is_empty() {
            tracing::info!(count = initial.len(), "Shake grids found at startup");
        }

        let task = tokio::spawn(async move {
            let mut pending = initial.into_iter();
            loop {
                let event = match pending.next() {
                    Some(event) => event,
                    None => match rx.recv().await {
                        Some(event) => event,
                        None => break,
                    },
                };
                let shake_id = event.shake_id.clone();
                match ingestor.submit_earthquake(event).await {
                    Ok(submission) if submission.dispatched => {
                        tracing::info!(%shake_id, record_id = %submission.record.id, "Shake grid ingested");
                    }
                    Ok(_) => tracing::debug!(%shake_id, "Shake grid already ingested"),
                    Err(e) => tracing::error!(%shake_id, error = %e, "Could not ingest shake grid"),
                }
            }
        });

        Ok(Self {
            root,
            _watcher: watcher,
            task,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stop(self) {
        self.task.abort();
    }
}
