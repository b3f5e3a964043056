//! Process-wide exclusion for job bodies that drive the native library.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Capacity-1 semaphore shared by every worker of an exclusive queue.
///
/// Workers take the permit before claiming a job and hold it until the queue
/// has stored the job's outcome, so at most one native-library job runs in
/// the process and no job is marked running while it waits for the library.
#[derive(Debug, Clone)]
pub struct NativeLibraryGuard {
    permits: Arc<Semaphore>,
}

/// Held while a native-library job body runs. Dropping it releases the guard.
#[derive(Debug)]
pub struct NativeLibraryPermit {
    _permit: OwnedSemaphorePermit,
}

impl NativeLibraryGuard {
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(1)),
        }
    }

    /// Take the permit if nobody holds it.
    pub fn try_acquire(&self) -> Option<NativeLibraryPermit> {
        self.permits
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| NativeLibraryPermit { _permit: permit })
    }
}

impl Default for NativeLibraryGuard {
    fn default() -> Self {
        Self::new()
    }
}
