//! Background execution for handler dispatch.
//!
//! Tasks run on tokio's blocking pool so a slow handler never stalls a
//! receive task. When no runtime is reachable, or `max_in_flight` tasks
//! are already running, the caller runs the task itself.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::Semaphore;

/// Where a submitted task ended up running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    Queued,
    CallerRan,
}

#[derive(Clone)]
pub struct BackgroundExecutor {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl BackgroundExecutor {
    pub fn new(max_in_flight: usize) -> Self {
        let capacity = max_in_flight.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn submit<F>(&self, task: F) -> Submitted
    where
        F: FnOnce() + Send + 'static,
    {
        let Ok(handle) = Handle::try_current() else {
            task();
            return Submitted::CallerRan;
        };
        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            tracing::debug!(capacity = self.capacity, "executor saturated, running on caller");
            task();
            return Submitted::CallerRan;
        };
        handle.spawn_blocking(move || {
            let _permit = permit;
            task();
        });
        Submitted::Queued
    }

    /// Tasks currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }
}
