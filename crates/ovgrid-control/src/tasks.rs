//! Fire-and-forget task runner.
//!
//! Background work that must finish even if the originating request is
//! dropped (old container removal, SDN deregistration, record remaps) is
//! spawned here. Failures are logged and never returned to the caller.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::error::ControlResult;

#[derive(Debug, Clone, Default)]
pub struct TaskRunner {
    tracker: TaskTracker,
    // Held across close/wait/reopen so concurrent drains cannot reopen the
    // tracker under each other.
    draining: Arc<Mutex<()>>,
}

impl TaskRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a named task. The handle may be awaited or dropped.
    pub fn spawn<F>(&self, name: &'static str, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ControlResult<()>> + Send + 'static,
    {
        self.tracker.spawn(async move {
            match task.await {
                Ok(()) => debug!(task = name, "background task finished"),
                Err(e) => warn!(task = name, error = %e, "background task failed"),
            }
        })
    }

    /// Tasks still running.
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Wait for every task spawned so far. New tasks may be spawned
    /// afterwards.
    pub async fn wait_idle(&self) {
        let _guard = self.draining.lock().await;
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}
