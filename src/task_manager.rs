//! Background task bookkeeping for modules.
//!
//! Module callbacks are synchronous, so tasks are spawned and cancelled
//! without awaiting. Tasks report back to their module through a wake
//! channel, never by touching module state.

use std::collections::HashMap;

use anyhow::Result;
use log::{debug, error, info};
use tokio_util::sync::CancellationToken;

/// Manages named async tasks with cancellation.
///
/// Every task gets a child of the manager's token: cancelling one task
/// leaves its siblings alone, [`TaskManager::cancel_all`] stops them all.
pub struct TaskManager {
    tasks: HashMap<String, CancellationToken>,
    global_token: CancellationToken,
}

impl TaskManager {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            global_token: CancellationToken::new(),
        }
    }

    /// Spawns a task under `name`, replacing (and cancelling) any task
    /// already registered with that name.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn spawn_task<F, Fut>(&mut self, name: &str, task_fn: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.cancel(name);

        let task_token = self.global_token.child_token();
        let task_token_clone = task_token.clone();
        let task_name = name.to_string();

        tokio::spawn(async move {
            debug!("Starting task: {task_name}");
            match task_fn(task_token_clone).await {
                Ok(()) => debug!("Task '{task_name}' completed"),
                Err(e) => error!("Task '{task_name}' failed: {e:#}"),
            }
        });

        self.tasks.insert(name.to_string(), task_token);
        info!("Task '{name}' spawned");
    }

    /// Cancels the task registered under `name`. Returns false if there was
    /// none.
    pub fn cancel(&mut self, name: &str) -> bool {
        match self.tasks.remove(name) {
            Some(token) => {
                token.cancel();
                debug!("Task '{name}' cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancels every task; further spawns still work.
    pub fn cancel_all(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        info!("Stopping all {} tasks", self.tasks.len());
        self.global_token.cancel();
        self.tasks.clear();
        self.global_token = CancellationToken::new();
    }

}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        self.global_token.cancel();
    }
}
