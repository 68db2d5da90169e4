//! Owns the handles of all background tasks and their shared cancellation.

use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct Supervisor {
    cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// Token every task must observe to exit its loop.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::info!(task = name, "Starting task");
        self.tasks.push((name, tokio::spawn(task)));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Cancel every task and wait for all of them to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for (name, handle) in self.tasks {
            match handle.await {
                Ok(()) => tracing::debug!(task = name, "Task finished"),
                Err(e) => tracing::error!(task = name, error = %e, "Task ended abnormally"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn shutdown_joins_all_tasks() {
        let mut supervisor = Supervisor::new();
        let stopped = Arc::new(AtomicUsize::new(0));
        for name in ["a", "b"] {
            let cancel = supervisor.token();
            let stopped = stopped.clone();
            supervisor.spawn(name, async move {
                cancel.cancelled().await;
                stopped.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(supervisor.len(), 2);
        supervisor.shutdown().await;
        assert_eq!(stopped.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn panicking_task_does_not_block_shutdown() {
        let mut supervisor = Supervisor::new();
        let missing: Option<()> = None;
        supervisor.spawn("boom", async move { missing.expect("boom") });
        supervisor.shutdown().await;
    }
}
