//! Named background workers.

use std::future::Future;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::lifecycle::Shutdown;

/// A spawned long-running task that exits on the shutdown signal.
pub struct BackgroundWorker {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl BackgroundWorker {
    /// Spawn `run` with its own shutdown receiver.
    pub fn start<F, Fut>(name: &'static str, shutdown: &Shutdown, run: F) -> Self
    where
        F: FnOnce(broadcast::Receiver<()>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        tracing::debug!(worker = name, "Starting background worker");
        let handle = tokio::spawn(run(shutdown.subscribe()));
        Self { name, handle }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Wait for the worker to exit after shutdown was triggered. Aborted
    /// if it takes longer than `grace`.
    pub async fn stop(mut self, grace: Duration) {
        match tokio::time::timeout(grace, &mut self.handle).await {
            Ok(Ok(())) => tracing::info!(worker = self.name, "Worker stopped"),
            Ok(Err(e)) if e.is_panic() => {
                tracing::error!(worker = self.name, error = %e, "Worker panicked")
            }
            Ok(Err(e)) => tracing::warn!(worker = self.name, error = %e, "Worker cancelled"),
            Err(_) => {
                tracing::warn!(worker = self.name, ?grace, "Worker did not stop in time, aborting");
                self.handle.abort();
            }
        }
    }
}

/// Trigger shutdown and stop every worker.
pub async fn stop_all(shutdown: &Shutdown, workers: Vec<BackgroundWorker>, grace: Duration) {
    shutdown.trigger();
    futures_util::future::join_all(workers.into_iter().map(|w| w.stop(grace))).await;
}
