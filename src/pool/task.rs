//! Cancellable in-flight analysis tasks.
//!
//! # Responsibilities
//! - Hold the one-way cancellation flag for a unit of work
//! - Own handles to external-tool subprocesses spawned for it
//! - Resolve a result holder exactly once (success, failure or cancelled)
//!
//! # Cancellation
//! ```text
//! cancel()
//!     → flag set (never cleared)
//!     → every registered subprocess: SIGTERM → wait(grace) → SIGKILL
//!     → result resolved as cancelled, unless something resolved it first
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::Serialize;
use tokio::process::Child;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::gateway::protocol::{AnalysisOutcome, AnalysisTarget};

/// Descriptive data attached to a task at registration.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskMetadata {
    pub service_type: Option<String>,
    pub target: Option<AnalysisTarget>,
}

/// A subprocess the task may need to stop.
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Ask the process to exit, then force it after `grace`.
    async fn terminate(&self, grace: Duration);
}

/// [`ProcessHandle`] over a tokio child process.
pub struct ChildProcess {
    pid: Option<u32>,
    child: tokio::sync::Mutex<Child>,
}

impl ChildProcess {
    pub fn new(child: Child) -> Self {
        Self {
            pid: child.id(),
            child: tokio::sync::Mutex::new(child),
        }
    }
}

#[async_trait]
impl ProcessHandle for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn terminate(&self, grace: Duration) {
        let mut child = self.child.lock().await;
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // SAFETY: plain kill(2) on a pid we spawned and have not reaped.
            unsafe {
                let _ = libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            if tokio::time::timeout(grace, child.wait()).await.is_ok() {
                tracing::debug!(pid, "Subprocess exited after SIGTERM");
                return;
            }
        }
        #[cfg(not(unix))]
        let _ = grace;

        if let Err(e) = child.kill().await {
            tracing::warn!(pid = ?self.pid, error = %e, "Failed to kill subprocess");
        } else {
            tracing::debug!(pid = ?self.pid, "Subprocess killed");
        }
    }
}

/// Handle for one in-flight analysis unit.
pub struct ManagedTask {
    id: String,
    metadata: TaskMetadata,
    created: Instant,
    token: CancellationToken,
    cancel_started: AtomicBool,
    processes: Mutex<Vec<Arc<dyn ProcessHandle>>>,
    result: watch::Sender<Option<AnalysisOutcome>>,
    grace: Duration,
}

impl std::fmt::Debug for ManagedTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedTask")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .field("subprocesses", &self.processes().len())
            .finish()
    }
}

/// Public view of a task, for the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub task_id: String,
    #[serde(flatten)]
    pub metadata: TaskMetadata,
    pub cancelled: bool,
    pub subprocesses: usize,
    pub age_ms: u64,
    pub outcome: Option<AnalysisOutcome>,
}

impl ManagedTask {
    pub fn new(id: impl Into<String>, metadata: TaskMetadata, grace: Duration) -> Self {
        let (result, _) = watch::channel(None);
        Self {
            id: id.into(),
            metadata,
            created: Instant::now(),
            token: CancellationToken::new(),
            cancel_started: AtomicBool::new(false),
            processes: Mutex::new(Vec::new()),
            result,
            grace,
        }
    }

    fn processes(&self) -> MutexGuard<'_, Vec<Arc<dyn ProcessHandle>>> {
        self.processes.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes once the task is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Track a subprocess. On an already-cancelled task the handle is
    /// terminated right away and `false` is returned.
    pub async fn register_subprocess(&self, handle: Arc<dyn ProcessHandle>) -> bool {
        {
            let mut processes = self.processes();
            if !self.token.is_cancelled() {
                processes.push(handle);
                return true;
            }
        }
        tracing::debug!(task_id = %self.id, pid = ?handle.pid(), "Subprocess registered after cancel");
        handle.terminate(self.grace).await;
        false
    }

    /// Cancel the task. Returns `false` if it was already cancelled.
    ///
    /// Safe after completion: the flag is set but an existing result is kept.
    pub async fn cancel(&self) -> bool {
        if self.cancel_started.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.token.cancel();

        let handles: Vec<_> = std::mem::take(&mut *self.processes());
        if !handles.is_empty() {
            tracing::info!(task_id = %self.id, count = handles.len(), "Terminating task subprocesses");
            join_all(handles.iter().map(|h| h.terminate(self.grace))).await;
        }

        let service = self.metadata.service_type.as_deref().unwrap_or_default();
        self.resolve(AnalysisOutcome::cancelled(service, &self.id));
        true
    }

    /// Store the outcome. Only the first call has an effect.
    pub fn resolve(&self, outcome: AnalysisOutcome) -> bool {
        self.result.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        })
    }

    pub fn result(&self) -> Option<AnalysisOutcome> {
        self.result.borrow().clone()
    }

    pub async fn wait_result(&self) -> AnalysisOutcome {
        let mut rx = self.result.subscribe();
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome;
            }
            // The sender lives in `self`, so the channel cannot close here.
            if rx.changed().await.is_err() {
                let service = self.metadata.service_type.as_deref().unwrap_or_default();
                return AnalysisOutcome::cancelled(service, &self.id);
            }
        }
    }

    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            task_id: self.id.clone(),
            metadata: self.metadata.clone(),
            cancelled: self.is_cancelled(),
            subprocesses: self.processes().len(),
            age_ms: self.created.elapsed().as_millis() as u64,
            outcome: self.result(),
        }
    }
}
