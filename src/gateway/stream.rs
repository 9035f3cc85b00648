//! Per-attempt streaming exchange with one replica.
//!
//! # State Machine
//! ```text
//! Acquiring → Sent → Streaming ─┬→ Completed   (terminal frame)
//!                               ├→ Failed      (transport/protocol error)
//!                               ├→ Cancelled   (task cancelled between frames)
//!                               └→ TimedOut    (deadline reached)
//! ```

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::timeout_at;

use crate::error::GatewayError;
use crate::gateway::protocol::{cancel_frame, OutcomeStatus, ReplicaMessage};
use crate::pool::{ConnectionLease, ManagedTask};
use crate::resilience::Deadline;

/// How long the best-effort cancel notice may take.
const CANCEL_NOTICE_TIMEOUT: Duration = Duration::from_secs(1);

/// Non-terminal progress relayed to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub task_id: String,
    pub service_type: String,
    pub endpoint: String,
    pub message: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AttemptState {
    Acquiring,
    Sent,
    Streaming,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

/// Tracks and logs state transitions of one attempt.
pub(crate) struct AttemptTracker<'a> {
    task_id: &'a str,
    endpoint: &'a str,
    state: AttemptState,
}

impl<'a> AttemptTracker<'a> {
    pub(crate) fn new(task_id: &'a str, endpoint: &'a str) -> Self {
        Self {
            task_id,
            endpoint,
            state: AttemptState::Acquiring,
        }
    }

    pub(crate) fn to(&mut self, next: AttemptState) {
        if self.state != next {
            tracing::trace!(
                task_id = self.task_id,
                endpoint = self.endpoint,
                from = ?self.state,
                to = ?next,
                "Attempt state"
            );
            self.state = next;
        }
    }

    pub(crate) fn state(&self) -> AttemptState {
        self.state
    }
}

/// Terminal frame of a successful exchange.
#[derive(Debug, Clone)]
pub(crate) struct Terminal {
    pub status: OutcomeStatus,
    pub body: Value,
    pub error: Option<String>,
}

pub(crate) struct StreamContext<'a> {
    pub task: &'a ManagedTask,
    pub service_type: &'a str,
    pub deadline: Deadline,
    pub progress: &'a broadcast::Sender<ProgressEvent>,
}

/// Send `frame` and read until a terminal message, cancellation or the
/// deadline.
pub(crate) async fn run_attempt(
    lease: &mut ConnectionLease,
    frame: String,
    ctx: &StreamContext<'_>,
    tracker: &mut AttemptTracker<'_>,
) -> Result<Terminal, GatewayError> {
    let endpoint = lease.endpoint().id.clone();

    if let Err(e) = lease.send_text(frame).await {
        tracker.to(AttemptState::Failed);
        return Err(GatewayError::Connection {
            endpoint,
            message: format!("send failed: {e}"),
        });
    }
    tracker.to(AttemptState::Sent);

    // Last frame that could not be parsed, if nothing valid followed it.
    let mut unparsable: Option<String> = None;

    loop {
        if ctx.task.is_cancelled() {
            return Err(cancel(lease, ctx.task, tracker).await);
        }

        let next = tokio::select! {
            biased;
            _ = ctx.task.cancelled() => None,
            next = timeout_at(ctx.deadline.instant(), lease.recv_text()) => Some(next),
        };
        let Some(next) = next else {
            return Err(cancel(lease, ctx.task, tracker).await);
        };

        let text = match next {
            Err(_) => {
                tracker.to(AttemptState::TimedOut);
                return Err(match unparsable {
                    Some(message) => GatewayError::Protocol {
                        message: format!("no valid terminal message from {endpoint} by the deadline: {message}"),
                    },
                    None => GatewayError::RequestTimeout {
                        endpoint,
                        timeout: ctx.deadline.budget(),
                    },
                });
            }
            Ok(None) => {
                tracker.to(AttemptState::Failed);
                return Err(GatewayError::Transport {
                    endpoint,
                    message: "stream closed before a terminal message".into(),
                });
            }
            Ok(Some(Err(e))) => {
                tracker.to(AttemptState::Failed);
                return Err(GatewayError::Transport {
                    endpoint,
                    message: e.to_string(),
                });
            }
            Ok(Some(Ok(text))) => text,
        };
        tracker.to(AttemptState::Streaming);

        match ReplicaMessage::parse(&text) {
            Ok(ReplicaMessage::Progress(message)) => {
                unparsable = None;
                tracing::debug!(task_id = ctx.task.id(), endpoint = %endpoint, "Progress update");
                let _ = ctx.progress.send(ProgressEvent {
                    task_id: ctx.task.id().to_string(),
                    service_type: ctx.service_type.to_string(),
                    endpoint: endpoint.clone(),
                    message,
                });
            }
            Ok(ReplicaMessage::Result { status, body }) => {
                tracker.to(AttemptState::Completed);
                let error = body.get("error").and_then(Value::as_str).map(str::to_string);
                return Ok(Terminal { status, body, error });
            }
            Ok(ReplicaMessage::Error { status, message }) => {
                tracker.to(AttemptState::Completed);
                let body = serde_json::from_str(&text).unwrap_or(Value::Null);
                return Ok(Terminal {
                    status,
                    body,
                    error: Some(message),
                });
            }
            Ok(other) => {
                tracing::debug!(task_id = ctx.task.id(), message = ?other, "Ignoring non-terminal message");
            }
            Err(e) if e.terminal => {
                tracker.to(AttemptState::Failed);
                return Err(GatewayError::Protocol { message: e.message });
            }
            Err(e) => {
                tracing::warn!(
                    task_id = ctx.task.id(),
                    endpoint = %endpoint,
                    error = %e.message,
                    "Skipping unparsable message"
                );
                unparsable = Some(e.message);
            }
        }
    }
}

async fn cancel(
    lease: &mut ConnectionLease,
    task: &ManagedTask,
    tracker: &mut AttemptTracker<'_>,
) -> GatewayError {
    tracker.to(AttemptState::Cancelled);
    let notice = lease.send_text(cancel_frame(task.id()));
    match tokio::time::timeout(CANCEL_NOTICE_TIMEOUT, notice).await {
        Ok(Ok(())) => tracing::debug!(task_id = task.id(), "Cancel notice sent"),
        Ok(Err(e)) => tracing::debug!(task_id = task.id(), error = %e, "Cancel notice failed"),
        Err(_) => tracing::debug!(task_id = task.id(), "Cancel notice timed out"),
    }
    GatewayError::Cancelled {
        task_id: task.id().to_string(),
    }
}
