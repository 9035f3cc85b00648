//! Wire protocol spoken with analyzer replicas.
//!
//! Every frame is a JSON object with a `type` field. The gateway sends one
//! request (`analysis_request`, `health_check`, or a service-specific type
//! such as `static_analyze`) and then reads:
//!
//! ```text
//! progress_update*  (non-terminal, repeatable)
//! analysis_result | <service>_result | error   (exactly one, terminal)
//! ```
//!
//! `health_response` answers a `health_check`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

pub const ANALYSIS_REQUEST: &str = "analysis_request";
pub const HEALTH_CHECK: &str = "health_check";
pub const CANCEL: &str = "cancel";

pub const PROGRESS_UPDATE: &str = "progress_update";
pub const HEALTH_RESPONSE: &str = "health_response";
pub const ANALYSIS_RESULT: &str = "analysis_result";
pub const ERROR: &str = "error";

/// `status` vocabulary shared by replicas and dispatch results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Error,
    Timeout,
    Cancelled,
    NotAvailable,
}

impl OutcomeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeStatus::Success => "success",
            OutcomeStatus::Error => "error",
            OutcomeStatus::Timeout => "timeout",
            OutcomeStatus::Cancelled => "cancelled",
            OutcomeStatus::NotAvailable => "not_available",
        }
    }

    fn parse(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// What an analysis is about: used for task metadata and deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnalysisTarget {
    pub model: String,
    pub app_number: u32,
    pub analysis_type: String,
}

/// A request handed to the dispatcher. `payload` is opaque.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    /// Caller's task id; generated when absent.
    #[serde(default)]
    pub task_id: Option<String>,

    /// Frame type sent to the replica.
    #[serde(default = "default_request_type")]
    pub request_type: String,

    /// Logical unit of work. Requests with a target are deduplicated.
    #[serde(default)]
    pub target: Option<AnalysisTarget>,

    #[serde(default)]
    pub payload: Value,
}

fn default_request_type() -> String {
    ANALYSIS_REQUEST.to_string()
}

impl DispatchRequest {
    pub fn new(payload: Value) -> Self {
        Self {
            task_id: None,
            request_type: default_request_type(),
            target: None,
            payload,
        }
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_request_type(mut self, request_type: impl Into<String>) -> Self {
        self.request_type = request_type.into();
        self
    }

    pub fn with_target(mut self, target: AnalysisTarget) -> Self {
        self.target = Some(target);
        self
    }

    /// Deduplication key: service type plus logical target.
    pub fn dedup_key(&self, service_type: &str) -> Option<String> {
        self.target.as_ref().map(|t| {
            format!(
                "{}:{}:{}:{}:{}",
                service_type, self.request_type, t.model, t.app_number, t.analysis_type
            )
        })
    }

    /// Serialize the request frame. `timeout_secs` is the budget the
    /// replica may use for its own tool timeouts.
    pub fn to_frame(&self, task_id: &str, timeout_secs: u64) -> String {
        let mut frame = Map::new();
        if let Value::Object(fields) = &self.payload {
            frame.extend(fields.clone());
        } else if !self.payload.is_null() {
            frame.insert("payload".into(), self.payload.clone());
        }
        if let Some(target) = &self.target {
            frame.insert("model".into(), json!(target.model));
            frame.insert("app_number".into(), json!(target.app_number));
            frame.insert("analysis_type".into(), json!(target.analysis_type));
        }
        frame.insert("type".into(), json!(self.request_type));
        frame.insert("id".into(), json!(Uuid::new_v4().to_string()));
        frame.insert("task_id".into(), json!(task_id));
        frame.insert("timeout".into(), json!(timeout_secs));
        Value::Object(frame).to_string()
    }
}

pub fn health_check_frame() -> String {
    json!({"type": HEALTH_CHECK, "id": Uuid::new_v4().to_string()}).to_string()
}

pub fn cancel_frame(task_id: &str) -> String {
    json!({"type": CANCEL, "task_id": task_id}).to_string()
}

/// A parsed frame from a replica.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicaMessage {
    Progress(Value),
    HealthResponse { status: OutcomeStatus },
    /// Terminal result (`analysis_result` or `<service>_result`).
    Result { status: OutcomeStatus, body: Value },
    /// Terminal failure reported by the replica.
    Error { status: OutcomeStatus, message: String },
    /// Well-formed but unrecognised type; skipped.
    Unknown { kind: String },
}

/// A frame that could not be understood.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameError {
    /// The frame claimed to be terminal.
    pub terminal: bool,
    pub message: String,
}

fn is_terminal_type(kind: &str) -> bool {
    kind == ANALYSIS_RESULT || kind == ERROR || kind.ends_with("_result")
}

impl ReplicaMessage {
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text).map_err(|e| FrameError {
            terminal: false,
            message: format!("invalid JSON: {e}"),
        })?;
        let kind = match value.get("type").and_then(Value::as_str) {
            Some(kind) => kind.to_string(),
            None => {
                return Err(FrameError {
                    terminal: false,
                    message: "missing type field".into(),
                })
            }
        };
        let status = value.get("status").and_then(OutcomeStatus::parse);

        match kind.as_str() {
            PROGRESS_UPDATE => Ok(ReplicaMessage::Progress(value)),
            HEALTH_RESPONSE => Ok(ReplicaMessage::HealthResponse {
                status: status.unwrap_or(OutcomeStatus::Error),
            }),
            ERROR => {
                let message = value
                    .get("error")
                    .or_else(|| value.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("replica reported an error")
                    .to_string();
                Ok(ReplicaMessage::Error {
                    status: status.unwrap_or(OutcomeStatus::Error),
                    message,
                })
            }
            k if is_terminal_type(k) => match status {
                Some(status) => Ok(ReplicaMessage::Result {
                    status,
                    body: value,
                }),
                None => Err(FrameError {
                    terminal: true,
                    message: format!("{k} without a valid status"),
                }),
            },
            _ => Ok(ReplicaMessage::Unknown { kind }),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ReplicaMessage::Result { .. } | ReplicaMessage::Error { .. })
    }
}

/// Result envelope returned for every dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutcome {
    pub status: OutcomeStatus,
    pub service_type: String,
    pub task_id: String,
    /// Terminal frame from the replica, when one arrived.
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    pub attempts: u32,
    pub duration_ms: u64,
}

impl AnalysisOutcome {
    pub fn cancelled(service_type: &str, task_id: &str) -> Self {
        Self {
            status: OutcomeStatus::Cancelled,
            service_type: service_type.to_string(),
            task_id: task_id.to_string(),
            result: Value::Null,
            error: Some(format!("task {task_id} was cancelled")),
            endpoint: None,
            attempts: 0,
            duration_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }
}
