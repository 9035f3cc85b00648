//! Scripted in-memory transport used by unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::load_balancer::endpoint::Endpoint;
use crate::transport::{Connection, Connector, TransportError, TransportResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectMode {
    Accept,
    Refuse,
    /// Never completes; only a connect timeout gets the caller out.
    Hang,
}

#[derive(Debug, Clone)]
pub(crate) enum Step {
    /// Emit this frame after the delay.
    After(Duration, String),
    /// Peer closes the stream.
    Close,
}

/// How one mock replica behaves.
#[derive(Debug, Clone)]
pub(crate) struct MockReplica {
    pub connect: ConnectMode,
    /// Frames replayed after every non-health request.
    pub on_request: Vec<Step>,
    /// Reply to `health_check` with success (`Some(true)`), error, or silence.
    pub on_health: Option<bool>,
}

impl MockReplica {
    pub fn healthy() -> Self {
        Self {
            connect: ConnectMode::Accept,
            on_request: vec![Step::After(Duration::ZERO, result_frame("success"))],
            on_health: Some(true),
        }
    }

    pub fn refusing() -> Self {
        Self {
            connect: ConnectMode::Refuse,
            on_request: Vec::new(),
            on_health: None,
        }
    }

    pub fn with_steps(steps: Vec<Step>) -> Self {
        Self {
            connect: ConnectMode::Accept,
            on_request: steps,
            on_health: Some(true),
        }
    }
}

pub(crate) fn result_frame(status: &str) -> String {
    json!({"type": "analysis_result", "status": status, "result": {"issues": 0}}).to_string()
}

pub(crate) fn progress_frame(percent: u32) -> String {
    json!({"type": "progress_update", "status": "success", "progress": percent}).to_string()
}

#[derive(Default)]
struct MockState {
    replicas: HashMap<String, MockReplica>,
    connects: HashMap<String, usize>,
    sent: Vec<(String, Value)>,
}

/// Connector whose endpoints follow scripted behaviour.
#[derive(Clone, Default)]
pub(crate) struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, endpoint_id: &str, replica: MockReplica) {
        self.state
            .lock()
            .unwrap()
            .replicas
            .insert(endpoint_id.to_string(), replica);
    }

    pub fn connects(&self, endpoint_id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .connects
            .get(endpoint_id)
            .copied()
            .unwrap_or(0)
    }

    /// Messages sent to an endpoint, in order.
    pub fn sent(&self, endpoint_id: &str) -> Vec<Value> {
        self.state
            .lock()
            .unwrap()
            .sent
            .iter()
            .filter(|(id, _)| id == endpoint_id)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn sent_of_type(&self, endpoint_id: &str, kind: &str) -> usize {
        self.sent(endpoint_id)
            .iter()
            .filter(|v| v["type"] == kind)
            .count()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, endpoint: &Endpoint) -> TransportResult<Box<dyn Connection>> {
        let replica = {
            let mut state = self.state.lock().unwrap();
            *state.connects.entry(endpoint.id.clone()).or_default() += 1;
            state
                .replicas
                .get(&endpoint.id)
                .cloned()
                .unwrap_or_else(MockReplica::healthy)
        };
        match replica.connect {
            ConnectMode::Accept => Ok(Box::new(MockConnection {
                endpoint: endpoint.id.clone(),
                replica,
                state: self.state.clone(),
                queue: VecDeque::new(),
                closed: false,
            })),
            ConnectMode::Refuse => Err(TransportError::Io("connection refused".into())),
            ConnectMode::Hang => std::future::pending().await,
        }
    }
}

struct MockConnection {
    endpoint: String,
    replica: MockReplica,
    state: Arc<Mutex<MockState>>,
    queue: VecDeque<Step>,
    closed: bool,
}

#[async_trait]
impl Connection for MockConnection {
    async fn send_text(&mut self, text: String) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let value: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
        let kind = value["type"].as_str().unwrap_or_default().to_string();
        self.state
            .lock()
            .unwrap()
            .sent
            .push((self.endpoint.clone(), value));

        match kind.as_str() {
            "cancel" => {}
            "health_check" => {
                if let Some(ok) = self.replica.on_health {
                    let status = if ok { "success" } else { "error" };
                    self.queue.push_back(Step::After(
                        Duration::ZERO,
                        json!({"type": "health_response", "status": status}).to_string(),
                    ));
                }
            }
            _ => self.queue.extend(self.replica.on_request.iter().cloned()),
        }
        Ok(())
    }

    async fn recv_text(&mut self) -> Option<TransportResult<String>> {
        if self.closed {
            return None;
        }
        match self.queue.pop_front() {
            Some(Step::After(delay, frame)) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Some(Ok(frame))
            }
            Some(Step::Close) => {
                self.closed = true;
                None
            }
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) {
        self.closed = true;
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
