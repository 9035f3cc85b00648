//! Shared utilities for integration tests: WebSocket mock replicas.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use analysis_gateway::config::{GatewayConfig, ServiceConfig, Strategy};
use analysis_gateway::transport::WebSocketConnector;
use analysis_gateway::Dispatcher;

/// How a mock replica answers an analysis request.
#[derive(Debug, Clone)]
pub struct ReplicaBehavior {
    pub progress_updates: usize,
    pub step_delay: Duration,
    /// Terminal status, or `None` to never answer.
    pub terminal: Option<&'static str>,
    pub healthy: bool,
}

impl ReplicaBehavior {
    pub fn ok() -> Self {
        Self {
            progress_updates: 2,
            step_delay: Duration::from_millis(20),
            terminal: Some("success"),
            healthy: true,
        }
    }

    pub fn hanging() -> Self {
        Self {
            progress_updates: 1,
            step_delay: Duration::from_millis(10),
            terminal: None,
            healthy: true,
        }
    }
}

/// What a mock replica has seen.
#[derive(Debug, Default)]
pub struct ReplicaLog {
    pub connections: AtomicUsize,
    pub requests: AtomicUsize,
    pub cancels: AtomicUsize,
    pub health_checks: AtomicUsize,
}

impl ReplicaLog {
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

/// Start a WebSocket replica on a free loopback port.
pub async fn start_replica(behavior: ReplicaBehavior) -> (SocketAddr, Arc<ReplicaLog>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log = Arc::new(ReplicaLog::default());

    let server_log = log.clone();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let behavior = behavior.clone();
            let log = server_log.clone();
            tokio::spawn(async move {
                if let Ok(ws) = tokio_tungstenite::accept_async(socket).await {
                    log.connections.fetch_add(1, Ordering::SeqCst);
                    serve(ws, behavior, log).await;
                }
            });
        }
    });

    (addr, log)
}

async fn send(ws: &mut WebSocketStream<TcpStream>, value: Value) -> bool {
    ws.send(Message::Text(value.to_string().into())).await.is_ok()
}

async fn serve(mut ws: WebSocketStream<TcpStream>, behavior: ReplicaBehavior, log: Arc<ReplicaLog>) {
    while let Some(Ok(msg)) = ws.next().await {
        let Message::Text(text) = msg else { continue };
        let request: Value = serde_json::from_str(text.as_str()).unwrap_or(Value::Null);
        let task_id = request["task_id"].clone();

        match request["type"].as_str().unwrap_or_default() {
            "health_check" => {
                log.health_checks.fetch_add(1, Ordering::SeqCst);
                let status = if behavior.healthy { "success" } else { "error" };
                if !send(&mut ws, json!({"type": "health_response", "status": status})).await {
                    return;
                }
            }
            "cancel" => {
                log.cancels.fetch_add(1, Ordering::SeqCst);
                return;
            }
            _ => {
                log.requests.fetch_add(1, Ordering::SeqCst);
                for i in 0..behavior.progress_updates {
                    tokio::time::sleep(behavior.step_delay).await;
                    let progress = json!({
                        "type": "progress_update",
                        "status": "success",
                        "task_id": task_id,
                        "progress": (i + 1) * 100 / (behavior.progress_updates + 1),
                    });
                    if !send(&mut ws, progress).await {
                        return;
                    }
                }
                if let Some(status) = behavior.terminal {
                    tokio::time::sleep(behavior.step_delay).await;
                    let result = json!({
                        "type": "analysis_result",
                        "status": status,
                        "task_id": task_id,
                        "timeout_seen": request["timeout"],
                        "result": {"tools_run": ["bandit", "pylint"]},
                    });
                    let _ = send(&mut ws, result).await;
                    let _ = ws.close(None).await;
                    return;
                }
            }
        }
    }
}

/// A loopback address nothing listens on.
pub async fn dead_address() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

pub fn gateway_config(service: &str, strategy: Strategy, addrs: &[SocketAddr]) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.pool.connect_timeout_secs = 2;
    config.dispatch.backoff_base_ms = 10;
    config.dispatch.backoff_max_ms = 50;
    config.services = vec![ServiceConfig {
        name: service.to_string(),
        strategy,
        endpoints: addrs.iter().map(|a| format!("ws://{a}")).collect(),
    }];
    config
}

pub fn websocket_dispatcher(config: &GatewayConfig) -> Dispatcher {
    Dispatcher::from_config(config, Arc::new(WebSocketConnector::new()))
}

/// Poll `check` until it holds or `limit` elapses.
pub async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
