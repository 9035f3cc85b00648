use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::gateway::{AnalysisOutcome, DispatchRequest, Dispatcher, GatewayStats, OutcomeStatus};
use crate::pool::TaskInfo;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub services: usize,
    pub active_tasks: usize,
}

/// Body of `POST /dispatch/{service}`.
#[derive(Debug, Deserialize)]
pub struct DispatchBody {
    #[serde(flatten)]
    pub request: DispatchRequest,
    /// Overall timeout; the configured default when absent.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Serialize)]
pub struct CancelResponse {
    pub task_id: String,
    pub cancelled: bool,
}

pub async fn get_status(State(dispatcher): State<Dispatcher>) -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        services: dispatcher.registry().all().len(),
        active_tasks: dispatcher.pool().active_tasks(),
    })
}

pub async fn get_stats(State(dispatcher): State<Dispatcher>) -> Json<GatewayStats> {
    Json(dispatcher.get_pool_stats())
}

pub async fn dispatch(
    State(dispatcher): State<Dispatcher>,
    Path(service): Path<String>,
    Json(body): Json<DispatchBody>,
) -> (StatusCode, Json<AnalysisOutcome>) {
    let timeout = body.timeout_secs.map(Duration::from_secs);
    let outcome = dispatcher.dispatch(&service, body.request, timeout).await;
    let code = match outcome.status {
        OutcomeStatus::NotAvailable => StatusCode::SERVICE_UNAVAILABLE,
        OutcomeStatus::Timeout => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::OK,
    };
    (code, Json(outcome))
}

pub async fn get_task(
    State(dispatcher): State<Dispatcher>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskInfo>, StatusCode> {
    dispatcher.get_task(&task_id).map(Json).ok_or(StatusCode::NOT_FOUND)
}

pub async fn cancel_task(
    State(dispatcher): State<Dispatcher>,
    Path(task_id): Path<String>,
) -> Json<CancelResponse> {
    let cancelled = dispatcher.cancel_task(&task_id).await;
    Json(CancelResponse { task_id, cancelled })
}
