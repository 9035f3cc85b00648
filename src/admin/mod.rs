//! Admin HTTP surface.
//!
//! ```text
//! GET  /admin/status               liveness + counts
//! GET  /admin/stats                pool + per-service endpoint stats
//! GET  /admin/tasks/{id}           in-flight task
//! POST /admin/tasks/{id}/cancel    cancel through the pool registry
//! POST /dispatch/{service}         dispatch one request, wait for the outcome
//! ```

pub mod handlers;

use std::time::Duration;

use axum::{
    http::StatusCode,
    routing::{get, post},
    Router,
};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use self::handlers::*;
use crate::gateway::Dispatcher;

const ADMIN_TIMEOUT: Duration = Duration::from_secs(10);

pub fn setup_admin_router(dispatcher: Dispatcher) -> Router {
    let admin = Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/stats", get(get_stats))
        .route("/admin/tasks/{id}", get(get_task))
        .route("/admin/tasks/{id}/cancel", post(cancel_task))
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, ADMIN_TIMEOUT));

    // Dispatch is bounded by its own deadline.
    let dispatch_routes = Router::new().route("/dispatch/{service}", post(dispatch));

    admin
        .merge(dispatch_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(dispatcher)
}
