//! Read-only introspection endpoints: aggregate queue status and the recent
//! dispatch log.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::state::DispatchState;

/// GET /queue-status — probe the whole pool and return the aggregate report.
pub async fn queue_status(State(state): State<Arc<DispatchState>>) -> impl IntoResponse {
    Json(crate::status::aggregate(&state).await)
}

#[derive(Deserialize)]
pub struct LogQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}
fn default_limit() -> usize {
    100
}

/// GET /dispatch-log?limit=N — recent N dispatch entries, aggregate stats,
/// and the current reservation state of the pool.
pub async fn dispatch_log(
    State(state): State<Arc<DispatchState>>,
    Query(q): Query<LogQuery>,
) -> impl IntoResponse {
    let entries = state.dispatch_log.recent(q.limit).await;
    let stats = state.dispatch_log.stats().await;
    Json(json!({
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "stats": stats,
        "entries": entries,
        "pool": state.registry.snapshot(),
    }))
}
