//! Task endpoints.
//!
//! The five task kinds differ only in which request field carries the
//! payload and which southbound endpoint receives it, so they share a single
//! pipeline parameterized by [`TaskKind`]; the per-route handlers are thin
//! wrappers. `/generate` additionally honors the `split` flag, fanning long
//! inputs out through the splitter.

use std::sync::Arc;

use axum::{
    extract::State,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

use crate::{
    proxy::proxy,
    splitter::{split_and_process, DEFAULT_CHUNK_SIZE},
    state::DispatchState,
};

/// The task surface: each kind names its payload field and the backend
/// endpoint the task is forwarded to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    GeneratePlaybook,
    ExplainPlaybook,
    GenerateCode,
    ExplainCode,
    Chat,
}

impl TaskKind {
    /// Request/forward body field holding the task payload.
    pub fn payload_key(self) -> &'static str {
        match self {
            Self::GeneratePlaybook => "commands",
            Self::ExplainPlaybook => "playbook",
            Self::GenerateCode => "description",
            Self::ExplainCode => "code",
            Self::Chat => "message",
        }
    }

    /// Southbound endpoint the task is proxied to.
    pub fn endpoint(self) -> &'static str {
        match self {
            Self::GeneratePlaybook => "/generate",
            Self::ExplainPlaybook => "/explain",
            Self::GenerateCode => "/generate-code",
            Self::ExplainCode => "/explain-code",
            Self::Chat => "/chat",
        }
    }
}

fn model_from(state: &DispatchState, body: &Value) -> String {
    body.get("model")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| state.config.catalog.default_model())
        .to_owned()
}

/// The shared task pipeline: extract payload and model, rebuild a clean
/// forward body, proxy, relay status and body northbound.
pub async fn run_task(state: &Arc<DispatchState>, kind: TaskKind, body: &Value) -> Response {
    let payload = body
        .get(kind.payload_key())
        .and_then(Value::as_str)
        .unwrap_or_default();
    let model = model_from(state, body);

    let forward = json!({ kind.payload_key(): payload, "model": model });
    let (status, result) = proxy(state, kind.endpoint(), forward).await;
    (status, Json(result)).into_response()
}

/// POST /generate — `{commands, model?, split?}`.
pub async fn generate(
    State(state): State<Arc<DispatchState>>,
    Json(body): Json<Value>,
) -> Response {
    let split = body.get("split").and_then(Value::as_bool).unwrap_or(false);
    if split {
        let commands = body
            .get("commands")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let model = model_from(&state, &body);
        let (status, result) =
            split_and_process(&state, commands, &model, DEFAULT_CHUNK_SIZE).await;
        return (status, Json(result)).into_response();
    }
    run_task(&state, TaskKind::GeneratePlaybook, &body).await
}

/// POST /explain — `{playbook, model?}`.
pub async fn explain(
    State(state): State<Arc<DispatchState>>,
    Json(body): Json<Value>,
) -> Response {
    run_task(&state, TaskKind::ExplainPlaybook, &body).await
}

/// POST /generate-code — `{description, model?}`.
pub async fn generate_code(
    State(state): State<Arc<DispatchState>>,
    Json(body): Json<Value>,
) -> Response {
    run_task(&state, TaskKind::GenerateCode, &body).await
}

/// POST /explain-code — `{code, model?}`.
pub async fn explain_code(
    State(state): State<Arc<DispatchState>>,
    Json(body): Json<Value>,
) -> Response {
    run_task(&state, TaskKind::ExplainCode, &body).await
}

/// POST /chat — `{message, model?}`.
pub async fn chat(State(state): State<Arc<DispatchState>>, Json(body): Json<Value>) -> Response {
    run_task(&state, TaskKind::Chat, &body).await
}
