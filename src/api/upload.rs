//! Multipart upload endpoint.
//!
//! Accepts a shell-history file plus an optional `model` form field and runs
//! it through the same pipeline as `POST /generate`.

use std::sync::Arc;

use axum::{
    extract::{Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::{error::AppError, proxy::proxy, state::DispatchState};

/// POST /upload — multipart `file` (required) + `model` (optional).
///
/// Missing `file` is a client error (400); malformed multipart streams
/// surface through [`AppError`].
pub async fn upload(
    State(state): State<Arc<DispatchState>>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let mut commands: Option<String> = None;
    let mut model: Option<String> = None;

    while let Some(field) = multipart.next_field().await? {
        match field.name() {
            Some("file") => commands = Some(field.text().await?),
            Some("model") => model = Some(field.text().await?),
            _ => {}
        }
    }

    let Some(commands) = commands else {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "no file provided" })),
        )
            .into_response());
    };

    let model = model
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| state.config.catalog.default_model().to_owned());

    let (status, result) =
        proxy(&state, "/generate", json!({ "commands": commands, "model": model })).await;
    Ok((status, Json(result)).into_response())
}
