//! HTTP surface: route table and request decoding.
//!
//! Handlers stay thin — dispatch logic lives in [`crate::proxy`],
//! [`crate::splitter`], and [`crate::status`]. The `/` and `/status` pages
//! are static assets served from the configured HTML directory when it
//! exists; the pages themselves are maintained outside this crate.

pub mod health;
pub mod request_id;
pub mod status;
pub mod tasks;
pub mod upload;

use std::{path::Path, sync::Arc};

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::services::ServeFile;

use crate::state::DispatchState;

/// Build the dispatcher's router.
pub fn router(state: Arc<DispatchState>, html_dir: &Path) -> Router {
    let mut router = Router::new()
        .route("/healthz", get(health::healthz))
        .route("/queue-status", get(status::queue_status))
        .route("/dispatch-log", get(status::dispatch_log))
        .route("/generate", post(tasks::generate))
        .route("/explain", post(tasks::explain))
        .route("/generate-code", post(tasks::generate_code))
        .route("/explain-code", post(tasks::explain_code))
        .route("/chat", post(tasks::chat))
        .route("/upload", post(upload::upload));

    let index = html_dir.join("index.html");
    if index.is_file() {
        router = router
            .route_service("/", ServeFile::new(index))
            .route_service("/status", ServeFile::new(html_dir.join("status.html")));
    }

    router.with_state(state)
}
