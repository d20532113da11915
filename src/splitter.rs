//! Parallel fan-out for long command inputs.
//!
//! The input is split on line terminators into contiguous chunks of at most
//! `chunk_size` lines. Each chunk is proxied to `/generate` as its own task,
//! concurrently — actual parallelism is bounded by how many backends the
//! selector will hand out. Results are reassembled by chunk index, never by
//! completion order, so the merged playbook reads in input order.
//!
//! Per-chunk failures (including a selection that finds no backend) keep
//! their slot in the output with an empty playbook; the merged response is
//! always HTTP 200 and callers inspect per-chunk payloads for errors.

use std::sync::Arc;

use axum::http::StatusCode;
use serde_json::{json, Value};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::{proxy::proxy, state::DispatchState};

/// Maximum lines per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 10;

/// Separator between per-chunk playbooks in the merged output.
const CHUNK_SEPARATOR: &str = "\n---\n";

/// Split trimmed input into ordered chunks of at most `chunk_size` lines.
pub fn chunk_lines(text: &str, chunk_size: usize) -> Vec<String> {
    let lines: Vec<&str> = text.trim().split('\n').collect();
    lines
        .chunks(chunk_size.max(1))
        .map(|chunk| chunk.join("\n"))
        .collect()
}

/// Chunk `commands`, fan the chunks out across backends, and merge the
/// results in input order.
///
/// Inputs of `chunk_size` lines or fewer degrade to a single direct proxy
/// call with the original text.
pub async fn split_and_process(
    state: &Arc<DispatchState>,
    commands: &str,
    model: &str,
    chunk_size: usize,
) -> (StatusCode, Value) {
    let chunks = chunk_lines(commands, chunk_size);
    if chunks.len() <= 1 {
        return proxy(state, "/generate", json!({ "commands": commands, "model": model })).await;
    }

    debug!(chunks = chunks.len(), %model, "splitting commands across backends");

    let mut set = JoinSet::new();
    for (idx, chunk) in chunks.iter().enumerate() {
        let state = Arc::clone(state);
        let body = json!({ "commands": chunk, "model": model });
        set.spawn(async move { (idx, proxy(&state, "/generate", body).await) });
    }

    // Index-addressed slots: completion order cannot reorder the output, and
    // a lost child leaves an empty slot rather than shifting its neighbours.
    let mut slots: Vec<Value> = vec![Value::Null; chunks.len()];
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((idx, (_status, body))) => slots[idx] = body,
            Err(e) => warn!(error = %e, "chunk task failed to join"),
        }
    }

    (StatusCode::OK, merge(&slots))
}

/// Merge per-chunk bodies: playbooks joined in order, max elapsed, summed
/// tokens.
fn merge(slots: &[Value]) -> Value {
    let playbook = slots
        .iter()
        .map(|r| r.get("playbook").and_then(Value::as_str).unwrap_or(""))
        .collect::<Vec<_>>()
        .join(CHUNK_SEPARATOR);

    let elapsed = slots
        .iter()
        .filter_map(|r| r.get("elapsed").and_then(Value::as_f64))
        .fold(0.0_f64, f64::max);

    let total_tokens: u64 = slots
        .iter()
        .filter_map(|r| r.get("total_tokens").and_then(Value::as_u64))
        .sum();

    json!({
        "playbook": playbook,
        "elapsed": (elapsed * 100.0).round() / 100.0,
        "total_tokens": total_tokens,
        "chunks_processed": slots.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendDescriptor, Config, ModelCatalog};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    // -----------------------------------------------------------------------
    // chunk_lines — pure, no I/O
    // -----------------------------------------------------------------------

    fn numbered_lines(n: usize) -> String {
        (1..=n).map(|i| format!("cmd {i}")).collect::<Vec<_>>().join("\n")
    }

    #[test]
    fn short_input_is_one_chunk() {
        let chunks = chunk_lines(&numbered_lines(10), 10);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn chunk_count_is_ceil_of_lines_over_size() {
        assert_eq!(chunk_lines(&numbered_lines(25), 10).len(), 3);
        assert_eq!(chunk_lines(&numbered_lines(30), 10).len(), 3);
        assert_eq!(chunk_lines(&numbered_lines(31), 10).len(), 4);
    }

    #[test]
    fn chunks_partition_the_trimmed_input() {
        let input = format!("\n\n{}\n\n", numbered_lines(25));
        let chunks = chunk_lines(&input, 10);
        assert_eq!(chunks.join("\n"), input.trim());
        // every line lands in exactly one chunk
        let total_lines: usize = chunks.iter().map(|c| c.split('\n').count()).sum();
        assert_eq!(total_lines, 25);
    }

    #[test]
    fn chunk_boundaries_preserve_order() {
        let chunks = chunk_lines(&numbered_lines(12), 5);
        assert_eq!(chunks[0].split('\n').next(), Some("cmd 1"));
        assert_eq!(chunks[1].split('\n').next(), Some("cmd 6"));
        assert_eq!(chunks[2], "cmd 11\ncmd 12");
    }

    // -----------------------------------------------------------------------
    // merge — pure
    // -----------------------------------------------------------------------

    #[test]
    fn merge_joins_playbooks_with_separator() {
        let slots = vec![
            serde_json::json!({ "playbook": "one", "elapsed": 1.0, "total_tokens": 10 }),
            serde_json::json!({ "playbook": "two", "elapsed": 3.517, "total_tokens": 20 }),
            serde_json::json!({ "playbook": "three", "elapsed": 2.0, "total_tokens": 30 }),
        ];
        let merged = merge(&slots);
        assert_eq!(merged["playbook"], "one\n---\ntwo\n---\nthree");
        assert_eq!(merged["elapsed"], 3.52);
        assert_eq!(merged["total_tokens"], 60);
        assert_eq!(merged["chunks_processed"], 3);
    }

    #[test]
    fn merge_keeps_slots_for_failed_chunks() {
        let slots = vec![
            serde_json::json!({ "playbook": "one" }),
            serde_json::json!({ "error": "no backends available that support codellama:13b" }),
            serde_json::json!({ "playbook": "three" }),
        ];
        let merged = merge(&slots);
        assert_eq!(merged["playbook"], "one\n---\n\n---\nthree");
        assert_eq!(merged["chunks_processed"], 3);
    }

    // -----------------------------------------------------------------------
    // split_and_process — wiremock backends
    // -----------------------------------------------------------------------

    /// Backend that echoes the received commands back as the playbook, with
    /// an artificial delay so later chunks can finish first.
    async fn echo_backend(delay_ms: u64) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/queue-status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "queue_size": 0
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/generate"))
            .respond_with(move |req: &Request| {
                let body: serde_json::Value = serde_json::from_slice(&req.body).unwrap();
                let commands = body["commands"].as_str().unwrap_or("").to_owned();
                ResponseTemplate::new(200)
                    .set_delay(std::time::Duration::from_millis(delay_ms))
                    .set_body_json(serde_json::json!({
                        "playbook": format!("# {}", commands.split('\n').next().unwrap_or("")),
                        "elapsed": delay_ms as f64 / 1000.0,
                        "total_tokens": 10
                    }))
            })
            .mount(&server)
            .await;
        server
    }

    fn state_for(servers: &[&MockServer]) -> Arc<DispatchState> {
        Arc::new(DispatchState::new(Config {
            backends: servers
                .iter()
                .map(|s| BackendDescriptor {
                    url: s.uri(),
                    weight: 1.0,
                    max_model: "codellama:70b".into(),
                })
                .collect(),
            catalog: ModelCatalog::default(),
        }))
    }

    #[tokio::test]
    async fn short_input_degrades_to_single_proxy_call() {
        let server = echo_backend(0).await;
        let state = state_for(&[&server]);

        let (status, body) =
            split_and_process(&state, &numbered_lines(5), "codellama:13b", 10).await;

        assert_eq!(status, StatusCode::OK);
        // direct proxy result — no merge fields
        assert_eq!(body["playbook"], "# cmd 1");
        assert!(body.get("chunks_processed").is_none());
    }

    #[tokio::test]
    async fn merged_output_preserves_chunk_order() {
        // Three backends with decreasing delays: the chunk dispatched last
        // tends to complete first. Order must still follow chunk indexes.
        let s1 = echo_backend(300).await;
        let s2 = echo_backend(150).await;
        let s3 = echo_backend(0).await;
        let state = state_for(&[&s1, &s2, &s3]);

        let (status, body) =
            split_and_process(&state, &numbered_lines(25), "codellama:13b", 10).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["chunks_processed"], 3);
        let playbook = body["playbook"].as_str().unwrap();
        let sections: Vec<&str> = playbook.split("\n---\n").collect();
        assert_eq!(sections, vec!["# cmd 1", "# cmd 11", "# cmd 21"]);
    }

    #[tokio::test]
    async fn merged_elapsed_is_max_and_tokens_sum() {
        let s1 = echo_backend(200).await;
        let s2 = echo_backend(50).await;
        let state = state_for(&[&s1, &s2]);

        let (_, body) = split_and_process(&state, &numbered_lines(20), "codellama:13b", 10).await;

        assert_eq!(body["total_tokens"], 20);
        let elapsed = body["elapsed"].as_f64().unwrap();
        assert!((0.01..=10.0).contains(&elapsed), "elapsed = {elapsed}");
    }

    #[tokio::test]
    async fn all_reservations_return_after_split() {
        let s1 = echo_backend(0).await;
        let s2 = echo_backend(0).await;
        let state = state_for(&[&s1, &s2]);

        split_and_process(&state, &numbered_lines(40), "codellama:13b", 10).await;

        assert!(state.registry.snapshot().iter().all(|s| s.state.available));
    }

    #[tokio::test]
    async fn chunks_beyond_pool_capacity_still_get_slots() {
        // One backend, three chunks: the dispatcher never queues internally,
        // so chunks that lose the selection race surface as empty slots. The
        // merged output still has exactly one slot per chunk, in order, and
        // the overall status is 200.
        let server = echo_backend(0).await;
        let state = state_for(&[&server]);

        let (status, body) =
            split_and_process(&state, &numbered_lines(25), "codellama:13b", 10).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["chunks_processed"], 3);
        let playbook = body["playbook"].as_str().unwrap();
        assert_eq!(playbook.split("\n---\n").count(), 3);
    }
}
