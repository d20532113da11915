//! Time-bounded liveness and queue-depth probe.
//!
//! A probe is a single `GET <url>/queue-status` with a 2-second wall-clock
//! deadline. It is idempotent and has no side effect on the registry —
//! callers decide what an offline result means for them (the selector treats
//! it as a 999-deep queue, the aggregator as an offline report entry).

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Hard per-probe deadline.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Decoded `queue-status` response from a single backend.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueStatus {
    #[serde(default)]
    pub queue_size: u32,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub active_model: Option<String>,
}

/// Why a probe came back empty-handed. Either way the backend is treated as
/// offline for this round.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("decoding queue-status: {0}")]
    Decode(#[from] serde_json::Error),
}

/// HTTP client dedicated to probing, with its own short timeout.
pub struct ProbeClient {
    client: reqwest::Client,
}

impl ProbeClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .expect("failed to build probe client");
        Self { client }
    }

    /// Probe one backend. Timeouts surface as [`ProbeError::Transport`].
    pub async fn probe(&self, url: &str) -> Result<QueueStatus, ProbeError> {
        let response = self
            .client
            .get(format!("{url}/queue-status"))
            .send()
            .await?;
        let text = response.text().await?;
        Ok(serde_json::from_str(&text)?)
    }
}

impl Default for ProbeClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn probe_decodes_queue_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/queue-status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "queue_size": 3,
                "active": true,
                "active_model": "codellama:13b"
            })))
            .mount(&server)
            .await;

        let status = ProbeClient::new().probe(&server.uri()).await.unwrap();
        assert_eq!(status.queue_size, 3);
        assert!(status.active);
        assert_eq!(status.active_model.as_deref(), Some("codellama:13b"));
    }

    #[tokio::test]
    async fn probe_tolerates_missing_fields() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/queue-status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let status = ProbeClient::new().probe(&server.uri()).await.unwrap();
        assert_eq!(status.queue_size, 0);
        assert!(!status.active);
        assert!(status.active_model.is_none());
    }

    #[tokio::test]
    async fn probe_errors_on_unparseable_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/queue-status"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = ProbeClient::new().probe(&server.uri()).await.unwrap_err();
        assert!(matches!(err, ProbeError::Decode(_)));
    }

    #[tokio::test]
    async fn probe_errors_when_nothing_is_listening() {
        // Port reserved then immediately dropped — nothing listens on it.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let err = ProbeClient::new().probe(&url).await.unwrap_err();
        assert!(matches!(err, ProbeError::Transport(_)));
    }
}
