//! Shared application state injected into every request handler.

use std::sync::Arc;
use std::time::Duration;

use crate::{
    config::Config,
    log::{DispatchLog, DEFAULT_LOG_CAPACITY},
    probe::ProbeClient,
    registry::Registry,
};

/// Hard wall-clock deadline for a proxied backend call. Playbook generation
/// on a cold 70b model can take minutes.
pub const BACKEND_TIMEOUT: Duration = Duration::from_secs(600);

/// Everything a handler needs, behind one `Arc`.
///
/// The registry is the only mutable piece; config and catalog are immutable
/// after startup.
pub struct DispatchState {
    pub config: Config,
    pub registry: Arc<Registry>,
    pub probe: ProbeClient,
    /// Client for southbound task calls, with the long backend timeout.
    /// Probing uses the separate short-deadline client in `probe`.
    pub client: reqwest::Client,
    pub dispatch_log: DispatchLog,
    pub started_at: std::time::Instant,
}

impl DispatchState {
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(Registry::new(&config.backends));
        let client = reqwest::Client::builder()
            .timeout(BACKEND_TIMEOUT)
            .build()
            .expect("failed to build backend client");
        Self {
            config,
            registry,
            probe: ProbeClient::new(),
            client,
            dispatch_log: DispatchLog::new(DEFAULT_LOG_CAPACITY),
            started_at: std::time::Instant::now(),
        }
    }
}
