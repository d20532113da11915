//! Pool-wide status aggregation.
//!
//! An independent read path over the registry and probe client: every
//! descriptor is probed with bounded concurrency and the outcomes are folded
//! into one report. Offline backends appear in the report with zeroed
//! figures; they are never made unreservable here — online/offline is purely
//! a reporting field.

use chrono::{DateTime, Utc};
use futures_util::StreamExt as _;
use serde::Serialize;

use crate::state::DispatchState;

/// Probes in flight at once during aggregation.
const PROBE_CONCURRENCY: usize = 8;

/// Reachability of a backend as of the last aggregation probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Reachability {
    Online,
    Offline,
}

/// Per-backend line of the aggregate report.
#[derive(Debug, Clone, Serialize)]
pub struct BackendReport {
    pub url: String,
    pub weight: f64,
    pub max_model: String,
    pub queue_size: u32,
    pub active: bool,
    pub status: Reachability,
    pub active_model: String,
}

/// The aggregate report returned by `GET /queue-status`.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    /// Sum of queue depths across online backends.
    pub queue_size: u32,
    /// True when any backend reports an active task.
    pub active: bool,
    pub active_backends: usize,
    pub total_backends: usize,
    pub backends: Vec<BackendReport>,
    pub timestamp: DateTime<Utc>,
}

/// Probe every backend and build the report. Probe outcomes are written back
/// into the registry for observability, without ever touching `available`.
pub async fn aggregate(state: &DispatchState) -> StatusReport {
    let descriptors = state.registry.descriptors();

    let reports: Vec<BackendReport> = futures_util::stream::iter(descriptors.iter().cloned().map(|d| {
        let probe = &state.probe;
        async move {
            match probe.probe(&d.url).await {
                Ok(status) => BackendReport {
                    url: d.url.clone(),
                    weight: d.weight,
                    max_model: d.max_model.clone(),
                    queue_size: status.queue_size,
                    active: status.active,
                    status: Reachability::Online,
                    active_model: status.active_model.unwrap_or_else(|| "none".into()),
                },
                Err(_) => BackendReport {
                    url: d.url.clone(),
                    weight: d.weight,
                    max_model: d.max_model.clone(),
                    queue_size: 0,
                    active: false,
                    status: Reachability::Offline,
                    active_model: "none".into(),
                },
            }
        }
    }))
    // `buffered`, not `buffer_unordered`: report order stays config order
    .buffered(PROBE_CONCURRENCY)
    .collect()
    .await;

    for report in &reports {
        let online = report.status == Reachability::Online;
        state.registry.set_online(&report.url, online, &report.active_model);
        if online {
            state.registry.update_queue(&report.url, report.queue_size);
        }
    }

    let active_backends = reports.iter().filter(|r| r.active).count();
    StatusReport {
        queue_size: reports.iter().map(|r| r.queue_size).sum(),
        active: active_backends > 0,
        active_backends,
        total_backends: reports.len(),
        backends: reports,
        timestamp: Utc::now(),
    }
}
