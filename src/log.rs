//! In-memory dispatch log.
//!
//! [`DispatchLog`] is a fixed-capacity ring-buffer of recent dispatches: once
//! full, the oldest entry is evicted to make room for the newest. Bounded,
//! O(1) memory regardless of request volume; nothing survives a restart.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Default number of entries retained.
pub const DEFAULT_LOG_CAPACITY: usize = 500;

/// Fixed-capacity ring-buffer of recent [`DispatchEntry`] records.
///
/// Safe to share via `Arc<DispatchLog>`. [`push`][Self::push] uses a
/// non-blocking `try_lock` so it never delays the dispatch path; under lock
/// contention the entry is silently dropped.
pub struct DispatchLog {
    capacity: usize,
    entries: Mutex<VecDeque<DispatchEntry>>,
}

impl DispatchLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Record a completed dispatch. Best-effort and non-blocking.
    pub fn push(&self, entry: DispatchEntry) {
        if let Ok(mut entries) = self.entries.try_lock() {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry);
        }
    }

    /// Up to `limit` recent entries, newest first.
    pub async fn recent(&self, limit: usize) -> Vec<DispatchEntry> {
        let entries = self.entries.lock().await;
        entries.iter().rev().take(limit).cloned().collect()
    }

    /// Aggregate statistics over all buffered entries.
    pub async fn stats(&self) -> DispatchStats {
        let entries = self.entries.lock().await;
        let total = entries.len();
        let avg_latency_ms = if total == 0 {
            0.0
        } else {
            entries.iter().map(|e| e.latency_ms as f64).sum::<f64>() / total as f64
        };
        let error_count = entries.iter().filter(|e| !e.success).count();

        let mut backend_counts: std::collections::HashMap<String, usize> =
            std::collections::HashMap::new();
        for entry in entries.iter() {
            *backend_counts.entry(entry.backend.clone()).or_default() += 1;
        }

        DispatchStats {
            total_requests: total,
            error_count,
            avg_latency_ms,
            backend_counts,
        }
    }
}

/// One completed dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Southbound endpoint, e.g. `/generate`.
    pub endpoint: String,
    /// Backend URL the task was sent to; empty when no backend was selected.
    pub backend: String,
    pub model: String,
    pub latency_ms: u64,
    pub success: bool,
    /// Error description when `success` is false.
    pub error: Option<String>,
}

impl DispatchEntry {
    pub fn new(endpoint: &str, backend: &str, model: &str, latency_ms: u64, success: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            endpoint: endpoint.to_owned(),
            backend: backend.to_owned(),
            model: model.to_owned(),
            latency_ms,
            success,
            error: None,
        }
    }

    pub fn with_error(mut self, err: &str) -> Self {
        self.error = Some(err.to_owned());
        self
    }
}

/// Aggregate view over the buffered entries.
#[derive(Debug, Serialize)]
pub struct DispatchStats {
    pub total_requests: usize,
    pub error_count: usize,
    pub avg_latency_ms: f64,
    pub backend_counts: std::collections::HashMap<String, usize>,
}
