//! Backend registry — the single piece of shared mutable state.
//!
//! The registry owns the immutable [`BackendDescriptor`] list and one mutable
//! [`BackendState`] per descriptor. Every read and write of state goes
//! through one `std::sync::Mutex`; critical sections are pure memory
//! operations, so the lock is never held across an await point and never
//! while the network is touched.
//!
//! Reservation is exclusive: a backend with `available = false` has exactly
//! one task in flight. [`ReservationGuard`] pairs every reservation with a
//! release on drop, so the release fires on early returns, errors, and
//! panics alike.

use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::config::BackendDescriptor;

/// Queue depth recorded for a backend whose probe failed. Large enough that
/// any live backend scores better.
pub const OFFLINE_QUEUE_SIZE: u32 = 999;

/// Mutable per-backend state. One instance per descriptor, living for the
/// process lifetime.
#[derive(Debug, Clone, Serialize)]
pub struct BackendState {
    /// False while a task is reserved against this backend.
    pub available: bool,
    /// Last observed queue depth; [`OFFLINE_QUEUE_SIZE`] after a failed probe.
    pub queue_size: u32,
    /// Model the backend last reported as loaded. Reported, not authoritative.
    pub active_model: String,
    /// Result of the last aggregator probe. Reporting only — an offline
    /// backend stays reservable so a stale probe cannot exile it.
    pub online: bool,
}

impl BackendState {
    fn new() -> Self {
        Self {
            available: true,
            queue_size: 0,
            active_model: "none".into(),
            online: true,
        }
    }
}

/// A descriptor/state pair as returned by [`Registry::snapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct BackendSnapshot {
    pub descriptor: BackendDescriptor,
    pub state: BackendState,
}

/// Registry of backends and their live state.
///
/// Never performs network I/O itself — probing is the
/// [`crate::probe::ProbeClient`]'s job.
pub struct Registry {
    descriptors: Vec<BackendDescriptor>,
    states: Mutex<Vec<BackendState>>,
}

impl Registry {
    pub fn new(descriptors: &[BackendDescriptor]) -> Self {
        Self {
            descriptors: descriptors.to_vec(),
            states: Mutex::new(descriptors.iter().map(|_| BackendState::new()).collect()),
        }
    }

    /// The immutable descriptor list, in config order.
    pub fn descriptors(&self) -> &[BackendDescriptor] {
        &self.descriptors
    }

    fn index_of(&self, url: &str) -> Option<usize> {
        self.descriptors.iter().position(|d| d.url == url)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<BackendState>> {
        self.states.lock().expect("registry lock poisoned")
    }

    /// Copy of every descriptor/state pair, for read-only consumers.
    pub fn snapshot(&self) -> Vec<BackendSnapshot> {
        let states = self.lock();
        self.descriptors
            .iter()
            .zip(states.iter())
            .map(|(descriptor, state)| BackendSnapshot {
                descriptor: descriptor.clone(),
                state: state.clone(),
            })
            .collect()
    }

    /// URLs of backends currently available for reservation.
    pub fn available_urls(&self) -> Vec<String> {
        let states = self.lock();
        self.descriptors
            .iter()
            .zip(states.iter())
            .filter(|(_, s)| s.available)
            .map(|(d, _)| d.url.clone())
            .collect()
    }

    /// Atomically claim `url` if it is available. Returns false for unknown
    /// URLs and for backends already reserved.
    pub fn try_reserve(&self, url: &str) -> bool {
        let Some(idx) = self.index_of(url) else {
            return false;
        };
        let mut states = self.lock();
        if states[idx].available {
            states[idx].available = false;
            true
        } else {
            false
        }
    }

    /// Return `url` to the pool. Idempotent; unknown URLs are ignored.
    pub fn release(&self, url: &str) {
        if let Some(idx) = self.index_of(url) {
            self.lock()[idx].available = true;
        }
    }

    /// Record an observed queue depth for `url`.
    pub fn update_queue(&self, url: &str, queue_size: u32) {
        if let Some(idx) = self.index_of(url) {
            self.lock()[idx].queue_size = queue_size;
        }
    }

    /// Aggregator write path: record reachability and the reported model.
    /// Never touches `available`.
    pub fn set_online(&self, url: &str, online: bool, active_model: &str) {
        if let Some(idx) = self.index_of(url) {
            let mut states = self.lock();
            states[idx].online = online;
            states[idx].active_model = active_model.to_owned();
        }
    }

    /// Scan available backends under the lock and return the URL with the
    /// smallest score. `score` returns `None` to filter a candidate out;
    /// ties break by config order. Read-only — callers follow up with
    /// [`Registry::try_reserve`] and retry if they lose the race.
    pub fn best_candidate<F>(&self, mut score: F) -> Option<String>
    where
        F: FnMut(&BackendDescriptor, &BackendState) -> Option<f64>,
    {
        let states = self.lock();
        let mut best: Option<(usize, f64)> = None;
        for (idx, state) in states.iter().enumerate() {
            if !state.available {
                continue;
            }
            if let Some(s) = score(&self.descriptors[idx], state) {
                // strict less-than keeps the earliest descriptor on ties
                if best.map_or(true, |(_, b)| s < b) {
                    best = Some((idx, s));
                }
            }
        }
        best.map(|(idx, _)| self.descriptors[idx].url.clone())
    }
}

/// RAII reservation: releases the backend when dropped, whatever the exit
/// path of the task that held it.
pub struct ReservationGuard {
    registry: Arc<Registry>,
    url: String,
}

impl ReservationGuard {
    pub fn new(registry: Arc<Registry>, url: String) -> Self {
        Self { registry, url }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        self.registry.release(&self.url);
    }
}
