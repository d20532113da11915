//! Configuration for playbook-dispatch.
//!
//! The backend pool is described by a JSON file (`backends.json` by default,
//! overridable via the `PBD_CONFIG` environment variable). Two forms are
//! accepted for the `backends` key:
//!
//! ```json
//! { "backends": ["http://host:5001", "http://host:5002"] }
//! ```
//!
//! ```json
//! { "backends": [
//!     { "url": "http://host:5001", "weight": 4, "max_model": "codellama:70b" }
//! ] }
//! ```
//!
//! Legacy string entries normalize to `weight = 1` and `max_model` set to the
//! largest model in the capability catalog. The loader never fails: any read
//! or parse error falls back to a single localhost backend so the dispatcher
//! always comes up.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Upper bound applied to configured weights. The selection score is
/// `queue_size − 0.1 × weight`; an unbounded weight would let a single
/// backend outscore arbitrarily deep queues everywhere else.
pub const MAX_WEIGHT: f64 = 100.0;

/// A single inference backend as declared in the pool config.
///
/// Immutable after load; the mutable counterpart lives in
/// [`crate::registry::BackendState`].
#[derive(Debug, Clone, Serialize)]
pub struct BackendDescriptor {
    /// Base URL of the backend, e.g. `http://gpu-1:5001`.
    pub url: String,
    /// Selection bias. A heavier box tolerates roughly ten extra queued
    /// items before a lighter idle box is preferred over it.
    pub weight: f64,
    /// Largest model identifier this backend can serve.
    pub max_model: String,
}

/// Raw wire form of a backend entry — either a bare URL string (legacy) or a
/// full object with optional fields.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawBackend {
    Url(String),
    Entry {
        url: String,
        #[serde(default)]
        weight: Option<f64>,
        #[serde(default)]
        max_model: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    backends: Vec<RawBackend>,
    #[serde(default)]
    models: Option<Vec<ModelSpec>>,
}

/// One entry of the model capability table.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelSpec {
    /// Model identifier as it appears in requests and `max_model` fields.
    pub id: String,
    /// Capability rank — a backend whose `max_model` has rank M can serve
    /// any request whose model has rank ≤ M.
    pub rank: u32,
}

/// Ordered capability table mapping model identifiers to ranks.
///
/// The table is itself configuration: a `models` key in the config file
/// replaces the built-in reference table.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    entries: Vec<ModelSpec>,
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self {
            entries: vec![
                ModelSpec { id: "codellama:7b".into(), rank: 1 },
                ModelSpec { id: "codellama:13b".into(), rank: 2 },
                ModelSpec { id: "codellama:34b".into(), rank: 3 },
                ModelSpec { id: "codellama:70b".into(), rank: 4 },
            ],
        }
    }
}

impl ModelCatalog {
    pub fn new(mut entries: Vec<ModelSpec>) -> Self {
        if entries.is_empty() {
            return Self::default();
        }
        entries.sort_by_key(|e| e.rank);
        Self { entries }
    }

    /// Rank of a model identifier.
    ///
    /// Exact id match first, then a containment match in descending rank
    /// order so descriptor values like `"70b"` line up with request models
    /// like `"codellama:70b"` (and vice versa). Unknown identifiers take the
    /// smallest rank in the table.
    pub fn rank_of(&self, model: &str) -> u32 {
        if let Some(spec) = self.entries.iter().find(|e| e.id == model) {
            return spec.rank;
        }
        if !model.is_empty() {
            if let Some(spec) = self
                .entries
                .iter()
                .rev()
                .find(|e| e.id.contains(model) || model.contains(e.id.as_str()))
            {
                return spec.rank;
            }
        }
        self.min_rank()
    }

    /// Smallest rank in the table.
    pub fn min_rank(&self) -> u32 {
        self.entries.iter().map(|e| e.rank).min().unwrap_or(1)
    }

    /// Identifier used when a request carries no `model` field.
    ///
    /// The second-smallest entry in the table — `codellama:13b` in the
    /// reference catalog.
    pub fn default_model(&self) -> &str {
        self.entries
            .get(1)
            .or_else(|| self.entries.first())
            .map(|e| e.id.as_str())
            .unwrap_or("codellama:13b")
    }

    /// Identifier with the highest rank — used to fill missing `max_model`
    /// fields so legacy entries are assumed fully capable.
    pub fn largest_model(&self) -> &str {
        self.entries
            .last()
            .map(|e| e.id.as_str())
            .unwrap_or("codellama:70b")
    }
}

/// Loaded dispatcher configuration: the backend pool plus the capability
/// catalog. Built once at startup and immutable afterwards.
#[derive(Debug, Clone)]
pub struct Config {
    pub backends: Vec<BackendDescriptor>,
    pub catalog: ModelCatalog,
}

impl Config {
    /// Load from `path`, falling back to a single localhost backend on any
    /// read or parse failure. This function never errors — a dispatcher with
    /// a broken config file still serves its default pool.
    pub fn load_or_default(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<RawConfig>(&content) {
                Ok(raw) => Self::from_raw(raw),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "config parse failed — using default backend");
                    Self::fallback()
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "config read failed — using default backend");
                Self::fallback()
            }
        }
    }

    fn from_raw(raw: RawConfig) -> Self {
        let catalog = match raw.models {
            Some(models) => ModelCatalog::new(models),
            None => ModelCatalog::default(),
        };
        let largest = catalog.largest_model().to_owned();

        let backends: Vec<BackendDescriptor> = raw
            .backends
            .into_iter()
            .map(|b| match b {
                RawBackend::Url(url) => BackendDescriptor {
                    url,
                    weight: 1.0,
                    max_model: largest.clone(),
                },
                RawBackend::Entry { url, weight, max_model } => BackendDescriptor {
                    url,
                    weight: clamp_weight(weight.unwrap_or(1.0)),
                    max_model: max_model.unwrap_or_else(|| largest.clone()),
                },
            })
            .collect();

        if backends.is_empty() {
            warn!("config lists no backends — using default backend");
            return Self::fallback();
        }
        Self { backends, catalog }
    }

    fn fallback() -> Self {
        let catalog = ModelCatalog::default();
        let max_model = catalog.largest_model().to_owned();
        Self {
            backends: vec![BackendDescriptor {
                url: "http://localhost:5001".into(),
                weight: 1.0,
                max_model,
            }],
            catalog,
        }
    }
}

/// Clamp a configured weight to `[0, MAX_WEIGHT]`; non-finite or negative
/// values reset to the neutral 1.
fn clamp_weight(weight: f64) -> f64 {
    if !weight.is_finite() || weight < 0.0 {
        warn!(weight, "invalid backend weight — using 1");
        return 1.0;
    }
    if weight > MAX_WEIGHT {
        warn!(weight, "backend weight above {MAX_WEIGHT} — clamping");
        return MAX_WEIGHT;
    }
    weight
}
