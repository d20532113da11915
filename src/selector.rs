//! Capability- and load-aware backend selection.
//!
//! Selection follows one canonical pattern: snapshot the available URLs
//! under the registry lock, probe them concurrently with the lock released,
//! write the fresh readings back, then filter, score, and reserve. The
//! reserve step uses `try_reserve`; losing the race to a concurrent
//! selection just re-runs the scan over whatever candidates remain.
//!
//! Score: `queue_size − 0.1 × weight`, smaller is better. Weight is a bias,
//! not a divisor — a heavier box tolerates roughly ten extra queued items
//! before a lighter idle box wins, and empty queues cannot invert the
//! preference pathologically.

use futures_util::future::join_all;
use tracing::debug;

use crate::{registry::OFFLINE_QUEUE_SIZE, state::DispatchState};

/// Weight discount per unit of weight in the selection score.
const WEIGHT_BIAS: f64 = 0.1;

/// Pick and exclusively reserve the best backend capable of serving `model`.
///
/// Returns the reserved backend's URL, or `None` when no backend is both
/// available and capable — the caller surfaces that as HTTP 503. The caller
/// owns the reservation and must pair it with a release
/// ([`crate::registry::ReservationGuard`]).
pub async fn select(state: &DispatchState, model: &str) -> Option<String> {
    let urls = state.registry.available_urls();
    if urls.is_empty() {
        return None;
    }

    // Probe round for this selection — concurrent, outside the lock.
    let readings = join_all(urls.into_iter().map(|url| async {
        let queue_size = match state.probe.probe(&url).await {
            Ok(status) => status.queue_size,
            Err(e) => {
                debug!(%url, error = %e, "probe failed — treating as offline");
                OFFLINE_QUEUE_SIZE
            }
        };
        (url, queue_size)
    }))
    .await;

    for (url, queue_size) in &readings {
        state.registry.update_queue(url, *queue_size);
    }

    let requested_rank = state.config.catalog.rank_of(model);
    let catalog = &state.config.catalog;

    // Scan-then-reserve: if another selection claims the winner between the
    // two steps, rescan — the lost backend is no longer available, so the
    // loop shrinks and terminates.
    loop {
        let candidate = state.registry.best_candidate(|descriptor, st| {
            (catalog.rank_of(&descriptor.max_model) >= requested_rank)
                .then(|| score(st.queue_size, descriptor.weight))
        })?;
        if state.registry.try_reserve(&candidate) {
            return Some(candidate);
        }
    }
}

fn score(queue_size: u32, weight: f64) -> f64 {
    queue_size as f64 - WEIGHT_BIAS * weight
}
