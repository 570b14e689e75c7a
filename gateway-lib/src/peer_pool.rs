//! Weighted peer selection.
//!
//! Every configured endpoint carries an integer weight in `[1, 99]`,
//! warmed on success and cooled on failure. Selection samples
//! proportionally to weight. Unhealthy peers are never removed
//! automatically; removal is an operational decision, the pool only
//! signals.

use parking_lot::Mutex;
use rand::Rng;
use tracing::warn;
use url::Url;

use crate::error::FetchError;

const MIN_WEIGHT: u32 = 1;
const MAX_WEIGHT: u32 = 99;
/// Below this weight an escalated failure emits the unhealthy-peer signal.
const LOW_HEALTH_THRESHOLD: u32 = 2;

#[derive(Debug)]
struct PeerEntry {
    endpoint: Url,
    weight: u32,
}

/// In-memory, process-lifetime peer health table. Weights reset to uniform
/// on restart by construction.
#[derive(Debug)]
pub struct PeerPool {
    entries: Mutex<Vec<PeerEntry>>,
    escalations: std::sync::atomic::AtomicU64,
}

impl PeerPool {
    pub fn new(endpoints: Vec<Url>) -> Self {
        Self {
            entries: Mutex::new(
                endpoints
                    .into_iter()
                    .map(|endpoint| PeerEntry {
                        endpoint,
                        weight: MIN_WEIGHT,
                    })
                    .collect(),
            ),
            escalations: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Picks an endpoint, weighted-random proportional to current weights.
    /// Falls back to the first configured endpoint if sampling degenerates,
    /// so a non-empty pool always yields a peer.
    pub fn select(&self) -> Result<Url, FetchError> {
        let entries = self.entries.lock();
        if entries.is_empty() {
            return Err(FetchError::NoPeersAvailable);
        }
        let total: u64 = entries.iter().map(|e| u64::from(e.weight)).sum();
        if total > 0 {
            let mut roll = rand::rng().random_range(0..total);
            for entry in entries.iter() {
                let weight = u64::from(entry.weight);
                if roll < weight {
                    return Ok(entry.endpoint.clone());
                }
                roll -= weight;
            }
        }
        Ok(entries[0].endpoint.clone())
    }

    /// Warms the peer after a successful fetch.
    pub fn report_success(&self, endpoint: &Url) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.iter_mut().find(|e| &e.endpoint == endpoint) {
            entry.weight = (entry.weight + 1).min(MAX_WEIGHT);
        }
    }

    /// Cools the peer after a failed fetch. With `escalate` set, a peer
    /// already at low health emits the unhealthy-peer signal.
    pub fn report_failure(&self, endpoint: &Url, escalate: bool) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.iter_mut().find(|e| &e.endpoint == endpoint) {
            entry.weight = entry.weight.saturating_sub(1).max(MIN_WEIGHT);
            if escalate && entry.weight < LOW_HEALTH_THRESHOLD {
                warn!(
                    peer = %endpoint,
                    "peer is not responding well, if at all, consider removing it from the peer list"
                );
                self.escalations
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        }
    }

    /// Number of unhealthy-peer signals emitted so far.
    pub fn escalation_count(&self) -> u64 {
        self.escalations.load(std::sync::atomic::Ordering::Relaxed)
    }

    #[cfg(test)]
    fn weight_of(&self, endpoint: &Url) -> Option<u32> {
        self.entries
            .lock()
            .iter()
            .find(|e| &e.endpoint == endpoint)
            .map(|e| e.weight)
    }
}
