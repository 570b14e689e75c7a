//! In-process sync counters.

use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};

/// A copy of all counters as plain values.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncMetricsSnapshot {
    /// Blocks ingested into the canonical projections
    pub blocks_synced: u64,
    /// Transactions indexed, bundle members included
    pub transactions_indexed: u64,
    /// Bundle payloads unpacked
    pub bundles_unpacked: u64,
    /// Batches the store accepted
    pub batches_flushed: u64,
    /// Fetch attempts that had to be retried
    pub fetch_retries: u64,
    /// Completed fork recoveries
    pub forks_recovered: u64,
}

impl Display for SyncMetricsSnapshot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Gateway Sync Metrics:")?;
        writeln!(f, "  Blocks synced: {}", self.blocks_synced)?;
        writeln!(f, "  Transactions indexed: {}", self.transactions_indexed)?;
        writeln!(f, "  Bundles unpacked: {}", self.bundles_unpacked)?;
        writeln!(f, "  Batches flushed: {}", self.batches_flushed)?;
        writeln!(f, "  Fetch retries: {}", self.fetch_retries)?;
        write!(f, "  Forks recovered: {}", self.forks_recovered)
    }
}

/// Atomic counters shared between the engine, the batcher and whoever
/// reports progress.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    pub blocks_synced: AtomicU64,
    pub transactions_indexed: AtomicU64,
    pub bundles_unpacked: AtomicU64,
    pub batches_flushed: AtomicU64,
    pub fetch_retries: AtomicU64,
    pub forks_recovered: AtomicU64,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SyncMetricsSnapshot {
        SyncMetricsSnapshot {
            blocks_synced: self.blocks_synced.load(Ordering::Relaxed),
            transactions_indexed: self.transactions_indexed.load(Ordering::Relaxed),
            bundles_unpacked: self.bundles_unpacked.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            fetch_retries: self.fetch_retries.load(Ordering::Relaxed),
            forks_recovered: self.forks_recovered.load(Ordering::Relaxed),
        }
    }
}
