//! Error taxonomy of the sync and query paths.
//!
//! Transient fetch failures stay local (retried, peer cooled). Everything
//! in [`SyncError`] terminates the process so a supervisor restarts into a
//! clean stored-vs-network re-evaluation.

use gateway_db::StoreError;
use thiserror::Error;

/// A single network fetch outcome that did not produce data.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The pool has no endpoints configured.
    #[error("no peers available")]
    NoPeersAvailable,

    /// Network-level failure or timeout; retried within the attempt budget.
    #[error("transient fetch failure: {0}")]
    Transient(String),

    /// A by-hash fetch returned a block at an unexpected height. Either a
    /// corrupt peer response or a modeling bug; never retried.
    #[error("block {hash} reported height {got}, expected {expected}")]
    InconsistentBlockData {
        hash: String,
        expected: u64,
        got: u64,
    },
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::NoPeersAvailable)
    }
}

/// Fatal sync-engine failures.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Mandatory startup tip discovery failed across all peers.
    #[error("failed to reach any peer during startup tip discovery")]
    PeerExhausted,

    /// A historical block stayed unfetchable past the attempt budget.
    #[error("failed to fetch block at height {height} after {attempts} attempts")]
    RetriesExhausted { height: u64, attempts: u32 },

    #[error(transparent)]
    InconsistentBlockData(FetchError),

    /// The store rejected a batch. Continuing would risk silent write loss
    /// and an untrustworthy highest stored height.
    #[error("batch write failed: {0}")]
    BatchWriteFailure(#[from] StoreError),

    /// A startup or linkage read against the store failed.
    #[error("store read failed: {0}")]
    Store(StoreError),

    /// The backward divergence walk ran past the configured depth without
    /// finding a common ancestor.
    #[error("no common ancestor within {max_depth} heights below {from}")]
    ForkDepthExceeded { from: u64, max_depth: u64 },
}

/// Rejections and failures on the query surface.
#[derive(Debug, Error)]
pub enum QueryError {
    /// Partition keys derive from height bounds; a query with no resolvable
    /// bounds would be an unbounded scan.
    #[error("query requires explicit height bounds")]
    Unbounded,

    #[error("malformed cursor: {0}")]
    MalformedCursor(String),

    #[error("page size must be between 1 and {max}, got {got}")]
    PageSize { max: usize, got: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}
