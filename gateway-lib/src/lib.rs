//! Sync and query machinery of the gateway.
//!
//! The write path pulls blocks and transactions from peer nodes and
//! materializes them into the bucketed projections of [`gateway_db`]; the
//! read path turns cursor-pagination parameters into bounded range queries
//! against the same projections. The two share one bucketing scheme, which
//! is what keeps every written row reachable.

pub mod batcher;
pub mod bundle;
pub mod error;
pub mod metrics;
pub mod node_client;
pub mod peer_pool;
pub mod query_planner;
pub mod query_runner;
pub mod sync_engine;

pub use batcher::{WriteBatcher, DEFAULT_FLUSH_THRESHOLD};
pub use bundle::{BundleCodec, BundleItem, JsonBundleCodec};
pub use error::{FetchError, QueryError, SyncError};
pub use metrics::{SyncMetrics, SyncMetricsSnapshot};
pub use node_client::{HttpNodeClient, NodeApi};
pub use peer_pool::PeerPool;
pub use query_runner::QueryRunner;
pub use sync_engine::{SyncEngine, SyncEvent, SyncOptions};
