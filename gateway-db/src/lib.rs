//! Storage model for the gateway: the bucketed wide-column schema, a
//! structured statement model that renders to CQL, the [`Store`] trait the
//! sync and query paths talk to, and an embedded in-process store used by
//! tests and local runs.

pub mod bucket;
pub mod memory;
pub mod projection;
pub mod schema;
pub mod statement;
pub mod store;

pub use bucket::{BucketRef, BucketingScheme};
pub use memory::MemoryStore;
pub use schema::{SortOrder, TableId};
pub use statement::{Aggregate, Filter, Row, Select, Upsert, Value};
pub use store::{Store, StoreError};

/// Index slots reserved per block height in the global transaction index.
/// Direct transactions occupy the leading slots in block order, bundle
/// members the slots after them.
pub const MAX_TXS_PER_BLOCK: u64 = 1_000;

/// Global transaction index of the first slot at `height`.
pub const fn first_tx_index(height: u64) -> u64 {
    height * MAX_TXS_PER_BLOCK
}

/// Global transaction index of the last slot at `height`.
pub const fn last_tx_index(height: u64) -> u64 {
    height * MAX_TXS_PER_BLOCK + (MAX_TXS_PER_BLOCK - 1)
}
