//! The store boundary.
//!
//! The gateway consumes the wide-column store as a networked service with
//! two primitives: a single-statement read and an atomic multi-statement
//! write batch. Durability and replication belong to the service behind
//! this trait.

use async_trait::async_trait;
use thiserror::Error;

use crate::statement::{Row, Select, Upsert};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("malformed statement: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Executes one read and returns its rows in the table's clustering
    /// order.
    async fn execute(&self, select: Select) -> Result<Vec<Row>, StoreError>;

    /// Executes all statements as one atomic batch. Either every upsert is
    /// applied or none is.
    async fn batch(&self, statements: Vec<Upsert>) -> Result<(), StoreError>;
}
