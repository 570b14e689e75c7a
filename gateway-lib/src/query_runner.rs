//! Executes query plans against the store and shapes paginated results.
//!
//! The runner walks a plan's buckets in order, accumulating one row more
//! than the page size so `has_next_page` needs no second round trip. Tag
//! scans run first; their index sets intersect conjunctively and gate the
//! main projection rows.

use std::collections::BTreeSet;
use std::sync::Arc;

use gateway_db::{Row, Select, Store, TableId, MAX_TXS_PER_BLOCK};
use tracing::debug;

use crate::error::QueryError;
use crate::query_planner::{
    plan_block_by_hash, plan_block_query, plan_block_summary_by_height, plan_transaction_by_id,
    plan_transaction_query, BlockQueryParams, Cursor, QueryPlan, TxQueryParams,
};

/// One edge of a paginated result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge<T> {
    pub cursor: String,
    pub node: T,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub edges: Vec<Edge<T>>,
    pub has_next_page: bool,
}

impl<T> Page<T> {
    fn empty() -> Self {
        Self {
            edges: Vec::new(),
            has_next_page: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionNode {
    pub id: String,
    pub tx_index: u64,
    pub owner: String,
    pub recipient: Option<String>,
    pub bundled_in: Option<String>,
    pub tags: Vec<(String, String)>,
}

impl TransactionNode {
    pub fn block_height(&self) -> u64 {
        self.tx_index / MAX_TXS_PER_BLOCK
    }

    fn from_projection_row(row: &Row) -> Option<Self> {
        Some(Self {
            id: row.text("tx_id")?.to_owned(),
            tx_index: row.number("tx_index")?,
            owner: row.text("owner").unwrap_or_default().to_owned(),
            recipient: non_empty(row.text("target")),
            bundled_in: non_empty(row.text("bundle_id")),
            tags: row.tags("tags").map(<[_]>::to_vec).unwrap_or_default(),
        })
    }

    fn from_transaction_row(row: &Row) -> Option<Self> {
        Some(Self {
            id: row.text("tx_id")?.to_owned(),
            tx_index: row.number("tx_index")?,
            owner: row.text("owner").unwrap_or_default().to_owned(),
            recipient: non_empty(row.text("target")),
            bundled_in: non_empty(row.text("bundled_in")),
            tags: row.tags("tags").map(<[_]>::to_vec).unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockNode {
    pub indep_hash: String,
    pub height: u64,
    pub previous: String,
    pub timestamp: u64,
}

impl BlockNode {
    fn from_row(row: &Row) -> Option<Self> {
        Some(Self {
            indep_hash: row.text("indep_hash")?.to_owned(),
            height: row.number("height")?,
            previous: row
                .text("previous")
                .or_else(|| row.text("previous_block"))
                .unwrap_or_default()
                .to_owned(),
            timestamp: row.number("timestamp").unwrap_or_default(),
        })
    }
}

/// The paginated query surface.
pub struct QueryRunner {
    store: Arc<dyn Store>,
}

impl QueryRunner {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn transactions(
        &self,
        params: &TxQueryParams,
    ) -> Result<Page<TransactionNode>, QueryError> {
        let Some(max_height) = resolve_max(params.max_height, self.max_stored_height().await?)
        else {
            return Ok(Page::empty());
        };
        let plan = plan_transaction_query(params, Some(max_height))?;

        let allowed = self.tag_allowed_set(&plan).await?;
        let rows = self
            .collect_rows(&plan, |row| {
                let Some(allowed) = &allowed else { return true };
                row.number("tx_index")
                    .is_some_and(|index| allowed.contains(&index))
            })
            .await?;

        Ok(build_page(rows, plan.first, |row| {
            let node = TransactionNode::from_projection_row(row)?;
            Some(Edge {
                cursor: Cursor {
                    index: node.tx_index,
                }
                .encode(),
                node,
            })
        }))
    }

    pub async fn blocks(&self, params: &BlockQueryParams) -> Result<Page<BlockNode>, QueryError> {
        let Some(max_height) = resolve_max(params.max_height, self.max_stored_height().await?)
        else {
            return Ok(Page::empty());
        };
        let plan = plan_block_query(params, Some(max_height))?;
        let rows = self.collect_rows(&plan, |_| true).await?;

        Ok(build_page(rows, plan.first, |row| {
            let node = BlockNode::from_row(row)?;
            Some(Edge {
                cursor: Cursor { index: node.height }.encode(),
                node,
            })
        }))
    }

    /// Full transaction row by id.
    pub async fn transaction(&self, id: &str) -> Result<Option<TransactionNode>, QueryError> {
        let rows = self.store.execute(plan_transaction_by_id(id)).await?;
        Ok(rows.first().and_then(TransactionNode::from_transaction_row))
    }

    /// Full block row by hash.
    pub async fn block(&self, hash: &str) -> Result<Option<BlockNode>, QueryError> {
        let rows = self.store.execute(plan_block_by_hash(hash)).await?;
        Ok(rows.first().and_then(BlockNode::from_row))
    }

    /// Canonical block summary at a height.
    pub async fn block_at_height(&self, height: u64) -> Result<Option<BlockNode>, QueryError> {
        let rows = self
            .store
            .execute(plan_block_summary_by_height(height))
            .await?;
        Ok(rows.first().and_then(BlockNode::from_row))
    }

    async fn max_stored_height(&self) -> Result<Option<u64>, QueryError> {
        let rows = self
            .store
            .execute(Select::max(TableId::Block, "height"))
            .await?;
        Ok(rows.first().and_then(|row| row.number("height")))
    }

    /// Conjunctive intersection of the plan's tag scans, `None` when the
    /// plan has no tag filters.
    async fn tag_allowed_set(&self, plan: &QueryPlan) -> Result<Option<BTreeSet<u64>>, QueryError> {
        if plan.tag_scans.is_empty() {
            return Ok(None);
        }
        let mut allowed: Option<BTreeSet<u64>> = None;
        for scan in &plan.tag_scans {
            let mut indexes = BTreeSet::new();
            for bucket in &scan.buckets {
                let rows = self.store.execute(scan.select_for_bucket(bucket)).await?;
                indexes.extend(rows.iter().filter_map(|row| row.number("tx_index")));
            }
            allowed = Some(match allowed {
                None => indexes,
                Some(current) => current.intersection(&indexes).copied().collect(),
            });
            if allowed.as_ref().is_some_and(BTreeSet::is_empty) {
                break;
            }
        }
        debug!(
            matches = allowed.as_ref().map_or(0, BTreeSet::len),
            "tag scans resolved"
        );
        Ok(allowed)
    }

    /// Walks the plan's buckets in order until one row past the page size
    /// has been kept.
    async fn collect_rows(
        &self,
        plan: &QueryPlan,
        keep: impl Fn(&Row) -> bool,
    ) -> Result<Vec<Row>, QueryError> {
        let mut collected = Vec::new();
        'buckets: for bucket in &plan.buckets {
            let mut select = plan.select_for_bucket(bucket);
            if !plan.tag_scans.is_empty() {
                // The tag intersection filters rows after the store already
                // applied its LIMIT, so the per-bucket limit has to go.
                select.limit = None;
            }
            let rows = self.store.execute(select).await?;
            for row in rows {
                if !keep(&row) {
                    continue;
                }
                collected.push(row);
                if collected.len() > plan.first {
                    break 'buckets;
                }
            }
        }
        Ok(collected)
    }
}

fn resolve_max(requested: Option<u64>, stored: Option<u64>) -> Option<u64> {
    requested.or(stored)
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_owned)
}

fn build_page<T>(
    rows: Vec<Row>,
    first: usize,
    to_edge: impl Fn(&Row) -> Option<Edge<T>>,
) -> Page<T> {
    let has_next_page = rows.len() > first;
    let edges = rows
        .iter()
        .take(first)
        .filter_map(to_edge)
        .collect();
    Page {
        edges,
        has_next_page,
    }
}
