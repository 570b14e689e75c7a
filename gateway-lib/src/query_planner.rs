//! Cursor-pagination planning.
//!
//! Pure translation from query-surface parameters to range queries over the
//! bucketed projections. The store has no OFFSET and no multi-column
//! secondary indexes, so pagination becomes an inequality over the
//! monotonic index column, tag filters become scans of the tag-name
//! projection, and every plan is bounded to an explicit height range from
//! which the partition keys derive.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use gateway_db::{
    first_tx_index, last_tx_index, BucketRef, BucketingScheme, Filter, Select, SortOrder, TableId,
};

use crate::error::QueryError;

pub const DEFAULT_PAGE_SIZE: usize = 10;
pub const MAX_PAGE_SIZE: usize = 100;

/// Opaque pagination cursor: the monotonic index (global transaction index,
/// or height for block queries) of the last item already returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub index: u64,
}

impl Cursor {
    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(format!("v1:{}", self.index))
    }

    pub fn decode(raw: &str) -> Result<Self, QueryError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(raw)
            .map_err(|e| QueryError::MalformedCursor(e.to_string()))?;
        let text =
            String::from_utf8(bytes).map_err(|e| QueryError::MalformedCursor(e.to_string()))?;
        let index = text
            .strip_prefix("v1:")
            .ok_or_else(|| QueryError::MalformedCursor(format!("unknown cursor version: {text}")))?
            .parse()
            .map_err(|e| QueryError::MalformedCursor(format!("bad cursor index: {e}")))?;
        Ok(Self { index })
    }
}

/// One tag filter: transactions carrying tag `name` with any of `values`.
/// Filters are conjunctive across names, values disjunctive within one name.
#[derive(Debug, Clone, Default)]
pub struct TagFilterParam {
    pub name: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TxQueryParams {
    pub ids: Vec<String>,
    pub owners: Vec<String>,
    pub recipients: Vec<String>,
    pub bundled_in: Vec<String>,
    pub tags: Vec<TagFilterParam>,
    pub min_height: Option<u64>,
    pub max_height: Option<u64>,
    /// Explicit numeric offset, emulated by shifting the range bound.
    pub offset: u64,
    pub first: Option<usize>,
    pub after: Option<String>,
    pub sort: SortOrder,
}

#[derive(Debug, Clone, Default)]
pub struct BlockQueryParams {
    pub ids: Vec<String>,
    pub min_height: Option<u64>,
    pub max_height: Option<u64>,
    pub offset: u64,
    pub first: Option<usize>,
    pub after: Option<String>,
    pub sort: SortOrder,
}

/// Scan of the tag-name projection for one tag filter.
#[derive(Debug, Clone)]
pub struct TagScan {
    pub name: String,
    pub values: Vec<String>,
    pub table: TableId,
    pub buckets: Vec<BucketRef>,
}

impl TagScan {
    pub fn select_for_bucket(&self, bucket: &BucketRef) -> Select {
        Select::from_table(self.table)
            .filter(Filter::eq("partition_id", bucket.partition_id.clone()))
            .filter(Filter::eq("bucket_id", bucket.bucket_id.clone()))
            .filter(Filter::ge("tx_index", bucket.min_position))
            .filter(Filter::le("tx_index", bucket.max_position))
            .filter(Filter::eq("tag_name", self.name.clone()))
            .filter(eq_or_in("tag_value", &self.values))
    }
}

/// A planned paginated query: the ordered bucket sequence plus everything
/// needed to issue one range query per bucket.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub table: TableId,
    pub sort: SortOrder,
    /// Clustering column the cursor coordinates live in.
    pub index_column: &'static str,
    pub buckets: Vec<BucketRef>,
    pub filters: Vec<Filter>,
    pub tag_scans: Vec<TagScan>,
    /// Page size requested by the caller.
    pub first: usize,
    /// Fetch limit per bucket; one row more than `first` so the executor
    /// can tell whether a next page exists.
    pub limit: usize,
}

impl QueryPlan {
    pub fn select_for_bucket(&self, bucket: &BucketRef) -> Select {
        let mut select = Select::from_table(self.table)
            .filter(Filter::eq("partition_id", bucket.partition_id.clone()))
            .filter(Filter::eq("bucket_id", bucket.bucket_id.clone()))
            .filter(Filter::ge(self.index_column, bucket.min_position))
            .filter(Filter::le(self.index_column, bucket.max_position));
        for filter in &self.filters {
            select = select.filter(filter.clone());
        }
        select.limit(self.limit)
    }
}

/// Plans a paginated transaction query. `default_max_height` is the
/// caller's fallback upper bound (normally the highest stored height);
/// without any resolvable bound the query is rejected.
pub fn plan_transaction_query(
    params: &TxQueryParams,
    default_max_height: Option<u64>,
) -> Result<QueryPlan, QueryError> {
    let first = validate_first(params.first)?;
    let max_height = params
        .max_height
        .or(default_max_height)
        .ok_or(QueryError::Unbounded)?;
    let min_height = params.min_height.unwrap_or(0);

    let range = index_range(
        first_tx_index(min_height),
        last_tx_index(max_height),
        params.sort,
        params.after.as_deref(),
        params.offset,
    )?;
    let buckets = match range {
        Some((lo, hi)) => BucketingScheme::TX_INDEX.buckets_in_range(lo, hi, params.sort),
        None => Vec::new(),
    };

    let mut filters = Vec::new();
    if !params.ids.is_empty() {
        filters.push(eq_or_in("tx_id", &params.ids));
    }
    if !params.owners.is_empty() {
        filters.push(eq_or_in("owner", &params.owners));
    }
    if !params.recipients.is_empty() {
        filters.push(eq_or_in("target", &params.recipients));
    }
    if !params.bundled_in.is_empty() {
        filters.push(eq_or_in("bundle_id", &params.bundled_in));
    }

    let tag_scans = params
        .tags
        .iter()
        .map(|tag| TagScan {
            name: tag.name.clone(),
            values: tag.values.clone(),
            table: params.sort.tag_table(),
            buckets: buckets.clone(),
        })
        .collect();

    Ok(QueryPlan {
        table: params.sort.tx_table(),
        sort: params.sort,
        index_column: "tx_index",
        buckets,
        filters,
        tag_scans,
        first,
        limit: first + 1,
    })
}

/// Plans a paginated block query; the cursor coordinate is the height
/// itself.
pub fn plan_block_query(
    params: &BlockQueryParams,
    default_max_height: Option<u64>,
) -> Result<QueryPlan, QueryError> {
    let first = validate_first(params.first)?;
    let max_height = params
        .max_height
        .or(default_max_height)
        .ok_or(QueryError::Unbounded)?;
    let min_height = params.min_height.unwrap_or(0);

    let range = index_range(
        min_height,
        max_height,
        params.sort,
        params.after.as_deref(),
        params.offset,
    )?;
    let buckets = match range {
        Some((lo, hi)) => BucketingScheme::BLOCK_HEIGHT.buckets_in_range(lo, hi, params.sort),
        None => Vec::new(),
    };

    let mut filters = Vec::new();
    if !params.ids.is_empty() {
        filters.push(eq_or_in("indep_hash", &params.ids));
    }

    Ok(QueryPlan {
        table: params.sort.block_table(),
        sort: params.sort,
        index_column: "height",
        buckets,
        filters,
        tag_scans: Vec::new(),
        first,
        limit: first + 1,
    })
}

/// Point lookup of a transaction's full row.
pub fn plan_transaction_by_id(id: &str) -> Select {
    Select::from_table(TableId::Transaction)
        .filter(Filter::eq("tx_id", id))
        .limit(1)
}

/// Point lookup of a block's full row.
pub fn plan_block_by_hash(hash: &str) -> Select {
    Select::from_table(TableId::Block)
        .filter(Filter::eq("indep_hash", hash))
        .limit(1)
}

/// Canonical block summary at a height, addressed through the ascending
/// projection.
pub fn plan_block_summary_by_height(height: u64) -> Select {
    let (partition_id, bucket_id) = BucketingScheme::BLOCK_HEIGHT.bucket_for(height);
    Select::from_table(TableId::BlockGqlAsc)
        .filter(Filter::eq("partition_id", partition_id))
        .filter(Filter::eq("bucket_id", bucket_id))
        .filter(Filter::eq("height", height))
        .limit(1)
}

fn validate_first(first: Option<usize>) -> Result<usize, QueryError> {
    let first = first.unwrap_or(DEFAULT_PAGE_SIZE);
    if first == 0 || first > MAX_PAGE_SIZE {
        return Err(QueryError::PageSize {
            max: MAX_PAGE_SIZE,
            got: first,
        });
    }
    Ok(first)
}

/// Applies cursor and offset to the closed index range. The after-cursor
/// moves the bound facing the scan direction just past the cursor index;
/// the numeric offset shifts the same bound further. `None` means the range
/// collapsed and the result is an empty page.
fn index_range(
    lo: u64,
    hi: u64,
    sort: SortOrder,
    after: Option<&str>,
    offset: u64,
) -> Result<Option<(u64, u64)>, QueryError> {
    let mut lo = lo;
    let mut hi = hi;
    if let Some(raw) = after {
        let cursor = Cursor::decode(raw)?;
        if sort.is_ascending() {
            lo = lo.max(cursor.index.saturating_add(1));
        } else {
            match cursor.index.checked_sub(1) {
                Some(bound) => hi = hi.min(bound),
                None => return Ok(None),
            }
        }
    }
    if offset > 0 {
        if sort.is_ascending() {
            lo = lo.saturating_add(offset);
        } else {
            match hi.checked_sub(offset) {
                Some(bound) => hi = bound,
                None => return Ok(None),
            }
        }
    }
    Ok(if lo <= hi { Some((lo, hi)) } else { None })
}

fn eq_or_in(column: &'static str, values: &[String]) -> Filter {
    if values.len() == 1 {
        Filter::eq(column, values[0].clone())
    } else {
        Filter::is_in(column, values.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_round_trips_and_rejects_garbage() {
        let cursor = Cursor { index: 987_654 };
        assert_eq!(Cursor::decode(&cursor.encode()).unwrap(), cursor);
        assert!(matches!(
            Cursor::decode("not-base64!!"),
            Err(QueryError::MalformedCursor(_))
        ));
        let wrong_version = URL_SAFE_NO_PAD.encode("v2:17");
        assert!(Cursor::decode(&wrong_version).is_err());
    }

    #[test]
    fn unbounded_queries_are_rejected() {
        let params = TxQueryParams::default();
        assert!(matches!(
            plan_transaction_query(&params, None),
            Err(QueryError::Unbounded)
        ));
        // A caller-supplied bound makes the same query plannable.
        assert!(plan_transaction_query(&params, Some(100)).is_ok());
    }

    #[test]
    fn sort_order_picks_the_projection_table() {
        let mut params = TxQueryParams {
            max_height: Some(10),
            ..Default::default()
        };
        params.sort = SortOrder::HeightAsc;
        let asc = plan_transaction_query(&params, None).unwrap();
        assert_eq!(asc.table, TableId::TxIdGqlAsc);

        params.sort = SortOrder::HeightDesc;
        let desc = plan_transaction_query(&params, None).unwrap();
        assert_eq!(desc.table, TableId::TxIdGqlDesc);
        // Descending plans walk buckets from the top.
        assert!(desc.buckets[0].max_position >= desc.buckets[desc.buckets.len() - 1].max_position);
    }

    #[test]
    fn after_cursor_shifts_the_facing_bound() {
        let base = TxQueryParams {
            max_height: Some(0),
            first: Some(5),
            ..Default::default()
        };

        let mut asc = base.clone();
        asc.sort = SortOrder::HeightAsc;
        asc.after = Some(Cursor { index: 3 }.encode());
        let plan = plan_transaction_query(&asc, None).unwrap();
        assert_eq!(plan.buckets[0].min_position, 4);

        let mut desc = base;
        desc.sort = SortOrder::HeightDesc;
        desc.after = Some(Cursor { index: 3 }.encode());
        let plan = plan_transaction_query(&desc, None).unwrap();
        assert_eq!(plan.buckets[0].max_position, 2);
    }

    #[test]
    fn offset_is_emulated_by_bound_shifting() {
        let mut params = BlockQueryParams {
            min_height: Some(10),
            max_height: Some(50),
            offset: 5,
            sort: SortOrder::HeightAsc,
            ..Default::default()
        };
        let plan = plan_block_query(&params, None).unwrap();
        assert_eq!(plan.buckets[0].min_position, 15);

        params.sort = SortOrder::HeightDesc;
        let plan = plan_block_query(&params, None).unwrap();
        assert_eq!(plan.buckets[0].max_position, 45);
    }

    #[test]
    fn collapsed_ranges_plan_to_no_buckets() {
        let params = TxQueryParams {
            max_height: Some(0),
            sort: SortOrder::HeightDesc,
            after: Some(Cursor { index: 0 }.encode()),
            ..Default::default()
        };
        let plan = plan_transaction_query(&params, None).unwrap();
        assert!(plan.buckets.is_empty());
    }

    #[test]
    fn page_size_is_validated_and_limit_carries_the_extra_row() {
        let params = TxQueryParams {
            max_height: Some(10),
            first: Some(25),
            ..Default::default()
        };
        let plan = plan_transaction_query(&params, None).unwrap();
        assert_eq!(plan.first, 25);
        assert_eq!(plan.limit, 26);

        let too_big = TxQueryParams {
            max_height: Some(10),
            first: Some(MAX_PAGE_SIZE + 1),
            ..Default::default()
        };
        assert!(matches!(
            plan_transaction_query(&too_big, None),
            Err(QueryError::PageSize { .. })
        ));
    }

    #[test]
    fn filters_translate_to_equality_and_in_predicates() {
        let params = TxQueryParams {
            max_height: Some(10),
            owners: vec!["owner-a".into()],
            recipients: vec!["addr-a".into(), "addr-b".into()],
            tags: vec![TagFilterParam {
                name: "App-Name".into(),
                values: vec!["app-1".into(), "app-2".into()],
            }],
            ..Default::default()
        };
        let plan = plan_transaction_query(&params, None).unwrap();
        assert!(plan
            .filters
            .iter()
            .any(|f| matches!(f, Filter::Cmp { column: "owner", .. })));
        assert!(plan
            .filters
            .iter()
            .any(|f| matches!(f, Filter::In { column: "target", values } if values.len() == 2)));

        assert_eq!(plan.tag_scans.len(), 1);
        let scan = &plan.tag_scans[0];
        assert_eq!(scan.table, TableId::TxTagGqlByNameDesc);
        let select = scan.select_for_bucket(&scan.buckets[0]);
        let (cql, _) = select.to_cql("gateway");
        assert!(cql.contains("tag_name = ?"));
        assert!(cql.contains("tag_value IN (?, ?)"));
    }
}
