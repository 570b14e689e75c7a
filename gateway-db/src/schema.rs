//! Logical table layout of the gateway keyspace.
//!
//! Every query-facing projection exists twice, pre-sorted ascending and
//! descending, because the store fixes clustering order per table at
//! creation time. Secondary indexes reuse the transaction projection for
//! owner/recipient/bundle filters instead of dedicated tables.

use std::fmt;

use itertools::Itertools;

/// Requested result ordering on the query surface. Picks which of the two
/// pre-sorted projection tables a plan reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    HeightAsc,
    #[default]
    HeightDesc,
}

impl SortOrder {
    pub fn is_ascending(self) -> bool {
        matches!(self, Self::HeightAsc)
    }

    /// Transaction projection table for this ordering.
    pub fn tx_table(self) -> TableId {
        match self {
            Self::HeightAsc => TableId::TxIdGqlAsc,
            Self::HeightDesc => TableId::TxIdGqlDesc,
        }
    }

    /// Block projection table for this ordering.
    pub fn block_table(self) -> TableId {
        match self {
            Self::HeightAsc => TableId::BlockGqlAsc,
            Self::HeightDesc => TableId::BlockGqlDesc,
        }
    }

    /// Tag-name projection table for this ordering.
    pub fn tag_table(self) -> TableId {
        match self {
            Self::HeightAsc => TableId::TxTagGqlByNameAsc,
            Self::HeightDesc => TableId::TxTagGqlByNameDesc,
        }
    }
}

/// Clustering order of one clustering column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// Static layout of one table: partition key, clustering columns with their
/// order, and the remaining value columns.
#[derive(Debug)]
pub struct TableSchema {
    pub name: &'static str,
    pub partition_key: &'static [(&'static str, ColumnType)],
    pub clustering_key: &'static [(&'static str, ColumnType, Order)],
    pub columns: &'static [(&'static str, ColumnType)],
    pub secondary_indexes: &'static [&'static str],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    BigInt,
    Int,
    TagList,
    TextList,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cql = match self {
            Self::Text => "text",
            Self::BigInt => "bigint",
            Self::Int => "int",
            Self::TagList => "list<frozen<tuple<text, text>>>",
            Self::TextList => "frozen<list<text>>",
        };
        f.write_str(cql)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableId {
    Block,
    BlockHeightByHash,
    BlockGqlAsc,
    BlockGqlDesc,
    Transaction,
    TxIdGqlAsc,
    TxIdGqlDesc,
    TxTag,
    TxTagGqlByNameAsc,
    TxTagGqlByNameDesc,
    TxOffset,
}

use ColumnType::{BigInt, Int, TagList, Text, TextList};
use Order::{Asc, Desc};

static BLOCK: TableSchema = TableSchema {
    name: "block",
    partition_key: &[("indep_hash", Text)],
    clustering_key: &[],
    columns: &[
        ("height", BigInt),
        ("previous_block", Text),
        ("timestamp", BigInt),
        ("txs", TextList),
        ("txs_count", Int),
    ],
    secondary_indexes: &[],
};

static BLOCK_HEIGHT_BY_BLOCK_HASH: TableSchema = TableSchema {
    name: "block_height_by_block_hash",
    partition_key: &[("block_height", BigInt)],
    clustering_key: &[],
    columns: &[("block_hash", Text)],
    secondary_indexes: &[],
};

static BLOCK_GQL_ASC: TableSchema = TableSchema {
    name: "block_gql_asc",
    partition_key: &[("partition_id", Text), ("bucket_id", Text)],
    clustering_key: &[("height", BigInt, Asc)],
    columns: &[
        ("indep_hash", Text),
        ("previous", Text),
        ("timestamp", BigInt),
    ],
    secondary_indexes: &[],
};

static BLOCK_GQL_DESC: TableSchema = TableSchema {
    name: "block_gql_desc",
    partition_key: &[("partition_id", Text), ("bucket_id", Text)],
    clustering_key: &[("height", BigInt, Desc)],
    columns: &[
        ("indep_hash", Text),
        ("previous", Text),
        ("timestamp", BigInt),
    ],
    secondary_indexes: &[],
};

static TRANSACTION: TableSchema = TableSchema {
    name: "transaction",
    partition_key: &[("tx_id", Text)],
    clustering_key: &[],
    columns: &[
        ("tx_index", BigInt),
        ("block_height", BigInt),
        ("block_hash", Text),
        ("bundled_in", Text),
        ("data_size", BigInt),
        ("format", Int),
        ("owner", Text),
        ("quantity", BigInt),
        ("reward", BigInt),
        ("signature", Text),
        ("tags", TagList),
        ("tag_count", Int),
        ("target", Text),
    ],
    secondary_indexes: &[],
};

static TX_ID_GQL_ASC: TableSchema = TableSchema {
    name: "tx_id_gql_asc",
    partition_key: &[("partition_id", Text), ("bucket_id", Text)],
    clustering_key: &[("tx_index", BigInt, Asc)],
    columns: &[
        ("tags", TagList),
        ("tx_id", Text),
        ("owner", Text),
        ("target", Text),
        ("bundle_id", Text),
    ],
    secondary_indexes: &["owner", "target", "bundle_id"],
};

static TX_ID_GQL_DESC: TableSchema = TableSchema {
    name: "tx_id_gql_desc",
    partition_key: &[("partition_id", Text), ("bucket_id", Text)],
    clustering_key: &[("tx_index", BigInt, Desc)],
    columns: &[
        ("tags", TagList),
        ("tx_id", Text),
        ("owner", Text),
        ("target", Text),
        ("bundle_id", Text),
    ],
    secondary_indexes: &["owner", "target", "bundle_id"],
};

static TX_TAG: TableSchema = TableSchema {
    name: "tx_tag",
    partition_key: &[("partition_id", Text), ("bucket_id", Text)],
    clustering_key: &[("tx_index", BigInt, Desc), ("tag_index", Int, Desc)],
    columns: &[("tx_id", Text), ("name", Text), ("value", Text)],
    secondary_indexes: &[],
};

static TX_TAG_GQL_BY_NAME_ASC: TableSchema = TableSchema {
    name: "tx_tag_gql_by_name_asc",
    partition_key: &[("partition_id", Text), ("bucket_id", Text)],
    clustering_key: &[("tx_index", BigInt, Asc), ("tag_index", Int, Asc)],
    columns: &[
        ("tag_name", Text),
        ("tag_value", Text),
        ("tx_id", Text),
        ("owner", Text),
        ("target", Text),
        ("bundle_id", Text),
    ],
    secondary_indexes: &["tag_name"],
};

static TX_TAG_GQL_BY_NAME_DESC: TableSchema = TableSchema {
    name: "tx_tag_gql_by_name_desc",
    partition_key: &[("partition_id", Text), ("bucket_id", Text)],
    clustering_key: &[("tx_index", BigInt, Desc), ("tag_index", Int, Desc)],
    columns: &[
        ("tag_name", Text),
        ("tag_value", Text),
        ("tx_id", Text),
        ("owner", Text),
        ("target", Text),
        ("bundle_id", Text),
    ],
    secondary_indexes: &["tag_name"],
};

static TX_OFFSET: TableSchema = TableSchema {
    name: "tx_offset",
    partition_key: &[("tx_id", Text)],
    clustering_key: &[],
    columns: &[("size", BigInt), ("offset", BigInt)],
    secondary_indexes: &[],
};

impl TableId {
    pub const ALL: [Self; 11] = [
        Self::Block,
        Self::BlockHeightByHash,
        Self::BlockGqlAsc,
        Self::BlockGqlDesc,
        Self::Transaction,
        Self::TxIdGqlAsc,
        Self::TxIdGqlDesc,
        Self::TxTag,
        Self::TxTagGqlByNameAsc,
        Self::TxTagGqlByNameDesc,
        Self::TxOffset,
    ];

    pub fn schema(self) -> &'static TableSchema {
        match self {
            Self::Block => &BLOCK,
            Self::BlockHeightByHash => &BLOCK_HEIGHT_BY_BLOCK_HASH,
            Self::BlockGqlAsc => &BLOCK_GQL_ASC,
            Self::BlockGqlDesc => &BLOCK_GQL_DESC,
            Self::Transaction => &TRANSACTION,
            Self::TxIdGqlAsc => &TX_ID_GQL_ASC,
            Self::TxIdGqlDesc => &TX_ID_GQL_DESC,
            Self::TxTag => &TX_TAG,
            Self::TxTagGqlByNameAsc => &TX_TAG_GQL_BY_NAME_ASC,
            Self::TxTagGqlByNameDesc => &TX_TAG_GQL_BY_NAME_DESC,
            Self::TxOffset => &TX_OFFSET,
        }
    }

    pub fn name(self) -> &'static str {
        self.schema().name
    }

    /// Columns forming the primary key, partition key first.
    pub fn primary_key(self) -> Vec<&'static str> {
        let schema = self.schema();
        schema
            .partition_key
            .iter()
            .map(|(name, _)| *name)
            .chain(schema.clustering_key.iter().map(|(name, _, _)| *name))
            .collect()
    }
}

/// `CREATE TABLE` / `CREATE INDEX` statements for the whole keyspace,
/// in creation order.
pub fn create_statements(keyspace: &str) -> Vec<String> {
    let mut statements = vec![format!(
        "CREATE KEYSPACE IF NOT EXISTS {keyspace} WITH replication = \
         {{'class': 'SimpleStrategy', 'replication_factor': '1'}}"
    )];
    for table in TableId::ALL {
        let schema = table.schema();
        let mut columns = Vec::new();
        for (name, ty) in schema.partition_key {
            columns.push(format!("{name} {ty}"));
        }
        for (name, ty, _) in schema.clustering_key {
            columns.push(format!("{name} {ty}"));
        }
        for (name, ty) in schema.columns {
            columns.push(format!("{name} {ty}"));
        }
        let partition = schema.partition_key.iter().map(|(name, _)| *name).join(", ");
        let primary = if schema.clustering_key.is_empty() {
            format!("PRIMARY KEY ({partition})")
        } else {
            let clustering = schema
                .clustering_key
                .iter()
                .map(|(name, _, _)| *name)
                .join(", ");
            format!("PRIMARY KEY (({partition}), {clustering})")
        };
        let mut cql = format!(
            "CREATE TABLE IF NOT EXISTS {keyspace}.{} ({}, {primary})",
            schema.name,
            columns.join(", "),
        );
        if !schema.clustering_key.is_empty() {
            let order = schema
                .clustering_key
                .iter()
                .map(|(name, _, order)| {
                    format!(
                        "{name} {}",
                        match order {
                            Order::Asc => "ASC",
                            Order::Desc => "DESC",
                        }
                    )
                })
                .join(", ");
            cql.push_str(&format!(" WITH CLUSTERING ORDER BY ({order})"));
        }
        statements.push(cql);
        for indexed in schema.secondary_indexes {
            statements.push(format!(
                "CREATE INDEX IF NOT EXISTS ON {keyspace}.{} ({indexed})",
                schema.name
            ));
        }
    }
    statements
}
