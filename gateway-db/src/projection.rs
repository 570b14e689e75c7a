//! Write-side projection: one ingested entity fans out into upserts across
//! every table that serves a read shape for it.
//!
//! Canonical-height rows (the `*_gql_*` projections and the height→hash
//! lookup) are plain overwriting upserts; re-ingesting a height during fork
//! recovery replaces them in place, which is how a reorganization becomes
//! visible to readers.

use crate::bucket::BucketingScheme;
use crate::schema::TableId;
use crate::statement::{Upsert, Value};

/// A block ready for projection.
#[derive(Debug, Clone)]
pub struct BlockRow {
    pub indep_hash: String,
    pub height: u64,
    pub previous: String,
    pub timestamp: u64,
    pub txs: Vec<String>,
}

impl BlockRow {
    /// Upserts for the by-hash table, the height→hash lookup and both
    /// height-bucketed projections.
    pub fn upserts(&self, heights: &BucketingScheme) -> Vec<Upsert> {
        let (partition_id, bucket_id) = heights.bucket_for(self.height);
        let mut statements = vec![
            Upsert::into_table(TableId::Block)
                .set("indep_hash", self.indep_hash.clone())
                .set("height", self.height)
                .set("previous_block", self.previous.clone())
                .set("timestamp", self.timestamp)
                .set("txs", Value::TextList(self.txs.clone()))
                .set("txs_count", self.txs.len() as u64),
            Upsert::into_table(TableId::BlockHeightByHash)
                .set("block_height", self.height)
                .set("block_hash", self.indep_hash.clone()),
        ];
        for table in [TableId::BlockGqlAsc, TableId::BlockGqlDesc] {
            statements.push(
                Upsert::into_table(table)
                    .set("partition_id", partition_id.clone())
                    .set("bucket_id", bucket_id.clone())
                    .set("height", self.height)
                    .set("indep_hash", self.indep_hash.clone())
                    .set("previous", self.previous.clone())
                    .set("timestamp", self.timestamp),
            );
        }
        statements
    }
}

/// A transaction ready for projection, already assigned its global index.
#[derive(Debug, Clone)]
pub struct TxRow {
    pub tx_id: String,
    pub tx_index: u64,
    pub block_height: u64,
    pub block_hash: String,
    pub owner: String,
    pub target: Option<String>,
    pub bundled_in: Option<String>,
    pub quantity: u64,
    pub reward: u64,
    pub signature: String,
    pub data_size: u64,
    pub format: u64,
    pub tags: Vec<(String, String)>,
}

impl TxRow {
    /// Upserts for the by-id table, both index-bucketed projections, the
    /// per-transaction tag rows and both tag-name projections.
    pub fn upserts(&self, indexes: &BucketingScheme) -> Vec<Upsert> {
        let (partition_id, bucket_id) = indexes.bucket_for(self.tx_index);
        let target = self.target.clone().unwrap_or_default();
        let bundle_id = self.bundled_in.clone().unwrap_or_default();

        let mut statements = vec![Upsert::into_table(TableId::Transaction)
            .set("tx_id", self.tx_id.clone())
            .set("tx_index", self.tx_index)
            .set("block_height", self.block_height)
            .set("block_hash", self.block_hash.clone())
            .set("bundled_in", bundle_id.clone())
            .set("data_size", self.data_size)
            .set("format", self.format)
            .set("owner", self.owner.clone())
            .set("quantity", self.quantity)
            .set("reward", self.reward)
            .set("signature", self.signature.clone())
            .set("tags", Value::Tags(self.tags.clone()))
            .set("tag_count", self.tags.len() as u64)
            .set("target", target.clone())];

        for table in [TableId::TxIdGqlAsc, TableId::TxIdGqlDesc] {
            statements.push(
                Upsert::into_table(table)
                    .set("partition_id", partition_id.clone())
                    .set("bucket_id", bucket_id.clone())
                    .set("tx_index", self.tx_index)
                    .set("tags", Value::Tags(self.tags.clone()))
                    .set("tx_id", self.tx_id.clone())
                    .set("owner", self.owner.clone())
                    .set("target", target.clone())
                    .set("bundle_id", bundle_id.clone()),
            );
        }

        for (tag_index, (name, value)) in self.tags.iter().enumerate() {
            statements.push(
                Upsert::into_table(TableId::TxTag)
                    .set("partition_id", partition_id.clone())
                    .set("bucket_id", bucket_id.clone())
                    .set("tx_index", self.tx_index)
                    .set("tag_index", tag_index as u64)
                    .set("tx_id", self.tx_id.clone())
                    .set("name", name.clone())
                    .set("value", value.clone()),
            );
            for table in [TableId::TxTagGqlByNameAsc, TableId::TxTagGqlByNameDesc] {
                statements.push(
                    Upsert::into_table(table)
                        .set("partition_id", partition_id.clone())
                        .set("bucket_id", bucket_id.clone())
                        .set("tx_index", self.tx_index)
                        .set("tag_index", tag_index as u64)
                        .set("tag_name", name.clone())
                        .set("tag_value", value.clone())
                        .set("tx_id", self.tx_id.clone())
                        .set("owner", self.owner.clone())
                        .set("target", target.clone())
                        .set("bundle_id", bundle_id.clone()),
                );
            }
        }
        statements
    }
}

/// Upsert for the payload byte-range lookup of one transaction.
pub fn tx_offset_upsert(tx_id: &str, size: u64, offset: u64) -> Upsert {
    Upsert::into_table(TableId::TxOffset)
        .set("tx_id", tx_id.to_owned())
        .set("size", size)
        .set("offset", offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_row_targets_all_four_block_tables() {
        let row = BlockRow {
            indep_hash: "x7".into(),
            height: 7,
            previous: "x6".into(),
            timestamp: 1_600_000_007,
            txs: vec!["t1".into(), "t2".into()],
        };
        let upserts = row.upserts(&BucketingScheme::BLOCK_HEIGHT);
        let tables: Vec<_> = upserts.iter().map(|u| u.table).collect();
        assert_eq!(
            tables,
            vec![
                TableId::Block,
                TableId::BlockHeightByHash,
                TableId::BlockGqlAsc,
                TableId::BlockGqlDesc,
            ]
        );
        // Both projections must address the same bucket.
        assert_eq!(upserts[2].columns[0], upserts[3].columns[0]);
        assert_eq!(upserts[2].columns[1], upserts[3].columns[1]);
    }

    #[test]
    fn tx_row_fans_out_per_tag() {
        let row = TxRow {
            tx_id: "t1".into(),
            tx_index: 7_000,
            block_height: 7,
            block_hash: "x7".into(),
            owner: "owner-a".into(),
            target: Some("addr-b".into()),
            bundled_in: None,
            quantity: 0,
            reward: 1,
            signature: "sig".into(),
            data_size: 256,
            format: 2,
            tags: vec![
                ("App-Name".into(), "test".into()),
                ("Content-Type".into(), "text/plain".into()),
            ],
        };
        let upserts = row.upserts(&BucketingScheme::TX_INDEX);
        // 1 by-id + 2 index projections + per tag (1 tag row + 2 name projections).
        assert_eq!(upserts.len(), 3 + 2 * 3);
        let tag_rows = upserts
            .iter()
            .filter(|u| u.table == TableId::TxTag)
            .count();
        assert_eq!(tag_rows, 2);
    }
}
