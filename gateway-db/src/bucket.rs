//! Deterministic partition/bucket addressing for monotonic sequences.
//!
//! Every projection row is keyed by `((partition_id, bucket_id), position)`
//! so that no single wide-column partition grows without bound. The mapping
//! from position to `(partition_id, bucket_id)` must be byte-identical on
//! the write path and the read path; a divergence makes rows unreachable
//! through range queries without any error surfacing.

use crate::schema::SortOrder;

/// Maps a monotonic sequence position (block height or global transaction
/// index) to the partition/bucket pair addressing its projection row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketingScheme {
    partition_size: u64,
    bucket_size: u64,
}

/// One bucket of a bounded range scan, with the slice of positions it
/// covers clipped to the requested bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketRef {
    pub partition_id: String,
    pub bucket_id: String,
    /// First position of the requested range covered by this bucket.
    pub min_position: u64,
    /// Last position of the requested range covered by this bucket.
    pub max_position: u64,
}

impl BucketingScheme {
    /// Block-height sequence: 500k heights per partition, 50k per bucket.
    pub const BLOCK_HEIGHT: Self = Self::new(500_000, 50_000);

    /// Global transaction-index sequence. 1000 index slots per height, so
    /// a partition spans the same height range as [`Self::BLOCK_HEIGHT`].
    pub const TX_INDEX: Self = Self::new(500_000_000, 50_000_000);

    pub const fn new(partition_size: u64, bucket_size: u64) -> Self {
        assert!(bucket_size > 0 && partition_size >= bucket_size);
        Self {
            partition_size,
            bucket_size,
        }
    }

    /// The `(partition_id, bucket_id)` pair for `position`.
    pub fn bucket_for(&self, position: u64) -> (String, String) {
        (
            format!("prt_{}", position / self.partition_size),
            format!("bkt_{}", position / self.bucket_size),
        )
    }

    /// All buckets covering the closed range `[min, max]`, ordered the way
    /// a scan in `order` visits them. Empty when `min > max`.
    pub fn buckets_in_range(&self, min: u64, max: u64, order: SortOrder) -> Vec<BucketRef> {
        if min > max {
            return Vec::new();
        }
        let mut buckets = Vec::new();
        let mut bucket_start = (min / self.bucket_size) * self.bucket_size;
        while bucket_start <= max {
            let bucket_end = bucket_start + self.bucket_size - 1;
            let (partition_id, bucket_id) = self.bucket_for(bucket_start);
            buckets.push(BucketRef {
                partition_id,
                bucket_id,
                min_position: bucket_start.max(min),
                max_position: bucket_end.min(max),
            });
            match bucket_start.checked_add(self.bucket_size) {
                Some(next) => bucket_start = next,
                None => break,
            }
        }
        if order == SortOrder::HeightDesc {
            buckets.reverse();
        }
        buckets
    }
}
