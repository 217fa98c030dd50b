use std::collections::BTreeMap;
use std::sync::Arc;
use crate::aggregation::rollup::RollupGranularity;
use crate::bitset::MatchBitset;
use crate::core::error::Result;
use crate::core::types::{BlockNum, ColumnValue, RecordNum};

/// Block-local dictionary: each record points at one distinct value.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockDictionary {
    pub values: Vec<ColumnValue>,
    pub codes: Vec<u32>,  // record number -> index into `values`
}

impl BlockDictionary {
    pub fn value_of(&self, record: usize) -> Option<&ColumnValue> {
        self.codes.get(record).and_then(|c| self.values.get(*c as usize))
    }
}

/// Rollup bucket start (epoch ms) -> records of the block falling in that bucket.
pub type RollupBuckets = BTreeMap<u64, MatchBitset>;

/// Decoded column access for one segment. Shared by every block worker of a search.
pub trait ColumnReader: Send + Sync {
    fn segment_key(&self) -> &str;

    fn has_column(&self, column: &str) -> bool;

    fn read_value(&self, column: &str, block: BlockNum, record: RecordNum) -> Result<ColumnValue>;

    fn read_timestamp(&self, block: BlockNum, record: RecordNum) -> Result<u64>;

    /// Some only for columns stored dictionary-encoded in this block.
    fn dictionary(&self, column: &str, block: BlockNum) -> Option<Arc<BlockDictionary>>;

    /// Precomputed time rollups of a block, when the segment has them.
    fn rollups(&self, _block: BlockNum, _granularity: RollupGranularity) -> Result<Option<Arc<RollupBuckets>>> {
        Ok(None)
    }
}
