use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use crate::core::error::Result;
use crate::core::types::BlockNum;
use crate::microindex::bloom::BlockBloom;
use crate::microindex::ranges::NumericRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSummary {
    pub low_ts: u64,
    pub high_ts: u64,
    pub record_count: u16,
}

/// Micro-index of one block: bloom over every value token plus numeric ranges.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockMicroIndex {
    pub bloom: Option<BlockBloom>,
    pub ranges: HashMap<String, NumericRange>,
    pub columns: HashSet<String>,       // columns with at least one value in the block
    pub dict_encoded: HashSet<String>,  // columns stored with a block-local dictionary
}

impl BlockMicroIndex {
    /// Missing bloom means nothing can be ruled out.
    pub fn bloom_might_contain(&self, token: &str) -> bool {
        self.bloom.as_ref().is_none_or(|b| b.might_contain(token))
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.contains(column)
    }

    pub fn is_dict_encoded(&self, column: &str) -> bool {
        self.dict_encoded.contains(column)
    }
}

/// Per-segment metadata needed before any record is read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SegmentMicroIndex {
    pub segment_key: String,
    pub table_name: String,
    pub block_summaries: Vec<BlockSummary>,  // indexed by block number
    pub block_indices: HashMap<BlockNum, BlockMicroIndex>,
    pub columns: BTreeSet<String>,
}

impl SegmentMicroIndex {
    pub fn num_blocks(&self) -> usize {
        self.block_summaries.len()
    }

    pub fn block_summary(&self, block: BlockNum) -> Option<&BlockSummary> {
        self.block_summaries.get(block as usize)
    }

    pub fn block_index(&self, block: BlockNum) -> Option<&BlockMicroIndex> {
        self.block_indices.get(&block)
    }

    pub fn is_dict_encoded(&self, column: &str, block: BlockNum) -> bool {
        self.block_index(block).is_some_and(|b| b.is_dict_encoded(column))
    }

    pub fn total_records(&self) -> u64 {
        self.block_summaries.iter().map(|b| b.record_count as u64).sum()
    }
}

/// Source of block summaries and micro-indices.
pub trait BlockMetadataProvider: Send + Sync {
    fn segment_micro_index(&self, table: &str, segment_key: &str) -> Result<Arc<SegmentMicroIndex>>;
}
