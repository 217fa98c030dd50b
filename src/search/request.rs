use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use crate::aggregation::request::QueryAggregators;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{BlockNum, TimeRange};
use crate::search::query::SearchNode;
use crate::segment::metadata::{BlockSummary, SegmentMicroIndex};

/// Per-query information shared by every segment request of the query.
#[derive(Debug, Clone)]
pub struct QueryInformation {
    pub qid: u64,
    pub time_range: TimeRange,
    pub parallelism: usize,
    pub pqid: Option<String>,  // stable hash of the normalized query
    pub node: Arc<SearchNode>,
    pub aggregators: Arc<QueryAggregators>,
}

impl QueryInformation {
    pub fn new(qid: u64, node: SearchNode, time_range: TimeRange) -> Self {
        QueryInformation {
            qid,
            time_range,
            parallelism: 1,
            pqid: None,
            node: Arc::new(node),
            aggregators: Arc::new(QueryAggregators::default()),
        }
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn with_pqid(mut self, pqid: &str) -> Self {
        self.pqid = Some(pqid.to_string());
        self
    }

    pub fn with_aggregators(mut self, aggregators: QueryAggregators) -> Self {
        self.aggregators = Arc::new(aggregators);
        self
    }
}

/// Work order for one segment: the blocks that survived pruning and the columns
/// that passed the micro-index in each of them.
#[derive(Debug, Clone)]
pub struct SegmentSearchRequest {
    pub segment_key: String,
    pub table_name: String,
    pub metadata: Arc<SegmentMicroIndex>,
    pub blocks_to_search: BTreeMap<BlockNum, BTreeSet<String>>,
    pub query_info: Arc<QueryInformation>,
    pub whole_segment: bool,  // every block was a candidate; absent blocks were pruned, not skipped
}

impl SegmentSearchRequest {
    /// Request covering every block of the segment, every column considered present.
    pub fn full_segment(metadata: Arc<SegmentMicroIndex>, query_info: Arc<QueryInformation>) -> Self {
        let blocks_to_search = (0..metadata.num_blocks() as BlockNum)
            .map(|b| {
                let columns = metadata
                    .block_index(b)
                    .map(|idx| idx.columns.iter().cloned().collect())
                    .unwrap_or_else(|| metadata.columns.clone());
                (b, columns)
            })
            .collect();
        SegmentSearchRequest {
            segment_key: metadata.segment_key.clone(),
            table_name: metadata.table_name.clone(),
            metadata,
            blocks_to_search,
            query_info,
            whole_segment: true,
        }
    }

    pub fn qid(&self) -> u64 {
        self.query_info.qid
    }

    pub fn time_range(&self) -> &TimeRange {
        &self.query_info.time_range
    }

    pub fn parallelism(&self) -> usize {
        self.query_info.parallelism
    }

    pub fn pqid(&self) -> Option<&str> {
        self.query_info.pqid.as_deref()
    }

    pub fn node(&self) -> &SearchNode {
        &self.query_info.node
    }

    pub fn aggregators(&self) -> &QueryAggregators {
        &self.query_info.aggregators
    }

    pub fn block_summaries(&self) -> &[BlockSummary] {
        &self.metadata.block_summaries
    }

    pub fn should_search_block(&self, block: BlockNum) -> bool {
        self.blocks_to_search.contains_key(&block)
    }

    pub fn cmi_passed_columns(&self, block: BlockNum) -> Option<&BTreeSet<String>> {
        self.blocks_to_search.get(&block)
    }
}

/// Cancellation handle for a running query.
#[derive(Debug)]
pub struct QueryContext {
    pub qid: u64,
    cancelled: AtomicBool,
}

impl QueryContext {
    pub fn new(qid: u64) -> Arc<Self> {
        Arc::new(QueryContext { qid, cancelled: AtomicBool::new(false) })
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::new(ErrorKind::Cancelled, format!("query {} cancelled", self.qid)));
        }
        Ok(())
    }
}
