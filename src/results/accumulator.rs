use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use crate::aggregation::groupby::GroupByBuckets;
use crate::aggregation::stats::SegStats;
use crate::core::error::Error;
use crate::core::types::{BlockNum, RecordNum};

/// Pointer to one matched record, plus the value it is ranked by.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordResultContainer {
    pub segment_key: Arc<str>,
    pub table_name: Arc<str>,
    pub block_num: BlockNum,
    pub record_num: RecordNum,
    pub timestamp: u64,
    pub sort_value: Option<f64>,
}

/// Everything one block worker produced.
#[derive(Debug, Default)]
pub struct BlockResults {
    pub records: Vec<RecordResultContainer>,
    pub time_buckets: BTreeMap<u64, u64>,  // bucket start -> count
    pub group_by: Option<GroupByBuckets>,
}

impl BlockResults {
    pub fn add_time_bucket(&mut self, bucket: u64, count: u64) {
        *self.time_buckets.entry(bucket).or_insert(0) += count;
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.time_buckets.is_empty() && self.group_by.as_ref().is_none_or(|g| g.is_empty())
    }
}

/// Sink shared by all segment searches of a query. Must tolerate concurrent calls.
pub trait ResultsAccumulator: Send + Sync {
    /// False when no record in [low_ts, high_ts] could make it into the results.
    fn should_search_range(&self, low_ts: u64, high_ts: u64) -> bool;

    fn set_early_exit(&self, early_exit: bool);

    /// False once record collection is complete.
    fn should_continue_rrc_search(&self) -> bool;

    fn will_value_be_added(&self, sort_value: Option<f64>) -> bool;

    fn add_block_results(&self, results: BlockResults);

    fn add_matched_count(&self, count: u64);

    fn add_segment_stats(&self, stats: HashMap<String, SegStats>);

    fn add_error(&self, error: &Error);
}
