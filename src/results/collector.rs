use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use parking_lot::Mutex;
use tracing::warn;
use crate::aggregation::groupby::{GroupByBuckets, GroupResult};
use crate::aggregation::request::{QueryAggregators, SortRequest};
use crate::aggregation::stats::{merge_seg_stats, SegStats};
use crate::core::error::Error;
use crate::results::accumulator::{BlockResults, RecordResultContainer, ResultsAccumulator};

/// Record ranked by its sort key; the heap top is the worst record kept.
#[derive(Debug, Clone)]
struct RankedRecord {
    key: f64,  // smaller is better
    rrc: RecordResultContainer,
}

impl PartialEq for RankedRecord {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for RankedRecord {}

impl PartialOrd for RankedRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RankedRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.total_cmp(&other.key)
    }
}

#[derive(Default)]
struct ResultsState {
    heap: BinaryHeap<RankedRecord>,
    time_buckets: BTreeMap<u64, u64>,
    group_by: Option<GroupByBuckets>,
    seg_stats: HashMap<String, SegStats>,
    errors: Vec<String>,
}

/// Top-K record collector plus aggregate sinks for one query.
pub struct SearchResults {
    pub size_limit: usize,
    pub sort: Option<SortRequest>,
    pub timestamp_key: String,
    pub max_reported_errors: usize,
    state: Mutex<ResultsState>,
    matched: AtomicU64,
    error_count: AtomicU64,
    early_exit: AtomicBool,
}

impl SearchResults {
    pub fn new(size_limit: usize, aggs: &QueryAggregators, timestamp_key: &str) -> Self {
        SearchResults {
            size_limit,
            sort: aggs.sort.clone(),
            timestamp_key: timestamp_key.to_string(),
            max_reported_errors: 100,
            state: Mutex::new(ResultsState::default()),
            matched: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            early_exit: AtomicBool::new(false),
        }
    }

    pub fn with_max_reported_errors(mut self, max: usize) -> Self {
        self.max_reported_errors = max;
        self
    }

    fn rank_key(&self, sort_value: Option<f64>) -> f64 {
        match (&self.sort, sort_value) {
            (Some(s), Some(v)) if s.ascending => v,
            (Some(_), Some(v)) => -v,
            (Some(_), None) => f64::INFINITY,  // records without a sort value rank last
            (None, _) => 0.0,
        }
    }

    fn sorts_by_time(&self) -> bool {
        self.sort.as_ref().is_some_and(|s| s.column == self.timestamp_key)
    }

    fn collect(&self, state: &mut ResultsState, rrc: RecordResultContainer) {
        if self.size_limit == 0 {
            return;
        }
        let ranked = RankedRecord { key: self.rank_key(rrc.sort_value), rrc };
        if state.heap.len() < self.size_limit {
            state.heap.push(ranked);
            return;
        }
        if self.sort.is_none() {
            return;
        }
        if state.heap.peek().is_some_and(|worst| ranked.key < worst.key) {
            state.heap.pop();
            state.heap.push(ranked);
        }
    }

    pub fn total_matched(&self) -> u64 {
        self.matched.load(AtomicOrdering::Acquire)
    }

    pub fn early_exit(&self) -> bool {
        self.early_exit.load(AtomicOrdering::Acquire)
    }

    /// Collected records, best first.
    pub fn records(&self) -> Vec<RecordResultContainer> {
        let state = self.state.lock();
        let mut ranked: Vec<RankedRecord> = state.heap.iter().cloned().collect();
        ranked.sort();
        ranked.into_iter().map(|r| r.rrc).collect()
    }

    pub fn time_histogram(&self) -> BTreeMap<u64, u64> {
        self.state.lock().time_buckets.clone()
    }

    pub fn group_by_results(&self) -> Vec<GroupResult> {
        self.state.lock().group_by.as_ref().map(|g| g.results()).unwrap_or_default()
    }

    pub fn segment_stats(&self) -> HashMap<String, SegStats> {
        self.state.lock().seg_stats.clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.state.lock().errors.clone()
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(AtomicOrdering::Acquire)
    }
}

impl ResultsAccumulator for SearchResults {
    fn should_search_range(&self, low_ts: u64, high_ts: u64) -> bool {
        if !self.sorts_by_time() {
            return true;
        }
        let state = self.state.lock();
        if state.heap.len() < self.size_limit {
            return true;
        }
        let Some(worst) = state.heap.peek() else {
            return true;
        };
        let ascending = self.sort.as_ref().is_some_and(|s| s.ascending);
        let best_possible = if ascending { low_ts as f64 } else { -(high_ts as f64) };
        best_possible < worst.key
    }

    fn set_early_exit(&self, early_exit: bool) {
        self.early_exit.store(early_exit, AtomicOrdering::Release);
    }

    fn should_continue_rrc_search(&self) -> bool {
        if self.size_limit == 0 {
            return false;
        }
        if self.sort.is_some() {
            return true;
        }
        self.state.lock().heap.len() < self.size_limit
    }

    fn will_value_be_added(&self, sort_value: Option<f64>) -> bool {
        let state = self.state.lock();
        if state.heap.len() < self.size_limit {
            return true;
        }
        if self.sort.is_none() || sort_value.is_none() {
            return false;
        }
        let key = self.rank_key(sort_value);
        state.heap.peek().is_some_and(|worst| key < worst.key)
    }

    fn add_block_results(&self, results: BlockResults) {
        let mut state = self.state.lock();
        for rrc in results.records {
            self.collect(&mut state, rrc);
        }
        for (bucket, count) in results.time_buckets {
            *state.time_buckets.entry(bucket).or_insert(0) += count;
        }
        if let Some(groups) = results.group_by {
            match &mut state.group_by {
                Some(existing) => {
                    if let Err(e) = existing.merge(groups) {
                        warn!(target: "segsearch::aggs", error = %e, "dropping group-by results that failed to merge");
                    }
                }
                None => state.group_by = Some(groups),
            }
        }
    }

    fn add_matched_count(&self, count: u64) {
        self.matched.fetch_add(count, AtomicOrdering::AcqRel);
    }

    fn add_segment_stats(&self, stats: HashMap<String, SegStats>) {
        let mut state = self.state.lock();
        if let Err(e) = merge_seg_stats(&mut state.seg_stats, stats) {
            warn!(target: "segsearch::aggs", error = %e, "dropping segment stats that failed to merge");
        }
    }

    fn add_error(&self, error: &Error) {
        self.error_count.fetch_add(1, AtomicOrdering::AcqRel);
        let mut state = self.state.lock();
        if state.errors.len() < self.max_reported_errors {
            state.errors.push(error.to_string());
        }
    }
}
