use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortRequest {
    pub column: String,
    pub ascending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimechartRequest {
    pub by_field: Option<String>,
}

/// Fixed-width time buckets over [start_ms, end_ms].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeHistogramRequest {
    pub start_ms: u64,
    pub end_ms: u64,
    pub interval_ms: u64,
    pub timechart: Option<TimechartRequest>,
}

impl TimeHistogramRequest {
    pub fn new(start_ms: u64, end_ms: u64, interval_ms: u64) -> Self {
        TimeHistogramRequest { start_ms, end_ms, interval_ms: interval_ms.max(1), timechart: None }
    }

    /// Start of the bucket holding `ts`, or None outside the histogram window.
    pub fn bucket_for(&self, ts: u64) -> Option<u64> {
        if ts < self.start_ms || ts > self.end_ms {
            return None;
        }
        Some(self.start_ms + (ts - self.start_ms) / self.interval_ms * self.interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MeasureFunc {
    Count,
    Sum,
    Min,
    Max,
    Avg,
    Variance,
    Stdev,
    Cardinality,
    Percentile(f64),  // 0..=100
    Values,
    List,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasureAggregator {
    pub column: String,
    pub func: MeasureFunc,
}

impl MeasureAggregator {
    pub fn new(column: &str, func: MeasureFunc) -> Self {
        MeasureAggregator { column: column.to_string(), func }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupByRequest {
    pub columns: Vec<String>,
    pub measures: Vec<MeasureAggregator>,
    pub bucket_limit: usize,
}

/// Everything the aggregation stage has to produce for a query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryAggregators {
    pub sort: Option<SortRequest>,
    pub collect_records: bool,
    pub time_histogram: Option<TimeHistogramRequest>,
    pub group_by: Option<GroupByRequest>,
}

impl QueryAggregators {
    pub fn records(sort: Option<SortRequest>) -> Self {
        QueryAggregators { sort, collect_records: true, ..Default::default() }
    }

    pub fn is_timechart(&self) -> bool {
        self.time_histogram.as_ref().is_some_and(|h| h.timechart.is_some())
    }

    /// Plain time histogram, not a timechart.
    pub fn has_histogram(&self) -> bool {
        self.time_histogram.as_ref().is_some_and(|h| h.timechart.is_none())
    }

    pub fn has_group_by(&self) -> bool {
        self.group_by.is_some() || self.is_timechart()
    }

    /// Counts and plain histograms can be answered from rollups alone.
    pub fn needs_only_counts(&self) -> bool {
        !self.collect_records && !self.has_group_by()
    }

    pub fn sort_ascending(&self) -> bool {
        self.sort.as_ref().is_none_or(|s| s.ascending)
    }
}
