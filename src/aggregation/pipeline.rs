use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use crate::aggregation::groupby::{build_group_key, build_timechart_key, GroupByBuckets};
use crate::aggregation::request::{QueryAggregators, TimeHistogramRequest};
use crate::aggregation::rollup::RollupGranularity;
use crate::aggregation::stats::SegStats;
use crate::core::config::SearchConfig;
use crate::core::types::{BlockNum, ColumnValue, RecordNum, TimeRange};
use crate::results::accumulator::{BlockResults, RecordResultContainer, ResultsAccumulator};
use crate::search::evaluate::ErrorBatch;
use crate::search::request::SegmentSearchRequest;
use crate::search::status::{BlockSearchStatus, SegmentSearchStatus};
use crate::segment::reader::ColumnReader;

/// Column name that asks segment stats for a plain record count.
pub const COUNT_ALL_COLUMN: &str = "*";

/// Turns final block bitsets into record pointers, histograms, group-by buckets and segment stats.
#[derive(Debug, Clone)]
pub struct AggregationPipeline {
    pub timestamp_key: String,
}

/// Segment-wide inputs shared by every block of one aggregation pass.
struct SegmentScope<'a> {
    req: &'a SegmentSearchRequest,
    reader: &'a dyn ColumnReader,
    acc: &'a dyn ResultsAccumulator,
    segment_key: Arc<str>,
    table_name: Arc<str>,
}

impl AggregationPipeline {
    pub fn new(config: &SearchConfig) -> Self {
        AggregationPipeline { timestamp_key: config.timestamp_key.clone() }
    }

    /// Full path. Re-checks every matched record against the query window, clearing the bit of
    /// records outside it, and feeds the rest to the accumulator. Returns the records that remain matched.
    pub fn apply_aggregations(
        &self,
        req: &SegmentSearchRequest,
        reader: &dyn ColumnReader,
        status: &SegmentSearchStatus,
        acc: &dyn ResultsAccumulator,
    ) -> u64 {
        let scope = SegmentScope {
            req,
            reader,
            acc,
            segment_key: Arc::from(req.segment_key.as_str()),
            table_name: Arc::from(req.table_name.as_str()),
        };
        let aggs = req.aggregators();
        let mut errors = ErrorBatch::default();
        let mut total = 0;
        for block in status.sorted_block_nums(aggs.sort_ascending()) {
            let Some(blk) = status.block(block) else {
                continue;
            };
            if !blk.has_any_matched() {
                continue;
            }
            let (results, matched) = self.aggregate_block(&scope, aggs, blk, &mut errors);
            total += matched;
            if !results.is_empty() {
                acc.add_block_results(results);
            }
        }
        self.report_errors(req, &errors, acc);
        debug!(target: "segsearch::aggs", qid = req.qid(), segment = %req.segment_key, matched = total, "aggregated segment");
        total
    }

    fn aggregate_block(
        &self,
        scope: &SegmentScope,
        aggs: &QueryAggregators,
        blk: &BlockSearchStatus,
        errors: &mut ErrorBatch,
    ) -> (BlockResults, u64) {
        let block = blk.block_num;
        let time_range = scope.req.time_range();
        let mut out = BlockResults::default();
        let mut groups = self.group_by_for(aggs);
        let mut key = Vec::new();
        let mut key_values = Vec::new();
        let mut matched = 0;

        // iterate a copy: bits of records outside the window are cleared on the status itself
        for record in blk.record_iterator_copy().iter_set() {
            let rec = record as RecordNum;
            let ts = match scope.reader.read_timestamp(block, rec) {
                Ok(ts) => ts,
                Err(e) => {
                    errors.record(e);
                    blk.unset_record(record);
                    continue;
                }
            };
            if !time_range.check_in_range(ts) {
                blk.unset_record(record);
                continue;
            }
            matched += 1;

            if let Some(hist) = &aggs.time_histogram {
                if let Some(bucket) = hist.bucket_for(ts) {
                    match (&hist.timechart, groups.as_mut()) {
                        (None, _) => out.add_time_bucket(bucket, 1),
                        (Some(chart), Some(groups)) => {
                            let by_value = chart.by_field.as_ref().map(|f| read_or_null(scope.reader, f, block, rec));
                            build_timechart_key(bucket, by_value.as_ref(), &mut key, &mut key_values);
                            let measures = self.measure_values(scope.reader, aggs, block, rec);
                            groups.add_record(&key, &key_values, &measures);
                        }
                        (Some(_), None) => {}
                    }
                }
            }
            if let (Some(request), Some(groups), false) = (&aggs.group_by, groups.as_mut(), aggs.is_timechart()) {
                build_group_key(scope.reader, &request.columns, block, rec, &mut key, &mut key_values);
                let measures = self.measure_values(scope.reader, aggs, block, rec);
                groups.add_record(&key, &key_values, &measures);
            }

            if aggs.collect_records && scope.acc.should_continue_rrc_search() {
                let sort_value = self.sort_value(scope.reader, aggs, block, rec, ts);
                if scope.acc.will_value_be_added(sort_value) {
                    out.records.push(RecordResultContainer {
                        segment_key: scope.segment_key.clone(),
                        table_name: scope.table_name.clone(),
                        block_num: block,
                        record_num: rec,
                        timestamp: ts,
                        sort_value,
                    });
                }
            }
        }
        out.group_by = groups.filter(|g| !g.is_empty());
        (out, matched)
    }

    fn group_by_for(&self, aggs: &QueryAggregators) -> Option<GroupByBuckets> {
        if !aggs.has_group_by() {
            return None;
        }
        let (measures, limit) = match &aggs.group_by {
            Some(g) => (g.measures.clone(), g.bucket_limit),
            None => (Vec::new(), 0),
        };
        Some(GroupByBuckets::new(measures, limit))
    }

    fn measure_values(&self, reader: &dyn ColumnReader, aggs: &QueryAggregators, block: BlockNum, record: RecordNum) -> Vec<ColumnValue> {
        aggs.group_by
            .as_ref()
            .map(|g| g.measures.iter().map(|m| read_or_null(reader, &m.column, block, record)).collect())
            .unwrap_or_default()
    }

    /// Timestamp for time sorts, otherwise the sort column as a float.
    fn sort_value(&self, reader: &dyn ColumnReader, aggs: &QueryAggregators, block: BlockNum, record: RecordNum, ts: u64) -> Option<f64> {
        let sort = aggs.sort.as_ref()?;
        if sort.column == self.timestamp_key {
            return Some(ts as f64);
        }
        reader.read_value(&sort.column, block, record).ok()?.as_f64()
    }

    /// Match-all fast path for counts and plain histograms. Blocks fully inside the window are
    /// counted from their summary and rollups; the others by their timestamps.
    pub fn aggs_fast_path(
        &self,
        req: &SegmentSearchRequest,
        reader: &dyn ColumnReader,
        status: &SegmentSearchStatus,
        acc: &dyn ResultsAccumulator,
    ) -> u64 {
        let histogram = req.aggregators().time_histogram.as_ref().filter(|h| h.timechart.is_none());
        let time_range = req.time_range();
        let mut errors = ErrorBatch::default();
        let mut total = 0;
        for block in status.sorted_block_nums(true) {
            let (Some(blk), Some(summary)) = (status.block(block), req.metadata.block_summary(block)) else {
                continue;
            };
            let mut out = BlockResults::default();
            let from_rollups = if time_range.are_times_fully_enclosed(summary.low_ts, summary.high_ts) {
                self.count_from_rollups(reader, blk, summary.low_ts, summary.high_ts, histogram, &mut out)
            } else {
                None
            };
            total += match from_rollups {
                Some(count) => count,
                None => count_by_timestamp(reader, blk, time_range, histogram, &mut out, &mut errors),
            };
            if !out.is_empty() {
                acc.add_block_results(out);
            }
        }
        self.report_errors(req, &errors, acc);
        total
    }

    /// None when rollups cannot answer exactly for this block.
    fn count_from_rollups(
        &self,
        reader: &dyn ColumnReader,
        blk: &BlockSearchStatus,
        low_ts: u64,
        high_ts: u64,
        histogram: Option<&TimeHistogramRequest>,
        out: &mut BlockResults,
    ) -> Option<u64> {
        let count = blk.num_records as u64;
        let Some(hist) = histogram else {
            return Some(count);
        };
        let granularity = RollupGranularity::for_interval(hist.interval_ms);
        let width = granularity.width_ms();
        let aligned = hist.interval_ms % width == 0 && hist.start_ms % width == 0;
        if !aligned || low_ts < hist.start_ms || high_ts > hist.end_ms {
            return None;
        }
        let rollups = match reader.rollups(blk.block_num, granularity) {
            Ok(Some(r)) => r,
            Ok(None) => return None,
            Err(e) => {
                debug!(target: "segsearch::aggs", block = blk.block_num, error = %e, "rollups unreadable, counting timestamps");
                return None;
            }
        };
        for (start, records) in rollups.iter() {
            if let Some(bucket) = hist.bucket_for(*start) {
                out.add_time_bucket(bucket, records.count() as u64);
            }
        }
        Some(count)
    }

    /// Folds the matched, in-window records of `columns` into per-column stats.
    /// `*` only counts records; dictionary-encoded columns are read through their dictionary.
    pub fn compute_segment_stats(
        &self,
        req: &SegmentSearchRequest,
        reader: &dyn ColumnReader,
        status: &SegmentSearchStatus,
        columns: &[String],
        acc: &dyn ResultsAccumulator,
    ) -> HashMap<String, SegStats> {
        let mut stats: HashMap<String, SegStats> = columns.iter().map(|c| (c.clone(), SegStats::default())).collect();
        let time_range = req.time_range();
        let mut errors = ErrorBatch::default();
        for block in status.block_nums() {
            let Some(blk) = status.block(block) else {
                continue;
            };
            let mut records = Vec::new();
            for record in blk.record_iterator_copy().iter_set() {
                match reader.read_timestamp(block, record as RecordNum) {
                    Ok(ts) if time_range.check_in_range(ts) => records.push(record),
                    Ok(_) => blk.unset_record(record),
                    Err(e) => {
                        errors.record(e);
                        blk.unset_record(record);
                    }
                }
            }
            for (column, col_stats) in stats.iter_mut() {
                if column == COUNT_ALL_COLUMN {
                    col_stats.count += records.len() as u64;
                    continue;
                }
                match reader.dictionary(column, block) {
                    Some(dict) => {
                        for r in &records {
                            if let Some(v) = dict.value_of(*r) {
                                col_stats.add_value(v);
                            }
                        }
                    }
                    None => {
                        for r in &records {
                            match reader.read_value(column, block, *r as RecordNum) {
                                Ok(v) => col_stats.add_value(&v),
                                Err(e) => errors.record(e),
                            }
                        }
                    }
                }
            }
        }
        self.report_errors(req, &errors, acc);
        stats
    }

    fn report_errors(&self, req: &SegmentSearchRequest, errors: &ErrorBatch, acc: &dyn ResultsAccumulator) {
        if let Some(e) = errors.summarize(&req.segment_key) {
            warn!(target: "segsearch::aggs", qid = req.qid(), segment = %req.segment_key, count = errors.count, error = %e, "records skipped during aggregation");
            acc.add_error(&e);
        }
    }
}

fn read_or_null(reader: &dyn ColumnReader, column: &str, block: BlockNum, record: RecordNum) -> ColumnValue {
    reader.read_value(column, block, record).unwrap_or(ColumnValue::Null)
}

fn count_by_timestamp(
    reader: &dyn ColumnReader,
    blk: &BlockSearchStatus,
    time_range: &TimeRange,
    histogram: Option<&TimeHistogramRequest>,
    out: &mut BlockResults,
    errors: &mut ErrorBatch,
) -> u64 {
    let mut count = 0;
    for record in blk.record_iterator_copy().iter_set() {
        let ts = match reader.read_timestamp(blk.block_num, record as RecordNum) {
            Ok(ts) => ts,
            Err(e) => {
                errors.record(e);
                continue;
            }
        };
        if !time_range.check_in_range(ts) {
            continue;
        }
        count += 1;
        if let Some(bucket) = histogram.and_then(|h| h.bucket_for(ts)) {
            out.add_time_bucket(bucket, 1);
        }
    }
    count
}
