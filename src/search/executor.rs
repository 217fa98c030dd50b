use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use crossbeam::channel::bounded;
use tracing::{debug, error, info, warn};
use crate::aggregation::pipeline::AggregationPipeline;
use crate::aggregation::stats::SegStats;
use crate::bitset::MatchBitset;
use crate::core::config::SearchConfig;
use crate::core::error::Result;
use crate::core::types::BlockNum;
use crate::memory::{estimate_search_memory, MemoryBudget, MemoryReservation, SemaphorePermit, WeightedSemaphore};
use crate::pqs::{PersistentQueryService, QueryPersistenceTracker, SegmentPqmrResults};
use crate::results::accumulator::ResultsAccumulator;
use crate::search::evaluate::{ColumnUsage, ErrorBatch, LeafEvaluator};
use crate::search::query::{SearchCondition, SearchNode, SearchOp, SearchQuery};
use crate::search::request::{QueryContext, SegmentSearchRequest};
use crate::search::status::SegmentSearchStatus;
use crate::segment::reader::ColumnReader;

/// One segment of a query together with the reader for its columns.
#[derive(Clone)]
pub struct SegmentTask {
    pub request: SegmentSearchRequest,
    pub reader: Arc<dyn ColumnReader>,
}

/// Inputs shared by every node and leaf of one segment search.
struct SegmentSearch<'a> {
    req: &'a SegmentSearchRequest,
    reader: &'a dyn ColumnReader,
}

/// Executes predicate trees against segments, consulting and filling the persistent query cache.
pub struct RawSearchExecutor {
    pub config: SearchConfig,
    pub pqs: Option<Arc<PersistentQueryService>>,
    pub tracker: Option<Arc<dyn QueryPersistenceTracker>>,
    pub aggs: AggregationPipeline,
    raw_search_gate: Arc<WeightedSemaphore>,
    memory: Arc<MemoryBudget>,
    seed: Arc<MatchBitset>,  // all-matched template, cloned per block
    usage: ColumnUsage,
}

impl RawSearchExecutor {
    pub fn new(config: SearchConfig) -> Self {
        RawSearchExecutor {
            raw_search_gate: WeightedSemaphore::new("raw-search", config.raw_search_permits),
            memory: MemoryBudget::new(config.max_search_memory_bytes),
            seed: Arc::new(MatchBitset::all_set(config.pqmr_initial_size)),
            aggs: AggregationPipeline::new(&config),
            usage: ColumnUsage::new(),
            pqs: None,
            tracker: None,
            config,
        }
    }

    pub fn with_pqs(mut self, pqs: Arc<PersistentQueryService>) -> Self {
        self.pqs = Some(pqs);
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<dyn QueryPersistenceTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Shares a raw-search gate with other executors of the process.
    pub fn with_raw_search_gate(mut self, gate: Arc<WeightedSemaphore>) -> Self {
        self.raw_search_gate = gate;
        self
    }

    pub fn with_memory_budget(mut self, memory: Arc<MemoryBudget>) -> Self {
        self.memory = memory;
        self
    }

    pub fn column_usage(&self) -> &ColumnUsage {
        &self.usage
    }

    /// Runs every segment with at most `raw_search_permits` in flight. Cancellation is checked
    /// before each segment starts; segment failures are reported to `acc` and do not stop the query.
    pub fn search_segments(&self, ctx: &QueryContext, tasks: &[SegmentTask], acc: &dyn ResultsAccumulator) -> Result<u64> {
        if let Some(tracker) = &self.tracker {
            let pqids: BTreeSet<&str> = tasks.iter().filter_map(|t| t.request.pqid()).collect();
            for pqid in pqids {
                tracker.record_usage(pqid);
            }
        }
        let total = AtomicU64::new(0);
        let (task_tx, task_rx) = bounded(tasks.len().max(1));
        for task in tasks {
            let _ = task_tx.send(task);
        }
        drop(task_tx);

        let workers = self.config.raw_search_permits.min(tasks.len()).max(1);
        rayon::scope(|s| {
            for _ in 0..workers {
                let task_rx = task_rx.clone();
                let total = &total;
                s.spawn(move |_| {
                    for task in task_rx.iter() {
                        if ctx.is_cancelled() {
                            break;
                        }
                        match self.search_segment(&task.request, task.reader.as_ref(), acc) {
                            Ok(matched) => {
                                total.fetch_add(matched, Ordering::Relaxed);
                            }
                            Err(e) => {
                                warn!(target: "segsearch::search", qid = ctx.qid, segment = %task.request.segment_key, error = %e, "segment search failed");
                                acc.add_error(&e);
                            }
                        }
                    }
                });
            }
        });
        ctx.check()?;
        let total = total.into_inner();
        info!(target: "segsearch::search", qid = ctx.qid, segments = tasks.len(), matched = total, "query segments searched");
        Ok(total)
    }

    /// Searches and aggregates one segment: the rollup fast path for bare counts, cached results
    /// when present, a raw search otherwise. Returns the matched records.
    pub fn search_segment(&self, req: &SegmentSearchRequest, reader: &dyn ColumnReader, acc: &dyn ResultsAccumulator) -> Result<u64> {
        if req.node().is_match_all() && req.aggregators().needs_only_counts() {
            return Ok(self.aggs_fast_path(req, reader, acc));
        }
        let status = match self.cached_results(req) {
            Some(cached) => {
                let status = self.raw_search_pqmr_results(req, reader, &cached, acc)?;
                if status.blocks.keys().any(|b| !cached.contains_block(*b)) {
                    self.backfill(req, &status, Some(cached.as_ref()));
                }
                status
            }
            None => {
                let status = self.raw_search_segment(req, reader, acc)?;
                self.backfill(req, &status, None);
                status
            }
        };
        let matched = self.aggs.apply_aggregations(req, reader, &status, acc);
        acc.add_matched_count(matched);
        Ok(matched)
    }

    /// Evaluates the request's node over every block it selects, without aggregating.
    pub fn raw_search_segment(
        &self,
        req: &SegmentSearchRequest,
        reader: &dyn ColumnReader,
        acc: &dyn ResultsAccumulator,
    ) -> Result<SegmentSearchStatus> {
        let mut status = SegmentSearchStatus::init_blocks_to_search(req, acc, &self.seed);
        if status.blocks.is_empty() {
            debug!(target: "segsearch::search", qid = req.qid(), segment = %req.segment_key, "no blocks to search");
            return Ok(status);
        }
        let (_permit, _reservation) = self.acquire(req)?;

        let missing: Vec<String> = req
            .node()
            .required_columns()
            .into_iter()
            .filter(|c| !reader.has_column(c))
            .collect();
        if !missing.is_empty() {
            warn!(target: "segsearch::search", qid = req.qid(), segment = %req.segment_key, columns = ?missing, "required columns missing, node matches nothing");
            status.reset_all_blocks();
            return Ok(status);
        }

        let search = SegmentSearch { req, reader };
        let mut errors = ErrorBatch::default();
        let order = status.sorted_block_nums(req.aggregators().sort_ascending());
        for batch in order.chunks(self.config.block_batch_size.max(1)) {
            self.search_node(&search, req.node(), &mut status, batch, &mut errors);
        }
        status.read_errors = errors.count;
        if let Some(e) = errors.summarize(&req.segment_key) {
            warn!(target: "segsearch::search", qid = req.qid(), segment = %req.segment_key, count = errors.count, error = %e, "column reads failed");
            acc.add_error(&e);
        }
        debug!(
            target: "segsearch::search",
            qid = req.qid(),
            segment = %req.segment_key,
            blocks = status.num_blocks_to_search,
            blocks_in_file = status.num_blocks_in_seg_file,
            matched = status.total_matched(),
            "raw search done"
        );
        Ok(status)
    }

    /// Status from cached bitsets; blocks the request wants that the cache lacks are raw searched.
    pub fn raw_search_pqmr_results(
        &self,
        req: &SegmentSearchRequest,
        reader: &dyn ColumnReader,
        cached: &SegmentPqmrResults,
        acc: &dyn ResultsAccumulator,
    ) -> Result<SegmentSearchStatus> {
        let mut status = SegmentSearchStatus::init_from_pqmr(req, &cached.to_map());
        let missing: BTreeMap<BlockNum, BTreeSet<String>> = req
            .blocks_to_search
            .iter()
            .filter(|(b, _)| !cached.contains_block(**b))
            .map(|(b, cols)| (*b, cols.clone()))
            .collect();
        if !missing.is_empty() {
            let mut partial = req.clone();
            partial.blocks_to_search = missing;
            let searched = self.raw_search_segment(&partial, reader, acc)?;
            debug!(target: "segsearch::search", qid = req.qid(), segment = %req.segment_key, blocks = searched.blocks.len(), "raw searched blocks missing from cache");
            status.read_errors += searched.read_errors;
            status.blocks.extend(searched.blocks);
            status.num_blocks_to_search = status.blocks.len();
        }
        Ok(status)
    }

    /// Counts and plain histograms of a match-all query, without evaluating anything.
    pub fn aggs_fast_path(&self, req: &SegmentSearchRequest, reader: &dyn ColumnReader, acc: &dyn ResultsAccumulator) -> u64 {
        let status = SegmentSearchStatus::init_blocks_for_aggs_fast_path(req);
        let matched = self.aggs.aggs_fast_path(req, reader, &status, acc);
        acc.add_matched_count(matched);
        matched
    }

    /// Raw searches the segment and folds the matched records of `columns` into segment stats.
    pub fn raw_compute_segment_stats(
        &self,
        req: &SegmentSearchRequest,
        reader: &dyn ColumnReader,
        columns: &[String],
        acc: &dyn ResultsAccumulator,
    ) -> Result<HashMap<String, SegStats>> {
        let status = self.raw_search_segment(req, reader, acc)?;
        let stats = self.aggs.compute_segment_stats(req, reader, &status, columns, acc);
        acc.add_matched_count(status.total_matched());
        acc.add_segment_stats(stats.clone());
        Ok(stats)
    }

    fn acquire(&self, req: &SegmentSearchRequest) -> Result<(SemaphorePermit, MemoryReservation)> {
        let retries = self.config.acquire_retries;
        let backoff = self.config.acquire_backoff;
        let permit = self
            .raw_search_gate
            .try_acquire_with_backoff(1, retries, backoff, req.qid())
            .inspect_err(|e| warn!(target: "segsearch::search", qid = req.qid(), segment = %req.segment_key, error = %e, "no raw search permit"))?;
        let records_per_block = req.block_summaries().iter().map(|b| b.record_count as usize).max().unwrap_or(0);
        let size = estimate_search_memory(records_per_block, req.parallelism(), self.config.search_memory_per_record_bytes);
        let reservation = self.memory.reserve_with_backoff(size, retries, backoff, req.qid())?;
        Ok((permit, reservation))
    }

    fn search_node(
        &self,
        search: &SegmentSearch,
        node: &SearchNode,
        status: &mut SegmentSearchStatus,
        blocks: &[BlockNum],
        errors: &mut ErrorBatch,
    ) {
        let mut composed = false;
        for (cond, op) in node.conditions() {
            if op == SearchOp::Or && composed {
                // any of the or conditions, on top of all of the and conditions
                let mut child = status.child_for_blocks(blocks);
                self.search_condition(search, cond, op, &mut child, blocks, errors);
                status.merge_child(child, SearchOp::And, blocks);
            } else {
                self.search_condition(search, cond, op, status, blocks, errors);
            }
            composed = true;
        }
    }

    fn search_condition(
        &self,
        search: &SegmentSearch,
        cond: &SearchCondition,
        op: SearchOp,
        status: &mut SegmentSearchStatus,
        blocks: &[BlockNum],
        errors: &mut ErrorBatch,
    ) {
        for query in &cond.queries {
            self.search_leaf(search, query, op, status, blocks, errors);
        }
        for node in &cond.nodes {
            let mut child = status.child_for_blocks(blocks);
            self.search_node(search, node, &mut child, blocks, errors);
            status.merge_child(child, op, blocks);
        }
    }

    /// Fans the blocks of a batch out to `parallelism` workers pulling from a shared channel.
    fn search_leaf(
        &self,
        search: &SegmentSearch,
        query: &SearchQuery,
        op: SearchOp,
        status: &SegmentSearchStatus,
        blocks: &[BlockNum],
        errors: &mut ErrorBatch,
    ) {
        let evaluator = LeafEvaluator::new(search.reader, self.config.dict_fast_path_max_entries, &self.usage);
        let req = search.req;
        let (block_tx, block_rx) = bounded(blocks.len().max(1));
        for block in blocks {
            let _ = block_tx.send(*block);
        }
        drop(block_tx);

        let workers = req.parallelism().min(blocks.len()).max(1);
        let (error_tx, error_rx) = bounded(workers);
        rayon::scope(|s| {
            for _ in 0..workers {
                let block_rx = block_rx.clone();
                let error_tx = error_tx.clone();
                let evaluator = &evaluator;
                s.spawn(move |_| {
                    let mut batch = ErrorBatch::default();
                    for block in block_rx.iter() {
                        let Some(blk) = status.block(block) else {
                            continue;
                        };
                        let columns = req.cmi_passed_columns(block).unwrap_or(&req.metadata.columns);
                        evaluator.apply_leaf(query, op, blk, columns, &mut batch);
                    }
                    let _ = error_tx.send(batch);
                });
            }
        });
        drop(error_tx);
        for batch in error_rx.iter() {
            errors.merge(batch);
        }
    }

    fn cached_results(&self, req: &SegmentSearchRequest) -> Option<Arc<SegmentPqmrResults>> {
        let (Some(pqs), Some(pqid)) = (&self.pqs, req.pqid()) else {
            return None;
        };
        if req.node().is_match_all() || !pqs.does_pqmr_exist(&req.segment_key, pqid) {
            return None;
        }
        match pqs.get_all_persistent_query_results(&req.segment_key, pqid) {
            Ok(results) => Some(results),
            Err(e) => {
                warn!(target: "segsearch::pqs", qid = req.qid(), segment = %req.segment_key, pqid, error = %e, "cached results unusable, raw searching");
                None
            }
        }
    }

    /// Persists the bitsets of a raw search for a tracked query. Only blocks whose whole time span
    /// lies inside the query window are written; zero-match blocks are written as empty bitsets.
    fn backfill(&self, req: &SegmentSearchRequest, status: &SegmentSearchStatus, cached: Option<&SegmentPqmrResults>) {
        let (Some(pqs), Some(tracker), Some(pqid)) = (&self.pqs, &self.tracker, req.pqid()) else {
            return;
        };
        if req.node().is_match_all() || req.segment_key.contains("/active/") || !tracker.is_persistent(pqid) {
            return;
        }
        if status.is_degraded() {
            debug!(target: "segsearch::pqs", qid = req.qid(), segment = %req.segment_key, pqid, errors = status.read_errors, "column reads failed, not caching");
            return;
        }
        let time_range = req.time_range();
        if cached.is_none() && status.total_matched() == 0 && covers_whole_segment(req, status) {
            pqs.add_empty_results(pqid, &req.segment_key);
            return;
        }

        let results = match cached {
            Some(c) => SegmentPqmrResults::from_map(c.to_map()),
            None => SegmentPqmrResults::new(),
        };
        let mut added = 0;
        for (block, blk) in &status.blocks {
            if results.contains_block(*block) {
                continue;
            }
            let Some(summary) = req.metadata.block_summary(*block) else {
                continue;
            };
            if time_range.are_times_fully_enclosed(summary.low_ts, summary.high_ts) {
                results.set_block_results(*block, blk.record_iterator_copy());
                added += 1;
            }
        }
        if added == 0 {
            return;
        }
        if let Err(e) = pqs.write_results(&req.segment_key, pqid, Arc::new(results)) {
            error!(target: "segsearch::pqs", qid = req.qid(), segment = %req.segment_key, pqid, error = %e, "failed to write pqmr");
        }
    }
}

/// True when every block of the segment lies inside the query window and was either searched
/// or pruned by the micro-index. Blocks the caller never asked for leave the segment uncovered.
fn covers_whole_segment(req: &SegmentSearchRequest, status: &SegmentSearchStatus) -> bool {
    if !req.whole_segment {
        return false;
    }
    let time_range = req.time_range();
    req.block_summaries().iter().enumerate().all(|(block, summary)| {
        let block = block as BlockNum;
        time_range.are_times_fully_enclosed(summary.low_ts, summary.high_ts)
            && (!req.should_search_block(block) || status.blocks.contains_key(&block))
    })
}
