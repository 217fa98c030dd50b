use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use crossbeam::channel::bounded;
use roaring::RoaringBitmap;
use tracing::{debug, error};
use crate::core::error::{Error, Result};
use crate::core::types::BlockNum;
use crate::microindex::ranges::RangeCheck;
use crate::pqs::PersistentQueryService;
use crate::search::query::{BloomKeys, ColumnSelector, LogicalOp, SearchNode, SearchOp, SearchQuery};
use crate::search::request::{QueryInformation, SegmentSearchRequest};
use crate::segment::metadata::{BlockMetadataProvider, BlockMicroIndex, SegmentMicroIndex};

/// Blocks of a segment that the caller wants searched.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockTracker {
    All,
    Blocks(RoaringBitmap),
}

impl BlockTracker {
    pub fn from_blocks(blocks: impl IntoIterator<Item = BlockNum>) -> Self {
        BlockTracker::Blocks(blocks.into_iter().map(u32::from).collect())
    }

    pub fn should_process_block(&self, block: BlockNum) -> bool {
        match self {
            BlockTracker::All => true,
            BlockTracker::Blocks(b) => b.contains(block as u32),
        }
    }

    /// True when no block of a segment with `num_blocks` blocks is left out.
    pub fn covers_all(&self, num_blocks: usize) -> bool {
        match self {
            BlockTracker::All => true,
            BlockTracker::Blocks(b) => (0..num_blocks as u32).all(|n| b.contains(n)),
        }
    }
}

/// table -> segment key -> blocks to consider
pub type CandidateSegments = HashMap<String, HashMap<String, BlockTracker>>;

/// table -> segment key -> search request
pub type SegmentRequests = HashMap<String, HashMap<String, SegmentSearchRequest>>;

/// Pruning outcome for one segment.
#[derive(Debug, Clone)]
pub struct SegmentCheck {
    pub metadata: Arc<SegmentMicroIndex>,
    pub time_passed: BTreeSet<BlockNum>,
    pub passed: BTreeMap<BlockNum, BTreeSet<String>>,  // block -> columns that passed
}

impl SegmentCheck {
    fn all_time_passed(metadata: Arc<SegmentMicroIndex>, time_passed: BTreeSet<BlockNum>) -> Self {
        let passed = time_passed.iter().map(|b| (*b, block_columns(&metadata, *b))).collect();
        SegmentCheck { metadata, time_passed, passed }
    }

    fn join(&mut self, other: SegmentCheck, op: SearchOp) {
        match op {
            SearchOp::And => {
                self.passed.retain(|b, _| other.passed.contains_key(b));
                for (b, cols) in other.passed {
                    if let Some(mine) = self.passed.get_mut(&b) {
                        mine.extend(cols);
                    }
                }
            }
            SearchOp::Or => {
                for (b, cols) in other.passed {
                    self.passed.entry(b).or_default().extend(cols);
                }
            }
            // exclusions never prune; they only contribute columns to blocks still searched
            SearchOp::Exclusion => {
                for (b, cols) in other.passed {
                    if let Some(mine) = self.passed.get_mut(&b) {
                        mine.extend(cols);
                    }
                }
            }
        }
    }
}

pub type CheckResults = HashMap<String, HashMap<String, SegmentCheck>>;

#[derive(Debug, Default)]
pub struct CmiCounters {
    pub total_blocks_checked: AtomicU64,
    pub filtered_blocks_passed: AtomicU64,
}

/// Prunes candidate blocks with block summaries, numeric ranges and bloom filters.
pub struct MicroIndexFilter {
    pub metadata: Arc<dyn BlockMetadataProvider>,
    pub pqs: Option<Arc<PersistentQueryService>>,
    pub counters: CmiCounters,
}

impl MicroIndexFilter {
    pub fn new(metadata: Arc<dyn BlockMetadataProvider>) -> Self {
        MicroIndexFilter { metadata, pqs: None, counters: CmiCounters::default() }
    }

    pub fn with_pqs(mut self, pqs: Arc<PersistentQueryService>) -> Self {
        self.pqs = Some(pqs);
        self
    }

    /// Prunes for a whole predicate tree and builds one request per segment with blocks left.
    /// Segments already recorded as empty for the query are dropped before any check.
    pub fn filter_segments(&self, candidates: &CandidateSegments, query_info: &Arc<QueryInformation>) -> SegmentRequests {
        let candidates = self.without_empty_segments(candidates, query_info);
        let candidates: &CandidateSegments = &candidates;
        let checks = self.check_node(&query_info.node, candidates, query_info);
        let mut requests = SegmentRequests::new();
        for (table, segments) in checks {
            for (segment_key, check) in segments {
                if check.passed.is_empty() {
                    self.record_empty_segment(&check, query_info);
                    continue;
                }
                let whole_segment = candidates
                    .get(&table)
                    .and_then(|segs| segs.get(&segment_key))
                    .is_some_and(|tracker| tracker.covers_all(check.metadata.num_blocks()));
                let req = SegmentSearchRequest {
                    segment_key: segment_key.clone(),
                    table_name: table.clone(),
                    metadata: check.metadata,
                    blocks_to_search: check.passed,
                    query_info: query_info.clone(),
                    whole_segment,
                };
                requests.entry(table.clone()).or_default().insert(segment_key, req);
            }
        }
        requests
    }

    fn without_empty_segments<'c>(&self, candidates: &'c CandidateSegments, query_info: &QueryInformation) -> Cow<'c, CandidateSegments> {
        let (Some(pqs), Some(pqid)) = (&self.pqs, &query_info.pqid) else {
            return Cow::Borrowed(candidates);
        };
        let is_empty = |seg: &str| pqs.is_empty_result(pqid, seg);
        if !candidates.values().flat_map(|segs| segs.keys()).any(|seg| is_empty(seg)) {
            return Cow::Borrowed(candidates);
        }
        let mut live = CandidateSegments::new();
        let mut skipped = 0usize;
        for (table, segs) in candidates {
            for (seg, tracker) in segs {
                if is_empty(seg) {
                    skipped += 1;
                    continue;
                }
                live.entry(table.clone()).or_default().insert(seg.clone(), tracker.clone());
            }
        }
        debug!(target: "segsearch::cmi", qid = query_info.qid, pqid = pqid.as_str(), skipped, "skipped segments with no results");
        Cow::Owned(live)
    }

    /// Every block overlapped the query window yet nothing survived pruning: the segment
    /// cannot match this query at any time.
    fn record_empty_segment(&self, check: &SegmentCheck, query_info: &QueryInformation) {
        let (Some(pqs), Some(pqid)) = (&self.pqs, &query_info.pqid) else {
            return;
        };
        if !check.time_passed.is_empty() && check.time_passed.len() == check.metadata.num_blocks() {
            pqs.add_empty_results(pqid, &check.metadata.segment_key);
        }
    }

    fn check_node(&self, node: &SearchNode, candidates: &CandidateSegments, query_info: &Arc<QueryInformation>) -> CheckResults {
        let mut acc: Option<CheckResults> = None;
        let mut exclusions = Vec::new();
        for (cond, op) in node.conditions() {
            let mut parts = Vec::new();
            for q in &cond.queries {
                parts.push(self.run_cmi_check(q, candidates, query_info));
            }
            for child in &cond.nodes {
                parts.push(self.check_node(child, candidates, query_info));
            }
            if op == SearchOp::Exclusion {
                exclusions.extend(parts);
                continue;
            }
            for part in parts {
                acc = Some(match acc {
                    None => part,
                    Some(mut current) => {
                        join_results(&mut current, part, op);
                        current
                    }
                });
            }
        }
        let mut result = match acc {
            Some(r) => r,
            None => self.run_cmi_check(&SearchQuery::MatchAll, candidates, query_info),
        };
        for part in exclusions {
            join_results(&mut result, part, SearchOp::Exclusion);
        }
        result
    }

    /// Checks one leaf against every candidate segment. One worker per segment; a failed
    /// worker is logged and its segment contributes no blocks.
    pub fn run_cmi_check(&self, query: &SearchQuery, candidates: &CandidateSegments, query_info: &Arc<QueryInformation>) -> CheckResults {
        let units: Vec<(&String, &String, &BlockTracker)> = candidates
            .iter()
            .flat_map(|(table, segs)| segs.iter().map(move |(seg, tracker)| (table, seg, tracker)))
            .collect();
        let (result_tx, result_rx) = bounded(units.len().max(1));
        let (error_tx, error_rx) = bounded(units.len().max(1));

        let bloom_keys = query.bloom_keys();
        let range_check = RangeCheck::from_query(query);

        rayon::scope(|s| {
            for (table, segment_key, tracker) in &units {
                let result_tx = result_tx.clone();
                let error_tx = error_tx.clone();
                let bloom_keys = &bloom_keys;
                let range_check = &range_check;
                s.spawn(move |_| {
                    match self.check_segment(query, bloom_keys.as_ref(), range_check.as_ref(), table, segment_key, tracker, query_info) {
                        Ok(check) => {
                            let _ = result_tx.send(((*table).clone(), (*segment_key).clone(), check));
                        }
                        Err(e) => {
                            let _ = error_tx.send(((*segment_key).clone(), e));
                        }
                    }
                });
            }
        });
        drop(result_tx);
        drop(error_tx);

        for (segment_key, e) in error_rx.iter() {
            error!(target: "segsearch::cmi", qid = query_info.qid, segment = %segment_key, error = %e, "micro-index check failed");
        }
        let mut results = CheckResults::new();
        for (table, segment_key, check) in result_rx.iter() {
            results.entry(table).or_default().insert(segment_key, check);
        }
        debug!(
            target: "segsearch::cmi",
            qid = query_info.qid,
            checked = self.counters.total_blocks_checked.load(Ordering::Relaxed),
            passed = self.counters.filtered_blocks_passed.load(Ordering::Relaxed),
            "micro-index check done"
        );
        results
    }

    #[allow(clippy::too_many_arguments)]
    fn check_segment(
        &self,
        query: &SearchQuery,
        bloom_keys: Option<&BloomKeys>,
        range_check: Option<&RangeCheck>,
        table: &str,
        segment_key: &str,
        tracker: &BlockTracker,
        query_info: &QueryInformation,
    ) -> Result<SegmentCheck> {
        let metadata = self.metadata.segment_micro_index(table, segment_key)?;
        let mut time_passed = BTreeSet::new();
        for (block, summary) in metadata.block_summaries.iter().enumerate() {
            let block = BlockNum::try_from(block)
                .map_err(|_| Error::corrupted(format!("segment {} has more than {} blocks", segment_key, BlockNum::MAX)))?;
            if tracker.should_process_block(block) && query_info.time_range.check_range_overlap(summary.low_ts, summary.high_ts) {
                time_passed.insert(block);
            }
        }
        if query.is_match_all() {
            return Ok(SegmentCheck::all_time_passed(metadata, time_passed));
        }

        let mut passed = BTreeMap::new();
        for block in &time_passed {
            self.counters.total_blocks_checked.fetch_add(1, Ordering::Relaxed);
            let columns = match metadata.block_index(*block) {
                Some(index) => check_block(query, bloom_keys, range_check, index),
                None => Some(block_columns(&metadata, *block)),
            };
            if let Some(columns) = columns {
                self.counters.filtered_blocks_passed.fetch_add(1, Ordering::Relaxed);
                passed.insert(*block, columns);
            }
        }
        Ok(SegmentCheck { metadata, time_passed, passed })
    }
}

fn block_columns(metadata: &SegmentMicroIndex, block: BlockNum) -> BTreeSet<String> {
    match metadata.block_index(block) {
        Some(index) => index.columns.iter().cloned().collect(),
        None => metadata.columns.clone(),
    }
}

fn join_results(into: &mut CheckResults, other: CheckResults, op: SearchOp) {
    if op == SearchOp::And {
        // a segment missing on one side failed its check there and contributes nothing
        into.retain(|table, segs| {
            segs.retain(|seg, _| other.get(table).is_some_and(|o| o.contains_key(seg)));
            !segs.is_empty()
        });
    }
    for (table, segs) in other {
        let mine = into.entry(table).or_default();
        for (seg, check) in segs {
            match mine.get_mut(&seg) {
                Some(existing) => existing.join(check, op),
                None if op == SearchOp::Or => {
                    mine.insert(seg, check);
                }
                None => {}
            }
        }
    }
}

fn bloom_passes(keys: &BloomKeys, index: &BlockMicroIndex) -> bool {
    if keys.keys.is_empty() {
        return true;
    }
    match keys.op {
        LogicalOp::And => keys.keys.iter().all(|k| index.bloom_might_contain(k)),
        // an unprobeable word may match anything
        LogicalOp::Or if keys.wildcard_exists => true,
        LogicalOp::Or => keys.keys.iter().any(|k| index.bloom_might_contain(k)),
    }
}

/// Columns of the block that may satisfy the leaf, or None when the block is pruned.
pub fn check_block(
    query: &SearchQuery,
    bloom_keys: Option<&BloomKeys>,
    range_check: Option<&RangeCheck>,
    index: &BlockMicroIndex,
) -> Option<BTreeSet<String>> {
    // a leaf that holds for absent values cannot be pruned by what the block lacks
    let matches_missing = query.matches_missing();

    match query.column() {
        None => Some(index.columns.iter().cloned().collect()),
        Some(ColumnSelector::Named(column)) => {
            if !index.has_column(&column) {
                return matches_missing.then(|| BTreeSet::from([column]));
            }
            if let (Some(check), Some(range)) = (range_check, index.ranges.get(&column)) {
                if !check.passes(range) {
                    return None;
                }
            }
            if let Some(keys) = bloom_keys {
                if !bloom_passes(keys, index) {
                    return None;
                }
            }
            Some(BTreeSet::from([column]))
        }
        Some(ColumnSelector::All) => {
            if let Some(keys) = bloom_keys {
                if !bloom_passes(keys, index) {
                    return None;
                }
            }
            let columns: BTreeSet<String> = index
                .columns
                .iter()
                .filter(|c| match (range_check, index.ranges.get(*c)) {
                    (Some(check), Some(range)) => check.passes(range),
                    _ => true,
                })
                .cloned()
                .collect();
            (!columns.is_empty()).then_some(columns)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::number::Number;
    use crate::core::types::TimeRange;
    use crate::search::query::FilterOp;
    use crate::segment::memory::{InMemoryMetadata, LogRecord, SegmentBuilder};

    // Block b holds records with latency in [b*100, b*100+9] and host "web-b".
    fn metadata() -> Arc<InMemoryMetadata> {
        let records = (0..40u64).map(|i| {
            let block = i / 10;
            LogRecord::new(1_000 + i)
                .with_field("latency", (block * 100 + i % 10) as i64)
                .with_field("host", format!("web-{}", block))
        });
        let seg = SegmentBuilder::new("logs", "seg-0")
            .block_size(10)
            .bloom_fp_rate(1e-6)
            .extend(records)
            .build();
        let meta = Arc::new(InMemoryMetadata::new());
        meta.register(seg.micro_index());
        meta
    }

    fn candidates() -> CandidateSegments {
        HashMap::from([("logs".to_string(), HashMap::from([("seg-0".to_string(), BlockTracker::All)]))])
    }

    fn passed_blocks(filter: &MicroIndexFilter, node: SearchNode) -> Vec<BlockNum> {
        let info = Arc::new(QueryInformation::new(1, node, TimeRange::all_time()));
        let reqs = filter.filter_segments(&candidates(), &info);
        reqs.get("logs")
            .and_then(|s| s.get("seg-0"))
            .map(|r| r.blocks_to_search.keys().copied().collect())
            .unwrap_or_default()
    }

    #[test]
    fn range_prunes_disjoint_blocks_only() {
        let filter = MicroIndexFilter::new(metadata());
        let q = SearchQuery::expression("latency", FilterOp::GreaterThanOrEqualTo, 209i64).unwrap();
        assert_eq!(passed_blocks(&filter, SearchNode::new().with_and(q)), vec![2, 3]);

        let between = SearchQuery::range("latency", Number::I64(109), Number::I64(200));
        assert_eq!(passed_blocks(&filter, SearchNode::new().with_and(between)), vec![1, 2]);
    }

    #[test]
    fn bloom_prunes_under_and() {
        let filter = MicroIndexFilter::new(metadata());
        let q = SearchQuery::expression("host", FilterOp::Equals, "web-2").unwrap();
        assert_eq!(passed_blocks(&filter, SearchNode::new().with_and(q)), vec![2]);

        // the bloom is block-wide: block 0 holds latency 3, so "3" is present there too
        let words = SearchQuery::words("host", &["web", "3"], LogicalOp::And).unwrap();
        assert_eq!(passed_blocks(&filter, SearchNode::new().with_and(words)), vec![0, 3]);

        let absent = SearchQuery::words("host", &["db", "web"], LogicalOp::And).unwrap();
        assert!(passed_blocks(&filter, SearchNode::new().with_and(absent)).is_empty());
    }

    #[test]
    fn or_of_leaves_unions_blocks() {
        let filter = MicroIndexFilter::new(metadata());
        let node = SearchNode::new()
            .with_or(SearchQuery::expression("host", FilterOp::Equals, "web-0").unwrap())
            .with_or(SearchQuery::expression("latency", FilterOp::Equals, 305i64).unwrap());
        assert_eq!(passed_blocks(&filter, node), vec![0, 3]);
    }

    #[test]
    fn wildcards_and_negation_never_prune() {
        let filter = MicroIndexFilter::new(metadata());
        let wild = SearchQuery::expression("host", FilterOp::Equals, "web-*").unwrap();
        assert_eq!(passed_blocks(&filter, SearchNode::new().with_and(wild)), vec![0, 1, 2, 3]);

        let SearchQuery::Match(m) = SearchQuery::words("host", &["web-9"], LogicalOp::And).unwrap() else {
            unreachable!()
        };
        let negated = SearchQuery::Match(m.negated());
        assert_eq!(passed_blocks(&filter, SearchNode::new().with_and(negated)), vec![0, 1, 2, 3]);
    }

    #[test]
    fn time_filter_and_tracker_restrict_blocks() {
        let filter = MicroIndexFilter::new(metadata());
        let info = Arc::new(QueryInformation::new(1, SearchNode::match_all(), TimeRange::new(1_015, 1_025)));
        let mut cands = candidates();
        cands.get_mut("logs").unwrap().insert("seg-0".into(), BlockTracker::from_blocks([1, 3]));
        let reqs = filter.filter_segments(&cands, &info);
        let blocks: Vec<_> = reqs["logs"]["seg-0"].blocks_to_search.keys().copied().collect();
        assert_eq!(blocks, vec![1]);
        assert!(!reqs["logs"]["seg-0"].whole_segment);
    }

    #[test]
    fn tracker_coverage() {
        assert!(BlockTracker::All.covers_all(4));
        assert!(BlockTracker::from_blocks([0, 1, 2, 3]).covers_all(4));
        assert!(!BlockTracker::from_blocks([0, 1, 3]).covers_all(4));

        let filter = MicroIndexFilter::new(metadata());
        let info = Arc::new(QueryInformation::new(1, SearchNode::match_all(), TimeRange::all_time()));
        assert!(filter.filter_segments(&candidates(), &info)["logs"]["seg-0"].whole_segment);
    }

    #[test]
    fn missing_metadata_degrades_to_no_blocks() {
        let filter = MicroIndexFilter::new(metadata());
        let mut cands = candidates();
        cands.get_mut("logs").unwrap().insert("seg-missing".into(), BlockTracker::All);
        let info = Arc::new(QueryInformation::new(1, SearchNode::match_all(), TimeRange::all_time()));
        let reqs = filter.filter_segments(&cands, &info);
        assert!(reqs["logs"].contains_key("seg-0"));
        assert!(!reqs["logs"].contains_key("seg-missing"));
    }

    #[test]
    fn exclusion_does_not_restrict() {
        let filter = MicroIndexFilter::new(metadata());
        let node = SearchNode::new()
            .with_and(SearchQuery::expression("latency", FilterOp::LessThan, 150i64).unwrap())
            .with_exclusion(SearchQuery::expression("host", FilterOp::Equals, "web-0").unwrap());
        assert_eq!(passed_blocks(&filter, node), vec![0, 1]);
    }
}
