use std::collections::BTreeMap;
use parking_lot::Mutex;
use crate::bitset::MatchBitset;
use crate::core::types::BlockNum;
use crate::results::accumulator::ResultsAccumulator;
use crate::search::query::SearchOp;
use crate::search::request::SegmentSearchRequest;

#[derive(Debug, Clone)]
pub struct MatchState {
    pub matched: MatchBitset,
    pub first_search: bool,
    pub has_any_matched: bool,
}

/// Match state of one block. Updates from concurrent leaf evaluations are serialized by the lock.
#[derive(Debug)]
pub struct BlockSearchStatus {
    pub block_num: BlockNum,
    pub num_records: u16,
    state: Mutex<MatchState>,
}

impl BlockSearchStatus {
    pub fn new(block_num: BlockNum, num_records: u16, matched: MatchBitset) -> Self {
        let has_any_matched = matched.any();
        BlockSearchStatus {
            block_num,
            num_records,
            state: Mutex::new(MatchState { matched, first_search: true, has_any_matched }),
        }
    }

    /// Seeded from a shared all-matched template, cloned and resized to the block.
    pub fn from_seed(block_num: BlockNum, num_records: u16, seed: &MatchBitset) -> Self {
        let mut matched = seed.clone();
        let n = num_records as usize;
        if matched.len() > n {
            matched.shrink(n);
        } else {
            matched.grow(n, true);
        }
        BlockSearchStatus::new(block_num, num_records, matched)
    }

    /// Composes `incoming` into the block under `op`. Any update ends the first search.
    pub fn update_matched_records(&self, incoming: &MatchBitset, op: SearchOp) {
        let mut state = self.state.lock();
        match op {
            SearchOp::And => state.matched.in_place_intersection(incoming),
            // the first OR leaf anchors the set instead of unioning into the all-matched seed
            SearchOp::Or if state.first_search => state.matched.in_place_intersection(incoming),
            SearchOp::Or => state.matched.in_place_union(incoming),
            SearchOp::Exclusion => state.matched.in_place_difference(incoming),
        }
        state.first_search = false;
        state.has_any_matched = state.matched.any();
    }

    /// Composes a negated leaf. `positive` holds every record the un-negated filter matches.
    pub fn apply_negated(&self, positive: &MatchBitset, op: SearchOp) {
        let mut complement = positive.clone();
        complement.grow(self.num_records as usize, false);
        complement.flip_all();
        let mut state = self.state.lock();
        match op {
            SearchOp::And => state.matched.in_place_intersection(&complement),
            SearchOp::Or if state.first_search => state.matched.in_place_intersection(&complement),
            // records the filter matches are cleared, the rest become matched
            SearchOp::Or => state.matched = complement,
            SearchOp::Exclusion => state.matched.in_place_intersection(positive),
        }
        state.first_search = false;
        state.has_any_matched = state.matched.any();
    }

    pub fn record_iterator(&self, op: SearchOp) -> RecordIterator {
        let state = self.state.lock();
        RecordIterator {
            bits: state.matched.clone(),
            num_records: self.num_records as usize,
            inverted: op == SearchOp::Or && !state.first_search,
        }
    }

    /// Snapshot of the matched bits. Aggregation iterates this copy while clearing bits on the original.
    pub fn record_iterator_copy(&self) -> MatchBitset {
        self.state.lock().matched.clone()
    }

    pub fn unset_record(&self, record: usize) {
        let mut state = self.state.lock();
        state.matched.clear_bit(record);
    }

    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.matched.reset_all();
        state.has_any_matched = false;
    }

    pub fn matched_count(&self) -> usize {
        self.state.lock().matched.count()
    }

    pub fn has_any_matched(&self) -> bool {
        self.state.lock().has_any_matched
    }

    pub fn is_first_search(&self) -> bool {
        self.state.lock().first_search
    }

    pub fn snapshot(&self) -> MatchState {
        self.state.lock().clone()
    }

    pub fn into_matched(self) -> MatchBitset {
        self.state.into_inner().matched
    }
}

/// Which records a leaf still has to evaluate under a given op.
#[derive(Debug, Clone)]
pub struct RecordIterator {
    bits: MatchBitset,
    num_records: usize,
    inverted: bool,  // OR after the first leaf: only records not yet matched
}

impl RecordIterator {
    pub fn should_process(&self, record: usize) -> bool {
        if record >= self.num_records {
            return false;
        }
        self.bits.is_set(record) != self.inverted
    }

    pub fn records(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.num_records).filter(|r| self.should_process(*r))
    }

    pub fn is_inverted(&self) -> bool {
        self.inverted
    }
}

/// Match state of every block of one segment that is still being searched.
#[derive(Debug, Default)]
pub struct SegmentSearchStatus {
    pub blocks: BTreeMap<BlockNum, BlockSearchStatus>,
    pub num_blocks_to_search: usize,
    pub num_blocks_in_seg_file: usize,
    pub read_errors: u64,  // column reads that failed; matches may be missing
}

impl SegmentSearchStatus {
    /// Blocks that overlap the query window, survived pruning and are still wanted by the
    /// accumulator start fully matched. Everything else is left out entirely.
    pub fn init_blocks_to_search(
        req: &SegmentSearchRequest,
        acc: &dyn ResultsAccumulator,
        seed: &MatchBitset,
    ) -> Self {
        let mut status = SegmentSearchStatus {
            num_blocks_in_seg_file: req.metadata.num_blocks(),
            ..Default::default()
        };
        for (block, summary) in req.block_summaries().iter().enumerate() {
            let block = block as BlockNum;
            if !req.time_range().check_range_overlap(summary.low_ts, summary.high_ts) {
                continue;
            }
            if !req.should_search_block(block) {
                continue;
            }
            if !acc.should_search_range(summary.low_ts, summary.high_ts) {
                acc.set_early_exit(true);
                continue;
            }
            status.blocks.insert(block, BlockSearchStatus::from_seed(block, summary.record_count, seed));
        }
        status.num_blocks_to_search = status.blocks.len();
        status
    }

    /// Same block selection without admission control; used when only counts are needed.
    pub fn init_blocks_for_aggs_fast_path(req: &SegmentSearchRequest) -> Self {
        let mut status = SegmentSearchStatus {
            num_blocks_in_seg_file: req.metadata.num_blocks(),
            ..Default::default()
        };
        for (block, summary) in req.block_summaries().iter().enumerate() {
            let block = block as BlockNum;
            if req.should_search_block(block) && req.time_range().check_range_overlap(summary.low_ts, summary.high_ts) {
                let matched = MatchBitset::all_set(summary.record_count as usize);
                status.blocks.insert(block, BlockSearchStatus::new(block, summary.record_count, matched));
            }
        }
        status.num_blocks_to_search = status.blocks.len();
        status
    }

    /// Status built from cached bitsets, limited to the blocks the request wants in its window.
    pub fn init_from_pqmr(req: &SegmentSearchRequest, cached: &BTreeMap<BlockNum, MatchBitset>) -> Self {
        let mut status = SegmentSearchStatus {
            num_blocks_in_seg_file: req.metadata.num_blocks(),
            ..Default::default()
        };
        for (block, bits) in cached {
            let Some(summary) = req.metadata.block_summary(*block) else {
                continue;
            };
            if !req.should_search_block(*block) || !req.time_range().check_range_overlap(summary.low_ts, summary.high_ts) {
                continue;
            }
            let mut matched = bits.clone();
            let n = summary.record_count as usize;
            matched.shrink(n);
            matched.grow(n, false);
            status.blocks.insert(*block, BlockSearchStatus::new(*block, summary.record_count, matched));
        }
        status.num_blocks_to_search = status.blocks.len();
        status
    }

    /// Fresh all-matched status over `blocks`, used to evaluate a nested node.
    pub fn child_for_blocks(&self, blocks: &[BlockNum]) -> SegmentSearchStatus {
        let mut child = SegmentSearchStatus {
            num_blocks_in_seg_file: self.num_blocks_in_seg_file,
            ..Default::default()
        };
        for block in blocks {
            if let Some(b) = self.blocks.get(block) {
                let matched = MatchBitset::all_set(b.num_records as usize);
                child.blocks.insert(*block, BlockSearchStatus::new(*block, b.num_records, matched));
            }
        }
        child.num_blocks_to_search = child.blocks.len();
        child
    }

    /// A status whose evaluation lost column reads must not be persisted.
    pub fn is_degraded(&self) -> bool {
        self.read_errors > 0
    }

    /// Merges a child's result into this status under `op`, for the given blocks only.
    /// AND treats a block missing from the child as matching nothing; EXCLUSION as excluding nothing.
    pub fn merge_child(&mut self, child: SegmentSearchStatus, op: SearchOp, blocks: &[BlockNum]) {
        let mut child_blocks = child.blocks;
        for block in blocks {
            let incoming = child_blocks.remove(block);
            if let Some(mine) = self.blocks.get(block) {
                match incoming {
                    Some(theirs) => mine.update_matched_records(&theirs.into_matched(), op),
                    None if op == SearchOp::And => mine.reset(),
                    None => {}
                }
                continue;
            }
            if let (Some(theirs), SearchOp::Or) = (incoming, op) {
                let fresh = BlockSearchStatus::new(*block, theirs.num_records, theirs.into_matched());
                // later OR merges union into this block
                fresh.state.lock().first_search = false;
                self.blocks.insert(*block, fresh);
            }
        }
    }

    pub fn block(&self, block: BlockNum) -> Option<&BlockSearchStatus> {
        self.blocks.get(&block)
    }

    pub fn block_nums(&self) -> Vec<BlockNum> {
        self.blocks.keys().copied().collect()
    }

    /// Block numbers in the visiting order of a sort: ascending or descending.
    pub fn sorted_block_nums(&self, ascending: bool) -> Vec<BlockNum> {
        let mut blocks = self.block_nums();
        if !ascending {
            blocks.reverse();
        }
        blocks
    }

    pub fn total_matched(&self) -> u64 {
        self.blocks.values().map(|b| b.matched_count() as u64).sum()
    }

    /// Invalid node: nothing in this segment can match.
    pub fn reset_all_blocks(&self) {
        for b in self.blocks.values() {
            b.reset();
        }
    }

    pub fn matched_bitsets(&self) -> BTreeMap<BlockNum, MatchBitset> {
        self.blocks.iter().map(|(k, b)| (*k, b.record_iterator_copy())).collect()
    }
}
