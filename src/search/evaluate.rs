use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use parking_lot::Mutex;
use crate::bitset::MatchBitset;
use crate::core::error::Error;
use crate::core::types::{BlockNum, RecordNum};
use crate::search::query::{ColumnSelector, SearchOp, SearchQuery};
use crate::search::status::BlockSearchStatus;
use crate::segment::reader::{BlockDictionary, ColumnReader};

/// Decode failures of one segment search, reported once.
#[derive(Debug, Default)]
pub struct ErrorBatch {
    pub count: u64,
    pub first: Option<Error>,
}

impl ErrorBatch {
    pub fn record(&mut self, error: Error) {
        self.count += 1;
        if self.first.is_none() {
            self.first = Some(error);
        }
    }

    pub fn merge(&mut self, other: ErrorBatch) {
        self.count += other.count;
        if self.first.is_none() {
            self.first = other.first;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// One error summarizing the batch.
    pub fn summarize(&self, segment_key: &str) -> Option<Error> {
        let first = self.first.as_ref()?;
        Some(Error::new(
            first.kind,
            format!("{} column read errors in {}, first: {}", self.count, segment_key, first.context),
        ))
    }
}

/// How often each column satisfied an all-columns leaf. Columns that match more often are tried first.
#[derive(Debug, Default)]
pub struct ColumnUsage {
    counts: Mutex<HashMap<String, u64>>,
}

impl ColumnUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, column: &str, matches: u64) {
        if matches == 0 {
            return;
        }
        *self.counts.lock().entry(column.to_string()).or_insert(0) += matches;
    }

    pub fn count(&self, column: &str) -> u64 {
        self.counts.lock().get(column).copied().unwrap_or(0)
    }

    /// `columns` by descending match count, ties in name order.
    pub fn ordered(&self, columns: &BTreeSet<String>) -> Vec<String> {
        let counts = self.counts.lock();
        let mut out: Vec<String> = columns.iter().cloned().collect();
        out.sort_by(|a, b| {
            let ca = counts.get(a).copied().unwrap_or(0);
            let cb = counts.get(b).copied().unwrap_or(0);
            cb.cmp(&ca).then_with(|| a.cmp(b))
        });
        out
    }
}

/// Per-block view of one column. Dictionaries small enough to evaluate once per distinct
/// value resolve the whole block when no value, or every value, satisfies the leaf.
enum ColumnLookup<'a> {
    NoMatch,
    AllMatch,
    Dictionary { dict: Arc<BlockDictionary>, hits: Vec<bool> },
    Records(&'a str),
}

/// Evaluates leaf predicates of one segment block by block.
pub struct LeafEvaluator<'a> {
    pub reader: &'a dyn ColumnReader,
    pub dict_max_entries: usize,
    pub usage: &'a ColumnUsage,
}

impl<'a> LeafEvaluator<'a> {
    pub fn new(reader: &'a dyn ColumnReader, dict_max_entries: usize, usage: &'a ColumnUsage) -> Self {
        LeafEvaluator { reader, dict_max_entries, usage }
    }

    /// Evaluates `query` on one block and folds the matches into its status under `op`.
    /// `cmi_columns` are the columns an all-columns leaf has to look at.
    pub fn apply_leaf(
        &self,
        query: &SearchQuery,
        op: SearchOp,
        status: &BlockSearchStatus,
        cmi_columns: &BTreeSet<String>,
        errors: &mut ErrorBatch,
    ) {
        let num_records = status.num_records as usize;
        if query.is_match_all() {
            status.update_matched_records(&MatchBitset::all_set(num_records), op);
            return;
        }
        if query.is_negated() {
            let positive = self.evaluate(query, status.block_num, num_records, 0..num_records, cmi_columns, errors);
            status.apply_negated(&positive, op);
            return;
        }
        let iter = status.record_iterator(op);
        let matched = self.evaluate(query, status.block_num, num_records, iter.records(), cmi_columns, errors);
        status.update_matched_records(&matched, op);
    }

    /// Positive matches of `query` among `records`.
    pub fn evaluate(
        &self,
        query: &SearchQuery,
        block: BlockNum,
        num_records: usize,
        records: impl Iterator<Item = usize>,
        cmi_columns: &BTreeSet<String>,
        errors: &mut ErrorBatch,
    ) -> MatchBitset {
        let mut matched = MatchBitset::new(num_records);
        let (columns, all_columns) = match query.column() {
            None => return MatchBitset::all_set(num_records),
            Some(ColumnSelector::Named(c)) => (vec![c], false),
            Some(ColumnSelector::All) => (self.usage.ordered(cmi_columns), true),
        };
        let lookups: Vec<(usize, ColumnLookup)> = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (i, self.lookup_for(query, c, block, num_records)))
            .filter(|(_, lookup)| !matches!(lookup, ColumnLookup::NoMatch))
            .collect();
        if lookups.is_empty() {
            return matched;
        }
        let mut hits_per_column = vec![0u64; columns.len()];

        for record in records {
            for (i, lookup) in &lookups {
                let hit = match lookup {
                    ColumnLookup::NoMatch => false,
                    ColumnLookup::AllMatch => true,
                    ColumnLookup::Dictionary { dict, hits } => dict
                        .codes
                        .get(record)
                        .is_some_and(|code| hits.get(*code as usize).copied().unwrap_or(false)),
                    ColumnLookup::Records(column) => match self.reader.read_value(column, block, record as RecordNum) {
                        Ok(value) => query.matches_value(&value),
                        Err(e) => {
                            errors.record(e);
                            false
                        }
                    },
                };
                if hit {
                    matched.add_matched_record(record);
                    hits_per_column[*i] += 1;
                    break;
                }
            }
        }

        if all_columns {
            for (column, hits) in columns.iter().zip(hits_per_column) {
                self.usage.add(column, hits);
            }
        }
        matched
    }

    fn lookup_for<'c>(&self, query: &SearchQuery, column: &'c str, block: BlockNum, num_records: usize) -> ColumnLookup<'c> {
        match self.reader.dictionary(column, block) {
            Some(dict) if dict.values.len() <= self.dict_max_entries => {
                let hits: Vec<bool> = dict.values.iter().map(|v| query.matches_value(v)).collect();
                if !hits.contains(&true) {
                    ColumnLookup::NoMatch
                } else if !hits.contains(&false) && dict.codes.len() >= num_records {
                    ColumnLookup::AllMatch
                } else {
                    ColumnLookup::Dictionary { dict, hits }
                }
            }
            _ => ColumnLookup::Records(column),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use crate::core::error::ErrorKind;
    use crate::core::types::ColumnValue;
    use crate::search::query::{FilterOp, LogicalOp};
    use crate::segment::memory::{InMemorySegment, LogRecord, SegmentBuilder};

    const LEVELS: [&str; 4] = ["info", "warn", "error", "debug"];

    fn segment(dict_threshold: usize) -> InMemorySegment {
        SegmentBuilder::new("logs", "seg0")
            .block_size(8)
            .dict_threshold(dict_threshold)
            .extend((0..16u64).map(|i| {
                LogRecord::new(1_000 + i)
                    .with_field("level", LEVELS[i as usize % 4])
                    .with_field("msg", format!("user {} logged in", i % 3))
            }))
            .build()
    }

    fn all_columns() -> BTreeSet<String> {
        BTreeSet::from(["level".to_string(), "msg".to_string()])
    }

    fn evaluate(seg: &InMemorySegment, dict_max: usize, query: &SearchQuery, block: BlockNum) -> Vec<usize> {
        let usage = ColumnUsage::new();
        let eval = LeafEvaluator::new(seg, dict_max, &usage);
        let mut errors = ErrorBatch::default();
        eval.evaluate(query, block, 8, 0..8, &all_columns(), &mut errors).iter_set().collect()
    }

    #[test]
    fn dictionary_and_record_paths_agree() {
        let seg = segment(4);
        let q = SearchQuery::expression("level", FilterOp::Equals, "error").unwrap();
        assert_eq!(evaluate(&seg, 1024, &q, 0), vec![2, 6]);
        assert_eq!(evaluate(&seg, 0, &q, 0), vec![2, 6]);
    }

    #[test]
    fn dictionary_resolves_whole_block() {
        let seg = segment(4);
        let usage = ColumnUsage::new();
        let eval = LeafEvaluator::new(&seg, 1024, &usage);
        let mut errors = ErrorBatch::default();
        let visited = std::cell::Cell::new(0);
        let records = || (0..8).inspect(|_| visited.set(visited.get() + 1));

        let none = SearchQuery::expression("level", FilterOp::Equals, "fatal").unwrap();
        assert_eq!(eval.evaluate(&none, 0, 8, records(), &all_columns(), &mut errors).count(), 0);
        assert_eq!(visited.get(), 0);

        let every = SearchQuery::expression("level", FilterOp::NotEquals, "fatal").unwrap();
        assert_eq!(eval.evaluate(&every, 0, 8, records(), &all_columns(), &mut errors).count(), 8);
        assert!(errors.is_empty());
    }

    #[test]
    fn negated_leaf_applies_complement() {
        let seg = segment(4);
        let usage = ColumnUsage::new();
        let eval = LeafEvaluator::new(&seg, 1024, &usage);
        let status = BlockSearchStatus::new(0, 8, MatchBitset::all_set(8));
        let q = SearchQuery::Match(
            crate::search::query::MatchFilter::new(ColumnSelector::named("level"), vec!["info".into()], LogicalOp::And)
                .unwrap()
                .negated(),
        );
        let mut errors = ErrorBatch::default();
        eval.apply_leaf(&q, SearchOp::And, &status, &all_columns(), &mut errors);
        assert_eq!(status.record_iterator_copy().iter_set().collect::<Vec<_>>(), vec![1, 2, 3, 5, 6, 7]);
    }

    #[test]
    fn or_leaf_only_reads_unmatched_records() {
        let seg = segment(0).with_failing_column("msg");
        let usage = ColumnUsage::new();
        let eval = LeafEvaluator::new(&seg, 1024, &usage);
        let status = BlockSearchStatus::new(0, 8, MatchBitset::all_set(8));
        status.update_matched_records(&MatchBitset::from_indices(8, [0, 1, 2, 3, 4, 5]), SearchOp::Or);

        let mut errors = ErrorBatch::default();
        let q = SearchQuery::words("msg", &["user"], LogicalOp::And).unwrap();
        eval.apply_leaf(&q, SearchOp::Or, &status, &all_columns(), &mut errors);
        // only records 6 and 7 were still unmatched
        assert_eq!(errors.count, 2);
        assert_eq!(status.matched_count(), 6);
        let err = errors.summarize("seg0").unwrap();
        assert_eq!(err.kind, ErrorKind::Io);
        assert!(err.context.starts_with("2 column read errors in seg0"));
    }

    #[test]
    fn all_columns_short_circuit_and_track_usage() {
        let seg = segment(0);
        let usage = ColumnUsage::new();
        let eval = LeafEvaluator::new(&seg, 1024, &usage);
        let mut errors = ErrorBatch::default();
        let q = SearchQuery::any_column(FilterOp::Equals, "warn").unwrap();
        let matched = eval.evaluate(&q, 0, 8, 0..8, &all_columns(), &mut errors);
        assert_eq!(matched.iter_set().collect::<Vec<_>>(), vec![1, 5]);
        assert_eq!(usage.count("level"), 2);
        assert_eq!(usage.count("msg"), 0);
        assert_eq!(usage.ordered(&all_columns()), vec!["level".to_string(), "msg".to_string()]);

        usage.add("msg", 10);
        assert_eq!(usage.ordered(&all_columns())[0], "msg");
    }

    #[test]
    fn error_batch_keeps_first() {
        let mut a = ErrorBatch::default();
        a.record(Error::not_found("a"));
        let mut b = ErrorBatch::default();
        b.record(Error::corrupted("b"));
        b.record(Error::corrupted("c"));
        a.merge(b);
        assert_eq!(a.count, 3);
        assert_eq!(a.first.unwrap().context, "a");
    }

    fn value_strategy() -> impl Strategy<Value = ColumnValue> {
        prop_oneof![
            Just(ColumnValue::Null),
            (0i64..6).prop_map(ColumnValue::Signed),
            prop::sample::select(vec!["a", "b", "a b", "c"]).prop_map(ColumnValue::from),
        ]
    }

    fn query_strategy() -> impl Strategy<Value = SearchQuery> {
        prop_oneof![
            (0i64..6).prop_map(|v| SearchQuery::expression("v", FilterOp::GreaterThan, v).unwrap()),
            (0i64..6).prop_map(|v| SearchQuery::expression("v", FilterOp::Equals, v).unwrap()),
            prop::sample::select(vec!["a", "b", "c"])
                .prop_map(|w| SearchQuery::words("v", &[w], LogicalOp::And).unwrap()),
            prop::sample::select(vec!["a", "a*", "c"])
                .prop_map(|w| SearchQuery::expression("v", FilterOp::NotEquals, w).unwrap()),
        ]
    }

    proptest! {
        #[test]
        fn dictionary_fast_path_matches_record_level(
            values in prop::collection::vec(value_strategy(), 1..40),
            query in query_strategy(),
        ) {
            let n = values.len();
            let seg = SegmentBuilder::new("t", "s")
                .block_size(n)
                .dict_threshold(64)
                .extend(values.iter().enumerate().map(|(i, v)| {
                    let mut r = LogRecord::new(i as u64);
                    r.fields.insert("v".to_string(), v.clone());
                    r
                }))
                .build();
            let usage = ColumnUsage::new();
            let columns = BTreeSet::from(["v".to_string()]);
            let mut errors = ErrorBatch::default();
            let fast = LeafEvaluator::new(&seg, 1024, &usage).evaluate(&query, 0, n, 0..n, &columns, &mut errors);
            let slow = LeafEvaluator::new(&seg, 0, &usage).evaluate(&query, 0, n, 0..n, &columns, &mut errors);
            prop_assert_eq!(fast, slow);
            prop_assert!(errors.is_empty());
        }
    }
}
