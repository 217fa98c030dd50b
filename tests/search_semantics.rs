//! Predicate tree semantics of raw segment search:
//! - the first OR leaf anchors the match set, later ones union
//! - exclusions only clear bits, AND leaves commute
//! - dictionary and record evaluation agree
//! - time windows are inclusive at both ends

mod common;

use common::*;
use proptest::prelude::*;
use segsearch::aggregation::QueryAggregators;
use segsearch::core::error::ErrorKind;
use segsearch::core::types::TimeRange;
use segsearch::results::SearchResults;
use segsearch::search::query::MatchFilter;
use segsearch::search::{ColumnSelector, FilterOp, LogicalOp, QueryContext, SearchNode, SearchQuery, SegmentTask};
use segsearch::segment::memory::{InMemorySegment, LogRecord, SegmentBuilder};
use std::sync::Arc;

// =============================================================================
// Helper Functions
// =============================================================================

const PER_BLOCK: usize = 10;

fn results() -> SearchResults {
    SearchResults::new(1_000, &QueryAggregators::default(), "timestamp")
}

/// Segment-wide record numbers matched by `node`.
fn matched_records(seg: &InMemorySegment, node: SearchNode) -> Vec<usize> {
    let req = full_request(seg, query_info(1, node, TimeRange::all_time()));
    let status = executor().raw_search_segment(&req, seg, &results()).unwrap();
    status
        .blocks
        .iter()
        .flat_map(|(b, blk)| {
            let base = *b as usize * PER_BLOCK;
            blk.record_iterator_copy().iter_set().map(move |r| base + r).collect::<Vec<_>>()
        })
        .collect()
}

fn eq(column: &str, value: &str) -> SearchQuery {
    SearchQuery::expression(column, FilterOp::Equals, value).unwrap()
}

fn not_level(level: &str) -> SearchQuery {
    SearchQuery::Match(
        MatchFilter::new(ColumnSelector::named("level"), vec![level.to_string()], LogicalOp::And)
            .unwrap()
            .negated(),
    )
}

fn expected(n: usize, pred: impl Fn(usize) -> bool) -> Vec<usize> {
    (0..n).filter(|i| pred(*i)).collect()
}

// =============================================================================
// Composition Tests
// =============================================================================

/// A lone OR leaf yields exactly its own matches.
#[test]
fn test_first_or_leaf_anchors() {
    let seg = log_segment("seg-or", 2, PER_BLOCK, 1_000);
    let node = SearchNode::new().with_or(eq("host", "web-1"));
    assert_eq!(matched_records(&seg, node), expected(20, |i| i % 4 == 1));
}

/// Later OR leaves add to the set.
#[test]
fn test_or_leaves_union() {
    let seg = log_segment("seg-or", 2, PER_BLOCK, 1_000);
    let node = SearchNode::new().with_or(eq("host", "web-1")).with_or(eq("host", "web-2"));
    assert_eq!(matched_records(&seg, node), expected(20, |i| i % 4 == 1 || i % 4 == 2));
}

/// An exclusion of one record keeps the other nine.
#[test]
fn test_exclusion_clears_only_excluded() {
    let seg = log_segment("seg-excl", 1, PER_BLOCK, 1_000);
    let node = SearchNode::new().with_exclusion(SearchQuery::expression("latency", FilterOp::Equals, 30i64).unwrap());
    let matched = matched_records(&seg, node);
    assert_eq!(matched.len(), 9);
    assert!(!matched.contains(&3));
}

/// OR leaves after an AND leaf only widen within the AND matches.
#[test]
fn test_or_within_and() {
    let seg = log_segment("seg-mixed", 2, PER_BLOCK, 1_000);
    let node = SearchNode::new()
        .with_and(eq("level", "info"))
        .with_or(eq("host", "web-1"))
        .with_or(eq("host", "web-2"));
    assert_eq!(matched_records(&seg, node), expected(20, |i| i % 4 == 2));
}

/// A nested OR node merged under AND.
#[test]
fn test_nested_or_node_under_and() {
    let seg = log_segment("seg-nested", 2, PER_BLOCK, 1_000);
    let inner = SearchNode::new().with_or(eq("host", "web-0")).with_or(eq("host", "web-3"));
    let node = SearchNode::new()
        .with_and(SearchQuery::expression("latency", FilterOp::GreaterThanOrEqualTo, 100i64).unwrap())
        .with_and_node(inner);
    assert_eq!(matched_records(&seg, node), expected(20, |i| i >= 10 && (i % 4 == 0 || i % 4 == 3)));
}

/// A negated AND leaf keeps the complement.
#[test]
fn test_negated_and_leaf() {
    let seg = log_segment("seg-neg", 2, PER_BLOCK, 1_000);
    let node = SearchNode::new().with_and(not_level("info"));
    assert_eq!(matched_records(&seg, node), expected(20, |i| i % 2 == 1));
}

/// A negated OR leaf after another OR leaf replaces the set with its complement.
#[test]
fn test_negated_or_leaf_takes_complement() {
    let seg = log_segment("seg-neg", 2, PER_BLOCK, 1_000);
    let node = SearchNode::new().with_or(eq("host", "web-0")).with_or(not_level("error"));
    // the web-0 matches are replaced by every record that is not an error
    assert_eq!(matched_records(&seg, node), expected(20, |i| i % 2 == 0));
}

/// A leaf on a column the segment never had makes the whole node match nothing.
#[test]
fn test_missing_column_invalidates_node() {
    let seg = log_segment("seg-missing", 2, PER_BLOCK, 1_000);
    let node = SearchNode::new().with_and(eq("level", "info")).with_and(eq("datacenter", "eu-1"));
    assert!(matched_records(&seg, node).is_empty());
}

// =============================================================================
// Evaluation Path Tests
// =============================================================================

/// Dictionary-encoded blocks give the same answer as plain records.
#[test]
fn test_dictionary_matches_record_path() {
    let records: Vec<LogRecord> = (0..40u64)
        .map(|i| {
            LogRecord::new(1_000 + i)
                .with_field("level", ["info", "warn", "error"][i as usize % 3])
                .with_field("host", format!("web-{}", i % 5))
        })
        .collect();
    let plain = SegmentBuilder::new(TABLE, "seg-plain").block_size(PER_BLOCK).extend(records.clone()).build();
    let dict = SegmentBuilder::new(TABLE, "seg-dict").block_size(PER_BLOCK).dict_threshold(8).extend(records).build();

    let nodes = [
        SearchNode::new().with_and(eq("level", "warn")),
        SearchNode::new().with_or(eq("host", "web-4")).with_or(eq("level", "error")),
        SearchNode::new().with_and(SearchQuery::expression("host", FilterOp::Equals, "web-*").unwrap()).with_exclusion(eq("host", "web-2")),
        SearchNode::new().with_and(SearchQuery::any_column(FilterOp::Equals, "info").unwrap()),
    ];
    for node in nodes {
        assert_eq!(matched_records(&plain, node.clone()), matched_records(&dict, node));
    }
}

fn leaf_pool(threshold: i64) -> Vec<SearchQuery> {
    vec![
        eq("level", "info"),
        eq("level", "error"),
        eq("host", "web-1"),
        eq("host", "web-2"),
        SearchQuery::expression("latency", FilterOp::GreaterThanOrEqualTo, threshold).unwrap(),
        SearchQuery::expression("latency", FilterOp::LessThan, threshold).unwrap(),
        not_level("error"),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Reordering AND leaves never changes the result.
    #[test]
    fn test_and_leaves_commute(picks in proptest::collection::vec(0usize..7, 1..5), threshold in 0i64..300) {
        let seg = log_segment("seg-prop", 3, PER_BLOCK, 1_000);
        let pool = leaf_pool(threshold);
        let forward = picks.iter().fold(SearchNode::new(), |n, i| n.with_and(pool[*i].clone()));
        let backward = picks.iter().rev().fold(SearchNode::new(), |n, i| n.with_and(pool[*i].clone()));
        prop_assert_eq!(matched_records(&seg, forward), matched_records(&seg, backward));
    }
}

// =============================================================================
// Time Window Tests
// =============================================================================

/// Records exactly on the window edges are counted, on both the fast path and the full path.
#[test]
fn test_window_edges_are_inclusive() {
    let seg = log_segment("seg-time", 2, PER_BLOCK, 1_000);
    let ex = executor();
    let window = TimeRange::new(1_009, 1_010);

    let acc = results();
    let req = full_request(&seg, query_info(1, SearchNode::match_all(), window));
    assert_eq!(ex.search_segment(&req, &seg, &acc).unwrap(), 2);

    let acc = results();
    let node = SearchNode::new().with_and(SearchQuery::expression("latency", FilterOp::GreaterThanOrEqualTo, 0i64).unwrap());
    let req = full_request(&seg, query_info(2, node, window));
    assert_eq!(ex.search_segment(&req, &seg, &acc).unwrap(), 2);
    assert_eq!(acc.total_matched(), 2);
}

// =============================================================================
// Multi-Segment Tests
// =============================================================================

fn tasks(keys: &[&str], node: SearchNode) -> Vec<SegmentTask> {
    let info = query_info(9, node, TimeRange::all_time());
    keys.iter()
        .map(|k| {
            let seg = log_segment(k, 2, PER_BLOCK, 1_000);
            SegmentTask { request: full_request(&seg, info.clone()), reader: Arc::new(seg) }
        })
        .collect()
}

/// Counts from every segment add up.
#[test]
fn test_segments_are_summed() {
    let ctx = QueryContext::new(9);
    let acc = results();
    let total = executor()
        .search_segments(&ctx, &tasks(&["a", "b", "c"], SearchNode::new().with_and(eq("level", "error"))), &acc)
        .unwrap();
    assert_eq!(total, 30);
    assert_eq!(acc.total_matched(), 30);
}

/// A cancelled query fails with Cancelled and starts no segment.
#[test]
fn test_cancelled_query() {
    let ctx = QueryContext::new(9);
    ctx.cancel();
    let acc = results();
    let err = executor()
        .search_segments(&ctx, &tasks(&["a", "b"], SearchNode::new().with_and(eq("level", "error"))), &acc)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Cancelled);
    assert_eq!(acc.total_matched(), 0);
}
