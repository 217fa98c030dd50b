use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::Rng;
use segsearch::aggregation::{QueryAggregators, TimeHistogramRequest};
use segsearch::core::config::SearchConfig;
use segsearch::core::types::TimeRange;
use segsearch::pqs::{PersistentQueryService, QueryPersistenceTracker, QueryUsageTracker};
use segsearch::results::SearchResults;
use segsearch::search::{FilterOp, LogicalOp, QueryInformation, RawSearchExecutor, SearchNode, SearchQuery, SegmentSearchRequest};
use segsearch::segment::blob::LocalBlobStore;
use segsearch::segment::memory::{InMemorySegment, LogRecord, SegmentBuilder};
use std::sync::Arc;

const LEVELS: [&str; 4] = ["info", "warn", "error", "debug"];

/// Helper to build a segment of random log records
fn create_segment(key: &str, records: usize, dict_threshold: usize) -> InMemorySegment {
    let mut rng = rand::thread_rng();
    let rows: Vec<LogRecord> = (0..records as u64)
        .map(|i| {
            let latency: i64 = rng.gen_range(0..2_000);
            LogRecord::new(1_700_000_000_000 + i * 10)
                .with_field("level", LEVELS[rng.gen_range(0..LEVELS.len())])
                .with_field("host", format!("web-{}", rng.gen_range(0..16)))
                .with_field("latency", latency)
                .with_field("msg", format!("GET /api/items/{} took {}ms", rng.gen_range(0..10_000), latency))
        })
        .collect();
    SegmentBuilder::new("logs", key)
        .block_size(1_024)
        .dict_threshold(dict_threshold)
        .extend(rows)
        .build()
}

fn request(seg: &InMemorySegment, node: SearchNode, aggs: QueryAggregators, pqid: Option<&str>) -> SegmentSearchRequest {
    let mut info = QueryInformation::new(1, node, TimeRange::all_time())
        .with_parallelism(num_cpus::get())
        .with_aggregators(aggs);
    if let Some(pqid) = pqid {
        info = info.with_pqid(pqid);
    }
    SegmentSearchRequest::full_segment(seg.micro_index(), Arc::new(info))
}

fn error_node() -> SearchNode {
    SearchNode::new()
        .with_and(SearchQuery::expression("level", FilterOp::Equals, "error").unwrap())
        .with_and(SearchQuery::expression("latency", FilterOp::GreaterThan, 500i64).unwrap())
}

/// Benchmark raw search over segment sizes
fn bench_raw_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("raw_search");
    let executor = RawSearchExecutor::new(SearchConfig::default());

    for records in [10_000, 50_000, 200_000].iter() {
        let seg = create_segment("seg-raw", *records, 0);
        let req = request(&seg, error_node(), QueryAggregators::default(), None);
        group.bench_with_input(BenchmarkId::from_parameter(records), records, |b, _| {
            b.iter(|| {
                let acc = SearchResults::new(100, req.aggregators(), "timestamp");
                black_box(executor.search_segment(&req, &seg, &acc).unwrap());
            });
        });
    }
    group.finish();
}

/// Benchmark dictionary evaluation against record-by-record evaluation
fn bench_dictionary_fast_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("dictionary_fast_path");
    let executor = RawSearchExecutor::new(SearchConfig::default());
    let node = SearchNode::new().with_and(SearchQuery::expression("host", FilterOp::Equals, "web-3").unwrap());

    for (name, threshold) in [("records", 0usize), ("dictionary", 64)] {
        let seg = create_segment("seg-dict", 100_000, threshold);
        let req = request(&seg, node.clone(), QueryAggregators::default(), None);
        group.bench_function(name, |b| {
            b.iter(|| {
                let acc = SearchResults::new(100, req.aggregators(), "timestamp");
                black_box(executor.search_segment(&req, &seg, &acc).unwrap());
            });
        });
    }
    group.finish();
}

/// Benchmark cached results against a raw search of the same query
fn bench_persistent_query(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let config = SearchConfig::with_data_dir(dir.path());
    let pqs = PersistentQueryService::new(&config, Arc::new(LocalBlobStore)).unwrap();
    let tracker = Arc::new(QueryUsageTracker::new(1));
    tracker.record_usage("bench-words");
    let cached = RawSearchExecutor::new(config.clone()).with_pqs(pqs).with_tracker(tracker);
    let raw = RawSearchExecutor::new(config);

    let seg = create_segment("seg-pqs", 100_000, 0);
    let node = SearchNode::new().with_and(SearchQuery::words("msg", &["took", "GET"], LogicalOp::And).unwrap());
    let req = request(&seg, node, QueryAggregators::default(), Some("bench-words"));

    // first run backfills the cache
    let acc = SearchResults::new(100, req.aggregators(), "timestamp");
    cached.search_segment(&req, &seg, &acc).unwrap();

    let mut group = c.benchmark_group("persistent_query");
    group.bench_function("raw", |b| {
        b.iter(|| {
            let acc = SearchResults::new(100, req.aggregators(), "timestamp");
            black_box(raw.search_segment(&req, &seg, &acc).unwrap());
        });
    });
    group.bench_function("cached", |b| {
        b.iter(|| {
            let acc = SearchResults::new(100, req.aggregators(), "timestamp");
            black_box(cached.search_segment(&req, &seg, &acc).unwrap());
        });
    });
    group.finish();
}

/// Benchmark histogram counts from rollups against counting timestamps
fn bench_histogram(c: &mut Criterion) {
    let seg = create_segment("seg-hist", 200_000, 0);
    let executor = RawSearchExecutor::new(SearchConfig::default());
    let aggs = QueryAggregators {
        time_histogram: Some(TimeHistogramRequest::new(1_700_000_000_000, 1_700_000_000_000 + 2_000_000, 60_000)),
        ..Default::default()
    };

    let mut group = c.benchmark_group("histogram");
    let fast = request(&seg, SearchNode::match_all(), aggs.clone(), None);
    group.bench_function("rollup_fast_path", |b| {
        b.iter(|| {
            let acc = SearchResults::new(0, fast.aggregators(), "timestamp");
            black_box(executor.search_segment(&fast, &seg, &acc).unwrap());
        });
    });
    let filtered = request(&seg, error_node(), aggs, None);
    group.bench_function("filtered", |b| {
        b.iter(|| {
            let acc = SearchResults::new(0, filtered.aggregators(), "timestamp");
            black_box(executor.search_segment(&filtered, &seg, &acc).unwrap());
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_raw_search,
    bench_dictionary_fast_path,
    bench_persistent_query,
    bench_histogram,
);
criterion_main!(benches);
