/// Segment search walkthrough
///
/// Builds two in-memory segments, prunes them with the micro-index and runs:
/// - a filtered record search sorted by latency
/// - a time histogram answered from rollups
/// - a group-by with measures

use segsearch::aggregation::{GroupByRequest, MeasureAggregator, MeasureFunc, QueryAggregators, SortRequest, TimeHistogramRequest};
use segsearch::core::config::SearchConfig;
use segsearch::core::logging::init_logging;
use segsearch::core::types::TimeRange;
use segsearch::microindex::{BlockTracker, MicroIndexFilter};
use segsearch::results::SearchResults;
use segsearch::search::{FilterOp, QueryContext, QueryInformation, RawSearchExecutor, SearchNode, SearchQuery, SegmentTask};
use segsearch::segment::ColumnReader;
use segsearch::segment::memory::{InMemoryMetadata, InMemorySegment, LogRecord, SegmentBuilder};
use std::collections::HashMap;
use std::sync::Arc;

const START: u64 = 1_700_000_000_000;

fn create_segment(key: &str, offset: u64) -> InMemorySegment {
    SegmentBuilder::new("logs", key)
        .block_size(256)
        .extend((0..2_000u64).map(|i| {
            let latency = ((i * 37 + offset) % 900) as i64;
            LogRecord::new(START + offset * 1_000 + i * 500)
                .with_field("level", if latency > 800 { "error" } else { "info" })
                .with_field("host", format!("web-{}", i % 3))
                .with_field("latency", latency)
        }))
        .build()
}

fn run(
    executor: &RawSearchExecutor,
    filter: &MicroIndexFilter,
    segments: &HashMap<String, Arc<InMemorySegment>>,
    info: QueryInformation,
) -> Result<SearchResults, Box<dyn std::error::Error>> {
    let info = Arc::new(info);
    let candidates = HashMap::from([(
        "logs".to_string(),
        segments.keys().map(|k| (k.clone(), BlockTracker::All)).collect(),
    )]);
    let requests = filter.filter_segments(&candidates, &info);
    let tasks: Vec<SegmentTask> = requests
        .into_values()
        .flat_map(|s| s.into_values())
        .filter_map(|req| {
            let reader: Arc<dyn ColumnReader> = segments.get(&req.segment_key)?.clone();
            Some(SegmentTask { request: req, reader })
        })
        .collect();

    let acc = SearchResults::new(5, &info.aggregators, "timestamp");
    executor.search_segments(&QueryContext::new(info.qid), &tasks, &acc)?;
    Ok(acc)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging("segsearch=info");
    println!("\n╔═══════════════════════════════════════════════╗");
    println!("║   segsearch - Segment Search Demo             ║");
    println!("╚═══════════════════════════════════════════════╝\n");

    // Step 1: Build segments and register their micro-indices
    let metadata = Arc::new(InMemoryMetadata::new());
    let mut segments = HashMap::new();
    for (key, offset) in [("seg-a", 0u64), ("seg-b", 7)] {
        let seg = create_segment(key, offset);
        metadata.register(seg.micro_index());
        segments.insert(key.to_string(), Arc::new(seg));
    }
    let filter = MicroIndexFilter::new(metadata);
    let executor = RawSearchExecutor::new(SearchConfig::default());
    println!("Built {} segments\n", segments.len());

    // Step 2: Slowest error records
    println!("Step 2: level=error AND latency>=850, top 5 by latency");
    let node = SearchNode::new()
        .with_and(SearchQuery::expression("level", FilterOp::Equals, "error")?)
        .with_and(SearchQuery::expression("latency", FilterOp::GreaterThanOrEqualTo, 850i64)?);
    let sort = SortRequest { column: "latency".to_string(), ascending: false };
    let info = QueryInformation::new(1, node, TimeRange::all_time())
        .with_parallelism(4)
        .with_aggregators(QueryAggregators::records(Some(sort)));
    let acc = run(&executor, &filter, &segments, info)?;
    println!("  matched: {}", acc.total_matched());
    for rrc in acc.records() {
        println!("  {} block {} record {} latency {:?}", rrc.segment_key, rrc.block_num, rrc.record_num, rrc.sort_value);
    }

    // Step 3: Ten-minute histogram of everything
    println!("\nStep 3: 10 minute histogram");
    let aggs = QueryAggregators {
        time_histogram: Some(TimeHistogramRequest::new(START, START + 3_600_000, 600_000)),
        ..Default::default()
    };
    let info = QueryInformation::new(2, SearchNode::match_all(), TimeRange::new(START, START + 3_600_000)).with_aggregators(aggs);
    let acc = run(&executor, &filter, &segments, info)?;
    for (bucket, count) in acc.time_histogram() {
        println!("  {} -> {}", bucket, count);
    }

    // Step 4: Group by host
    println!("\nStep 4: count, avg and max latency by host");
    let aggs = QueryAggregators {
        group_by: Some(GroupByRequest {
            columns: vec!["host".to_string()],
            measures: vec![
                MeasureAggregator::new("latency", MeasureFunc::Avg),
                MeasureAggregator::new("latency", MeasureFunc::Max),
            ],
            bucket_limit: 10,
        }),
        ..Default::default()
    };
    let info = QueryInformation::new(3, SearchNode::match_all(), TimeRange::all_time()).with_aggregators(aggs);
    let acc = run(&executor, &filter, &segments, info)?;
    for group in acc.group_by_results() {
        let keys: Vec<String> = group.key_values.iter().map(|v| v.to_string()).collect();
        let measures: Vec<String> = group.measures.iter().map(|v| v.to_string()).collect();
        println!("  {} count={} [{}]", keys.join(","), group.count, measures.join(", "));
    }

    println!("\nDone!");
    Ok(())
}
