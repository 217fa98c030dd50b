/// Persistent query demo
///
/// Runs the same query three times against a segment:
/// - the first run only counts as usage
/// - the second run makes the query persistent and backfills its bitsets
/// - the third run is served from the pqmr cache

use segsearch::core::config::SearchConfig;
use segsearch::core::logging::init_logging;
use segsearch::core::types::TimeRange;
use segsearch::pqs::{PersistentQueryService, QueryUsageTracker};
use segsearch::results::SearchResults;
use segsearch::search::{LogicalOp, QueryContext, QueryInformation, RawSearchExecutor, SearchNode, SearchQuery, SegmentSearchRequest, SegmentTask};
use segsearch::segment::blob::LocalBlobStore;
use segsearch::segment::memory::{LogRecord, SegmentBuilder};
use std::sync::Arc;
use std::time::Instant;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging("segsearch=debug");
    println!("\n╔═══════════════════════════════════════════════╗");
    println!("║   segsearch - Persistent Query Demo           ║");
    println!("╚═══════════════════════════════════════════════╝\n");

    let dir = tempfile::tempdir()?;
    let config = SearchConfig::with_data_dir(dir.path());
    let pqs = PersistentQueryService::new(&config, Arc::new(LocalBlobStore))?;
    let tracker = Arc::new(QueryUsageTracker::new(2));
    let executor = RawSearchExecutor::new(config).with_pqs(pqs.clone()).with_tracker(tracker);

    let seg = SegmentBuilder::new("logs", "seg-0")
        .block_size(1_000)
        .extend((0..20_000u64).map(|i| {
            LogRecord::new(1_700_000_000_000 + i)
                .with_field("msg", format!("user {} {} from 10.0.{}.{}", i % 97, if i % 5 == 0 { "denied" } else { "accepted" }, i % 7, i % 250))
        }))
        .build();

    let node = SearchNode::new().with_and(SearchQuery::words("msg", &["denied"], LogicalOp::And)?);
    let info = Arc::new(QueryInformation::new(1, node, TimeRange::all_time()).with_parallelism(4).with_pqid("msg-denied"));
    let task = SegmentTask { request: SegmentSearchRequest::full_segment(seg.micro_index(), info.clone()), reader: Arc::new(seg) };

    for run in 1..=3 {
        let acc = SearchResults::new(10, &info.aggregators, "timestamp");
        let started = Instant::now();
        let matched = executor.search_segments(&QueryContext::new(run), std::slice::from_ref(&task), &acc)?;
        println!(
            "Run {}: {} matched in {:?} (pqmr cached: {})",
            run,
            matched,
            started.elapsed(),
            pqs.does_pqmr_exist("seg-0", "msg-denied")
        );
    }

    let stats = pqs.stats();
    println!("\nCache: {} hits, {} misses, {}/{} decoded entries", stats.hit_count, stats.miss_count, stats.size, stats.capacity);
    pqs.shutdown();
    println!("\nDone!");
    Ok(())
}
