#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use segsearch::aggregation::QueryAggregators;
use segsearch::core::config::SearchConfig;
use segsearch::core::types::TimeRange;
use segsearch::microindex::{BlockTracker, CandidateSegments};
use segsearch::search::{QueryInformation, RawSearchExecutor, SearchNode, SegmentSearchRequest};
use segsearch::segment::memory::{InMemorySegment, LogRecord, SegmentBuilder};

pub const TABLE: &str = "logs";

/// `blocks` blocks of `per_block` records; record i has timestamp `base + i`,
/// level "info" when i is even and "error" otherwise, host "web-{i % 4}" and latency i * 10.
pub fn log_segment(key: &str, blocks: usize, per_block: usize, base: u64) -> InMemorySegment {
    SegmentBuilder::new(TABLE, key)
        .block_size(per_block)
        .bloom_fp_rate(1e-6)
        .extend((0..(blocks * per_block) as u64).map(|i| {
            LogRecord::new(base + i)
                .with_field("level", if i % 2 == 0 { "info" } else { "error" })
                .with_field("host", format!("web-{}", i % 4))
                .with_field("latency", (i * 10) as i64)
                .with_field("msg", format!("GET /api/items/{} took {}ms", i, i * 10))
        }))
        .build()
}

pub fn executor() -> RawSearchExecutor {
    RawSearchExecutor::new(test_config())
}

pub fn test_config() -> SearchConfig {
    let mut config = SearchConfig::default();
    config.raw_search_permits = 4;
    config.acquire_retries = 1;
    config.acquire_backoff = std::time::Duration::from_millis(1);
    config
}

pub fn query_info(qid: u64, node: SearchNode, time_range: TimeRange) -> Arc<QueryInformation> {
    Arc::new(QueryInformation::new(qid, node, time_range).with_parallelism(2))
}

pub fn records_query(qid: u64, node: SearchNode) -> Arc<QueryInformation> {
    Arc::new(
        QueryInformation::new(qid, node, TimeRange::all_time())
            .with_parallelism(2)
            .with_aggregators(QueryAggregators::records(None)),
    )
}

pub fn full_request(seg: &InMemorySegment, info: Arc<QueryInformation>) -> SegmentSearchRequest {
    SegmentSearchRequest::full_segment(seg.micro_index(), info)
}

pub fn all_blocks(keys: &[&str]) -> CandidateSegments {
    let segments = keys.iter().map(|k| (k.to_string(), BlockTracker::All)).collect();
    HashMap::from([(TABLE.to_string(), segments)])
}
