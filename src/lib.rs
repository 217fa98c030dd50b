pub mod core;
pub mod bitset;
pub mod segment;
pub mod memory;
pub mod microindex;
pub mod search;
pub mod pqs;
pub mod aggregation;
pub mod results;

pub use core::config::SearchConfig;
pub use core::error::{Error, ErrorKind, Result};

/*
┌────────────────────────────────────────────────────────────────────────────────────────────┐
│                             SEGSEARCH QUERY EXECUTION                                       │
└────────────────────────────────────────────────────────────────────────────────────────────┘

┌──────────────────────────────────── PRUNING LAYER ──────────────────────────────────────────┐
│                                                                                              │
│  ┌────────────────────────────────────────────────────────────────────────────────────┐    │
│  │                           struct MicroIndexFilter                                   │    │
│  │  ┌──────────────────────────────────────────────────────────────────────────────┐ │    │
│  │  │ metadata: Arc<dyn BlockMetadataProvider> // Block summaries, blooms, ranges │ │    │
│  │  │ pqs: Option<Arc<PersistentQueryService>> // Records empty segments          │ │    │
│  │  │ counters: CmiCounters                     // Blocks checked / passed        │ │    │
│  │  └──────────────────────────────────────────────────────────────────────────────┘ │    │
│  └────────────────────────────────────────────────────────────────────────────────────┘    │
│                                                                                              │
│  ┌──────────────────────┐  ┌──────────────────────┐  ┌───────────────────────────────┐    │
│  │ struct BlockBloom    │  │ struct NumericRange  │  │ struct SegmentSearchRequest   │    │
│  │ • bits: Vec<u64>     │  │ • min: Number        │  │ • segment_key                 │    │
│  │ • num_hashes: usize  │  │ • max: Number        │  │ • metadata: Arc<MicroIndex>   │    │
│  │ • xxh3 double hash   │  │ • RangeCheck         │  │ • blocks_to_search: block ->  │    │
│  └──────────────────────┘  └──────────────────────┘  │   columns that passed         │    │
│                                                        │ • query_info: Arc<QueryInfo> │    │
│                                                        └───────────────────────────────┘    │
└──────────────────────────────────────────────────────────────────────────────────────────────┘

┌──────────────────────────────────── SEARCH LAYER ───────────────────────────────────────────┐
│                                                                                              │
│  ┌────────────────────────────────────────────────────────────────────────────────────┐    │
│  │                           struct RawSearchExecutor                                  │    │
│  │  ┌──────────────────────────────────────────────────────────────────────────────┐ │    │
│  │  │ config: SearchConfig                                                         │ │    │
│  │  │ pqs: Option<Arc<PersistentQueryService>>   // Cached bitsets, backfill      │ │    │
│  │  │ tracker: Option<Arc<dyn QueryPersistenceTracker>>                           │ │    │
│  │  │ aggs: AggregationPipeline                  // Histograms, group-by, records │ │    │
│  │  │ raw_search_gate: Arc<WeightedSemaphore>    // Segments in flight            │ │    │
│  │  │ memory: Arc<MemoryBudget>                  // Per-segment reservation       │ │    │
│  │  └──────────────────────────────────────────────────────────────────────────────┘ │    │
│  └────────────────────────────────────────────────────────────────────────────────────┘    │
│                                                                                              │
│  ┌──────────────────────┐  ┌──────────────────────┐  ┌───────────────────────────────┐    │
│  │ struct SearchNode    │  │ struct SegmentSearch │  │ struct BlockSearchStatus      │    │
│  │ • and: Condition     │  │   Status             │  │ • block_num                   │    │
│  │ • or: Condition      │  │ • blocks: BTreeMap   │  │ • num_records                 │    │
│  │ • exclusion: Cond.   │  │ • num_blocks_to_     │  │ • state: Mutex<MatchState>    │    │
│  └──────────────────────┘  │   search             │  │   matched: MatchBitset        │    │
│                            └──────────────────────┘  │   first_search: bool          │    │
│  ┌──────────────────────┐  ┌──────────────────────┐  └───────────────────────────────┘    │
│  │ enum SearchQuery     │  │ struct LeafEvaluator │                                        │
│  │ • Match(words)       │  │ • dictionary fast    │  ┌───────────────────────────────┐    │
│  │ • Expression         │  │   path               │  │ struct MatchBitset            │    │
│  │ • Regex              │  │ • ColumnUsage order  │  │ • words: Vec<u64>             │    │
│  │ • Range              │  │ • ErrorBatch         │  │ • len: usize                  │    │
│  │ • MatchAll           │  └──────────────────────┘  └───────────────────────────────┘    │
│  └──────────────────────┘                                                                   │
└──────────────────────────────────────────────────────────────────────────────────────────────┘

┌──────────────────────────────── PERSISTENT QUERY LAYER ─────────────────────────────────────┐
│                                                                                              │
│  ┌────────────────────────┐  ┌──────────────────────────┐  ┌─────────────────────────┐     │
│  │ PersistentQueryService │  │ struct SegmentPqmrResults│  │ trait QueryPersistence  │     │
│  │ • index: seg -> pqids  │  │ • blocks: RwLock<BTree   │  │   Tracker               │     │
│  │ • decoded: LruCache    │  │   Map<Block, Bitset>>    │  │ • record_usage()        │     │
│  │ • empty_results        │  │ • [blk u16][len u16]     │  │ • is_persistent()       │     │
│  │ • upload worker        │  │   [bitset] records       │  └─────────────────────────┘     │
│  └────────────────────────┘  └──────────────────────────┘                                   │
└──────────────────────────────────────────────────────────────────────────────────────────────┘

┌─────────────────────────────────── AGGREGATION LAYER ───────────────────────────────────────┐
│                                                                                              │
│  ┌────────────────────────┐  ┌──────────────────────────┐  ┌─────────────────────────┐     │
│  │ AggregationPipeline    │  │ struct GroupByBuckets    │  │ trait ResultsAccumulator│     │
│  │ • apply_aggregations() │  │ • RunningStat per measure│  │ • add_block_results()   │     │
│  │ • aggs_fast_path()     │  │ • HyperLogLog distinct   │  │ • add_matched_count()   │     │
│  │ • compute_segment_     │  └──────────────────────────┘  │ • should_search_range() │     │
│  │   stats()              │  ┌──────────────────────────┐  │ • add_error()           │     │
│  └────────────────────────┘  │ struct SegStats          │  └─────────────────────────┘     │
│                              │ • count, hll, numeric    │                                   │
│                              └──────────────────────────┘                                   │
└──────────────────────────────────────────────────────────────────────────────────────────────┘

Flow: candidates ──► MicroIndexFilter::filter_segments ──► SegmentSearchRequest per segment
        ──► RawSearchExecutor::search_segments ──► cached pqmr | raw search ──► backfill
        ──► AggregationPipeline ──► ResultsAccumulator
*/
