pub mod groupby;
pub mod hll;
pub mod number;
pub mod pipeline;
pub mod request;
pub mod rollup;
pub mod running;
pub mod stats;

pub use groupby::{GroupByBuckets, GroupResult};
pub use hll::HyperLogLog;
pub use number::Number;
pub use pipeline::AggregationPipeline;
pub use request::{GroupByRequest, MeasureAggregator, MeasureFunc, QueryAggregators, SortRequest, TimeHistogramRequest, TimechartRequest};
pub use rollup::RollupGranularity;
pub use running::RunningStat;
pub use stats::SegStats;
