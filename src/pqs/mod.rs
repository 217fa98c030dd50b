pub mod layout;
pub mod meta;
pub mod pqmr;
pub mod service;
pub mod tracker;

pub use pqmr::SegmentPqmrResults;
pub use service::{CacheStats, PersistentQueryService};
pub use tracker::{QueryPersistenceTracker, QueryUsageTracker};
