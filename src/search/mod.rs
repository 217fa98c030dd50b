pub mod query;
pub mod request;
pub mod status;
pub mod evaluate;
pub mod executor;

pub use executor::{RawSearchExecutor, SegmentTask};
pub use query::{ColumnSelector, FilterOp, LogicalOp, SearchCondition, SearchNode, SearchNodeType, SearchOp, SearchQuery};
pub use request::{QueryContext, QueryInformation, SegmentSearchRequest};
pub use status::{BlockSearchStatus, SegmentSearchStatus};
