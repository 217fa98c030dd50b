pub mod bloom;
pub mod checker;
pub mod ranges;

pub use bloom::BlockBloom;
pub use checker::{BlockTracker, CandidateSegments, MicroIndexFilter, SegmentRequests};
pub use ranges::{NumericRange, RangeCheck};
