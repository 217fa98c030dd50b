pub mod metadata;
pub mod reader;
pub mod blob;
pub mod memory;

pub use metadata::{BlockMetadataProvider, BlockMicroIndex, BlockSummary, SegmentMicroIndex};
pub use reader::{BlockDictionary, ColumnReader, RollupBuckets};
