pub mod accumulator;
pub mod collector;

pub use accumulator::{BlockResults, RecordResultContainer, ResultsAccumulator};
pub use collector::SearchResults;
