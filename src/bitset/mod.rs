pub mod match_bitset;

pub use match_bitset::MatchBitset;
