//! Domain filtering: probabilistic blocklist with public-suffix awareness.

mod blocklist;
mod bloom;

pub use blocklist::{Blocklist, DEFAULT_FP_RATE};
pub use bloom::BloomFilter;
