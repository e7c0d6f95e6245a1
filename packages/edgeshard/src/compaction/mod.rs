//! Shard group compaction.
//!
//! Sealed groups past the minimum delta are merged down into their oldest
//! shard, so the read fan-out of an edge path stays bounded.

pub mod merge;
pub mod planner;
pub mod types;

pub use planner::CompactionPlanner;
pub use types::*;
