//! Shard data model: shards, groups and the per-path topology.

pub mod group;
pub mod topology;
pub mod types;

pub use group::{CompactionClaim, ShardGroup};
pub use topology::ShardTopology;
pub use types::{Shard, ShardIndex};
