//! edgeshard - shard management core for a time-sharded graph edge store.
//!
//! Decides, per edge path, which shards a read must cover and which single
//! shard new writes land in. Splits the write shard as a path grows and
//! compacts sealed shard groups back down while readers and writers keep
//! running, without losing or duplicating a visible edge.

pub mod allocator;
pub mod cache;
pub mod clock;
pub mod compaction;
pub mod config;
pub mod edge;
pub mod error;
pub mod graph;
pub mod node;
pub mod shard;
pub mod store;
pub mod worker;

pub use allocator::{Allocation, ShardAllocator, WriteLoad};
pub use cache::{ShardCache, ShardGroups};
pub use clock::{Clock, ManualClock, SystemClock};
pub use compaction::{CompactionPlanner, CompactionReport, CompactionStatus, MigrationStats, RebalanceReport};
pub use config::{ConfigHandle, ShardConfig};
pub use edge::{Direction, Edge, EdgeKey, EdgeMeta, MarkedEdge, NodeId, Scope};
pub use error::{Result, ShardError};
pub use graph::{EdgeGraph, EdgeStream, SearchByEdgeType};
pub use node::{GraphNode, GraphNodeBuilder};
pub use shard::{CompactionClaim, Shard, ShardGroup, ShardIndex, ShardTopology};
pub use store::{
    CasOutcome, EdgeStore, FaultyStore, MemoryStore, RowPage, RowQuery, RowStore, SuccessorSlot, TopologyStore,
};
pub use worker::{stop_signal, CompactionWorker, StopHandle, StopSignal};
