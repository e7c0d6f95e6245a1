//! Types for shard group compaction.

use std::fmt;

use crate::shard::ShardIndex;

/// Where a shard group stands with respect to compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompactionStatus {
    /// Not eligible yet: still writable or sealed too recently.
    Pending,
    /// Another planner holds a live claim on the group.
    Compacting,
    /// The group holds a single shard.
    Complete,
}

impl fmt::Display for CompactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompactionStatus::Pending => "pending",
            CompactionStatus::Compacting => "compacting",
            CompactionStatus::Complete => "complete",
        };
        f.write_str(s)
    }
}

/// Row movement of one compaction run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationStats {
    /// Rows moved from their source into the target
    pub rows_moved: u64,
    /// Rows listed on a page but gone from the source by the time they
    /// were moved (deleted, or moved by another planner)
    pub rows_dropped: u64,
    /// Pages read across all sources
    pub pages: u64,
}

impl MigrationStats {
    pub fn absorb(&mut self, other: &MigrationStats) {
        self.rows_moved += other.rows_moved;
        self.rows_dropped += other.rows_dropped;
        self.pages += other.pages;
    }
}

/// Result of compacting a single group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionReport {
    /// Group id (its minimum shard index), which is also the target shard
    pub group: ShardIndex,
    /// Source shards emptied into the target
    pub shards_merged: Vec<ShardIndex>,
    pub stats: MigrationStats,
    /// Migration passes until every source was verified empty
    pub passes: u32,
    /// Wall time in milliseconds, from the planner's clock
    pub duration_ms: u64,
}

/// Topology changes made by one rebalance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalanceReport {
    /// Ids of empty sealed groups that were removed
    pub dissolved: Vec<ShardIndex>,
    /// Each entry lists the ids of groups merged into one pending group
    pub coalesced: Vec<Vec<ShardIndex>>,
    /// The default group took over writes again
    pub reopened_default: bool,
}

impl RebalanceReport {
    pub fn is_empty(&self) -> bool {
        self.dissolved.is_empty() && self.coalesced.is_empty() && !self.reopened_default
    }
}
