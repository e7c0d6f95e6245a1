//! Backing store interfaces
//!
//! The shard core never talks to a concrete database. It needs two things
//! from the store:
//!
//! - `TopologyStore`: a per-(scope, EdgeMeta) record with compare-and-swap
//!   on its version, plus an exclusive create-if-absent for successor shards
//! - `RowStore`: keyed edge rows addressed by (scope, EdgeMeta, shard index)
//!
//! All calls are synchronous and may block. A store that cannot serve a
//! call returns `ShardError::Unavailable`; the core surfaces it unchanged.
//!
//! `MemoryStore` implements both traits in-process. `FaultyStore` wraps any
//! store and injects failures.

pub mod faulty;
pub mod memory;

pub use faulty::FaultyStore;
pub use memory::{MemoryStore, StoreStats};

use crate::edge::{EdgeKey, EdgeMeta, MarkedEdge, Scope};
use crate::error::Result;
use crate::shard::{Shard, ShardIndex, ShardTopology};

// ============================================================================
// Topology records
// ============================================================================

/// Result of a topology compare-and-swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// Stored; carries the record as persisted (with its new version).
    Committed(ShardTopology),
    /// Someone else changed the record since `expected_version`.
    Conflict,
}

/// Identifies one split decision of an edge path.
///
/// The write shard alone is not enough: an emptied collection returns to
/// the default shard and splits from it again later. Together with the
/// high water index at decision time the pair never repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SuccessorSlot {
    pub predecessor: ShardIndex,
    pub high_water_index: ShardIndex,
}

impl SuccessorSlot {
    pub fn of(topology: &ShardTopology) -> Result<Self> {
        Ok(Self {
            predecessor: topology.write_shard()?.index(),
            high_water_index: topology.high_water_index(),
        })
    }
}

pub trait TopologyStore: Send + Sync {
    /// Load the current topology record, if the edge path has one.
    fn load_topology(&self, scope: &Scope, meta: &EdgeMeta) -> Result<Option<ShardTopology>>;

    /// Store `topology` unless a record exists. Returns whichever record
    /// is stored afterwards.
    fn create_topology_if_absent(
        &self,
        scope: &Scope,
        meta: &EdgeMeta,
        topology: ShardTopology,
    ) -> Result<ShardTopology>;

    /// Replace the record if its version is still `expected_version`.
    /// The stored record gets version `expected_version + 1`.
    fn compare_and_swap_topology(
        &self,
        scope: &Scope,
        meta: &EdgeMeta,
        expected_version: u64,
        topology: ShardTopology,
    ) -> Result<CasOutcome>;

    /// Exclusive create-if-absent of the shard following `slot`.
    ///
    /// The first caller's `proposed` shard wins; every later caller for the
    /// same slot gets the winner back.
    fn claim_successor(
        &self,
        scope: &Scope,
        meta: &EdgeMeta,
        slot: SuccessorSlot,
        proposed: Shard,
    ) -> Result<Shard>;
}

// ============================================================================
// Edge rows
// ============================================================================

/// One page request against a single shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowQuery {
    /// Only rows with `timestamp <= max_timestamp`.
    pub max_timestamp: u64,
    /// Resume strictly after this key.
    pub after: Option<EdgeKey>,
    pub limit: usize,
}

impl RowQuery {
    pub fn first(max_timestamp: u64, limit: usize) -> Self {
        Self {
            max_timestamp,
            after: None,
            limit,
        }
    }

    /// Every row in the shard, one page at a time.
    pub fn all(limit: usize) -> Self {
        Self::first(u64::MAX, limit)
    }

    pub fn resume(&self, after: EdgeKey) -> Self {
        Self {
            after: Some(after),
            ..self.clone()
        }
    }
}

/// Rows in key order plus the cursor for the next page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowPage {
    pub rows: Vec<MarkedEdge>,
    /// Set when more rows may follow.
    pub next: Option<EdgeKey>,
}

pub trait RowStore: Send + Sync {
    /// Insert or overwrite the row keyed by `row.edge.key_for(meta)`.
    fn append_row(&self, scope: &Scope, meta: &EdgeMeta, shard: ShardIndex, row: MarkedEdge) -> Result<()>;

    /// Read one page of rows, newest first.
    fn read_rows(&self, scope: &Scope, meta: &EdgeMeta, shard: ShardIndex, query: &RowQuery) -> Result<RowPage>;

    fn get_row(&self, scope: &Scope, meta: &EdgeMeta, shard: ShardIndex, key: &EdgeKey) -> Result<Option<MarkedEdge>>;

    /// Delete a row. Returns false when the row was not there.
    fn delete_row(&self, scope: &Scope, meta: &EdgeMeta, shard: ShardIndex, key: &EdgeKey) -> Result<bool>;

    /// Flag a stored row for deletion in place. Returns false when the row
    /// was not there; nothing is written then.
    fn mark_row(&self, scope: &Scope, meta: &EdgeMeta, shard: ShardIndex, key: &EdgeKey) -> Result<bool>;

    /// Remove the row from `from` and upsert its current version into `to`
    /// as one step.
    ///
    /// Returns false when `from` no longer holds the row (deleted, or
    /// already moved by someone else); `to` is left untouched then.
    fn move_row(&self, scope: &Scope, meta: &EdgeMeta, from: ShardIndex, to: ShardIndex, key: &EdgeKey)
        -> Result<bool>;

    /// Live rows in one shard.
    fn count_rows(&self, scope: &Scope, meta: &EdgeMeta, shard: ShardIndex) -> Result<u64>;
}

/// A store serving both topology records and rows.
pub trait EdgeStore: TopologyStore + RowStore {}

impl<T: TopologyStore + RowStore> EdgeStore for T {}
