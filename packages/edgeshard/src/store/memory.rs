//! In-process backing store
//!
//! Topology records are kept as serialized JSON bytes, the way a remote
//! store would hold them, so every load hands out an independent copy and
//! a caller can never mutate the shared record in place. Rows live in one
//! `BTreeMap` per (scope, EdgeMeta, shard), ordered by `EdgeKey`.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::edge::{EdgeKey, EdgeMeta, MarkedEdge, Scope};
use crate::error::Result;
use crate::shard::{Shard, ShardIndex, ShardTopology};
use crate::store::{CasOutcome, RowPage, RowQuery, RowStore, SuccessorSlot, TopologyStore};

type PathKey = (Scope, EdgeMeta);
type ShardKey = (Scope, EdgeMeta, ShardIndex);
type Rows = BTreeMap<EdgeKey, MarkedEdge>;

/// Operation counters, readable while the store is in use.
#[derive(Debug, Default)]
pub struct StoreStats {
    topology_reads: AtomicU64,
    topology_writes: AtomicU64,
    row_writes: AtomicU64,
    row_reads: AtomicU64,
}

impl StoreStats {
    pub fn topology_reads(&self) -> u64 {
        self.topology_reads.load(Ordering::Relaxed)
    }

    pub fn topology_writes(&self) -> u64 {
        self.topology_writes.load(Ordering::Relaxed)
    }

    pub fn row_writes(&self) -> u64 {
        self.row_writes.load(Ordering::Relaxed)
    }

    pub fn row_reads(&self) -> u64 {
        self.row_reads.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    topologies: RwLock<HashMap<PathKey, Vec<u8>>>,
    successors: Mutex<HashMap<(PathKey, SuccessorSlot), Shard>>,
    rows: RwLock<HashMap<ShardKey, Rows>>,
    stats: StoreStats,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    /// Shard indices holding at least one row for the edge path.
    pub fn populated_shards(&self, scope: &Scope, meta: &EdgeMeta) -> Vec<ShardIndex> {
        let rows = read(&self.rows);
        let mut shards: Vec<ShardIndex> = rows
            .iter()
            .filter(|((s, m, _), r)| s == scope && m == meta && !r.is_empty())
            .map(|((_, _, shard), _)| *shard)
            .collect();
        shards.sort_unstable();
        shards
    }

    /// Overwrite a topology record without a version check.
    ///
    /// Only for tests that need to plant a broken record.
    pub fn force_topology(&self, scope: &Scope, meta: &EdgeMeta, topology: &ShardTopology) -> Result<()> {
        let bytes = serde_json::to_vec(topology)?;
        write(&self.topologies).insert((scope.clone(), meta.clone()), bytes);
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<ShardTopology> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl TopologyStore for MemoryStore {
    fn load_topology(&self, scope: &Scope, meta: &EdgeMeta) -> Result<Option<ShardTopology>> {
        self.stats.topology_reads.fetch_add(1, Ordering::Relaxed);
        let topologies = read(&self.topologies);
        match topologies.get(&(scope.clone(), meta.clone())) {
            Some(bytes) => Ok(Some(Self::decode(bytes)?)),
            None => Ok(None),
        }
    }

    fn create_topology_if_absent(
        &self,
        scope: &Scope,
        meta: &EdgeMeta,
        topology: ShardTopology,
    ) -> Result<ShardTopology> {
        let mut topologies = write(&self.topologies);
        let key = (scope.clone(), meta.clone());
        if let Some(bytes) = topologies.get(&key) {
            return Self::decode(bytes);
        }
        self.stats.topology_writes.fetch_add(1, Ordering::Relaxed);
        topologies.insert(key, serde_json::to_vec(&topology)?);
        Ok(topology)
    }

    fn compare_and_swap_topology(
        &self,
        scope: &Scope,
        meta: &EdgeMeta,
        expected_version: u64,
        topology: ShardTopology,
    ) -> Result<CasOutcome> {
        let mut topologies = write(&self.topologies);
        let key = (scope.clone(), meta.clone());
        let current = match topologies.get(&key) {
            Some(bytes) => Self::decode(bytes)?,
            None => return Ok(CasOutcome::Conflict),
        };
        if current.version() != expected_version {
            return Ok(CasOutcome::Conflict);
        }
        let next = topology.with_version(expected_version + 1);
        topologies.insert(key, serde_json::to_vec(&next)?);
        self.stats.topology_writes.fetch_add(1, Ordering::Relaxed);
        Ok(CasOutcome::Committed(next))
    }

    fn claim_successor(
        &self,
        scope: &Scope,
        meta: &EdgeMeta,
        slot: SuccessorSlot,
        proposed: Shard,
    ) -> Result<Shard> {
        let mut successors = lock(&self.successors);
        let winner = successors
            .entry(((scope.clone(), meta.clone()), slot))
            .or_insert(proposed);
        Ok(*winner)
    }
}

impl RowStore for MemoryStore {
    fn append_row(&self, scope: &Scope, meta: &EdgeMeta, shard: ShardIndex, row: MarkedEdge) -> Result<()> {
        self.stats.row_writes.fetch_add(1, Ordering::Relaxed);
        let key = row.edge.key_for(meta);
        write(&self.rows)
            .entry((scope.clone(), meta.clone(), shard))
            .or_default()
            .insert(key, row);
        Ok(())
    }

    fn read_rows(&self, scope: &Scope, meta: &EdgeMeta, shard: ShardIndex, query: &RowQuery) -> Result<RowPage> {
        self.stats.row_reads.fetch_add(1, Ordering::Relaxed);
        let rows = read(&self.rows);
        let Some(shard_rows) = rows.get(&(scope.clone(), meta.clone(), shard)) else {
            return Ok(RowPage::default());
        };

        let start = match &query.after {
            Some(after) => Bound::Excluded(after.clone()),
            None => Bound::Included(EdgeKey::scan_start(query.max_timestamp)),
        };
        let page: Vec<MarkedEdge> = shard_rows
            .range((start, Bound::Unbounded))
            .filter(|(key, _)| key.timestamp <= query.max_timestamp)
            .take(query.limit)
            .map(|(_, row)| row.clone())
            .collect();

        let next = if page.len() == query.limit {
            page.last().map(|row| row.edge.key_for(meta))
        } else {
            None
        };
        Ok(RowPage { rows: page, next })
    }

    fn get_row(&self, scope: &Scope, meta: &EdgeMeta, shard: ShardIndex, key: &EdgeKey) -> Result<Option<MarkedEdge>> {
        let rows = read(&self.rows);
        Ok(rows
            .get(&(scope.clone(), meta.clone(), shard))
            .and_then(|shard_rows| shard_rows.get(key))
            .cloned())
    }

    fn delete_row(&self, scope: &Scope, meta: &EdgeMeta, shard: ShardIndex, key: &EdgeKey) -> Result<bool> {
        let mut rows = write(&self.rows);
        Ok(rows
            .get_mut(&(scope.clone(), meta.clone(), shard))
            .map(|shard_rows| shard_rows.remove(key).is_some())
            .unwrap_or(false))
    }

    fn mark_row(&self, scope: &Scope, meta: &EdgeMeta, shard: ShardIndex, key: &EdgeKey) -> Result<bool> {
        let mut rows = write(&self.rows);
        let Some(row) = rows
            .get_mut(&(scope.clone(), meta.clone(), shard))
            .and_then(|shard_rows| shard_rows.get_mut(key))
        else {
            return Ok(false);
        };
        self.stats.row_writes.fetch_add(1, Ordering::Relaxed);
        row.marked = true;
        Ok(true)
    }

    fn move_row(&self, scope: &Scope, meta: &EdgeMeta, from: ShardIndex, to: ShardIndex, key: &EdgeKey) -> Result<bool> {
        let mut rows = write(&self.rows);
        let Some(row) = rows
            .get_mut(&(scope.clone(), meta.clone(), from))
            .and_then(|shard_rows| shard_rows.remove(key))
        else {
            return Ok(false);
        };
        self.stats.row_writes.fetch_add(1, Ordering::Relaxed);
        rows.entry((scope.clone(), meta.clone(), to))
            .or_default()
            .insert(key.clone(), row);
        Ok(true)
    }

    fn count_rows(&self, scope: &Scope, meta: &EdgeMeta, shard: ShardIndex) -> Result<u64> {
        let rows = read(&self.rows);
        Ok(rows
            .get(&(scope.clone(), meta.clone(), shard))
            .map(|shard_rows| shard_rows.len() as u64)
            .unwrap_or(0))
    }
}
