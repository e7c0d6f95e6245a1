//! ShardCache - TTL cache in front of allocation and topology reads
//!
//! Two independent maps, both keyed by (scope, EdgeMeta):
//!
//! - write shards: the shard new writes go to, as decided by the allocator
//! - read topologies: the group layout readers fan out over
//!
//! Keeping them apart means a steady stream of readers never keeps an old
//! write shard alive past its TTL, so writers keep re-checking the split
//! threshold. Entries expire lazily on lookup and are replaced only after
//! a successful recomputation; a failing store leaves the cache as it was.
//!
//! A read refresh is also what drives compaction: the planner rebalances
//! and evaluates every group before the new topology is cached.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::allocator::ShardAllocator;
use crate::clock::Clock;
use crate::compaction::CompactionPlanner;
use crate::config::ConfigHandle;
use crate::edge::{EdgeMeta, Scope};
use crate::error::Result;
use crate::shard::{Shard, ShardGroup, ShardTopology};
use crate::store::EdgeStore;
use crate::worker::StopSignal;

type PathKey = (Scope, EdgeMeta);

// ============================================================================
// TTL map
// ============================================================================

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    fetched_at: u64,
}

#[derive(Debug)]
struct TtlMap<V> {
    entries: RwLock<HashMap<PathKey, CacheEntry<V>>>,
}

impl<V: Clone> TtlMap<V> {
    fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Value if present and younger than `ttl_ms`.
    fn get_fresh(&self, key: &PathKey, now: u64, ttl_ms: u64) -> Option<V> {
        let entries = self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries
            .get(key)
            .filter(|entry| now.saturating_sub(entry.fetched_at) < ttl_ms)
            .map(|entry| entry.value.clone())
    }

    fn insert(&self, key: PathKey, value: V, now: u64) {
        let mut entries = self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.insert(key, CacheEntry { value, fetched_at: now });
    }

    fn remove(&self, key: &PathKey) {
        let mut entries = self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.remove(key);
    }

    fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }
}

// ============================================================================
// Read snapshot
// ============================================================================

/// Snapshot of the groups covering a read, writable group first, then
/// sealed groups newest first. Later topology changes do not affect it.
#[derive(Debug, Clone)]
pub struct ShardGroups {
    version: u64,
    groups: std::vec::IntoIter<ShardGroup>,
}

impl ShardGroups {
    fn new(topology: &ShardTopology, as_of: u64) -> Self {
        Self {
            version: topology.version(),
            groups: topology.groups_as_of(as_of).into_iter(),
        }
    }

    /// Topology version the snapshot was taken from.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Groups not yet yielded.
    pub fn remaining(&self) -> &[ShardGroup] {
        self.groups.as_slice()
    }

    /// Union of the remaining groups' shards, highest index first.
    pub fn read_shards_desc(&self) -> Vec<Shard> {
        let mut shards: Vec<Shard> = self
            .remaining()
            .iter()
            .flat_map(|g| g.read_shards().iter().copied())
            .collect();
        shards.sort_by(|a, b| b.cmp(a));
        shards.dedup();
        shards
    }
}

impl Iterator for ShardGroups {
    type Item = ShardGroup;

    fn next(&mut self) -> Option<ShardGroup> {
        self.groups.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.groups.size_hint()
    }
}

impl ExactSizeIterator for ShardGroups {}

// ============================================================================
// ShardCache
// ============================================================================

pub struct ShardCache<S> {
    allocator: Arc<ShardAllocator<S>>,
    planner: Arc<CompactionPlanner<S>>,
    config: ConfigHandle,
    clock: Arc<dyn Clock>,
    write_shards: TtlMap<Shard>,
    read_topologies: TtlMap<ShardTopology>,
}

impl<S: EdgeStore> ShardCache<S> {
    pub fn new(
        allocator: Arc<ShardAllocator<S>>,
        planner: Arc<CompactionPlanner<S>>,
        config: ConfigHandle,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            allocator,
            planner,
            config,
            clock,
            write_shards: TtlMap::new(),
            read_topologies: TtlMap::new(),
        }
    }

    /// The shard new writes for the edge path must land in.
    ///
    /// Served from cache while fresh. A miss observes the current write
    /// shard's row count and lets the allocator split if it is full.
    pub fn get_write_shard(&self, scope: &Scope, meta: &EdgeMeta) -> Result<Shard> {
        let key = (scope.clone(), meta.clone());
        let ttl_ms = self.config.snapshot().cache_ttl_ms;
        if let Some(shard) = self.write_shards.get_fresh(&key, self.clock.now_ms(), ttl_ms) {
            return Ok(shard);
        }

        let load = self.allocator.observe_write_load(scope, meta)?;
        let allocation = self.allocator.get_or_create_write_shard(scope, meta, load)?;
        debug!(
            %meta,
            shard = allocation.shard.index(),
            edge_count = load.edge_count,
            split = allocation.split,
            "write shard refreshed"
        );

        self.write_shards.insert(key.clone(), allocation.shard, self.clock.now_ms());
        if allocation.split {
            self.read_topologies.remove(&key);
        }
        Ok(allocation.shard)
    }

    /// Groups a read up to `as_of` must cover.
    ///
    /// A miss reloads the topology, runs compaction for the edge path,
    /// reloads again and caches the result.
    pub fn get_read_shard_group(&self, scope: &Scope, as_of: u64, meta: &EdgeMeta) -> Result<ShardGroups> {
        let key = (scope.clone(), meta.clone());
        let ttl_ms = self.config.snapshot().cache_ttl_ms;
        if let Some(topology) = self.read_topologies.get_fresh(&key, self.clock.now_ms(), ttl_ms) {
            return Ok(ShardGroups::new(&topology, as_of));
        }

        let topology = self.refresh_read_topology(scope, meta)?;
        let groups = ShardGroups::new(&topology, as_of);
        self.read_topologies.insert(key, topology, self.clock.now_ms());
        Ok(groups)
    }

    fn refresh_read_topology(&self, scope: &Scope, meta: &EdgeMeta) -> Result<ShardTopology> {
        self.allocator.load_or_init(scope, meta)?;
        let statuses = self.planner.drive(scope, meta, &StopSignal::never())?;
        let topology = self.allocator.load_or_init(scope, meta)?;
        topology.validate()?;
        debug!(
            %meta,
            version = topology.version(),
            groups = topology.groups().len(),
            evaluated = statuses.len(),
            "read topology refreshed"
        );
        Ok(topology)
    }

    /// Current topology straight from the store, bypassing the cache.
    ///
    /// Used by mutations that must see every shard a row may be in.
    pub fn fresh_topology(&self, scope: &Scope, meta: &EdgeMeta) -> Result<ShardTopology> {
        let topology = self.allocator.load_or_init(scope, meta)?;
        topology.validate()?;
        Ok(topology)
    }

    /// Drop both cached entries of the edge path.
    pub fn invalidate(&self, scope: &Scope, meta: &EdgeMeta) {
        let key = (scope.clone(), meta.clone());
        self.write_shards.remove(&key);
        self.read_topologies.remove(&key);
    }

    /// Cached (write, read) entry counts, expired ones included.
    pub fn len(&self) -> (usize, usize) {
        (self.write_shards.len(), self.read_topologies.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ShardConfig;
    use crate::edge::{Edge, MarkedEdge, NodeId};
    use crate::store::{MemoryStore, RowStore};
    use std::time::Duration;

    const TTL_MS: u64 = 100;

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        cache: ShardCache<MemoryStore>,
        scope: Scope,
        meta: EdgeMeta,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(5_000));
        let config = ShardConfig::new(3, Duration::from_millis(TTL_MS), Duration::from_millis(250))
            .with_shard_min_age(Duration::ZERO);
        let handle = ConfigHandle::new(config).unwrap();
        let allocator = Arc::new(ShardAllocator::new(store.clone(), handle.clone(), clock.clone()));
        let planner = Arc::new(CompactionPlanner::new(store.clone(), handle.clone(), clock.clone()));
        Fixture {
            cache: ShardCache::new(allocator, planner, handle, clock.clone()),
            scope: Scope::named("cache"),
            meta: EdgeMeta::from_source_node(NodeId::from_name("source", "s"), "test"),
            store,
            clock,
        }
    }

    impl Fixture {
        fn fill(&self, shard: Shard, n: u64) {
            let source = NodeId::from_name("source", "s");
            for i in 0..n {
                let edge = Edge::new(source.clone(), "test", NodeId::from_name("target", &i.to_string()), i);
                self.store
                    .append_row(&self.scope, &self.meta, shard.index(), MarkedEdge::new(edge))
                    .unwrap();
            }
        }
    }

    #[test]
    fn test_write_shard_cached_until_ttl() {
        let fx = fixture();
        let first = fx.cache.get_write_shard(&fx.scope, &fx.meta).unwrap();
        assert_eq!(first, Shard::MIN);
        fx.fill(first, 3);

        // still fresh: full shard keeps taking writes
        fx.clock.advance_ms(TTL_MS - 1);
        assert_eq!(fx.cache.get_write_shard(&fx.scope, &fx.meta).unwrap(), Shard::MIN);

        fx.clock.advance_ms(1);
        let next = fx.cache.get_write_shard(&fx.scope, &fx.meta).unwrap();
        assert!(next.index() > Shard::MIN_INDEX);
    }

    #[test]
    fn test_read_entry_skips_store_while_fresh() {
        let fx = fixture();
        fx.cache.get_read_shard_group(&fx.scope, u64::MAX, &fx.meta).unwrap();
        let reads = fx.store.stats().topology_reads();

        fx.cache.get_read_shard_group(&fx.scope, u64::MAX, &fx.meta).unwrap();
        assert_eq!(fx.store.stats().topology_reads(), reads);

        fx.clock.advance_ms(TTL_MS);
        fx.cache.get_read_shard_group(&fx.scope, u64::MAX, &fx.meta).unwrap();
        assert!(fx.store.stats().topology_reads() > reads);
    }

    #[test]
    fn test_reads_do_not_refresh_write_entry() {
        let fx = fixture();
        fx.cache.get_write_shard(&fx.scope, &fx.meta).unwrap();
        fx.fill(Shard::MIN, 3);

        fx.clock.advance_ms(TTL_MS / 2);
        fx.cache.get_read_shard_group(&fx.scope, u64::MAX, &fx.meta).unwrap();
        fx.clock.advance_ms(TTL_MS / 2);

        let shard = fx.cache.get_write_shard(&fx.scope, &fx.meta).unwrap();
        assert_ne!(shard, Shard::MIN);
    }

    #[test]
    fn test_split_drops_read_entry() {
        let fx = fixture();
        let groups = fx.cache.get_read_shard_group(&fx.scope, u64::MAX, &fx.meta).unwrap();
        assert_eq!(groups.len(), 1);

        fx.cache.get_write_shard(&fx.scope, &fx.meta).unwrap();
        fx.fill(Shard::MIN, 3);
        fx.clock.advance_ms(TTL_MS);
        fx.cache.get_write_shard(&fx.scope, &fx.meta).unwrap();

        let groups = fx.cache.get_read_shard_group(&fx.scope, u64::MAX, &fx.meta).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups.read_shards_desc().last(), Some(&Shard::MIN));
    }

    #[test]
    fn test_as_of_filters_newer_groups() {
        let fx = fixture();
        fx.cache.get_write_shard(&fx.scope, &fx.meta).unwrap();
        fx.fill(Shard::MIN, 3);
        fx.clock.advance_ms(TTL_MS);
        let split_at = fx.clock.now_ms();
        fx.cache.get_write_shard(&fx.scope, &fx.meta).unwrap();

        let groups = fx.cache.get_read_shard_group(&fx.scope, split_at - 1, &fx.meta).unwrap();
        let ids: Vec<_> = groups.map(|g| g.id()).collect();
        assert_eq!(ids, vec![Shard::MIN_INDEX]);
    }

    #[test]
    fn test_invalidate_forces_reload() {
        let fx = fixture();
        fx.cache.get_read_shard_group(&fx.scope, u64::MAX, &fx.meta).unwrap();
        fx.cache.get_write_shard(&fx.scope, &fx.meta).unwrap();
        assert_eq!(fx.cache.len(), (1, 1));

        fx.cache.invalidate(&fx.scope, &fx.meta);
        assert_eq!(fx.cache.len(), (0, 0));

        let reads = fx.store.stats().topology_reads();
        fx.cache.get_read_shard_group(&fx.scope, u64::MAX, &fx.meta).unwrap();
        assert!(fx.store.stats().topology_reads() > reads);
    }
}
