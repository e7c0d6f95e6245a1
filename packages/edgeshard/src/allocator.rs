//! Write shard allocation
//!
//! The allocator owns the split decision for one edge path. It never holds
//! state of its own between calls: every decision starts from the stored
//! topology and ends in a compare-and-swap, so any number of allocators
//! (threads or processes) can run against the same store.
//!
//! A split happens when all of these hold:
//! - the caller's observed shard is still the write shard
//! - the observed edge count reached `shard_size`
//! - the writable group is at least `shard_min_age_ms` old
//!
//! The successor shard is claimed through `TopologyStore::claim_successor`
//! before the topology changes, so racing allocators agree on one shard.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::ConfigHandle;
use crate::edge::{EdgeMeta, Scope};
use crate::error::{Result, ShardError};
use crate::shard::{Shard, ShardTopology};
use crate::store::{CasOutcome, EdgeStore, SuccessorSlot};

/// Topology CAS attempts before giving up with `Contention`.
pub const MAX_CAS_ATTEMPTS: usize = 16;

/// What a writer saw of the shard it has been writing into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteLoad {
    pub shard: Shard,
    pub edge_count: u64,
}

/// The allocator's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Shard the next write must land in.
    pub shard: Shard,
    /// True when this call committed the split.
    pub split: bool,
}

impl Allocation {
    fn existing(shard: Shard) -> Self {
        Self { shard, split: false }
    }
}

pub struct ShardAllocator<S> {
    store: Arc<S>,
    config: ConfigHandle,
    clock: Arc<dyn Clock>,
}

impl<S: EdgeStore> ShardAllocator<S> {
    pub fn new(store: Arc<S>, config: ConfigHandle, clock: Arc<dyn Clock>) -> Self {
        Self { store, config, clock }
    }

    /// Load the topology, creating the initial one on first use.
    ///
    /// A stored record that breaks an invariant is returned as
    /// `ShardError::InvariantViolation`.
    pub fn load_or_init(&self, scope: &Scope, meta: &EdgeMeta) -> Result<ShardTopology> {
        if let Some(topology) = self.store.load_topology(scope, meta)? {
            topology.validate()?;
            return Ok(topology);
        }
        let initial = ShardTopology::initial(self.clock.now_ms());
        let topology = self.store.create_topology_if_absent(scope, meta, initial)?;
        debug!(%meta, version = topology.version(), "initialised shard topology");
        Ok(topology)
    }

    /// Count the rows of the current write shard.
    pub fn observe_write_load(&self, scope: &Scope, meta: &EdgeMeta) -> Result<WriteLoad> {
        let topology = self.load_or_init(scope, meta)?;
        let shard = topology.write_shard()?;
        let edge_count = self.store.count_rows(scope, meta, shard.index())?;
        Ok(WriteLoad { shard, edge_count })
    }

    /// Decide the write shard, splitting when `load` crossed the threshold.
    pub fn get_or_create_write_shard(&self, scope: &Scope, meta: &EdgeMeta, load: WriteLoad) -> Result<Allocation> {
        let config = self.config.snapshot();
        let mut topology = self.load_or_init(scope, meta)?;

        for attempt in 0..MAX_CAS_ATTEMPTS {
            topology.validate()?;
            let writable = topology.writable_group()?;
            let current = writable.max_shard();

            if current != load.shard {
                return Ok(Allocation::existing(current));
            }
            if load.edge_count < config.shard_size {
                return Ok(Allocation::existing(current));
            }
            let now = self.clock.now_ms();
            if now.saturating_sub(writable.opened_at()) < config.shard_min_age_ms {
                debug!(
                    %meta,
                    shard = current.index(),
                    edge_count = load.edge_count,
                    "write shard full but too young to split"
                );
                return Ok(Allocation::existing(current));
            }

            let slot = SuccessorSlot::of(&topology)?;
            let proposed = Shard::new(now.max(topology.high_water_index() + 1), now);
            let successor = self.store.claim_successor(scope, meta, slot, proposed)?;
            let next = topology.with_successor(successor, now)?;

            match self
                .store
                .compare_and_swap_topology(scope, meta, topology.version(), next)?
            {
                CasOutcome::Committed(committed) => {
                    info!(
                        %meta,
                        from = current.index(),
                        to = successor.index(),
                        edge_count = load.edge_count,
                        groups = committed.groups().len(),
                        "split write shard"
                    );
                    return Ok(Allocation { shard: successor, split: true });
                }
                CasOutcome::Conflict => {
                    warn!(%meta, attempt, "topology changed during split, retrying");
                    topology = self.load_or_init(scope, meta)?;
                }
            }
        }

        Err(ShardError::Contention(format!(
            "split of {} lost {} topology races",
            meta, MAX_CAS_ATTEMPTS
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ShardConfig;
    use crate::edge::NodeId;
    use crate::store::{MemoryStore, TopologyStore};
    use std::time::Duration;

    fn setup(min_age_ms: u64) -> (ShardAllocator<MemoryStore>, Arc<MemoryStore>, Arc<ManualClock>, Scope, EdgeMeta) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let config = ShardConfig::new(10, Duration::from_millis(100), Duration::from_millis(250))
            .with_shard_min_age(Duration::from_millis(min_age_ms));
        let handle = ConfigHandle::new(config).unwrap();
        let allocator = ShardAllocator::new(store.clone(), handle, clock.clone());
        let scope = Scope::named("allocator");
        let meta = EdgeMeta::from_source_node(NodeId::from_name("source", "s"), "test");
        (allocator, store, clock, scope, meta)
    }

    #[test]
    fn test_first_use_returns_default_shard() {
        let (allocator, store, _clock, scope, meta) = setup(0);
        let load = allocator.observe_write_load(&scope, &meta).unwrap();
        assert_eq!(load.shard, Shard::MIN);
        assert_eq!(load.edge_count, 0);

        let allocation = allocator.get_or_create_write_shard(&scope, &meta, load).unwrap();
        assert_eq!(allocation, Allocation::existing(Shard::MIN));
        assert!(store.load_topology(&scope, &meta).unwrap().is_some());
    }

    #[test]
    fn test_split_at_threshold() {
        let (allocator, store, clock, scope, meta) = setup(0);
        clock.advance_ms(5);
        let load = WriteLoad { shard: Shard::MIN, edge_count: 10 };
        let allocation = allocator.get_or_create_write_shard(&scope, &meta, load).unwrap();

        assert!(allocation.split);
        assert_eq!(allocation.shard.index(), 1_005);
        let topology = store.load_topology(&scope, &meta).unwrap().unwrap();
        assert_eq!(topology.write_shard().unwrap(), allocation.shard);
        assert_eq!(topology.groups().len(), 2);
    }

    #[test]
    fn test_below_threshold_keeps_shard() {
        let (allocator, _store, _clock, scope, meta) = setup(0);
        let load = WriteLoad { shard: Shard::MIN, edge_count: 9 };
        let allocation = allocator.get_or_create_write_shard(&scope, &meta, load).unwrap();
        assert!(!allocation.split);
        assert_eq!(allocation.shard, Shard::MIN);
    }

    #[test]
    fn test_stale_load_does_not_split_twice() {
        let (allocator, store, _clock, scope, meta) = setup(0);
        let load = WriteLoad { shard: Shard::MIN, edge_count: 10 };
        let first = allocator.get_or_create_write_shard(&scope, &meta, load).unwrap();
        let second = allocator.get_or_create_write_shard(&scope, &meta, load).unwrap();

        assert!(first.split);
        assert!(!second.split);
        assert_eq!(first.shard, second.shard);
        assert_eq!(store.load_topology(&scope, &meta).unwrap().unwrap().shard_count(), 2);
    }

    #[test]
    fn test_young_group_is_not_split() {
        let (allocator, _store, clock, scope, meta) = setup(100);
        allocator.load_or_init(&scope, &meta).unwrap();

        let load = WriteLoad { shard: Shard::MIN, edge_count: 50 };
        assert!(!allocator.get_or_create_write_shard(&scope, &meta, load).unwrap().split);

        clock.advance_ms(100);
        assert!(allocator.get_or_create_write_shard(&scope, &meta, load).unwrap().split);
    }

    #[test]
    fn test_same_clock_tick_splits_get_distinct_indices() {
        let (allocator, _store, _clock, scope, meta) = setup(0);
        let first = allocator
            .get_or_create_write_shard(&scope, &meta, WriteLoad { shard: Shard::MIN, edge_count: 10 })
            .unwrap();
        let second = allocator
            .get_or_create_write_shard(&scope, &meta, WriteLoad { shard: first.shard, edge_count: 10 })
            .unwrap();
        assert!(second.split);
        assert!(second.shard.index() > first.shard.index());
    }
}
