//! Integration test: behaviour under backing store faults.
//!
//! Validates that:
//! - a compaction that fails halfway loses nothing and finishes on retry
//! - a cancelled compaction leaves the topology as it found it
//! - store outages surface as retryable errors and never poison the cache
//! - a failed split commit leaves the old write shard in place
//! - broken topology records are reported as invariant violations

use std::sync::Arc;
use std::time::Duration;

use edgeshard::{
    stop_signal, Clock, CompactionStatus, ConfigHandle, Edge, EdgeMeta, FaultyStore, GraphNode, ManualClock, MemoryStore,
    NodeId, Scope, SearchByEdgeType, Shard, ShardConfig, ShardError, ShardGroup, ShardTopology, StopSignal,
    TopologyStore,
};

const TTL_MS: u64 = 100;
const MIN_DELTA_MS: u64 = 250;
const EDGE_TYPE: &str = "test";

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Harness {
    memory: Arc<MemoryStore>,
    store: Arc<FaultyStore<MemoryStore>>,
    clock: Arc<ManualClock>,
    config: ConfigHandle,
    node: GraphNode<FaultyStore<MemoryStore>>,
    scope: Scope,
    source: NodeId,
    meta: EdgeMeta,
}

fn shard_config(shard_size: u64) -> ShardConfig {
    ShardConfig::new(shard_size, Duration::from_millis(TTL_MS), Duration::from_millis(MIN_DELTA_MS))
        .with_shard_min_age(Duration::ZERO)
        .with_compaction_page_size(3)
}

fn harness(shard_size: u64) -> Harness {
    let memory = Arc::new(MemoryStore::new());
    let store = Arc::new(FaultyStore::new(memory.clone()));
    let clock = Arc::new(ManualClock::new(1_000_000));
    let config = ConfigHandle::new(shard_config(shard_size)).unwrap();
    let node = GraphNode::builder(store.clone())
        .config(config.clone())
        .clock(clock.clone())
        .build();
    let source = NodeId::from_name("source", "faults");
    Harness {
        meta: EdgeMeta::from_source_node(source.clone(), EDGE_TYPE),
        scope: Scope::named("faults"),
        memory,
        store,
        clock,
        config,
        node,
        source,
    }
}

impl Harness {
    fn write(&self, n: u64, batch: u64) {
        let graph = self.node.graph(self.scope.clone());
        for i in 0..n {
            if i > 0 && i % batch == 0 {
                self.clock.advance_ms(TTL_MS);
            }
            let target = NodeId::from_name("target", &i.to_string());
            graph
                .write_edge(Edge::new(self.source.clone(), EDGE_TYPE, target, 1 + i))
                .unwrap();
        }
    }

    fn count(&self) -> u64 {
        self.node
            .graph(self.scope.clone())
            .load_edges_from_source(&SearchByEdgeType::new(self.source.clone(), EDGE_TYPE))
            .unwrap()
            .count_edges()
            .unwrap()
    }

    fn topology(&self) -> ShardTopology {
        self.memory.load_topology(&self.scope, &self.meta).unwrap().unwrap()
    }

    fn default_group(&self) -> ShardGroup {
        self.topology().group(Shard::MIN_INDEX).unwrap().clone()
    }

    /// Four two-edge shards, then the three sealed ones coalesced into the
    /// default group, pending compaction.
    fn coalesced(&self) {
        self.write(8, 2);
        self.config.update(shard_config(10)).unwrap();
        self.clock.advance_ms(MIN_DELTA_MS + TTL_MS);

        let report = self.node.planner().rebalance(&self.scope, &self.meta).unwrap();
        assert_eq!(report.coalesced.len(), 1);
        assert_eq!(self.default_group().len(), 3);
        assert!(self.default_group().is_compaction_pending());
    }
}

// ---------------------------------------------------------------------------
// Compaction faults
// ---------------------------------------------------------------------------

#[test]
fn failed_compaction_resumes_without_loss() {
    let h = harness(2);
    h.coalesced();

    h.store.fail_row_writes_after(2);
    let err = h
        .node
        .planner()
        .evaluate(&h.scope, &h.meta, &h.default_group())
        .unwrap_err();
    assert!(err.is_retryable(), "unexpected error: {}", err);

    let group = h.default_group();
    assert_eq!(group.len(), 3);
    assert!(group.claim().is_none(), "claim was not released");
    assert_eq!(h.memory.populated_shards(&h.scope, &h.meta).len(), 3);
    assert_eq!(h.count(), 8);

    h.store.heal();
    let status = h
        .node
        .planner()
        .evaluate(&h.scope, &h.meta, &h.default_group())
        .unwrap();
    assert_eq!(status, CompactionStatus::Complete);

    let group = h.default_group();
    assert_eq!(group.len(), 1);
    assert!(!group.is_compaction_pending());
    assert_eq!(h.memory.populated_shards(&h.scope, &h.meta).len(), 2);
    assert_eq!(h.count(), 8);
}

#[test]
fn cancelled_compaction_leaves_topology_unchanged() {
    let h = harness(2);
    h.coalesced();
    let before = h.topology();
    let populated = h.memory.populated_shards(&h.scope, &h.meta);

    let (stop, signal) = stop_signal();
    stop.stop();
    let err = h
        .node
        .planner()
        .evaluate_until(&h.scope, &h.meta, &h.default_group(), &signal)
        .unwrap_err();
    assert!(matches!(err, ShardError::Cancelled));

    let after = h.topology();
    assert_eq!(after.groups(), before.groups());
    assert_eq!(after.high_water_index(), before.high_water_index());
    assert_eq!(h.memory.populated_shards(&h.scope, &h.meta), populated);

    let status = h
        .node
        .planner()
        .evaluate_until(&h.scope, &h.meta, &h.default_group(), &StopSignal::never())
        .unwrap();
    assert_eq!(status, CompactionStatus::Complete);
    assert_eq!(h.count(), 8);
}

// ---------------------------------------------------------------------------
// Store outages
// ---------------------------------------------------------------------------

#[test]
fn unavailable_store_does_not_poison_cache() {
    let h = harness(5);
    let cache = h.node.shard_cache();
    let shard = cache.get_write_shard(&h.scope, &h.meta).unwrap();
    cache.get_read_shard_group(&h.scope, u64::MAX, &h.meta).unwrap();

    // fresh entries are served while the store is down
    h.store.fail_topology_reads(true);
    assert_eq!(cache.get_write_shard(&h.scope, &h.meta).unwrap(), shard);
    assert_eq!(cache.get_read_shard_group(&h.scope, u64::MAX, &h.meta).unwrap().len(), 1);

    h.clock.advance_ms(TTL_MS);
    let err = cache.get_write_shard(&h.scope, &h.meta).unwrap_err();
    assert!(err.is_retryable());
    let err = cache.get_read_shard_group(&h.scope, u64::MAX, &h.meta).unwrap_err();
    assert_eq!(err.code(), "STORE_UNAVAILABLE");
    assert_eq!(cache.len(), (1, 1));

    h.store.heal();
    assert_eq!(cache.get_write_shard(&h.scope, &h.meta).unwrap(), shard);
    assert_eq!(cache.get_read_shard_group(&h.scope, u64::MAX, &h.meta).unwrap().len(), 1);
}

#[test]
fn failed_split_keeps_old_write_shard() {
    let h = harness(2);
    h.write(2, 2);
    h.clock.advance_ms(TTL_MS);

    h.store.fail_cas(true);
    let graph = h.node.graph(h.scope.clone());
    let edge = Edge::new(h.source.clone(), EDGE_TYPE, NodeId::from_name("target", "late"), 50);
    assert!(graph.write_edge(edge.clone()).unwrap_err().is_retryable());
    assert_eq!(h.topology().shard_count(), 1);
    assert_eq!(h.count(), 2);

    h.store.heal();
    graph.write_edge(edge).unwrap();
    let topology = h.topology();
    assert_eq!(topology.shard_count(), 2);
    assert_ne!(topology.write_shard().unwrap(), Shard::MIN);
    assert_eq!(h.count(), 3);
}

// ---------------------------------------------------------------------------
// Invariant violations
// ---------------------------------------------------------------------------

#[test]
fn broken_topology_is_reported_as_fatal() {
    let h = harness(5);
    h.write(3, 5);

    let now = h.clock.now_ms();
    let broken = ShardTopology::from_parts(
        7,
        vec![
            ShardGroup::open(Shard::new(now, now), now),
            ShardGroup::open(Shard::MIN, now),
        ],
        now,
    );
    assert!(broken.validate().is_err());
    h.memory.force_topology(&h.scope, &h.meta, &broken).unwrap();
    h.clock.advance_ms(TTL_MS);

    let cache = h.node.shard_cache();
    let err = cache.get_read_shard_group(&h.scope, u64::MAX, &h.meta).unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(err.code(), "INVARIANT_VIOLATION");

    assert!(cache.get_write_shard(&h.scope, &h.meta).unwrap_err().is_fatal());
    assert!(h
        .node
        .planner()
        .drive(&h.scope, &h.meta, &StopSignal::never())
        .unwrap_err()
        .is_fatal());

    let graph = h.node.graph(h.scope.clone());
    let edge = Edge::new(h.source.clone(), EDGE_TYPE, NodeId::from_name("target", "0"), 1);
    assert!(graph.delete_edge(&edge).unwrap_err().is_fatal());

    // the record is reported, never patched
    assert_eq!(h.topology(), broken);
}
