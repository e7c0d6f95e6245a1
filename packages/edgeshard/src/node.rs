//! GraphNode - one independent shard management stack
//!
//! A node owns its own allocator, compaction planner and shard cache over
//! a backing store it shares with other nodes. Several nodes built over one
//! `Arc` store behave like several service processes: they coordinate only
//! through the store's CAS and create-if-absent operations.

use std::sync::Arc;
use std::time::Duration;

use crate::allocator::ShardAllocator;
use crate::cache::ShardCache;
use crate::clock::{Clock, SystemClock};
use crate::compaction::CompactionPlanner;
use crate::config::ConfigHandle;
use crate::edge::{EdgeMeta, Scope};
use crate::graph::EdgeGraph;
use crate::store::EdgeStore;
use crate::worker::CompactionWorker;

pub struct GraphNodeBuilder<S> {
    store: Arc<S>,
    config: ConfigHandle,
    clock: Arc<dyn Clock>,
}

impl<S: EdgeStore> GraphNodeBuilder<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            config: ConfigHandle::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Share an existing config handle; updates through it reach this node.
    pub fn config(mut self, config: ConfigHandle) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> GraphNode<S> {
        let allocator = Arc::new(ShardAllocator::new(
            Arc::clone(&self.store),
            self.config.clone(),
            Arc::clone(&self.clock),
        ));
        let planner = Arc::new(CompactionPlanner::new(
            Arc::clone(&self.store),
            self.config.clone(),
            Arc::clone(&self.clock),
        ));
        let cache = Arc::new(ShardCache::new(
            Arc::clone(&allocator),
            Arc::clone(&planner),
            self.config.clone(),
            Arc::clone(&self.clock),
        ));
        GraphNode {
            store: self.store,
            config: self.config,
            clock: self.clock,
            allocator,
            planner,
            cache,
        }
    }
}

pub struct GraphNode<S> {
    store: Arc<S>,
    config: ConfigHandle,
    clock: Arc<dyn Clock>,
    allocator: Arc<ShardAllocator<S>>,
    planner: Arc<CompactionPlanner<S>>,
    cache: Arc<ShardCache<S>>,
}

impl<S: EdgeStore> GraphNode<S> {
    pub fn builder(store: Arc<S>) -> GraphNodeBuilder<S> {
        GraphNodeBuilder::new(store)
    }

    /// Edge manager for one scope. Cheap; all graphs share this node's cache.
    pub fn graph(&self, scope: Scope) -> EdgeGraph<S> {
        EdgeGraph::new(
            scope,
            Arc::clone(&self.store),
            Arc::clone(&self.cache),
            self.config.clone(),
            Arc::clone(&self.clock),
        )
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn shard_cache(&self) -> &Arc<ShardCache<S>> {
        &self.cache
    }

    pub fn allocator(&self) -> &Arc<ShardAllocator<S>> {
        &self.allocator
    }

    pub fn planner(&self) -> &Arc<CompactionPlanner<S>> {
        &self.planner
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

impl<S: EdgeStore + 'static> GraphNode<S> {
    /// Start a background thread compacting `paths` every `interval`.
    pub fn compaction_worker(&self, paths: Vec<(Scope, EdgeMeta)>, interval: Duration) -> CompactionWorker {
        CompactionWorker::spawn(Arc::clone(&self.planner), paths, interval)
    }
}
