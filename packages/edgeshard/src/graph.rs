//! EdgeGraph - per-scope edge manager
//!
//! Writes go to the cached write shard of both edge paths an edge belongs
//! to (outgoing from the source, incoming to the target). Searches walk the
//! shards of the cached read groups from the highest index down, one page
//! at a time, skipping keys already returned.
//!
//! Walking downwards is what keeps searches exact while compaction runs:
//! rows only ever move into a lower shard, in one store call, so a row is
//! always found either before or after its move and the seen-set drops a
//! second sighting.
//!
//! Marks and deletes walk the same way over a topology loaded straight
//! from the store. Both act on the row where it currently sits, so a row
//! moved under them is met again further down.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use crate::cache::ShardCache;
use crate::clock::Clock;
use crate::config::ConfigHandle;
use crate::edge::{Edge, EdgeKey, EdgeMeta, MarkedEdge, NodeId, Scope};
use crate::error::Result;
use crate::shard::Shard;
use crate::store::{EdgeStore, RowQuery, RowStore};

// ============================================================================
// Search
// ============================================================================

/// Edges of one type at one node, optionally bounded by timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchByEdgeType {
    pub node: NodeId,
    pub edge_type: String,
    /// Only edges with `timestamp <= max_timestamp`.
    pub max_timestamp: u64,
    /// Also return edges marked for deletion.
    pub include_marked: bool,
}

impl SearchByEdgeType {
    pub fn new(node: NodeId, edge_type: impl Into<String>) -> Self {
        Self {
            node,
            edge_type: edge_type.into(),
            max_timestamp: u64::MAX,
            include_marked: false,
        }
    }

    pub fn with_max_timestamp(mut self, max_timestamp: u64) -> Self {
        self.max_timestamp = max_timestamp;
        self
    }

    pub fn including_marked(mut self) -> Self {
        self.include_marked = true;
        self
    }
}

/// Lazy, finite search result.
///
/// Pages are fetched on demand. A failed page read is returned as an error
/// and leaves the cursor where it was, so pulling again retries it.
pub struct EdgeStream<S> {
    store: Arc<S>,
    scope: Scope,
    meta: EdgeMeta,
    /// Highest index first.
    shards: Vec<Shard>,
    position: usize,
    query: RowQuery,
    page_size: usize,
    include_marked: bool,
    seen: HashSet<EdgeKey>,
    buffer: VecDeque<MarkedEdge>,
}

impl<S: RowStore> EdgeStream<S> {
    fn new(store: Arc<S>, scope: Scope, meta: EdgeMeta, shards: Vec<Shard>, search: &SearchByEdgeType, page_size: usize) -> Self {
        Self {
            store,
            scope,
            meta,
            shards,
            position: 0,
            query: RowQuery::first(search.max_timestamp, page_size),
            page_size,
            include_marked: search.include_marked,
            seen: HashSet::new(),
            buffer: VecDeque::new(),
        }
    }

    /// Shards this stream reads, in read order.
    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    /// Next non-empty batch of edges, or `None` once every shard is read.
    pub fn next_page(&mut self) -> Result<Option<Vec<MarkedEdge>>> {
        if !self.buffer.is_empty() {
            return Ok(Some(self.buffer.drain(..).collect()));
        }
        while let Some(shard) = self.shards.get(self.position) {
            let page = self.store.read_rows(&self.scope, &self.meta, shard.index(), &self.query)?;
            match page.next {
                Some(next) => self.query = self.query.resume(next),
                None => {
                    self.position += 1;
                    self.query = RowQuery::first(self.query.max_timestamp, self.page_size);
                }
            }

            let edges: Vec<MarkedEdge> = page
                .rows
                .into_iter()
                .filter(|row| self.include_marked || !row.marked)
                .filter(|row| self.seen.insert(row.edge.key_for(&self.meta)))
                .collect();
            if !edges.is_empty() {
                return Ok(Some(edges));
            }
        }
        Ok(None)
    }

    /// Drain the stream, counting edges.
    pub fn count_edges(mut self) -> Result<u64> {
        let mut count = self.buffer.len() as u64;
        self.buffer.clear();
        while let Some(page) = self.next_page()? {
            count += page.len() as u64;
        }
        Ok(count)
    }
}

impl<S: RowStore> Iterator for EdgeStream<S> {
    type Item = Result<MarkedEdge>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(edge) = self.buffer.pop_front() {
            return Some(Ok(edge));
        }
        match self.next_page() {
            Ok(Some(page)) => {
                self.buffer.extend(page);
                self.buffer.pop_front().map(Ok)
            }
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

// ============================================================================
// EdgeGraph
// ============================================================================

pub struct EdgeGraph<S> {
    scope: Scope,
    store: Arc<S>,
    cache: Arc<ShardCache<S>>,
    config: ConfigHandle,
    clock: Arc<dyn Clock>,
}

impl<S: EdgeStore> EdgeGraph<S> {
    pub fn new(scope: Scope, store: Arc<S>, cache: Arc<ShardCache<S>>, config: ConfigHandle, clock: Arc<dyn Clock>) -> Self {
        Self {
            scope,
            store,
            cache,
            config,
            clock,
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Store an edge under both of its edge paths.
    pub fn write_edge(&self, edge: Edge) -> Result<MarkedEdge> {
        for meta in edge.metas() {
            let shard = self.cache.get_write_shard(&self.scope, &meta)?;
            self.store
                .append_row(&self.scope, &meta, shard.index(), MarkedEdge::new(edge.clone()))?;
        }
        Ok(MarkedEdge::new(edge))
    }

    /// Flag an edge for deletion wherever it is stored.
    ///
    /// Returns false when the edge was not found.
    pub fn mark_edge(&self, edge: &Edge) -> Result<bool> {
        let mut found = false;
        for meta in edge.metas() {
            let key = edge.key_for(&meta);
            let topology = self.cache.fresh_topology(&self.scope, &meta)?;
            for shard in topology.all_shards_desc() {
                found |= self.store.mark_row(&self.scope, &meta, shard.index(), &key)?;
            }
        }
        Ok(found)
    }

    /// Remove an edge from every shard of both paths.
    ///
    /// Returns false when no copy was found.
    pub fn delete_edge(&self, edge: &Edge) -> Result<bool> {
        let mut deleted = false;
        for meta in edge.metas() {
            let key = edge.key_for(&meta);
            let topology = self.cache.fresh_topology(&self.scope, &meta)?;
            for shard in topology.all_shards_desc() {
                deleted |= self.store.delete_row(&self.scope, &meta, shard.index(), &key)?;
            }
        }
        Ok(deleted)
    }

    /// Edges leaving `search.node`.
    pub fn load_edges_from_source(&self, search: &SearchByEdgeType) -> Result<EdgeStream<S>> {
        let meta = EdgeMeta::from_source_node(search.node.clone(), search.edge_type.clone());
        self.search(meta, search)
    }

    /// Edges arriving at `search.node`.
    pub fn load_edges_to_target(&self, search: &SearchByEdgeType) -> Result<EdgeStream<S>> {
        let meta = EdgeMeta::from_target_node(search.node.clone(), search.edge_type.clone());
        self.search(meta, search)
    }

    fn search(&self, meta: EdgeMeta, search: &SearchByEdgeType) -> Result<EdgeStream<S>> {
        let groups = self
            .cache
            .get_read_shard_group(&self.scope, self.clock.now_ms(), &meta)?;
        let shards = groups.read_shards_desc();
        let page_size = self.config.snapshot().read_page_size;
        Ok(EdgeStream::new(
            Arc::clone(&self.store),
            self.scope.clone(),
            meta,
            shards,
            search,
            page_size,
        ))
    }
}
