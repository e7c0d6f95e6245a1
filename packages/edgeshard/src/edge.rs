//! Edge value types: node ids, scopes, edge paths and stored rows.
//!
//! An [`EdgeMeta`] names one shardable edge path: every edge of one type
//! leaving (or arriving at) one node. Each edge is stored twice, once
//! under the source node's outgoing path and once under the target node's
//! incoming path, so both directions can be searched.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

// ── Node Id ────────────────────────────────────────────────────────

/// Identifier of a graph node: 128-bit id plus node type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    pub id: u128,
    pub node_type: String,
}

impl NodeId {
    pub fn new(id: u128, node_type: impl Into<String>) -> Self {
        Self {
            id,
            node_type: node_type.into(),
        }
    }

    /// Deterministic id derived from `blake3(node_type ":" name)`.
    pub fn from_name(node_type: &str, name: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(node_type.as_bytes());
        hasher.update(b":");
        hasher.update(name.as_bytes());
        let hash = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&hash.as_bytes()[0..16]);
        Self::new(u128::from_le_bytes(bytes), node_type)
    }

    /// Smallest possible id; used as an open lower bound in row scans.
    pub fn min_value() -> Self {
        Self::new(0, String::new())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:032x}", self.node_type, self.id)
    }
}

// ── Scope ──────────────────────────────────────────────────────────

/// Tenant/application partition. Opaque to the core.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Scope {
    pub application: NodeId,
}

impl Scope {
    pub fn new(application: NodeId) -> Self {
        Self { application }
    }

    pub fn named(name: &str) -> Self {
        Self::new(NodeId::from_name("application", name))
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.application.fmt(f)
    }
}

// ── Edge Meta ──────────────────────────────────────────────────────

/// Which side of the edge the path's node sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Direction {
    /// Edges leaving the node (source -> target).
    Source,
    /// Edges arriving at the node (target <- source).
    Target,
}

/// Immutable identifier of a shardable edge path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeMeta {
    pub node: NodeId,
    pub edge_type: String,
    pub direction: Direction,
}

impl EdgeMeta {
    pub fn from_source_node(source: NodeId, edge_type: impl Into<String>) -> Self {
        Self {
            node: source,
            edge_type: edge_type.into(),
            direction: Direction::Source,
        }
    }

    pub fn from_target_node(target: NodeId, edge_type: impl Into<String>) -> Self {
        Self {
            node: target,
            edge_type: edge_type.into(),
            direction: Direction::Target,
        }
    }
}

impl fmt::Display for EdgeMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arrow = match self.direction {
            Direction::Source => "->",
            Direction::Target => "<-",
        };
        write!(f, "{} {} {}", self.node, arrow, self.edge_type)
    }
}

// ── Edge ───────────────────────────────────────────────────────────

/// A directed, typed, timestamped edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub source: NodeId,
    pub edge_type: String,
    pub target: NodeId,
    /// Write timestamp in unix epoch milliseconds.
    pub timestamp: u64,
}

impl Edge {
    pub fn new(source: NodeId, edge_type: impl Into<String>, target: NodeId, timestamp: u64) -> Self {
        Self {
            source,
            edge_type: edge_type.into(),
            target,
            timestamp,
        }
    }

    /// The two paths this edge is indexed under.
    pub fn metas(&self) -> [EdgeMeta; 2] {
        [
            EdgeMeta::from_source_node(self.source.clone(), self.edge_type.clone()),
            EdgeMeta::from_target_node(self.target.clone(), self.edge_type.clone()),
        ]
    }

    /// Row key of this edge under `meta`.
    pub fn key_for(&self, meta: &EdgeMeta) -> EdgeKey {
        let far = match meta.direction {
            Direction::Source => self.target.clone(),
            Direction::Target => self.source.clone(),
        };
        EdgeKey::new(self.timestamp, far)
    }
}

/// An edge as stored: `marked` edges are pending deletion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MarkedEdge {
    pub edge: Edge,
    pub marked: bool,
}

impl MarkedEdge {
    pub fn new(edge: Edge) -> Self {
        Self { edge, marked: false }
    }

    pub fn marked(edge: Edge) -> Self {
        Self { edge, marked: true }
    }
}

// ── Edge Key ───────────────────────────────────────────────────────

/// Row key inside one (scope, EdgeMeta, shard).
///
/// Ordered newest first: descending timestamp, then ascending far node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeKey {
    pub timestamp: u64,
    /// The node on the other end of the edge from the path's node.
    pub far: NodeId,
}

impl EdgeKey {
    pub fn new(timestamp: u64, far: NodeId) -> Self {
        Self { timestamp, far }
    }

    /// First key a scan bounded by `max_timestamp` may return.
    pub fn scan_start(max_timestamp: u64) -> Self {
        Self::new(max_timestamp, NodeId::min_value())
    }
}

impl Ord for EdgeKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .timestamp
            .cmp(&self.timestamp)
            .then_with(|| self.far.cmp(&other.far))
    }
}

impl PartialOrd for EdgeKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
