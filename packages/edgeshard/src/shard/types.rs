//! The physical shard value type.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Shard index: time-derived, strictly increasing per edge path.
pub type ShardIndex = u64;

/// One physical partition of an edge path.
///
/// Ordering and equality follow `(index, created_at, default)`, so shards
/// sort by index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Shard {
    index: ShardIndex,
    created_at: u64,
    default: bool,
}

impl Shard {
    /// Index of the default shard; lower than any allocated index.
    pub const MIN_INDEX: ShardIndex = 0;

    /// The default shard every edge path starts with.
    pub const MIN: Shard = Shard {
        index: Self::MIN_INDEX,
        created_at: 0,
        default: true,
    };

    /// An allocated (non-default) shard.
    pub fn new(index: ShardIndex, created_at: u64) -> Self {
        Self {
            index,
            created_at,
            default: false,
        }
    }

    pub fn index(&self) -> ShardIndex {
        self.index
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn is_default(&self) -> bool {
        self.default
    }
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.default {
            write!(f, "shard#{}(default)", self.index)
        } else {
            write!(f, "shard#{}@{}", self.index, self.created_at)
        }
    }
}
