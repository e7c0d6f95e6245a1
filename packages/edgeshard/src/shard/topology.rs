//! The versioned shard layout of one edge path.
//!
//! A `ShardTopology` is what the backing store persists per
//! (scope, EdgeMeta). Every change goes through a compare-and-swap on
//! `version`, so the struct itself is a plain value: transitions build a
//! new topology and the caller commits it.
//!
//! Invariants (checked by [`ShardTopology::validate`]):
//! - groups are disjoint and each group is valid
//! - exactly one writable group, always first
//! - sealed groups follow in descending order of their newest shard
//! - the default shard is present exactly once
//! - `high_water_index` is at least every allocated index

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShardError};
use crate::shard::group::ShardGroup;
use crate::shard::types::{Shard, ShardIndex};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardTopology {
    version: u64,
    groups: Vec<ShardGroup>,
    high_water_index: ShardIndex,
}

impl ShardTopology {
    /// A fresh edge path: one writable group holding the default shard.
    pub fn initial(now: u64) -> Self {
        Self {
            version: 0,
            groups: vec![ShardGroup::open(Shard::MIN, now)],
            high_water_index: Shard::MIN_INDEX,
        }
    }

    /// Assemble a topology from raw parts without validating it.
    pub fn from_parts(version: u64, groups: Vec<ShardGroup>, high_water_index: ShardIndex) -> Self {
        Self {
            version,
            groups,
            high_water_index,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// The same topology carrying `version`. Stores call this on commit.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// All groups, writable first.
    pub fn groups(&self) -> &[ShardGroup] {
        &self.groups
    }

    pub fn high_water_index(&self) -> ShardIndex {
        self.high_water_index
    }

    pub fn writable_group(&self) -> Result<&ShardGroup> {
        self.groups
            .iter()
            .find(|g| g.is_writable())
            .ok_or_else(|| ShardError::InvariantViolation("topology has no writable group".to_string()))
    }

    /// The single shard new writes land in.
    pub fn write_shard(&self) -> Result<Shard> {
        Ok(self.writable_group()?.max_shard())
    }

    pub fn group(&self, id: ShardIndex) -> Option<&ShardGroup> {
        self.groups.iter().find(|g| g.id() == id)
    }

    /// Groups whose time range starts at or before `as_of`.
    pub fn groups_as_of(&self, as_of: u64) -> Vec<ShardGroup> {
        self.groups
            .iter()
            .filter(|g| g.lower_bound() <= as_of)
            .cloned()
            .collect()
    }

    pub fn contains_shard(&self, index: ShardIndex) -> bool {
        self.groups.iter().any(|g| g.contains(index))
    }

    pub fn shard_count(&self) -> usize {
        self.groups.iter().map(|g| g.len()).sum()
    }

    /// Every shard of every group, highest index first.
    pub fn all_shards_desc(&self) -> Vec<Shard> {
        let mut shards: Vec<Shard> = self.groups.iter().flat_map(|g| g.read_shards().iter().copied()).collect();
        shards.sort_by(|a, b| b.cmp(a));
        shards
    }

    // ── Transitions ────────────────────────────────────────────────

    /// Open `successor` as the new writable group and seal the current one.
    pub(crate) fn with_successor(&self, successor: Shard, now: u64) -> Result<Self> {
        if successor.index() <= self.high_water_index || self.contains_shard(successor.index()) {
            return Err(ShardError::InvariantViolation(format!(
                "successor {} does not exceed high water index {}",
                successor, self.high_water_index
            )));
        }
        let mut groups = self.groups.clone();
        for group in groups.iter_mut().filter(|g| g.is_writable()) {
            group.seal(now);
        }
        groups.push(ShardGroup::open(successor, now));
        let next = Self {
            version: self.version,
            groups,
            high_water_index: successor.index(),
        };
        Ok(next.normalized())
    }

    /// Replace the group with id `id`.
    pub(crate) fn with_group(&self, id: ShardIndex, group: ShardGroup) -> Result<Self> {
        let mut next = self.clone();
        let slot = next
            .groups
            .iter_mut()
            .find(|g| g.id() == id)
            .ok_or_else(|| ShardError::InvariantViolation(format!("group {} not in topology", id)))?;
        *slot = group;
        Ok(next.normalized())
    }

    /// Drop the group with id `id`.
    pub(crate) fn without_group(&self, id: ShardIndex) -> Self {
        let mut next = self.clone();
        next.groups.retain(|g| g.id() != id);
        next
    }

    /// Replace the groups with ids `ids` by `merged`.
    pub(crate) fn with_coalesced(&self, ids: &[ShardIndex], merged: ShardGroup) -> Self {
        let mut next = self.clone();
        next.groups.retain(|g| !ids.contains(&g.id()));
        next.groups.push(merged);
        next.normalized()
    }

    /// Writable group first, sealed groups by newest shard, descending.
    fn normalized(mut self) -> Self {
        self.groups.sort_by(|a, b| {
            b.is_writable()
                .cmp(&a.is_writable())
                .then_with(|| b.max_shard().cmp(&a.max_shard()))
        });
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.groups.is_empty() {
            return Err(ShardError::InvariantViolation("topology has no groups".to_string()));
        }
        let mut seen = HashSet::new();
        let mut defaults = 0usize;
        for group in &self.groups {
            group.validate()?;
            for shard in group.read_shards() {
                if !seen.insert(shard.index()) {
                    return Err(ShardError::InvariantViolation(format!(
                        "shard {} appears in more than one group",
                        shard
                    )));
                }
                if shard.is_default() {
                    defaults += 1;
                }
                if shard.index() > self.high_water_index {
                    return Err(ShardError::InvariantViolation(format!(
                        "shard {} above high water index {}",
                        shard, self.high_water_index
                    )));
                }
            }
        }
        if defaults != 1 {
            return Err(ShardError::InvariantViolation(format!(
                "expected exactly one default shard, found {}",
                defaults
            )));
        }
        let writable = self.groups.iter().filter(|g| g.is_writable()).count();
        if writable != 1 || !self.groups[0].is_writable() {
            return Err(ShardError::InvariantViolation(format!(
                "expected one writable group in first position, found {}",
                writable
            )));
        }
        if self.groups[1..]
            .windows(2)
            .any(|w| w[0].max_shard().index() <= w[1].max_shard().index())
        {
            return Err(ShardError::InvariantViolation(
                "sealed groups are not ordered newest first".to_string(),
            ));
        }
        Ok(())
    }
}
