//! Shard groups: the logical read and compaction unit.
//!
//! A group is a non-empty set of shards (newest first) covering one
//! contiguous time range of an edge path. The writable group receives all
//! new writes through its newest shard. When a newer group opens, the
//! previous writable group is sealed; once it has been sealed for longer
//! than `min_delta` nobody can still be writing into it and compaction may
//! merge its shards down into the oldest one.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShardError};
use crate::shard::types::{Shard, ShardIndex};

// ── Compaction Claim ───────────────────────────────────────────────

/// Exclusive right of one planner to migrate a group's rows.
///
/// Written through the topology CAS. Expired claims may be taken over,
/// which is what makes an interrupted compaction restartable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionClaim {
    pub owner: u64,
    pub expires_at: u64,
}

impl CompactionClaim {
    pub fn is_live(&self, now: u64) -> bool {
        now < self.expires_at
    }
}

// ── Shard Group ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardGroup {
    /// Newest first. Never empty.
    shards: Vec<Shard>,
    writable: bool,
    opened_at: u64,
    sealed_at: Option<u64>,
    compaction_pending: bool,
    claim: Option<CompactionClaim>,
}

impl ShardGroup {
    /// A new writable group holding only `shard`.
    pub fn open(shard: Shard, now: u64) -> Self {
        Self {
            shards: vec![shard],
            writable: true,
            opened_at: now,
            sealed_at: None,
            compaction_pending: false,
            claim: None,
        }
    }

    /// Stable identity: the index of the oldest shard.
    ///
    /// Compaction keeps the oldest shard, so the id survives a merge.
    pub fn id(&self) -> ShardIndex {
        self.min_shard().index()
    }

    /// Shards to read, newest first.
    pub fn read_shards(&self) -> &[Shard] {
        &self.shards
    }

    /// Oldest shard; the compaction target.
    pub fn min_shard(&self) -> Shard {
        self.shards[self.shards.len() - 1]
    }

    /// Newest shard; the write target while the group is writable.
    pub fn max_shard(&self) -> Shard {
        self.shards[0]
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn opened_at(&self) -> u64 {
        self.opened_at
    }

    pub fn sealed_at(&self) -> Option<u64> {
        self.sealed_at
    }

    pub fn is_compaction_pending(&self) -> bool {
        self.compaction_pending
    }

    pub fn claim(&self) -> Option<CompactionClaim> {
        self.claim
    }

    pub fn contains(&self, index: ShardIndex) -> bool {
        self.shards.iter().any(|s| s.index() == index)
    }

    pub fn contains_default(&self) -> bool {
        self.shards.iter().any(|s| s.is_default())
    }

    /// Lower bound of the group's time range.
    pub fn lower_bound(&self) -> u64 {
        self.min_shard().created_at()
    }

    /// Sealed for at least `min_delta_ms` and therefore safe to compact.
    pub fn is_compaction_eligible(&self, now: u64, min_delta_ms: u64) -> bool {
        match self.sealed_at {
            Some(sealed) if !self.writable => now >= sealed.saturating_add(min_delta_ms),
            _ => false,
        }
    }

    /// Claimed by a planner whose lease has not run out.
    pub fn is_claimed(&self, now: u64) -> bool {
        self.claim.map(|c| c.is_live(now)).unwrap_or(false)
    }

    // -- Transitions ---------------------------------------------------------

    /// Stop accepting writes.
    pub(crate) fn seal(&mut self, now: u64) {
        self.writable = false;
        if self.sealed_at.is_none() {
            self.sealed_at = Some(now);
        }
    }

    /// Accept writes again (empty-collection reset of the default group).
    pub(crate) fn reopen(&mut self, now: u64) {
        self.writable = true;
        self.sealed_at = None;
        self.opened_at = now;
        self.claim = None;
    }

    pub(crate) fn set_claim(&mut self, claim: Option<CompactionClaim>) {
        self.claim = claim;
    }

    /// Union of two sealed groups. The result is pending when it holds
    /// more than one shard.
    pub(crate) fn coalesce(groups: &[ShardGroup]) -> Self {
        let mut shards: Vec<Shard> = groups.iter().flat_map(|g| g.shards.iter().copied()).collect();
        shards.sort_by(|a, b| b.cmp(a));
        shards.dedup();
        let opened_at = groups.iter().map(|g| g.opened_at).min().unwrap_or(0);
        let sealed_at = groups.iter().filter_map(|g| g.sealed_at).max();
        let compaction_pending = shards.len() > 1;
        Self {
            shards,
            writable: false,
            opened_at,
            sealed_at,
            compaction_pending,
            claim: None,
        }
    }

    /// The group after all rows were merged into its oldest shard.
    pub(crate) fn compacted(&self) -> Self {
        Self {
            shards: vec![self.min_shard()],
            writable: self.writable,
            opened_at: self.opened_at,
            sealed_at: self.sealed_at,
            compaction_pending: false,
            claim: None,
        }
    }

    /// Check the per-group invariants.
    pub fn validate(&self) -> Result<()> {
        if self.shards.is_empty() {
            return Err(ShardError::InvariantViolation("empty shard group".to_string()));
        }
        if self.shards.windows(2).any(|w| w[0].index() <= w[1].index()) {
            return Err(ShardError::InvariantViolation(format!(
                "shards of group {} are not strictly newest-first",
                self
            )));
        }
        if self.compaction_pending != (self.shards.len() > 1) {
            return Err(ShardError::InvariantViolation(format!(
                "group {} reports compaction_pending={} with {} shards",
                self,
                self.compaction_pending,
                self.shards.len()
            )));
        }
        if self.writable && self.sealed_at.is_some() {
            return Err(ShardError::InvariantViolation(format!(
                "group {} is both writable and sealed",
                self
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ShardGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let indices: Vec<String> = self.shards.iter().map(|s| s.index().to_string()).collect();
        write!(
            f,
            "[{}]{}{}",
            indices.join(","),
            if self.writable { " writable" } else { "" },
            if self.compaction_pending { " pending" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed(shard: Shard, opened: u64, sealed: u64) -> ShardGroup {
        let mut group = ShardGroup::open(shard, opened);
        group.seal(sealed);
        group
    }

    #[test]
    fn test_open_group_is_writable_single_shard() {
        let group = ShardGroup::open(Shard::MIN, 100);
        assert!(group.is_writable());
        assert!(!group.is_compaction_pending());
        assert_eq!(group.min_shard(), Shard::MIN);
        assert_eq!(group.max_shard(), Shard::MIN);
        assert!(group.validate().is_ok());
    }

    #[test]
    fn test_eligibility_requires_seal_plus_delta() {
        let mut group = ShardGroup::open(Shard::new(10, 10), 10);
        assert!(!group.is_compaction_eligible(1_000_000, 100));

        group.seal(500);
        assert!(!group.is_compaction_eligible(599, 100));
        assert!(group.is_compaction_eligible(600, 100));
    }

    #[test]
    fn test_seal_keeps_first_seal_time() {
        let mut group = ShardGroup::open(Shard::new(10, 10), 10);
        group.seal(50);
        group.seal(90);
        assert_eq!(group.sealed_at(), Some(50));
    }

    #[test]
    fn test_coalesce_orders_and_marks_pending() {
        let a = sealed(Shard::MIN, 0, 100);
        let b = sealed(Shard::new(100, 100), 100, 200);
        let merged = ShardGroup::coalesce(&[a, b]);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged.max_shard().index(), 100);
        assert_eq!(merged.min_shard(), Shard::MIN);
        assert!(merged.is_compaction_pending());
        assert_eq!(merged.sealed_at(), Some(200));
        assert!(merged.validate().is_ok());
    }

    #[test]
    fn test_compacted_keeps_min_shard() {
        let a = sealed(Shard::new(5, 5), 5, 100);
        let b = sealed(Shard::new(100, 100), 100, 200);
        let merged = ShardGroup::coalesce(&[b, a]);
        let done = merged.compacted();

        assert_eq!(done.read_shards(), &[Shard::new(5, 5)]);
        assert!(!done.is_compaction_pending());
        assert_eq!(done.id(), merged.id());
    }

    #[test]
    fn test_validate_rejects_complete_multi_shard_group() {
        let mut group = ShardGroup::coalesce(&[
            sealed(Shard::MIN, 0, 1),
            sealed(Shard::new(7, 7), 7, 8),
        ]);
        group.compaction_pending = false;
        let err = group.validate().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_claim_liveness() {
        let mut group = sealed(Shard::new(3, 3), 3, 4);
        group.set_claim(Some(CompactionClaim { owner: 1, expires_at: 50 }));
        assert!(group.is_claimed(49));
        assert!(!group.is_claimed(50));
    }
}
