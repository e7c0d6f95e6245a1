//! Compaction planner for shard groups.
//!
//! Decides which groups may be compacted and drives the merge:
//! 1. `rebalance()`: topology-level cleanup of sealed groups
//!    (dissolve empty ones, coalesce small neighbours, hand writes back
//!    to the default shard once the collection is empty)
//! 2. `evaluate()`: per group; claims an eligible group, migrates its rows
//!    into the oldest shard and commits the single-shard group
//!
//! The planner does NOT cache anything. Every step starts from the stored
//! topology and ends in a compare-and-swap, so planners of several nodes
//! can work the same edge path. Exclusivity for row migration comes from a
//! `CompactionClaim` written into the group; a claim is a lease of
//! `min_delta_ms`, checked before every migrated page and renewed once
//! half of it is used, so a crashed planner's claim expires and the group
//! is picked up again. A planner that finds its claim gone stops with
//! `ShardError::Contention`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::allocator::MAX_CAS_ATTEMPTS;
use crate::clock::Clock;
use crate::compaction::merge::migrate_rows;
use crate::compaction::types::{CompactionReport, CompactionStatus, MigrationStats, RebalanceReport};
use crate::config::{ConfigHandle, ShardConfig};
use crate::edge::{EdgeMeta, Scope};
use crate::error::{Result, ShardError};
use crate::shard::{CompactionClaim, ShardGroup, ShardIndex, ShardTopology};
use crate::store::{CasOutcome, EdgeStore};
use crate::worker::StopSignal;

/// Migration passes before rows still showing up in sources is an error.
pub const MAX_VERIFY_PASSES: u32 = 3;

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

/// Outcome of trying to claim a group.
enum ClaimAttempt {
    Claimed(ShardGroup),
    /// Nothing to do for this planner; report this status.
    Settled(CompactionStatus),
}

pub struct CompactionPlanner<S> {
    store: Arc<S>,
    config: ConfigHandle,
    clock: Arc<dyn Clock>,
    owner: u64,
}

impl<S: EdgeStore> CompactionPlanner<S> {
    pub fn new(store: Arc<S>, config: ConfigHandle, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            config,
            clock,
            owner: NEXT_OWNER.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Claim owner id of this planner; unique within the process.
    pub fn owner(&self) -> u64 {
        self.owner
    }

    // ── Per-group evaluation ───────────────────────────────────────

    /// Evaluate one group, compacting it when eligible.
    pub fn evaluate(&self, scope: &Scope, meta: &EdgeMeta, group: &ShardGroup) -> Result<CompactionStatus> {
        self.evaluate_until(scope, meta, group, &StopSignal::never())
    }

    /// Like `evaluate`, but a raised `stop` cancels migration between pages.
    ///
    /// Returns `Complete` once the group holds one shard, `Pending` while
    /// it is not eligible (or no longer exists in that shape), and
    /// `Compacting` while another planner holds a live claim.
    pub fn evaluate_until(
        &self,
        scope: &Scope,
        meta: &EdgeMeta,
        group: &ShardGroup,
        stop: &StopSignal,
    ) -> Result<CompactionStatus> {
        let config = self.config.snapshot();
        group.validate()?;
        if group.len() == 1 {
            return Ok(CompactionStatus::Complete);
        }
        if !group.is_compaction_eligible(self.clock.now_ms(), config.min_delta_ms) {
            return Ok(CompactionStatus::Pending);
        }

        let claimed = match self.claim(scope, meta, group.id(), &config)? {
            ClaimAttempt::Claimed(claimed) => claimed,
            ClaimAttempt::Settled(status) => return Ok(status),
        };

        match self.compact_claimed(scope, meta, &claimed, stop, &config) {
            Ok(report) => {
                info!(
                    %meta,
                    group = report.group,
                    merged = ?report.shards_merged,
                    moved = report.stats.rows_moved,
                    dropped = report.stats.rows_dropped,
                    passes = report.passes,
                    duration_ms = report.duration_ms,
                    "compacted shard group"
                );
                Ok(CompactionStatus::Complete)
            }
            Err(err) => {
                self.release(scope, meta, claimed.id());
                Err(err)
            }
        }
    }

    fn claim(&self, scope: &Scope, meta: &EdgeMeta, id: ShardIndex, config: &ShardConfig) -> Result<ClaimAttempt> {
        for attempt in 0..MAX_CAS_ATTEMPTS {
            let topology = self.load(scope, meta)?;
            let Some(current) = topology.group(id) else {
                return Ok(ClaimAttempt::Settled(CompactionStatus::Pending));
            };
            if current.len() == 1 {
                return Ok(ClaimAttempt::Settled(CompactionStatus::Complete));
            }
            let now = self.clock.now_ms();
            if !current.is_compaction_eligible(now, config.min_delta_ms) {
                return Ok(ClaimAttempt::Settled(CompactionStatus::Pending));
            }
            if let Some(held) = current.claim() {
                if held.is_live(now) && held.owner != self.owner {
                    debug!(%meta, group = id, owner = held.owner, "group claimed by another planner");
                    return Ok(ClaimAttempt::Settled(CompactionStatus::Compacting));
                }
            }

            let mut claimed = current.clone();
            claimed.set_claim(Some(CompactionClaim {
                owner: self.owner,
                expires_at: now + config.min_delta_ms,
            }));
            let next = topology.with_group(id, claimed.clone())?;
            match self.store.compare_and_swap_topology(scope, meta, topology.version(), next)? {
                CasOutcome::Committed(_) => return Ok(ClaimAttempt::Claimed(claimed)),
                CasOutcome::Conflict => {
                    debug!(%meta, group = id, attempt, "topology changed while claiming, retrying");
                }
            }
        }
        Err(ShardError::Contention(format!(
            "could not claim group {} of {}",
            id, meta
        )))
    }

    fn compact_claimed(
        &self,
        scope: &Scope,
        meta: &EdgeMeta,
        group: &ShardGroup,
        stop: &StopSignal,
        config: &ShardConfig,
    ) -> Result<CompactionReport> {
        let started = self.clock.now_ms();
        let id = group.id();
        let target = group.min_shard().index();
        let sources: Vec<ShardIndex> = group
            .read_shards()
            .iter()
            .map(|s| s.index())
            .filter(|index| *index != target)
            .collect();
        let mut claim = group
            .claim()
            .ok_or_else(|| ShardError::InvariantViolation(format!("group {} compacted without a claim", id)))?;

        let mut stats = MigrationStats::default();
        let mut passes = 0u32;
        loop {
            passes += 1;
            for &source in &sources {
                let moved = migrate_rows(
                    self.store.as_ref(),
                    scope,
                    meta,
                    source,
                    target,
                    config.compaction_page_size,
                    stop,
                    || self.renew_claim(scope, meta, id, &mut claim, config),
                )?;
                stats.absorb(&moved);
            }

            let mut remaining = 0u64;
            for &source in &sources {
                remaining += self.store.count_rows(scope, meta, source)?;
            }
            if remaining == 0 {
                break;
            }
            if passes >= MAX_VERIFY_PASSES {
                return Err(ShardError::Contention(format!(
                    "{} rows still arriving in sealed shards of group {} after {} passes",
                    remaining, id, passes
                )));
            }
            warn!(%meta, group = id, remaining, "rows left in source shards, migrating again");
        }

        self.commit(scope, meta, id)?;
        Ok(CompactionReport {
            group: id,
            shards_merged: sources,
            stats,
            passes,
            duration_ms: self.clock.now_ms().saturating_sub(started),
        })
    }

    /// Replace the claimed group by its single target shard.
    fn commit(&self, scope: &Scope, meta: &EdgeMeta, id: ShardIndex) -> Result<()> {
        for attempt in 0..MAX_CAS_ATTEMPTS {
            let topology = self.load(scope, meta)?;
            let current = self.owned_group(&topology, id)?;
            let next = topology.with_group(id, current.compacted())?;
            match self.store.compare_and_swap_topology(scope, meta, topology.version(), next)? {
                CasOutcome::Committed(_) => return Ok(()),
                CasOutcome::Conflict => {
                    warn!(%meta, group = id, attempt, "topology changed during compaction commit, retrying");
                }
            }
        }
        Err(ShardError::Contention(format!(
            "could not commit compaction of group {} of {}",
            id, meta
        )))
    }

    /// Check that the claim is still ours; extend it once less than half
    /// of the lease is left.
    fn renew_claim(
        &self,
        scope: &Scope,
        meta: &EdgeMeta,
        id: ShardIndex,
        claim: &mut CompactionClaim,
        config: &ShardConfig,
    ) -> Result<()> {
        let now = self.clock.now_ms();
        for _ in 0..MAX_CAS_ATTEMPTS {
            let topology = self.load(scope, meta)?;
            let mut current = self.owned_group(&topology, id)?.clone();
            if now + config.min_delta_ms / 2 < claim.expires_at {
                return Ok(());
            }
            let renewed = CompactionClaim {
                owner: self.owner,
                expires_at: now + config.min_delta_ms,
            };
            current.set_claim(Some(renewed));
            let next = topology.with_group(id, current)?;
            if let CasOutcome::Committed(_) =
                self.store.compare_and_swap_topology(scope, meta, topology.version(), next)?
            {
                debug!(%meta, group = id, expires_at = renewed.expires_at, "renewed compaction claim");
                *claim = renewed;
                return Ok(());
            }
        }
        Err(ShardError::Contention(format!(
            "could not renew claim on group {} of {}",
            id, meta
        )))
    }

    /// Clear our claim so the group can be retried at once. Best effort:
    /// if this fails the claim simply expires.
    fn release(&self, scope: &Scope, meta: &EdgeMeta, id: ShardIndex) {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let topology = match self.load(scope, meta) {
                Ok(topology) => topology,
                Err(err) => {
                    warn!(%meta, group = id, error = %err, "could not release compaction claim");
                    return;
                }
            };
            let Ok(current) = self.owned_group(&topology, id) else {
                return;
            };
            let mut released = current.clone();
            released.set_claim(None);
            let outcome = topology
                .with_group(id, released)
                .and_then(|next| self.store.compare_and_swap_topology(scope, meta, topology.version(), next));
            match outcome {
                Ok(CasOutcome::Committed(_)) => {
                    warn!(%meta, group = id, "released compaction claim");
                    return;
                }
                Ok(CasOutcome::Conflict) => continue,
                Err(err) => {
                    warn!(%meta, group = id, error = %err, "could not release compaction claim");
                    return;
                }
            }
        }
    }

    fn owned_group<'a>(&self, topology: &'a ShardTopology, id: ShardIndex) -> Result<&'a ShardGroup> {
        topology
            .group(id)
            .filter(|g| g.claim().map(|c| c.owner) == Some(self.owner))
            .ok_or_else(|| ShardError::Contention(format!("compaction claim on group {} lost", id)))
    }

    /// Stored topology, validated before any group is looked up in it.
    fn load(&self, scope: &Scope, meta: &EdgeMeta) -> Result<ShardTopology> {
        let topology = self
            .store
            .load_topology(scope, meta)?
            .ok_or_else(|| ShardError::TopologyNotFound(meta.to_string()))?;
        topology.validate()?;
        Ok(topology)
    }

    // ── Topology rebalancing ───────────────────────────────────────

    /// Dissolve, coalesce and reset sealed groups in one CAS.
    ///
    /// Only groups that are sealed, past `min_delta` and unclaimed are
    /// touched. Does nothing for an edge path without a topology.
    pub fn rebalance(&self, scope: &Scope, meta: &EdgeMeta) -> Result<RebalanceReport> {
        let config = self.config.snapshot();
        for attempt in 0..MAX_CAS_ATTEMPTS {
            let Some(topology) = self.store.load_topology(scope, meta)? else {
                return Ok(RebalanceReport::default());
            };
            topology.validate()?;
            let now = self.clock.now_ms();
            let (next, report) = self.plan_rebalance(scope, meta, &topology, now, &config)?;
            if report.is_empty() {
                return Ok(report);
            }
            next.validate()?;

            match self.store.compare_and_swap_topology(scope, meta, topology.version(), next)? {
                CasOutcome::Committed(committed) => {
                    info!(
                        %meta,
                        dissolved = ?report.dissolved,
                        coalesced = ?report.coalesced,
                        reopened_default = report.reopened_default,
                        groups = committed.groups().len(),
                        "rebalanced shard groups"
                    );
                    return Ok(report);
                }
                CasOutcome::Conflict => {
                    warn!(%meta, attempt, "topology changed during rebalance, retrying");
                }
            }
        }
        Err(ShardError::Contention(format!("could not rebalance {}", meta)))
    }

    fn plan_rebalance(
        &self,
        scope: &Scope,
        meta: &EdgeMeta,
        topology: &ShardTopology,
        now: u64,
        config: &ShardConfig,
    ) -> Result<(ShardTopology, RebalanceReport)> {
        let mut rows: HashMap<ShardIndex, u64> = HashMap::new();
        for group in topology.groups() {
            let mut total = 0u64;
            for shard in group.read_shards() {
                total += self.store.count_rows(scope, meta, shard.index())?;
            }
            rows.insert(group.id(), total);
        }
        let rows_of = |g: &ShardGroup| rows.get(&g.id()).copied().unwrap_or(0);
        let candidate = |g: &ShardGroup| {
            !g.is_writable() && g.is_compaction_eligible(now, config.min_delta_ms) && !g.is_claimed(now)
        };

        let mut report = RebalanceReport::default();
        let mut next = topology.clone();

        // Empty sealed groups have nothing to merge; drop them.
        for group in topology.groups() {
            if candidate(group) && !group.contains_default() && rows_of(group) == 0 {
                next = next.without_group(group.id());
                report.dissolved.push(group.id());
            }
        }

        // Adjacent sealed groups that fit in one shard become one group.
        let mut runs: Vec<Vec<ShardGroup>> = Vec::new();
        let mut run: Vec<ShardGroup> = Vec::new();
        let mut run_rows = 0u64;
        for group in next.groups().iter().filter(|g| !g.is_writable()) {
            if candidate(group) && run_rows + rows_of(group) <= config.shard_size {
                run_rows += rows_of(group);
                run.push(group.clone());
                continue;
            }
            if run.len() > 1 {
                runs.push(std::mem::take(&mut run));
            }
            run.clear();
            run_rows = 0;
            if candidate(group) {
                run_rows = rows_of(group);
                run.push(group.clone());
            }
        }
        if run.len() > 1 {
            runs.push(run);
        }
        for run in runs {
            let ids: Vec<ShardIndex> = run.iter().map(|g| g.id()).collect();
            next = next.with_coalesced(&ids, ShardGroup::coalesce(&run));
            report.coalesced.push(ids);
        }

        // An emptied collection goes back to its default shard.
        let total_rows: u64 = rows.values().sum();
        if total_rows == 0 && next.groups().len() == 2 {
            let writable = &next.groups()[0];
            let sealed = &next.groups()[1];
            let settled_default = sealed.len() == 1 && sealed.contains_default() && !sealed.is_claimed(now);
            let writable_aged = now.saturating_sub(writable.opened_at()) >= config.min_delta_ms;
            if settled_default && writable.is_writable() && !writable.contains_default() && writable_aged {
                let mut default_group = sealed.clone();
                default_group.reopen(now);
                let mut retired = writable.clone();
                retired.seal(now);
                next = ShardTopology::from_parts(next.version(), vec![default_group, retired], next.high_water_index());
                report.reopened_default = true;
            }
        }

        Ok((next, report))
    }

    // ── Driving ────────────────────────────────────────────────────

    /// Rebalance, then evaluate every group of the edge path.
    ///
    /// Store failures of single groups are logged and skipped; invariant
    /// violations and cancellation are returned.
    pub fn drive(&self, scope: &Scope, meta: &EdgeMeta, stop: &StopSignal) -> Result<Vec<(ShardIndex, CompactionStatus)>> {
        if let Err(err) = self.rebalance(scope, meta) {
            if err.is_fatal() {
                return Err(err);
            }
            warn!(%meta, error = %err, "rebalance failed");
        }

        let Some(topology) = self.store.load_topology(scope, meta)? else {
            return Ok(Vec::new());
        };
        topology.validate()?;

        let mut statuses = Vec::with_capacity(topology.groups().len());
        for group in topology.groups() {
            match self.evaluate_until(scope, meta, group, stop) {
                Ok(status) => statuses.push((group.id(), status)),
                Err(err) if err.is_fatal() || matches!(err, ShardError::Cancelled) => return Err(err),
                Err(err) => {
                    warn!(%meta, group = group.id(), error = %err, "compaction evaluation failed");
                }
            }
        }
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{ShardAllocator, WriteLoad};
    use crate::clock::ManualClock;
    use crate::edge::{Edge, MarkedEdge, NodeId};
    use crate::store::{MemoryStore, RowStore, TopologyStore};
    use std::time::Duration;

    const TTL_MS: u64 = 100;
    const MIN_DELTA_MS: u64 = 250;

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        allocator: ShardAllocator<MemoryStore>,
        planner: CompactionPlanner<MemoryStore>,
        scope: Scope,
        meta: EdgeMeta,
        source: NodeId,
    }

    fn fixture(shard_size: u64) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(10_000));
        let config = ShardConfig::new(shard_size, Duration::from_millis(TTL_MS), Duration::from_millis(MIN_DELTA_MS))
            .with_shard_min_age(Duration::ZERO)
            .with_compaction_page_size(3);
        let handle = ConfigHandle::new(config).unwrap();
        let source = NodeId::from_name("source", "planner");
        Fixture {
            allocator: ShardAllocator::new(store.clone(), handle.clone(), clock.clone()),
            planner: CompactionPlanner::new(store.clone(), handle, clock.clone()),
            meta: EdgeMeta::from_source_node(source.clone(), "test"),
            scope: Scope::named("planner"),
            store,
            clock,
            source,
        }
    }

    impl Fixture {
        fn write(&self, shard: ShardIndex, n: u64) {
            for _ in 0..n {
                let ts = self.clock.now_ms();
                self.clock.advance_ms(1);
                let target = NodeId::from_name("target", &format!("{}", ts));
                let edge = Edge::new(self.source.clone(), "test", target, ts);
                self.store.append_row(&self.scope, &self.meta, shard, MarkedEdge::new(edge)).unwrap();
            }
        }

        fn split(&self) -> ShardIndex {
            let load = self.allocator.observe_write_load(&self.scope, &self.meta).unwrap();
            let load = WriteLoad { edge_count: u64::MAX, ..load };
            self.allocator
                .get_or_create_write_shard(&self.scope, &self.meta, load)
                .unwrap()
                .shard
                .index()
        }

        fn topology(&self) -> ShardTopology {
            self.store.load_topology(&self.scope, &self.meta).unwrap().unwrap()
        }

        fn clear_all(&self) {
            for shard in self.topology().all_shards_desc() {
                let page = self
                    .store
                    .read_rows(&self.scope, &self.meta, shard.index(), &crate::store::RowQuery::all(10_000))
                    .unwrap();
                for row in page.rows {
                    let key = row.edge.key_for(&self.meta);
                    self.store.delete_row(&self.scope, &self.meta, shard.index(), &key).unwrap();
                }
            }
        }
    }

    #[test]
    fn test_single_shard_group_is_complete() {
        let fx = fixture(10);
        fx.allocator.load_or_init(&fx.scope, &fx.meta).unwrap();
        let group = fx.topology().groups()[0].clone();
        assert_eq!(fx.planner.evaluate(&fx.scope, &fx.meta, &group).unwrap(), CompactionStatus::Complete);
    }

    #[test]
    fn test_small_neighbours_coalesce_then_compact() {
        let fx = fixture(10);
        fx.allocator.load_or_init(&fx.scope, &fx.meta).unwrap();
        fx.write(0, 4);
        let s1 = fx.split();
        fx.write(s1, 4);
        let s2 = fx.split();
        fx.write(s2, 1);

        // too young
        assert!(fx.planner.rebalance(&fx.scope, &fx.meta).unwrap().is_empty());

        fx.clock.advance_ms(MIN_DELTA_MS);
        let report = fx.planner.rebalance(&fx.scope, &fx.meta).unwrap();
        assert_eq!(report.coalesced, vec![vec![s1, 0]]);

        let topology = fx.topology();
        let pending = topology.groups()[1].clone();
        assert!(pending.is_compaction_pending());
        assert_eq!(pending.min_shard().index(), 0);

        let status = fx.planner.evaluate(&fx.scope, &fx.meta, &pending).unwrap();
        assert_eq!(status, CompactionStatus::Complete);

        let topology = fx.topology();
        assert!(topology.validate().is_ok());
        assert_eq!(topology.shard_count(), 2);
        assert_eq!(fx.store.count_rows(&fx.scope, &fx.meta, 0).unwrap(), 8);
        assert_eq!(fx.store.count_rows(&fx.scope, &fx.meta, s1).unwrap(), 0);
        assert!(topology.groups()[1].claim().is_none());
    }

    #[test]
    fn test_full_groups_do_not_coalesce() {
        let fx = fixture(5);
        fx.allocator.load_or_init(&fx.scope, &fx.meta).unwrap();
        fx.write(0, 5);
        let s1 = fx.split();
        fx.write(s1, 5);
        fx.split();

        fx.clock.advance_ms(MIN_DELTA_MS);
        let report = fx.planner.rebalance(&fx.scope, &fx.meta).unwrap();
        assert!(report.is_empty());
        assert_eq!(fx.topology().groups().len(), 3);
    }

    #[test]
    fn test_pending_group_not_eligible_before_min_delta() {
        let fx = fixture(10);
        fx.allocator.load_or_init(&fx.scope, &fx.meta).unwrap();
        fx.write(0, 2);
        let s1 = fx.split();
        fx.write(s1, 2);
        fx.split();
        fx.clock.advance_ms(MIN_DELTA_MS);
        fx.planner.rebalance(&fx.scope, &fx.meta).unwrap();

        // a freshly sealed copy is turned away without touching the store
        let pending = fx.topology().groups()[1].clone();
        let young = {
            let mut g = pending.clone();
            g.reopen(fx.clock.now_ms());
            g.seal(fx.clock.now_ms());
            g
        };
        assert_eq!(fx.planner.evaluate(&fx.scope, &fx.meta, &young).unwrap(), CompactionStatus::Pending);
    }

    #[test]
    fn test_claimed_group_reports_compacting() {
        let fx = fixture(10);
        fx.allocator.load_or_init(&fx.scope, &fx.meta).unwrap();
        fx.write(0, 2);
        let s1 = fx.split();
        fx.write(s1, 2);
        fx.split();
        fx.clock.advance_ms(MIN_DELTA_MS);
        fx.planner.rebalance(&fx.scope, &fx.meta).unwrap();

        let topology = fx.topology();
        let mut claimed = topology.groups()[1].clone();
        claimed.set_claim(Some(CompactionClaim {
            owner: u64::MAX,
            expires_at: fx.clock.now_ms() + MIN_DELTA_MS,
        }));
        let next = topology.with_group(claimed.id(), claimed.clone()).unwrap();
        fx.store
            .compare_and_swap_topology(&fx.scope, &fx.meta, topology.version(), next)
            .unwrap();

        let status = fx.planner.evaluate(&fx.scope, &fx.meta, &claimed).unwrap();
        assert_eq!(status, CompactionStatus::Compacting);

        // the lease runs out and the group is taken over
        fx.clock.advance_ms(MIN_DELTA_MS);
        let status = fx.planner.evaluate(&fx.scope, &fx.meta, &claimed).unwrap();
        assert_eq!(status, CompactionStatus::Complete);
    }

    #[test]
    fn test_empty_collection_returns_to_default_shard() {
        let fx = fixture(3);
        fx.allocator.load_or_init(&fx.scope, &fx.meta).unwrap();
        fx.write(0, 3);
        let s1 = fx.split();
        fx.write(s1, 3);
        let s2 = fx.split();
        fx.write(s2, 3);
        fx.split();
        fx.clear_all();

        fx.clock.advance_ms(MIN_DELTA_MS);
        let report = fx.planner.rebalance(&fx.scope, &fx.meta).unwrap();
        assert_eq!(report.dissolved.len(), 2);
        assert!(report.reopened_default);

        let topology = fx.topology();
        assert_eq!(topology.write_shard().unwrap().index(), 0);
        assert_eq!(topology.groups().len(), 2);

        fx.clock.advance_ms(MIN_DELTA_MS);
        let report = fx.planner.rebalance(&fx.scope, &fx.meta).unwrap();
        assert_eq!(report.dissolved.len(), 1);

        let topology = fx.topology();
        assert_eq!(topology.shard_count(), 1);
        assert_eq!(topology.all_shards_desc()[0].index(), 0);
        assert!(topology.validate().is_ok());
    }

    #[test]
    fn test_split_after_reopen_uses_fresh_index() {
        let fx = fixture(3);
        fx.allocator.load_or_init(&fx.scope, &fx.meta).unwrap();
        let s1 = fx.split();
        fx.clock.advance_ms(MIN_DELTA_MS);
        fx.planner.rebalance(&fx.scope, &fx.meta).unwrap();
        assert_eq!(fx.topology().write_shard().unwrap().index(), 0);

        let s2 = fx.split();
        assert!(s2 > s1);
        assert!(fx.topology().validate().is_ok());
    }

    #[test]
    fn test_drive_reports_every_group() {
        let fx = fixture(10);
        fx.allocator.load_or_init(&fx.scope, &fx.meta).unwrap();
        fx.write(0, 2);
        let s1 = fx.split();
        fx.write(s1, 2);
        fx.split();
        fx.clock.advance_ms(MIN_DELTA_MS);

        let statuses = fx.planner.drive(&fx.scope, &fx.meta, &StopSignal::never()).unwrap();
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|(_, s)| *s == CompactionStatus::Complete));
        assert_eq!(fx.store.populated_shards(&fx.scope, &fx.meta), vec![0]);
    }

    #[test]
    fn test_claim_with_empty_stored_group_is_reported() {
        let fx = fixture(10);
        fx.allocator.load_or_init(&fx.scope, &fx.meta).unwrap();
        fx.write(0, 2);
        let s1 = fx.split();
        fx.write(s1, 2);
        fx.split();
        fx.clock.advance_ms(MIN_DELTA_MS);
        fx.planner.rebalance(&fx.scope, &fx.meta).unwrap();
        let topology = fx.topology();
        let pending = topology.groups()[1].clone();

        let empty: ShardGroup = serde_json::from_value(serde_json::json!({
            "shards": [],
            "writable": false,
            "opened_at": 0,
            "sealed_at": 1,
            "compaction_pending": false,
            "claim": null
        }))
        .unwrap();
        let mut groups = topology.groups().to_vec();
        groups.push(empty);
        let broken = ShardTopology::from_parts(topology.version(), groups, topology.high_water_index());
        fx.store.force_topology(&fx.scope, &fx.meta, &broken).unwrap();

        let err = fx.planner.evaluate(&fx.scope, &fx.meta, &pending).unwrap_err();
        assert_eq!(err.code(), "INVARIANT_VIOLATION");
        assert!(fx.allocator.observe_write_load(&fx.scope, &fx.meta).unwrap_err().is_fatal());
        assert_eq!(fx.topology(), broken);
    }

    #[test]
    fn test_lost_claim_stops_migration() {
        let fx = fixture(10);
        fx.allocator.load_or_init(&fx.scope, &fx.meta).unwrap();
        fx.write(0, 2);
        let s1 = fx.split();
        fx.write(s1, 2);
        fx.split();
        fx.clock.advance_ms(MIN_DELTA_MS);
        fx.planner.rebalance(&fx.scope, &fx.meta).unwrap();

        let id = fx.topology().groups()[1].id();
        let config = fx.planner.config.snapshot();
        let claimed = match fx.planner.claim(&fx.scope, &fx.meta, id, &config).unwrap() {
            ClaimAttempt::Claimed(group) => group,
            ClaimAttempt::Settled(status) => panic!("not claimed: {:?}", status),
        };

        // the lease runs out and another planner commits the group
        fx.clock.advance_ms(MIN_DELTA_MS);
        let other = CompactionPlanner::new(fx.store.clone(), fx.planner.config.clone(), fx.clock.clone());
        assert_eq!(other.evaluate(&fx.scope, &fx.meta, &claimed).unwrap(), CompactionStatus::Complete);

        let err = fx
            .planner
            .compact_claimed(&fx.scope, &fx.meta, &claimed, &StopSignal::never(), &config)
            .unwrap_err();
        assert!(matches!(err, ShardError::Contention(_)));
        assert_eq!(fx.store.count_rows(&fx.scope, &fx.meta, 0).unwrap(), 4);
        assert_eq!(fx.store.populated_shards(&fx.scope, &fx.meta), vec![0]);
    }

    #[test]
    fn test_broken_topology_is_reported() {
        let fx = fixture(10);
        let broken = ShardTopology::initial(0)
            .with_successor(crate::shard::Shard::new(5, 5), 5)
            .unwrap()
            .without_group(0);
        fx.store.force_topology(&fx.scope, &fx.meta, &broken).unwrap();

        let err = fx.planner.rebalance(&fx.scope, &fx.meta).unwrap_err();
        assert!(err.is_fatal());
    }
}
