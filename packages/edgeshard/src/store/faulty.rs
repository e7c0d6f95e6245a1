//! A store wrapper that fails on demand.
//!
//! `FaultyStore` forwards to an inner store until a fault is armed. Armed
//! faults turn the matching calls into `ShardError::Unavailable`, which is
//! what a real store client reports for timeouts and lost connections.
//!
//! ```ignore
//! let store = Arc::new(FaultyStore::new(Arc::new(MemoryStore::new())));
//! store.fail_row_writes_after(10); // 10 row writes succeed, then they fail
//! store.fail_topology_reads(true);
//! ```

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use crate::edge::{EdgeKey, EdgeMeta, MarkedEdge, Scope};
use crate::error::{Result, ShardError};
use crate::shard::{Shard, ShardIndex, ShardTopology};
use crate::store::{CasOutcome, RowPage, RowQuery, RowStore, SuccessorSlot, TopologyStore};

/// Budget value meaning "never fail".
const UNLIMITED: i64 = -1;

pub struct FaultyStore<S> {
    inner: Arc<S>,
    /// Row writes (appends, marks, moves) left before they start failing;
    /// `UNLIMITED` when disarmed.
    row_write_budget: AtomicI64,
    fail_row_reads: AtomicBool,
    fail_topology_reads: AtomicBool,
    fail_cas: AtomicBool,
}

impl<S> FaultyStore<S> {
    /// Pass-through wrapper with no faults armed.
    pub fn new(inner: Arc<S>) -> Self {
        Self {
            inner,
            row_write_budget: AtomicI64::new(UNLIMITED),
            fail_row_reads: AtomicBool::new(false),
            fail_topology_reads: AtomicBool::new(false),
            fail_cas: AtomicBool::new(false),
        }
    }

    pub fn inner(&self) -> &Arc<S> {
        &self.inner
    }

    /// Let `n` more row writes succeed, then fail every row write.
    pub fn fail_row_writes_after(&self, n: u64) {
        self.row_write_budget.store(n as i64, Ordering::SeqCst);
    }

    pub fn fail_row_reads(&self, fail: bool) {
        self.fail_row_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_topology_reads(&self, fail: bool) {
        self.fail_topology_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_cas(&self, fail: bool) {
        self.fail_cas.store(fail, Ordering::SeqCst);
    }

    /// Disarm every fault.
    pub fn heal(&self) {
        self.row_write_budget.store(UNLIMITED, Ordering::SeqCst);
        self.fail_row_reads(false);
        self.fail_topology_reads(false);
        self.fail_cas(false);
    }

    fn take_write_budget(&self) -> Result<()> {
        let outcome = self
            .row_write_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                UNLIMITED => Some(UNLIMITED),
                0 => None,
                n => Some(n - 1),
            });
        match outcome {
            Ok(_) => Ok(()),
            Err(_) => Err(ShardError::Unavailable("injected row write failure".to_string())),
        }
    }

    fn check(flag: &AtomicBool, what: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(ShardError::Unavailable(format!("injected {} failure", what)));
        }
        Ok(())
    }
}

impl<S: TopologyStore> TopologyStore for FaultyStore<S> {
    fn load_topology(&self, scope: &Scope, meta: &EdgeMeta) -> Result<Option<ShardTopology>> {
        Self::check(&self.fail_topology_reads, "topology read")?;
        self.inner.load_topology(scope, meta)
    }

    fn create_topology_if_absent(
        &self,
        scope: &Scope,
        meta: &EdgeMeta,
        topology: ShardTopology,
    ) -> Result<ShardTopology> {
        Self::check(&self.fail_cas, "topology create")?;
        self.inner.create_topology_if_absent(scope, meta, topology)
    }

    fn compare_and_swap_topology(
        &self,
        scope: &Scope,
        meta: &EdgeMeta,
        expected_version: u64,
        topology: ShardTopology,
    ) -> Result<CasOutcome> {
        Self::check(&self.fail_cas, "topology cas")?;
        self.inner
            .compare_and_swap_topology(scope, meta, expected_version, topology)
    }

    fn claim_successor(
        &self,
        scope: &Scope,
        meta: &EdgeMeta,
        slot: SuccessorSlot,
        proposed: Shard,
    ) -> Result<Shard> {
        Self::check(&self.fail_cas, "successor claim")?;
        self.inner.claim_successor(scope, meta, slot, proposed)
    }
}

impl<S: RowStore> RowStore for FaultyStore<S> {
    fn append_row(&self, scope: &Scope, meta: &EdgeMeta, shard: ShardIndex, row: MarkedEdge) -> Result<()> {
        self.take_write_budget()?;
        self.inner.append_row(scope, meta, shard, row)
    }

    fn read_rows(&self, scope: &Scope, meta: &EdgeMeta, shard: ShardIndex, query: &RowQuery) -> Result<RowPage> {
        Self::check(&self.fail_row_reads, "row read")?;
        self.inner.read_rows(scope, meta, shard, query)
    }

    fn get_row(&self, scope: &Scope, meta: &EdgeMeta, shard: ShardIndex, key: &EdgeKey) -> Result<Option<MarkedEdge>> {
        Self::check(&self.fail_row_reads, "row read")?;
        self.inner.get_row(scope, meta, shard, key)
    }

    fn delete_row(&self, scope: &Scope, meta: &EdgeMeta, shard: ShardIndex, key: &EdgeKey) -> Result<bool> {
        self.inner.delete_row(scope, meta, shard, key)
    }

    fn mark_row(&self, scope: &Scope, meta: &EdgeMeta, shard: ShardIndex, key: &EdgeKey) -> Result<bool> {
        self.take_write_budget()?;
        self.inner.mark_row(scope, meta, shard, key)
    }

    fn move_row(&self, scope: &Scope, meta: &EdgeMeta, from: ShardIndex, to: ShardIndex, key: &EdgeKey) -> Result<bool> {
        self.take_write_budget()?;
        self.inner.move_row(scope, meta, from, to, key)
    }

    fn count_rows(&self, scope: &Scope, meta: &EdgeMeta, shard: ShardIndex) -> Result<u64> {
        Self::check(&self.fail_row_reads, "row count")?;
        self.inner.count_rows(scope, meta, shard)
    }
}
