//! Row migration for shard group compaction.
//!
//! Moves every row of a source shard into the group's target shard, one
//! page at a time. The page only supplies keys: each row is moved with
//! `RowStore::move_row`, which takes the row's current version out of the
//! source and upserts it into the target in one store call. A mark or
//! delete that lands on the source after the page was read therefore
//! travels with the row, or leaves nothing to move.
//!
//! A row the source no longer holds is counted as dropped and skipped. It
//! was deleted, or another planner moved it after taking over an expired
//! claim; in both cases the target already holds the right state.
//!
//! Rows only move from a higher index to a lower one, so a reader walking
//! shards from the highest index down meets each row in the source or in
//! the target.

use tracing::debug;

use crate::compaction::types::MigrationStats;
use crate::edge::{EdgeMeta, Scope};
use crate::error::{Result, ShardError};
use crate::shard::ShardIndex;
use crate::store::{RowQuery, RowStore};
use crate::worker::StopSignal;

/// Move all rows of `source` into `target`.
///
/// `before_page` runs before every page read, the first one included; it
/// lets the caller renew or check its claim. The stop signal is checked
/// before every page and turns into `ShardError::Cancelled`. Rows already
/// moved stay moved, which is safe: the group still lists both shards
/// until the caller commits.
///
/// Complexity: O(R) store calls where R = rows in `source`
#[allow(clippy::too_many_arguments)]
pub fn migrate_rows<S, F>(
    store: &S,
    scope: &Scope,
    meta: &EdgeMeta,
    source: ShardIndex,
    target: ShardIndex,
    page_size: usize,
    stop: &StopSignal,
    mut before_page: F,
) -> Result<MigrationStats>
where
    S: RowStore + ?Sized,
    F: FnMut() -> Result<()>,
{
    let mut stats = MigrationStats::default();
    let mut query = RowQuery::all(page_size);

    loop {
        if stop.is_stopped() {
            return Err(ShardError::Cancelled);
        }
        before_page()?;

        let page = store.read_rows(scope, meta, source, &query)?;
        if page.rows.is_empty() {
            break;
        }
        stats.pages += 1;

        for row in &page.rows {
            let key = row.edge.key_for(meta);
            if store.move_row(scope, meta, source, target, &key)? {
                stats.rows_moved += 1;
            } else {
                stats.rows_dropped += 1;
            }
        }

        debug!(
            %meta,
            source,
            target,
            moved = stats.rows_moved,
            dropped = stats.rows_dropped,
            "migrated page"
        );

        match page.next {
            Some(next) => query = query.resume(next),
            None => break,
        }
    }

    Ok(stats)
}
