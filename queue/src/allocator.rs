//! Tick-to-tick slot allocation for the scrolling submission queue.
//!
//! Every feed update delivers a total snapshot of the runs currently eligible
//! for display (newest first). The allocator diffs that snapshot against the
//! previous [`QueueState`] and decides which run occupies which on-screen
//! position, under three rules:
//!
//! 1. **Stability** - a run's `(batch, slot)` or reserved index never changes
//!    while the run stays live; only the rank of its batch shifts as older
//!    batches retire. The renderer relies on this to animate moves instead of
//!    jumping.
//! 2. **Reserved strip** - first-to-solve runs claim the lowest free index in
//!    a fixed strip of `reserved_capacity` slots; when the strip is full they
//!    fall back to ordinary batch placement.
//! 3. **Batch rotation** - new runs fill the most recently created batch at
//!    its lowest unused slot; once it reaches `batch_capacity`, a fresh batch
//!    opens at rank 0 and everything older shifts down one rank.
//!
//! The transition is a pure function of `(previous, feed)` and commits
//! atomically, so a host can re-run a tick (or drive it from any
//! single-threaded update loop) without extra bookkeeping.

use std::collections::BTreeSet;

use overlay_types::{
    BatchId, BatchRank, QueueConfig, QueueConfigError, RenderRow, Run, RunId, SlotIndex,
};
use tracing::{debug, warn};

use crate::state::{Batch, QueueState};

/// Output of one allocation tick.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tick {
    /// State to thread into the next call.
    pub state: QueueState,
    /// Renderable rows: grid rows by ascending rank then slot, followed by
    /// reserved rows by ascending index.
    pub rows: Vec<RenderRow>,
    /// Run pulled out of the grid for the highlight area, if any.
    pub featured: Option<Run>,
}

/// The live queue slot allocator.
///
/// Holds only the validated configuration; all per-widget state is passed in
/// and returned explicitly, so one allocator can serve any number of
/// independent queues as long as each threads its own [`QueueState`].
#[derive(Clone, Debug)]
pub struct QueueAllocator {
    config: QueueConfig,
}

impl QueueAllocator {
    /// Create an allocator, rejecting a malformed configuration eagerly.
    pub fn new(config: QueueConfig) -> Result<Self, QueueConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Run one allocation tick against a total feed snapshot.
    ///
    /// Never panics for a well-formed snapshot. Duplicate ids keep their
    /// first occurrence in feed order; later ones are ignored.
    pub fn tick(&self, previous: &QueueState, feed: &[Run]) -> Tick {
        let mut state = previous.clone();

        // Deduplicate and pull out the featured run. The feed promises at
        // most one featured run per snapshot; if it sends more, the first in
        // feed order wins and the rest stay in the grid for this tick.
        let mut seen = BTreeSet::new();
        let mut grid_feed: Vec<Run> = Vec::with_capacity(feed.len());
        let mut featured: Option<Run> = None;
        for run in feed {
            if !seen.insert(run.id) {
                warn!(run = run.id.0, "duplicate run id in feed snapshot, ignoring");
                continue;
            }
            if run.featured && featured.is_none() {
                featured = Some(*run);
            } else {
                grid_feed.push(*run);
            }
        }

        self.reclaim(&mut state, &grid_feed);
        self.assign_reserved(&mut state, &grid_feed);
        self.place_new(&mut state, &grid_feed);

        let rows = emit_rows(&state);
        Tick {
            state,
            rows,
            featured,
        }
    }

    /// Purge every run that left the feed or was promoted to featured.
    /// Freed batch slots and reserved indices become assignable this same
    /// tick, but only through the lowest-free-index rules; survivors never
    /// move.
    fn reclaim(&self, state: &mut QueueState, grid_feed: &[Run]) {
        let retained: BTreeSet<RunId> = grid_feed.iter().map(|run| run.id).collect();

        let stale_reserved: Vec<RunId> = state
            .reserved
            .keys()
            .filter(|run| !retained.contains(run))
            .copied()
            .collect();
        for run in stale_reserved {
            let index = state.reserved.remove(&run);
            debug!(run = run.0, ?index, "released reserved slot");
        }

        let stale_grid: Vec<RunId> = state
            .current_runs
            .keys()
            .filter(|run| !retained.contains(run))
            .copied()
            .collect();
        for run in stale_grid {
            if let Some((batch, slot)) = state.remove_grid_run(run) {
                debug!(run = run.0, batch = batch.0, slot, "reclaimed grid slot");
                if state.batch(batch).is_none() {
                    debug!(batch = batch.0, "retired empty batch");
                }
            }
        }
    }

    /// Hand out reserved indices to first-to-solve runs, lowest index first.
    ///
    /// A run already sitting in a batch claims a freed index too; the claim
    /// pulls it out of the grid in the same transition. With the strip full,
    /// placement falls through to the ordinary batch flow (best-effort
    /// priority, not guaranteed).
    fn assign_reserved(&self, state: &mut QueueState, grid_feed: &[Run]) {
        if self.config.reserved_capacity == 0 {
            return;
        }
        for run in grid_feed.iter().filter(|run| run.first_to_solve) {
            if state.reserved.contains_key(&run.id) {
                continue;
            }
            let taken: BTreeSet<SlotIndex> = state.reserved.values().copied().collect();
            let Some(index) = (0..self.config.reserved_capacity).find(|i| !taken.contains(i))
            else {
                continue;
            };
            if state.remove_grid_run(run.id).is_some() {
                debug!(run = run.id.0, "moved from grid to reserved strip");
            }
            state.reserved.insert(run.id, index);
            debug!(run = run.id.0, index, "claimed reserved slot");
        }
    }

    /// Place every remaining new run into the open batch, opening a fresh
    /// batch at rank 0 whenever the current one is full.
    fn place_new(&self, state: &mut QueueState, grid_feed: &[Run]) {
        for run in grid_feed {
            if state.current_runs.contains_key(&run.id) || state.reserved.contains_key(&run.id) {
                continue;
            }

            // Only the newest batch ever accepts arrivals.
            let open = state.batch_order.first().copied().and_then(|id| {
                state
                    .batch(id)
                    .and_then(|batch| batch.lowest_free_slot(self.config.batch_capacity))
                    .map(|slot| (id, slot))
            });

            match open {
                Some((batch_id, slot)) => {
                    if let Some(batch) = state.batches.get_mut(&batch_id) {
                        batch.insert(slot, run.id);
                    }
                    state.current_runs.insert(run.id, batch_id);
                    debug!(run = run.id.0, batch = batch_id.0, slot, "placed in open batch");
                }
                None => {
                    let batch_id = self.mint_batch_id(state, run.id);
                    state.batches.insert(batch_id, Batch::with_occupant(0, run.id));
                    state.batch_order.insert(0, batch_id);
                    state.current_runs.insert(run.id, batch_id);
                    debug!(run = run.id.0, batch = batch_id.0, "opened new batch");
                }
            }
        }
    }

    /// Batch ids come from the opening run's id. A collision with a still
    /// live batch can only happen when the feed recycles an id whose old
    /// batch outlived it; probe upward so neither batch is disturbed.
    fn mint_batch_id(&self, state: &QueueState, opener: RunId) -> BatchId {
        let mut id = BatchId::from_opener(opener);
        while state.batch(id).is_some() {
            warn!(run = opener.0, batch = id.0, "batch id collision, probing");
            id = BatchId(id.0.wrapping_add(1));
        }
        id
    }
}

/// Emit rows in deterministic order: grid by `(rank, slot)`, reserved by
/// index. The renderer keys on `run_id` and treats the rest as a position
/// lookup key.
fn emit_rows(state: &QueueState) -> Vec<RenderRow> {
    let mut rows = Vec::with_capacity(state.grid_len() + state.reserved_len());
    for (rank, batch_id) in state.batch_order().iter().enumerate() {
        if let Some(batch) = state.batch(*batch_id) {
            for (slot, run_id) in batch.occupants() {
                rows.push(RenderRow {
                    run_id: *run_id,
                    rank: BatchRank::Grid(rank as u32),
                    slot: *slot,
                });
            }
        }
    }
    let mut reserved: Vec<(SlotIndex, RunId)> = state
        .reserved
        .iter()
        .map(|(run, slot)| (*slot, *run))
        .collect();
    reserved.sort_unstable();
    for (slot, run_id) in reserved {
        rows.push(RenderRow {
            run_id,
            rank: BatchRank::Reserved,
            slot,
        });
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(id: u64) -> Run {
        Run::new(RunId(id))
    }

    fn fts(id: u64) -> Run {
        Run::new(RunId(id)).with_first_to_solve()
    }

    fn featured(id: u64) -> Run {
        Run::new(RunId(id)).with_featured()
    }

    fn allocator(batch_capacity: u32, reserved_capacity: u32) -> QueueAllocator {
        QueueAllocator::new(QueueConfig::new(batch_capacity, reserved_capacity)).unwrap()
    }

    fn row_for(tick: &Tick, id: u64) -> RenderRow {
        tick.rows
            .iter()
            .copied()
            .find(|row| row.run_id == RunId(id))
            .unwrap_or_else(|| panic!("no row for run {id}"))
    }

    #[test]
    fn test_config_rejected_eagerly() {
        assert_eq!(
            QueueAllocator::new(QueueConfig::new(0, 2)).err(),
            Some(QueueConfigError::ZeroBatchCapacity)
        );
    }

    #[test]
    fn test_empty_feed_on_empty_state_is_noop() {
        let alloc = allocator(3, 1);
        let tick = alloc.tick(&QueueState::new(), &[]);
        assert!(tick.state.is_empty());
        assert!(tick.rows.is_empty());
        assert_eq!(tick.featured, None);
    }

    #[test]
    fn test_fill_then_overflow() {
        let alloc = allocator(3, 0);
        let config = *alloc.config();

        let t1 = alloc.tick(&QueueState::new(), &[run(1)]);
        let t2 = alloc.tick(&t1.state, &[run(1), run(2)]);
        let t3 = alloc.tick(&t2.state, &[run(1), run(2), run(3)]);
        let t4 = alloc.tick(&t3.state, &[run(1), run(2), run(3), run(4)]);

        // r1..r3 fill the first batch in arrival order.
        for (id, slot) in [(1, 0), (2, 1), (3, 2)] {
            let row = row_for(&t3, id);
            assert_eq!(row.rank, BatchRank::Grid(0));
            assert_eq!(row.slot, slot);
        }

        // r4 overflows into a fresh batch at rank 0; the full batch moves to
        // rank 1 with every slot untouched.
        let r4 = row_for(&t4, 4);
        assert_eq!(r4.rank, BatchRank::Grid(0));
        assert_eq!(r4.slot, 0);
        for (id, slot) in [(1, 0), (2, 1), (3, 2)] {
            let row = row_for(&t4, id);
            assert_eq!(row.rank, BatchRank::Grid(1));
            assert_eq!(row.slot, slot);
        }
        assert_eq!(t4.state.batch_order(), &[BatchId(4), BatchId(1)]);
        t4.state
            .check_invariants(&[run(1), run(2), run(3), run(4)], &config)
            .unwrap();
    }

    #[test]
    fn test_reclamation_keeps_positions() {
        let alloc = allocator(3, 0);

        let t1 = alloc.tick(&QueueState::new(), &[run(1), run(2), run(3)]);
        let t2 = alloc.tick(&t1.state, &[run(1), run(3)]);

        // r2's slot is vacated, not compacted: r1 keeps 0, r3 keeps 2.
        assert_eq!(row_for(&t2, 1).slot, 0);
        assert_eq!(row_for(&t2, 3).slot, 2);
        assert_eq!(t2.rows.len(), 2);
    }

    #[test]
    fn test_vacated_slot_reused_by_next_arrival() {
        let alloc = allocator(3, 0);

        let t1 = alloc.tick(&QueueState::new(), &[run(1), run(2), run(3)]);
        let t2 = alloc.tick(&t1.state, &[run(1), run(3)]);
        let t3 = alloc.tick(&t2.state, &[run(1), run(3), run(4)]);

        // Slot 1 is the lowest unused index in the open batch.
        assert_eq!(row_for(&t3, 4).rank, BatchRank::Grid(0));
        assert_eq!(row_for(&t3, 4).slot, 1);
        assert_eq!(t3.state.batch_order().len(), 1);
    }

    #[test]
    fn test_reserved_overflow_falls_back_to_grid() {
        let alloc = allocator(3, 1);

        let t1 = alloc.tick(&QueueState::new(), &[fts(1)]);
        assert_eq!(t1.state.reserved_slot_of(RunId(1)), Some(0));

        let t2 = alloc.tick(&t1.state, &[fts(1), fts(2)]);
        // Index 0 is held by r1, so r2 lands in the ordinary batch flow.
        assert_eq!(t2.state.reserved_slot_of(RunId(1)), Some(0));
        assert_eq!(t2.state.reserved_slot_of(RunId(2)), None);
        let r2 = row_for(&t2, 2);
        assert_eq!(r2.rank, BatchRank::Grid(0));
        assert_eq!(r2.slot, 0);

        let r1 = row_for(&t2, 1);
        assert!(r1.is_reserved());
        assert_eq!(r1.slot, 0);
    }

    #[test]
    fn test_reserved_index_reused_after_departure() {
        let alloc = allocator(3, 2);

        let t1 = alloc.tick(&QueueState::new(), &[fts(1), fts(2)]);
        assert_eq!(t1.state.reserved_slot_of(RunId(1)), Some(0));
        assert_eq!(t1.state.reserved_slot_of(RunId(2)), Some(1));

        // r1 leaves; r3 takes the freed index 0 while r2 stays on 1.
        let t2 = alloc.tick(&t1.state, &[fts(2), fts(3)]);
        assert_eq!(t2.state.reserved_slot_of(RunId(2)), Some(1));
        assert_eq!(t2.state.reserved_slot_of(RunId(3)), Some(0));
    }

    #[test]
    fn test_batched_fts_run_claims_freed_index() {
        let alloc = allocator(3, 1);

        let t1 = alloc.tick(&QueueState::new(), &[fts(1), fts(2)]);
        // Strip full, r2 waits in the grid.
        assert_eq!(t1.state.reserved_slot_of(RunId(2)), None);
        assert!(t1.state.grid_slot_of(RunId(2)).is_some());

        // r1 departs; r2 is promoted off the grid and its batch retires.
        let t2 = alloc.tick(&t1.state, &[fts(2)]);
        assert_eq!(t2.state.reserved_slot_of(RunId(2)), Some(0));
        assert_eq!(t2.state.grid_slot_of(RunId(2)), None);
        assert!(t2.state.batch_order().is_empty());
        assert_eq!(t2.rows.len(), 1);
        assert!(t2.rows[0].is_reserved());
    }

    #[test]
    fn test_feature_extraction_and_reentry() {
        let alloc = allocator(3, 0);

        let t1 = alloc.tick(&QueueState::new(), &[run(1), run(2)]);
        assert_eq!(row_for(&t1, 1).slot, 0);
        assert_eq!(row_for(&t1, 2).slot, 1);

        // r1 becomes featured: gone from the grid, returned separately, and
        // r2 is not renumbered.
        let t2 = alloc.tick(&t1.state, &[featured(1), run(2)]);
        assert_eq!(t2.featured, Some(featured(1)));
        assert!(t2.rows.iter().all(|row| row.run_id != RunId(1)));
        assert_eq!(row_for(&t2, 2).slot, 1);

        // Losing the flag re-enters r1 as a brand-new run: lowest unused
        // slot in the open batch, no memory of its old position.
        let t3 = alloc.tick(&t2.state, &[run(1), run(2)]);
        assert_eq!(t3.featured, None);
        assert_eq!(row_for(&t3, 1).rank, BatchRank::Grid(0));
        assert_eq!(row_for(&t3, 1).slot, 0);
        assert_eq!(row_for(&t3, 2).slot, 1);
    }

    #[test]
    fn test_featured_never_enters_state() {
        let alloc = allocator(3, 2);

        // Featured on arrival: never placed, even when flagged first-to-solve.
        let t1 = alloc.tick(
            &QueueState::new(),
            &[Run::new(RunId(1)).with_featured().with_first_to_solve()],
        );
        assert_eq!(t1.featured.map(|run| run.id), Some(RunId(1)));
        assert!(t1.state.is_empty());
        assert!(t1.rows.is_empty());
    }

    #[test]
    fn test_featured_reserved_run_is_extracted() {
        let alloc = allocator(3, 1);

        let t1 = alloc.tick(&QueueState::new(), &[fts(1)]);
        assert_eq!(t1.state.reserved_slot_of(RunId(1)), Some(0));

        let t2 = alloc.tick(&t1.state, &[fts(1).with_featured()]);
        assert_eq!(t2.featured.map(|run| run.id), Some(RunId(1)));
        assert_eq!(t2.state.reserved_len(), 0);
        assert!(t2.rows.is_empty());
    }

    #[test]
    fn test_empty_feed_drains_everything() {
        let alloc = allocator(2, 1);

        let t1 = alloc.tick(
            &QueueState::new(),
            &[fts(1), run(2), run(3), run(4)],
        );
        assert!(!t1.state.is_empty());

        let t2 = alloc.tick(&t1.state, &[]);
        assert!(t2.state.is_empty());
        assert!(t2.state.batch_order().is_empty());
        assert!(t2.rows.is_empty());
    }

    #[test]
    fn test_duplicate_ids_tolerated() {
        let alloc = allocator(3, 0);

        let tick = alloc.tick(&QueueState::new(), &[run(1), run(1), run(2)]);
        assert_eq!(tick.rows.len(), 2);
        assert_eq!(row_for(&tick, 1).slot, 0);
        assert_eq!(row_for(&tick, 2).slot, 1);
    }

    #[test]
    fn test_noop_tick_is_idempotent() {
        let alloc = allocator(2, 1);
        let feed = [fts(1), run(2), run(3), run(4)];

        let t1 = alloc.tick(&QueueState::new(), &feed);
        let t2 = alloc.tick(&t1.state, &feed);
        assert_eq!(t1.state, t2.state);
        assert_eq!(t1.rows, t2.rows);
        assert_eq!(t1.featured, t2.featured);
    }

    #[test]
    fn test_stale_slot_freed_same_tick() {
        let alloc = allocator(1, 0);

        let t1 = alloc.tick(&QueueState::new(), &[run(1)]);
        assert_eq!(t1.state.batch_order(), &[BatchId(1)]);

        // r1 left this tick; its batch retires and r2 opens a fresh one at
        // rank 0 rather than stacking behind a dead batch.
        let t2 = alloc.tick(&t1.state, &[run(2)]);
        assert_eq!(t2.state.batch_order(), &[BatchId(2)]);
        assert_eq!(row_for(&t2, 2).rank, BatchRank::Grid(0));
        assert_eq!(row_for(&t2, 2).slot, 0);
    }

    #[test]
    fn test_batch_id_collision_probes_upward() {
        let alloc = allocator(2, 0);

        // Batch 5 opened by run 5, then kept alive by run 6 after 5 leaves.
        let t1 = alloc.tick(&QueueState::new(), &[run(5)]);
        let t2 = alloc.tick(&t1.state, &[run(5), run(6)]);
        let t3 = alloc.tick(&t2.state, &[run(6), run(7)]);
        assert_eq!(t3.state.batch_order(), &[BatchId(5)]);

        // The open batch is full; a recycled id 5 arrives and must not
        // collide with the surviving batch 5.
        let t4 = alloc.tick(&t3.state, &[run(6), run(7), run(5)]);
        assert_eq!(t4.state.grid_slot_of(RunId(5)), Some((BatchId(6), 0)));
        assert_eq!(t4.state.batch_order(), &[BatchId(6), BatchId(5)]);
    }

    #[test]
    fn test_zero_reserved_capacity_routes_fts_to_grid() {
        let alloc = allocator(3, 0);

        let tick = alloc.tick(&QueueState::new(), &[fts(1)]);
        assert_eq!(tick.state.reserved_len(), 0);
        assert_eq!(row_for(&tick, 1).rank, BatchRank::Grid(0));
    }

    #[test]
    fn test_row_emission_order() {
        let alloc = allocator(2, 2);

        let tick = alloc.tick(
            &QueueState::new(),
            &[run(1), run(2), run(3), fts(4)],
        );
        let keys: Vec<(BatchRank, SlotIndex)> =
            tick.rows.iter().map(|row| (row.rank, row.slot)).collect();
        assert_eq!(
            keys,
            vec![
                (BatchRank::Grid(0), 0),
                (BatchRank::Grid(1), 0),
                (BatchRank::Grid(1), 1),
                (BatchRank::Reserved, 0),
            ]
        );
    }
}
