//! Allocator state threaded between ticks.
//!
//! The host owns exactly one [`QueueState`] per queue widget and passes it to
//! every [`tick`](crate::QueueAllocator::tick), storing the returned state for
//! the next call. The state is mutated only by the allocator; everything here
//! is ordered (`BTreeMap`/`Vec`) so iteration order can never leak
//! non-determinism into the emitted rows.

use std::collections::{BTreeMap, BTreeSet};

use overlay_types::{BatchId, QueueConfig, Run, RunId, SlotIndex};
use thiserror::Error;

/// Occupancy of a single display batch, keyed by slot index.
///
/// Slot indices are never renumbered while occupants remain; a freed index is
/// only reused through the lowest-free-index assignment rule. That is what
/// keeps surviving entries visually stationary across ticks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Batch {
    occupants: BTreeMap<SlotIndex, RunId>,
}

impl Batch {
    /// A fresh batch holding a single run at the given slot.
    pub(crate) fn with_occupant(slot: SlotIndex, run: RunId) -> Self {
        let mut occupants = BTreeMap::new();
        occupants.insert(slot, run);
        Self { occupants }
    }

    /// Occupants by ascending slot index.
    pub fn occupants(&self) -> &BTreeMap<SlotIndex, RunId> {
        &self.occupants
    }

    pub fn len(&self) -> usize {
        self.occupants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.occupants.is_empty()
    }

    /// Lowest unused slot index in `[0, capacity)`, if the batch has room.
    pub(crate) fn lowest_free_slot(&self, capacity: u32) -> Option<SlotIndex> {
        (0..capacity).find(|slot| !self.occupants.contains_key(slot))
    }

    pub(crate) fn insert(&mut self, slot: SlotIndex, run: RunId) {
        self.occupants.insert(slot, run);
    }

    /// Remove a run by id, returning the slot it vacated.
    pub(crate) fn remove_run(&mut self, run: RunId) -> Option<SlotIndex> {
        let slot = self
            .occupants
            .iter()
            .find(|(_, occupant)| **occupant == run)
            .map(|(slot, _)| *slot)?;
        self.occupants.remove(&slot);
        Some(slot)
    }
}

/// Full allocator state: grid membership, batch contents, batch rank order,
/// and the reserved first-to-solve strip.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueState {
    /// Which batch each grid run lives in.
    pub(crate) current_runs: BTreeMap<RunId, BatchId>,
    /// Contents of every live batch.
    pub(crate) batches: BTreeMap<BatchId, Batch>,
    /// Live batches, newest-created first. Index in this list is the batch's
    /// on-screen rank.
    pub(crate) batch_order: Vec<BatchId>,
    /// Reserved-strip assignment for first-to-solve runs.
    pub(crate) reserved: BTreeMap<RunId, SlotIndex>,
}

impl QueueState {
    /// Empty state, the starting point before the first tick.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.current_runs.is_empty() && self.reserved.is_empty()
    }

    /// Number of runs currently placed in the grid.
    pub fn grid_len(&self) -> usize {
        self.current_runs.len()
    }

    /// Number of runs currently holding a reserved index.
    pub fn reserved_len(&self) -> usize {
        self.reserved.len()
    }

    /// Live batches, newest-created first.
    pub fn batch_order(&self) -> &[BatchId] {
        &self.batch_order
    }

    pub fn batch(&self, id: BatchId) -> Option<&Batch> {
        self.batches.get(&id)
    }

    /// On-screen rank of a batch, if it is live.
    pub fn rank_of(&self, batch: BatchId) -> Option<u32> {
        self.batch_order
            .iter()
            .position(|id| *id == batch)
            .map(|rank| rank as u32)
    }

    /// Grid position of a run as a stable `(batch, slot)` identity.
    pub fn grid_slot_of(&self, run: RunId) -> Option<(BatchId, SlotIndex)> {
        let batch_id = *self.current_runs.get(&run)?;
        let slot = self
            .batches
            .get(&batch_id)?
            .occupants()
            .iter()
            .find(|(_, occupant)| **occupant == run)
            .map(|(slot, _)| *slot)?;
        Some((batch_id, slot))
    }

    /// Reserved index held by a run, if any.
    pub fn reserved_slot_of(&self, run: RunId) -> Option<SlotIndex> {
        self.reserved.get(&run).copied()
    }

    /// All grid runs with the batch each lives in, in id order.
    pub fn grid_runs(&self) -> impl Iterator<Item = (RunId, BatchId)> + '_ {
        self.current_runs.iter().map(|(run, batch)| (*run, *batch))
    }

    /// All reserved runs with their indices, in id order.
    pub fn reserved_runs(&self) -> impl Iterator<Item = (RunId, SlotIndex)> + '_ {
        self.reserved.iter().map(|(run, slot)| (*run, *slot))
    }

    /// Remove a run from the grid, retiring its batch if that empties it.
    /// Returns the vacated position.
    pub(crate) fn remove_grid_run(&mut self, run: RunId) -> Option<(BatchId, SlotIndex)> {
        let batch_id = self.current_runs.remove(&run)?;
        let mut vacated = None;
        if let Some(batch) = self.batches.get_mut(&batch_id) {
            vacated = batch.remove_run(run).map(|slot| (batch_id, slot));
            if batch.is_empty() {
                self.batches.remove(&batch_id);
                self.batch_order.retain(|id| *id != batch_id);
            }
        }
        vacated
    }

    /// Verify every structural invariant against the latest feed snapshot.
    ///
    /// Used by tests and property checks; the transition function maintains
    /// these by construction and does not re-verify on the hot path.
    pub fn check_invariants(
        &self,
        feed: &[Run],
        config: &QueueConfig,
    ) -> Result<(), QueueInvariantError> {
        // Mirror the allocator's snapshot normalization: first occurrence
        // wins on duplicate ids, and only the first featured run is pulled
        // out of the grid.
        let mut seen = BTreeSet::new();
        let mut featured_run: Option<RunId> = None;
        let mut grid_live: BTreeSet<RunId> = BTreeSet::new();
        for run in feed {
            if !seen.insert(run.id) {
                continue;
            }
            if run.featured && featured_run.is_none() {
                featured_run = Some(run.id);
            } else {
                grid_live.insert(run.id);
            }
        }

        // The featured run must not occupy any queue position.
        if let Some(run) = featured_run {
            if self.current_runs.contains_key(&run) || self.reserved.contains_key(&run) {
                return Err(QueueInvariantError::FeaturedInGrid { run });
            }
        }

        for run in self.current_runs.keys().chain(self.reserved.keys()) {
            if !grid_live.contains(run) {
                return Err(QueueInvariantError::StaleRun { run: *run });
            }
        }

        for run in self.current_runs.keys() {
            if self.reserved.contains_key(run) {
                return Err(QueueInvariantError::DoubleBooked { run: *run });
            }
        }

        let order_set: BTreeSet<BatchId> = self.batch_order.iter().copied().collect();
        if order_set.len() != self.batch_order.len() {
            let dup = self
                .batch_order
                .iter()
                .find(|id| self.batch_order.iter().filter(|other| other == id).count() > 1)
                .copied()
                .unwrap_or_default();
            return Err(QueueInvariantError::OrderMismatch { batch: dup });
        }
        for batch in &order_set {
            if !self.batches.contains_key(batch) {
                return Err(QueueInvariantError::OrderMismatch { batch: *batch });
            }
        }

        for (batch_id, batch) in &self.batches {
            if !order_set.contains(batch_id) {
                return Err(QueueInvariantError::OrderMismatch { batch: *batch_id });
            }
            if batch.is_empty() {
                return Err(QueueInvariantError::EmptyBatch { batch: *batch_id });
            }
            if batch.len() > config.batch_capacity as usize {
                return Err(QueueInvariantError::BatchOverCapacity {
                    batch: *batch_id,
                    got: batch.len(),
                    max: config.batch_capacity,
                });
            }
            for (slot, run) in batch.occupants() {
                if *slot >= config.batch_capacity {
                    return Err(QueueInvariantError::SlotOutOfRange {
                        batch: *batch_id,
                        slot: *slot,
                        max: config.batch_capacity,
                    });
                }
                match self.current_runs.get(run) {
                    Some(indexed) if indexed == batch_id => {}
                    _ => {
                        return Err(QueueInvariantError::UnindexedOccupant {
                            run: *run,
                            batch: *batch_id,
                        })
                    }
                }
            }
        }

        for (run, batch_id) in &self.current_runs {
            let present = self
                .batches
                .get(batch_id)
                .is_some_and(|batch| batch.occupants().values().any(|occupant| occupant == run));
            if !present {
                return Err(QueueInvariantError::DanglingIndex {
                    run: *run,
                    batch: *batch_id,
                });
            }
        }

        let mut seen_indices = BTreeSet::new();
        for index in self.reserved.values() {
            if *index >= config.reserved_capacity {
                return Err(QueueInvariantError::ReservedIndexOutOfRange {
                    index: *index,
                    max: config.reserved_capacity,
                });
            }
            if !seen_indices.insert(*index) {
                return Err(QueueInvariantError::ReservedIndexReused { index: *index });
            }
        }

        Ok(())
    }
}

/// Structural invariant violation, reported by [`QueueState::check_invariants`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueInvariantError {
    #[error("run {run:?} held in state but absent from the feed")]
    StaleRun { run: RunId },
    #[error("run {run:?} appears in both the grid and the reserved strip")]
    DoubleBooked { run: RunId },
    #[error("batch {batch:?} holds {got} occupants (capacity {max})")]
    BatchOverCapacity { batch: BatchId, got: usize, max: u32 },
    #[error("batch {batch:?} is tracked but empty")]
    EmptyBatch { batch: BatchId },
    #[error("batch order and batch set disagree on {batch:?}")]
    OrderMismatch { batch: BatchId },
    #[error("slot {slot} in batch {batch:?} out of range (capacity {max})")]
    SlotOutOfRange {
        batch: BatchId,
        slot: SlotIndex,
        max: u32,
    },
    #[error("run {run:?} occupies batch {batch:?} but is missing from the run index")]
    UnindexedOccupant { run: RunId, batch: BatchId },
    #[error("run {run:?} indexed in batch {batch:?} but not among its occupants")]
    DanglingIndex { run: RunId, batch: BatchId },
    #[error("reserved index {index} out of range (capacity {max})")]
    ReservedIndexOutOfRange { index: SlotIndex, max: u32 },
    #[error("reserved index {index} assigned twice")]
    ReservedIndexReused { index: SlotIndex },
    #[error("featured run {run:?} still occupies a queue position")]
    FeaturedInGrid { run: RunId },
}
