//! Common types shared between the live-overlay feed, the queue allocator,
//! and the renderer.
//!
//! The renderer treats `(rank, slot)` in a [`RenderRow`] purely as a stable
//! key for position lookup; the mapping to pixels (row height, easing,
//! transition timing) is renderer configuration and never appears here.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable identifier of a judged submission ("run").
///
/// Ids are unique within a contest and stable across feed snapshots for the
/// same logical submission.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct RunId(pub u64);

/// Stable identifier of a display batch.
///
/// A batch id is minted from the id of the run that opened it, so it is
/// itself a stable key that survives rank changes as older batches retire.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct BatchId(pub u64);

impl BatchId {
    /// Mint a batch id from the run that triggered the batch's creation.
    pub fn from_opener(run: RunId) -> Self {
        Self(run.0)
    }
}

/// Index of a slot within a batch, or within the reserved strip.
pub type SlotIndex = u32;

/// One judged-submission event currently eligible for display in the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    /// First accepted solution for its problem; competes for the reserved strip.
    #[serde(default)]
    pub first_to_solve: bool,
    /// Pulled out of the grid entirely and shown with attached media.
    #[serde(default)]
    pub featured: bool,
}

impl Run {
    /// An ordinary run with neither flag set.
    pub fn new(id: RunId) -> Self {
        Self {
            id,
            first_to_solve: false,
            featured: false,
        }
    }

    pub fn with_first_to_solve(mut self) -> Self {
        self.first_to_solve = true;
        self
    }

    pub fn with_featured(mut self) -> Self {
        self.featured = true;
        self
    }
}

/// Static queue geometry supplied by the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum occupants per batch (K).
    pub batch_capacity: u32,
    /// Size of the first-to-solve reserved strip (F). Zero disables the strip.
    pub reserved_capacity: u32,
}

impl QueueConfig {
    pub fn new(batch_capacity: u32, reserved_capacity: u32) -> Self {
        Self {
            batch_capacity,
            reserved_capacity,
        }
    }

    /// Validate the configuration. A zero batch capacity can never host a
    /// run and is rejected eagerly, before any tick runs.
    pub fn validate(&self) -> Result<(), QueueConfigError> {
        if self.batch_capacity == 0 {
            return Err(QueueConfigError::ZeroBatchCapacity);
        }
        Ok(())
    }
}

/// Error rejecting a malformed [`QueueConfig`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueConfigError {
    #[error("batch_capacity must be greater than zero")]
    ZeroBatchCapacity,
}

/// Vertical placement key for a render row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchRank {
    /// The row lives in the reserved first-to-solve strip.
    Reserved,
    /// The row lives in the batch at this position in the newest-first batch
    /// order. Rank 0 is the most recently created batch.
    Grid(u32),
}

impl BatchRank {
    pub fn is_reserved(&self) -> bool {
        matches!(self, Self::Reserved)
    }
}

/// One renderable queue entry emitted by the allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderRow {
    pub run_id: RunId,
    pub rank: BatchRank,
    pub slot: SlotIndex,
}

impl RenderRow {
    pub fn is_reserved(&self) -> bool {
        self.rank.is_reserved()
    }
}
