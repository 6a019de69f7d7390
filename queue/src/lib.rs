//! Live queue slot allocation for contest broadcast overlays.
//!
//! This crate contains the slot allocator behind the scrolling submission
//! queue widget: given a total feed snapshot of live runs each tick, it
//! decides which run occupies which on-screen position while keeping
//! already-shown entries stationary, reserving a strip for first-to-solve
//! runs, rotating overflow into new batches, and reclaiming positions when
//! runs leave the feed or get promoted to the featured highlight.
//!
//! ## Determinism requirements
//! - Do not let iteration order of hash-based collections influence outputs;
//!   allocator state uses ordered collections only.
//! - Ties (free reserved indices, free batch slots) always resolve to the
//!   lowest index, so a replayed feed history reproduces identical rows.
//!
//! ## Ownership model
//! The host owns one [`QueueState`] per queue widget and threads it through
//! [`QueueAllocator::tick`]; the allocator holds only configuration. There is
//! no interior mutability and no I/O, so a tick either commits atomically or
//! (for a malformed config) the allocator is never constructed at all.
//!
//! ## Usage
//! ```rust,ignore
//! use overlay_queue::{QueueAllocator, QueueState};
//! use overlay_types::QueueConfig;
//!
//! let alloc = QueueAllocator::new(QueueConfig::new(3, 1))?;
//! let mut state = QueueState::new();
//! loop {
//!     let feed = next_snapshot(); // newest first, total snapshot
//!     let tick = alloc.tick(&state, &feed);
//!     render(&tick.rows, tick.featured);
//!     state = tick.state;
//! }
//! ```

pub mod allocator;
pub mod state;

mod props;

pub use allocator::{QueueAllocator, Tick};
pub use state::{Batch, QueueInvariantError, QueueState};
