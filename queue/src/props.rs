//! Property tests for the queue allocator.
//!
//! These tests drive the allocator through randomized multi-tick feed
//! histories and verify the invariants the renderer depends on:
//!
//! 1. **Stability**: a surviving run keeps its `(batch, slot)` identity or
//!    reserved index across ticks; only batch rank may change.
//! 2. **Capacity**: no batch exceeds `batch_capacity`, and reserved indices
//!    are distinct and in range.
//! 3. **No orphan batches**: `batch_order` and the batch set agree exactly,
//!    and every tracked batch is non-empty.
//! 4. **Exhaustiveness**: every non-featured feed run lands in exactly one
//!    row; nothing is silently dropped.
//! 5. **Idempotence**: re-running a tick with the same snapshot changes
//!    nothing.
