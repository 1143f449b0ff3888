//! Run state persistence.
//!
//! A checkpoint captures the dependency graph with every unit's status and
//! artifact handle, so an interrupted run can resume without redoing
//! completed units.

mod checkpoint;

pub use checkpoint::{Checkpoint, CHECKPOINT_VERSION};
