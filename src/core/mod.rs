//! Core domain models for braid scheduling.
//!
//! This module contains the work unit model, the dependency graph that
//! orders units, and the foreshadowing table validated against that order.

pub mod dag;
pub mod foreshadowing;
pub mod unit;

pub use dag::{Cycle, DependencyEdge, DependencyGraph, DependencyKind, GraphSnapshot};
pub use foreshadowing::{
    ForeshadowingTable, ForeshadowingToken, TokenStatus, UnitForeshadowing, ValidationWarning,
};
pub use unit::{UnitId, UnitStatus, WorkUnit};
