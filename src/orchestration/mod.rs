//! Orchestration layer: runs the streams of every work unit in dependency
//! order and collects the outcome.
//!
//! The [`Coordinator`] consumes the parallel groups of a
//! [`DependencyGraph`](crate::core::DependencyGraph), dispatches each unit's
//! streams to a [`Producer`], filters every result into a digest, and merges
//! the digests into one artifact per unit.

mod board;
mod coordinator;
pub mod merge;
pub mod producer;
mod report;
pub mod stream;

pub use board::{CompletionBoard, Settlement};
pub use coordinator::Coordinator;
pub use merge::{aggregate_quality, Artifact, ArtifactMetadata, ArtifactSection};
pub use producer::{
    Bible, Conflict, ConflictDetector, ContextBundle, NoConflicts, Producer, UpstreamArtifact,
};
pub use report::{CoordinatorEvent, RunReport, UnitResult};
pub use stream::{StreamResult, StreamRole, StreamRoster, StreamSpec, StreamTask, MAX_SPECIALISTS};
