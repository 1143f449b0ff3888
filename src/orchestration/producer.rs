//! Collaborator seams: the producer that generates stream output, and the
//! detector that flags contradictions between streams.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::foreshadowing::UnitForeshadowing;
use crate::core::unit::{UnitId, UnitStatus};
use crate::digest::{DetailRef, Digest, RawResult};
use crate::error::Result;
use crate::orchestration::stream::{StreamRole, StreamTask};

/// Shared world/story knowledge handed to every producer call. Opaque here.
pub type Bible = serde_json::Value;

/// What a dependency unit left behind for its dependents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamArtifact {
    pub unit: UnitId,
    pub status: UnitStatus,
    pub quality: Option<f64>,
    pub artifact: Option<DetailRef>,
}

/// Everything a producer gets for one unit. Shared by all of the unit's streams.
#[derive(Debug, Clone)]
pub struct ContextBundle {
    pub unit: UnitId,
    pub kind: Option<String>,
    pub bible: Arc<Bible>,
    pub foreshadowing: UnitForeshadowing,
    pub upstream: Vec<UpstreamArtifact>,
}

/// Generates the output for one stream of one unit.
///
/// Every call runs on its own tokio task under the task's timeout. A call
/// that overruns is aborted and recorded as a timeout; a call that panics
/// is recorded as a failed attempt and retried like any other failure.
#[async_trait]
pub trait Producer: Send + Sync {
    async fn produce(&self, task: &StreamTask, context: &ContextBundle) -> Result<RawResult>;
}

/// Contradiction between streams, surfaced for later reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub streams: Vec<StreamRole>,
    pub description: String,
}

/// Finds contradictions between a unit's digests. Domain-specific, so
/// the coordinator only records what this returns.
pub trait ConflictDetector: Send + Sync {
    fn detect(&self, unit: UnitId, digests: &[(&StreamRole, &Digest)]) -> Vec<Conflict>;
}

/// Reports nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoConflicts;

impl ConflictDetector for NoConflicts {
    fn detect(&self, _unit: UnitId, _digests: &[(&StreamRole, &Digest)]) -> Vec<Conflict> {
        Vec::new()
    }
}
