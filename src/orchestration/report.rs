//! Run outcome and the events emitted while a run is in progress.

use serde::{Deserialize, Serialize};

use crate::core::dag::Cycle;
use crate::core::foreshadowing::ValidationWarning;
use crate::core::unit::{UnitId, UnitStatus};
use crate::digest::{DetailRef, StreamStatus};
use crate::orchestration::merge::Artifact;
use crate::orchestration::stream::{StreamResult, StreamRole};

/// Events emitted by the coordinator for unit and group lifecycle changes.
///
/// Observers can follow a run without polling the graph.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    /// Dependencies settled and the unit's streams were dispatched.
    UnitStarted { unit: UnitId, streams: usize },
    /// One stream settled after filtering.
    StreamSettled {
        unit: UnitId,
        stream: StreamRole,
        status: StreamStatus,
        attempts: u32,
    },
    UnitCompleted {
        unit: UnitId,
        quality: f64,
        degraded: bool,
    },
    UnitFailed { unit: UnitId, error: String },
    /// Every unit of a group settled.
    GroupSettled {
        index: usize,
        completed: usize,
        failed: usize,
    },
    /// The run stopped because its cancellation token fired.
    RunCancelled { completed: usize },
}

/// Outcome of one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitResult {
    pub unit: UnitId,
    /// Completed or Failed.
    pub status: UnitStatus,
    pub quality: f64,
    pub degraded: bool,
    pub artifact_ref: Option<DetailRef>,
    /// Merged digests; absent for failed or restored units.
    pub artifact: Option<Artifact>,
    pub streams: Vec<StreamResult>,
    /// Completed in an earlier run and carried over from a checkpoint.
    #[serde(default)]
    pub restored: bool,
}

impl UnitResult {
    pub fn is_completed(&self) -> bool {
        matches!(self.status, UnitStatus::Completed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, UnitStatus::Failed { .. })
    }

    /// Failed result without any stream output, e.g. a store error.
    pub fn failed(unit: UnitId, error: &str) -> Self {
        Self {
            unit,
            status: UnitStatus::Failed {
                error: error.to_string(),
            },
            quality: 0.0,
            degraded: true,
            artifact_ref: None,
            artifact: None,
            streams: Vec::new(),
            restored: false,
        }
    }
}

/// Everything a caller needs to decide what to do after a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Sorted by unit id.
    pub unit_results: Vec<UnitResult>,
    pub unresolved_foreshadowing: Vec<String>,
    /// Non-empty means nothing was scheduled.
    pub cycles: Vec<Cycle>,
    pub warnings: Vec<ValidationWarning>,
    /// Units left pending because a dependency failed or was skipped.
    pub skipped: Vec<UnitId>,
    pub cancelled: bool,
    /// Units left pending because the run was aborted after a failure.
    pub aborted: bool,
    pub last_completed_group: Option<usize>,
}

impl RunReport {
    pub fn completed(&self) -> Vec<UnitId> {
        self.unit_results
            .iter()
            .filter(|r| r.is_completed())
            .map(|r| r.unit)
            .collect()
    }

    pub fn failed(&self) -> Vec<UnitId> {
        self.unit_results
            .iter()
            .filter(|r| r.is_failed())
            .map(|r| r.unit)
            .collect()
    }

    /// Completed units whose quality fell below the threshold.
    pub fn degraded(&self) -> Vec<UnitId> {
        self.unit_results
            .iter()
            .filter(|r| r.is_completed() && r.degraded)
            .map(|r| r.unit)
            .collect()
    }

    /// No valid order existed, so the run never started.
    pub fn is_fatal(&self) -> bool {
        !self.cycles.is_empty()
    }

    pub fn result(&self, unit: UnitId) -> Option<&UnitResult> {
        self.unit_results.iter().find(|r| r.unit == unit)
    }

    /// Every scheduled unit completed and nothing was cut short.
    pub fn is_success(&self) -> bool {
        !self.is_fatal()
            && !self.cancelled
            && !self.aborted
            && self.skipped.is_empty()
            && self.unit_results.iter().all(|r| r.is_completed())
    }
}
