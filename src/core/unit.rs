//! Work unit data model for the dependency graph.
//!
//! A work unit is one schedulable piece of content (a chapter, say). Units
//! are created when the caller enqueues them, mutated by the graph (status)
//! and the coordinator (quality, artifact), and never removed during a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::DetailRef;

/// Ordinal identifier of a work unit.
///
/// Ordering on the ordinal is what breaks scheduling ties, so two runs
/// over the same graph always produce the same order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct UnitId(pub u32);

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for UnitId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.trim().parse()?))
    }
}

impl From<u32> for UnitId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Unit status in its lifecycle.
///
/// `Pending -> Ready -> Running -> {Completed | Failed}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum UnitStatus {
    /// Enqueued, dependencies not yet settled.
    #[default]
    Pending,
    /// Every dependency completed; eligible for dispatch.
    Ready,
    /// Streams are being produced for this unit.
    Running,
    /// At least one stream succeeded and the artifact was merged.
    Completed,
    /// Every stream failed.
    Failed {
        /// Why the unit failed.
        error: String,
    },
}

impl std::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitStatus::Pending => write!(f, "pending"),
            UnitStatus::Ready => write!(f, "ready"),
            UnitStatus::Running => write!(f, "running"),
            UnitStatus::Completed => write!(f, "completed"),
            UnitStatus::Failed { error } => write!(f, "failed: {}", error),
        }
    }
}

/// A single work unit in the dependency graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnit {
    /// Ordinal identifier.
    pub id: UnitId,
    /// Optional unit kind ("climax", "battle", ...) used to pick specialist streams.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Current lifecycle status.
    pub status: UnitStatus,
    /// Aggregated quality (0-100), set once the unit settles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<f64>,
    /// Handle to the merged artifact, set on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<DetailRef>,
    /// When the unit started running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the unit settled (success or failure).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkUnit {
    /// Create a pending unit with no kind.
    pub fn new(id: impl Into<UnitId>) -> Self {
        Self {
            id: id.into(),
            kind: None,
            status: UnitStatus::Pending,
            quality: None,
            artifact: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Create a pending unit tagged with a kind.
    pub fn with_kind(id: impl Into<UnitId>, kind: &str) -> Self {
        Self {
            kind: Some(kind.to_string()),
            ..Self::new(id)
        }
    }

    pub fn mark_ready(&mut self) {
        self.status = UnitStatus::Ready;
    }

    /// Transition to Running and record the start time.
    pub fn start(&mut self) {
        self.status = UnitStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Transition to Completed with the merged artifact and its quality.
    pub fn complete(&mut self, quality: f64, artifact: DetailRef) {
        self.status = UnitStatus::Completed;
        self.quality = Some(quality);
        self.artifact = Some(artifact);
        self.completed_at = Some(Utc::now());
    }

    /// Transition to Failed. Quality is pinned to zero.
    pub fn fail(&mut self, error: &str) {
        self.status = UnitStatus::Failed {
            error: error.to_string(),
        };
        self.quality = Some(0.0);
        self.completed_at = Some(Utc::now());
    }

    /// Return the unit to Pending, dropping run-time fields.
    ///
    /// Used for units interrupted by cancellation so a restored run picks
    /// them up again.
    pub fn reset(&mut self) {
        self.status = UnitStatus::Pending;
        self.quality = None;
        self.artifact = None;
        self.started_at = None;
        self.completed_at = None;
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.status, UnitStatus::Completed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, UnitStatus::Failed { .. })
    }

    /// Completed or Failed.
    pub fn is_settled(&self) -> bool {
        self.is_completed() || self.is_failed()
    }
}
