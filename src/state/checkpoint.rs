use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::dag::{DependencyGraph, GraphSnapshot};
use crate::core::unit::UnitStatus;
use crate::{Error, Result};

/// Format version written into every checkpoint.
pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub graph: GraphSnapshot,
    /// Index of the last parallel group that fully settled.
    #[serde(default)]
    pub last_completed_group: Option<usize>,
}

impl Checkpoint {
    /// Capture the graph. Units caught mid-flight are recorded as pending.
    pub fn capture(graph: &DependencyGraph, last_completed_group: Option<usize>) -> Self {
        let mut snapshot = graph.snapshot();
        for unit in &mut snapshot.units {
            if matches!(unit.status, UnitStatus::Ready | UnitStatus::Running) {
                unit.reset();
            }
        }
        Self {
            version: CHECKPOINT_VERSION,
            created_at: Utc::now(),
            graph: snapshot,
            last_completed_group,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parse a checkpoint blob.
    ///
    /// # Errors
    /// [`Error::Checkpoint`] for a version this build does not understand.
    pub fn from_bytes(blob: &[u8]) -> Result<Self> {
        let checkpoint: Self = serde_json::from_slice(blob)?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(Error::Checkpoint(format!(
                "unsupported checkpoint version {} (expected {})",
                checkpoint.version, CHECKPOINT_VERSION
            )));
        }
        Ok(checkpoint)
    }

    /// Graph to resume from: completed units kept, everything else pending.
    pub fn into_graph(self) -> Result<DependencyGraph> {
        let mut snapshot = self.graph;
        for unit in &mut snapshot.units {
            if !unit.is_completed() {
                unit.reset();
            }
        }
        DependencyGraph::from_snapshot(snapshot)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, self.to_bytes()?)?;
        tracing::debug!(path = %path.display(), "checkpoint saved");
        Ok(())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "Checkpoint::load_from");
        Self::from_bytes(&fs::read(path)?)
    }
}
