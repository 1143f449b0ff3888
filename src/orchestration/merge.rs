//! Deterministic merge of a unit's stream digests into one artifact.

use serde::{Deserialize, Serialize};

use crate::core::unit::UnitId;
use crate::digest::{DetailRef, Digest, StreamStatus};
use crate::orchestration::producer::Conflict;
use crate::orchestration::stream::{StreamResult, StreamRole};

/// One role-labelled section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSection {
    pub role: StreamRole,
    pub quality_score: f64,
    pub digest: Digest,
    /// Full output of the stream.
    pub detail_ref: DetailRef,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub quality: f64,
    /// Quality fell below the configured threshold.
    pub degraded: bool,
    /// Streams that produced nothing usable, with how they ended.
    pub failed_streams: Vec<(StreamRole, StreamStatus)>,
    /// Reported as-is for downstream reconciliation.
    pub conflicts: Vec<Conflict>,
}

/// Merged output of a completed unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub unit: UnitId,
    pub sections: Vec<ArtifactSection>,
    pub metadata: ArtifactMetadata,
}

impl Artifact {
    /// Markdown rendering: one heading per section, in merge order.
    pub fn render(&self) -> String {
        let mut out = format!("# Unit {}\n", self.unit);
        for section in &self.sections {
            out.push_str(&format!("\n## {}\n\n{}\n", section.role, section.digest.summary));
            if !section.digest.decisions.is_empty() {
                out.push('\n');
                for decision in &section.digest.decisions {
                    out.push_str(&format!("- {}\n", decision));
                }
            }
            if !section.digest.next_steps.is_empty() {
                out.push_str("\nNext:\n");
                for step in &section.digest.next_steps {
                    out.push_str(&format!("- {}\n", step));
                }
            }
        }
        if !self.metadata.conflicts.is_empty() {
            out.push_str("\n## Conflicts\n\n");
            for conflict in &self.metadata.conflicts {
                let streams: Vec<String> = conflict.streams.iter().map(|s| s.to_string()).collect();
                out.push_str(&format!("- [{}] {}\n", streams.join(", "), conflict.description));
            }
        }
        out
    }

    pub fn section(&self, role: &StreamRole) -> Option<&ArtifactSection> {
        self.sections.iter().find(|s| &s.role == role)
    }
}

/// Weighted mean of usable scores. `None` when no stream is usable.
///
/// If every usable stream has zero weight the plain mean is used.
pub fn aggregate_quality(results: &[StreamResult]) -> Option<f64> {
    let usable: Vec<&StreamResult> = results.iter().filter(|r| r.is_usable()).collect();
    if usable.is_empty() {
        return None;
    }
    let total_weight: f64 = usable.iter().map(|r| r.weight).sum();
    if total_weight > 0.0 {
        Some(usable.iter().map(|r| r.quality_score * r.weight).sum::<f64>() / total_weight)
    } else {
        Some(usable.iter().map(|r| r.quality_score).sum::<f64>() / usable.len() as f64)
    }
}

/// Concatenate usable digests by role order. Completion order never matters.
pub fn merge(
    unit: UnitId,
    results: &[StreamResult],
    conflicts: Vec<Conflict>,
    quality: f64,
    quality_threshold: f64,
) -> Artifact {
    let mut usable: Vec<&StreamResult> = results.iter().filter(|r| r.is_usable()).collect();
    usable.sort_by(|a, b| a.stream.merge_key().cmp(&b.stream.merge_key()));

    let mut failed_streams: Vec<(StreamRole, StreamStatus)> = results
        .iter()
        .filter(|r| !r.is_usable())
        .map(|r| (r.stream.clone(), r.status))
        .collect();
    failed_streams.sort_by(|a, b| a.0.merge_key().cmp(&b.0.merge_key()));

    Artifact {
        unit,
        sections: usable
            .into_iter()
            .map(|r| ArtifactSection {
                role: r.stream.clone(),
                quality_score: r.quality_score,
                digest: r.digest.clone(),
                detail_ref: r.detail_ref.clone(),
            })
            .collect(),
        metadata: ArtifactMetadata {
            quality,
            degraded: quality < quality_threshold,
            failed_streams,
            conflicts,
        },
    }
}
