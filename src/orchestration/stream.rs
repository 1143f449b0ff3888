//! Stream roles, the per-unit roster, and the per-dispatch task/result types.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::unit::{UnitId, WorkUnit};
use crate::digest::{DetailRef, Digest, StreamStatus};

/// Upper bound on specialist streams added for a single unit kind.
pub const MAX_SPECIALISTS: usize = 4;

pub const DEFAULT_STREAM_PRIORITY: u8 = 5;

/// One facet of a unit's artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamRole {
    NarrativeStructure,
    CharacterPsychology,
    WorldBuilding,
    DialogueMaster,
    ProseCraft,
    EmotionWeaver,
    ContinuityGuard,
    Foreshadowing,
    /// Extra stream for a particular kind of unit, e.g. "battle".
    Specialist(String),
}

impl StreamRole {
    /// Core roles in merge order.
    pub const CORE: [StreamRole; 8] = [
        StreamRole::NarrativeStructure,
        StreamRole::CharacterPsychology,
        StreamRole::WorldBuilding,
        StreamRole::DialogueMaster,
        StreamRole::ProseCraft,
        StreamRole::EmotionWeaver,
        StreamRole::ContinuityGuard,
        StreamRole::Foreshadowing,
    ];

    /// Position in the merge. Structural content sorts first; specialists
    /// come after every core role.
    pub fn merge_rank(&self) -> usize {
        Self::CORE
            .iter()
            .position(|role| role == self)
            .unwrap_or(Self::CORE.len())
    }

    /// Stable sort key: rank first, then specialist name.
    pub fn merge_key(&self) -> (usize, &str) {
        match self {
            StreamRole::Specialist(name) => (self.merge_rank(), name.as_str()),
            _ => (self.merge_rank(), ""),
        }
    }

    /// Machine name used for detail keys and logs.
    pub fn key(&self) -> String {
        match self {
            StreamRole::NarrativeStructure => "narrative_structure".to_string(),
            StreamRole::CharacterPsychology => "character_psychology".to_string(),
            StreamRole::WorldBuilding => "world_building".to_string(),
            StreamRole::DialogueMaster => "dialogue_master".to_string(),
            StreamRole::ProseCraft => "prose_craft".to_string(),
            StreamRole::EmotionWeaver => "emotion_weaver".to_string(),
            StreamRole::ContinuityGuard => "continuity_guard".to_string(),
            StreamRole::Foreshadowing => "foreshadowing".to_string(),
            StreamRole::Specialist(name) => format!("specialist_{}", name),
        }
    }

    pub fn is_specialist(&self) -> bool {
        matches!(self, StreamRole::Specialist(_))
    }
}

impl std::fmt::Display for StreamRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamRole::NarrativeStructure => write!(f, "Narrative Structure"),
            StreamRole::CharacterPsychology => write!(f, "Character Psychology"),
            StreamRole::WorldBuilding => write!(f, "World Building"),
            StreamRole::DialogueMaster => write!(f, "Dialogue Master"),
            StreamRole::ProseCraft => write!(f, "Prose Craft"),
            StreamRole::EmotionWeaver => write!(f, "Emotion Weaver"),
            StreamRole::ContinuityGuard => write!(f, "Continuity Guard"),
            StreamRole::Foreshadowing => write!(f, "Foreshadowing"),
            StreamRole::Specialist(name) => write!(f, "Specialist: {}", name),
        }
    }
}

fn default_priority() -> u8 {
    DEFAULT_STREAM_PRIORITY
}

fn default_weight() -> f64 {
    1.0
}

/// Configured stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSpec {
    pub role: StreamRole,
    /// Dispatch priority, higher first. Does not affect merge order.
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// Weight in the unit quality mean.
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Overrides the per-stream timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl StreamSpec {
    pub fn new(role: StreamRole) -> Self {
        Self {
            role,
            priority: DEFAULT_STREAM_PRIORITY,
            weight: 1.0,
            timeout_ms: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}

/// One producer call for one unit. Discarded once the unit settles.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamTask {
    pub stream: StreamRole,
    pub unit: UnitId,
    pub priority: u8,
    pub weight: f64,
    pub timeout: Duration,
}

/// Settled outcome of a stream, after filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamResult {
    pub stream: StreamRole,
    pub status: StreamStatus,
    pub quality_score: f64,
    pub weight: f64,
    /// Producer calls made, retries included.
    pub attempts: u32,
    pub digest: Digest,
    pub detail_ref: DetailRef,
}

impl StreamResult {
    pub fn is_usable(&self) -> bool {
        self.status.is_usable()
    }
}

/// Builds the stream tasks each unit runs.
#[derive(Debug, Clone, Default)]
pub struct StreamRoster {
    core: Vec<StreamSpec>,
    specialists: BTreeMap<String, Vec<StreamSpec>>,
}

impl StreamRoster {
    pub fn new(core: Vec<StreamSpec>, specialists: BTreeMap<String, Vec<StreamSpec>>) -> Self {
        Self { core, specialists }
    }

    pub fn core(&self) -> &[StreamSpec] {
        &self.core
    }

    /// Specs a unit of this kind runs: the core roster plus up to
    /// [`MAX_SPECIALISTS`] kind-specific streams. A role appears once.
    pub fn specs_for(&self, kind: Option<&str>) -> Vec<&StreamSpec> {
        let mut specs: Vec<&StreamSpec> = Vec::with_capacity(self.core.len() + MAX_SPECIALISTS);
        for spec in &self.core {
            if !specs.iter().any(|s| s.role == spec.role) {
                specs.push(spec);
            }
        }

        if let Some(extra) = kind.and_then(|k| self.specialists.get(k)) {
            let mut added = 0;
            for spec in extra {
                if added == MAX_SPECIALISTS {
                    tracing::warn!(
                        kind = kind.unwrap_or_default(),
                        dropped = %spec.role,
                        "specialist limit reached"
                    );
                    continue;
                }
                if specs.iter().any(|s| s.role == spec.role) {
                    continue;
                }
                specs.push(spec);
                added += 1;
            }
        }
        specs
    }

    /// Tasks for a unit, highest priority first.
    pub fn tasks_for(&self, unit: &WorkUnit, default_timeout: Duration) -> Vec<StreamTask> {
        let mut tasks: Vec<StreamTask> = self
            .specs_for(unit.kind.as_deref())
            .into_iter()
            .map(|spec| StreamTask {
                stream: spec.role.clone(),
                unit: unit.id,
                priority: spec.priority,
                weight: spec.weight,
                timeout: spec
                    .timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(default_timeout),
            })
            .collect();
        tasks.sort_by(|a, b| b.priority.cmp(&a.priority));
        tasks
    }
}
