//! Size-bounded digests of producer output.
//!
//! Producers return unbounded [`RawResult`]s. The [`DigestFilter`] turns each
//! one into a [`Digest`] whose summary and lists are capped, writes the
//! untruncated result to a [`DetailStore`], and hands back only a
//! [`DetailRef`]. This is the only path by which producer output reaches
//! the coordinator, so the coordinator's working set scales with digest
//! size rather than with producer output.

mod filter;
mod store;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use filter::{BatchOutcome, BatchStats, DigestFilter, TRUNCATION_MARKER};
pub use store::{DetailKey, DetailStore, FileDetailStore, MemoryDetailStore};

/// Metric key recording how many summary characters were cut.
pub const METRIC_SUMMARY_OVERFLOW: &str = "summary_overflow_chars";
/// Metric key recording how many decisions were dropped.
pub const METRIC_DECISIONS_OVERFLOW: &str = "decisions_overflow";
/// Metric key recording how many next steps were dropped.
pub const METRIC_NEXT_STEPS_OVERFLOW: &str = "next_steps_overflow";

/// Opaque reference to full detail held by a [`DetailStore`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DetailRef(String);

impl DetailRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DetailRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    #[default]
    Success,
    Partial,
    Failed,
    Timeout,
}

impl StreamStatus {
    /// Success and Partial results count toward unit quality and the merge.
    pub fn is_usable(&self) -> bool {
        matches!(self, StreamStatus::Success | StreamStatus::Partial)
    }
}

impl std::fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamStatus::Success => write!(f, "success"),
            StreamStatus::Partial => write!(f, "partial"),
            StreamStatus::Failed => write!(f, "failed"),
            StreamStatus::Timeout => write!(f, "timeout"),
        }
    }
}

/// Unbounded result as returned by a producer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawResult {
    pub status: StreamStatus,
    /// Self-reported quality, 0-100.
    pub quality_score: f64,
    pub summary: String,
    #[serde(default)]
    pub decisions: Vec<String>,
    #[serde(default)]
    pub next_steps: Vec<String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    /// Full generated content. Never kept in the coordinator.
    #[serde(default)]
    pub content: String,
}

impl RawResult {
    pub fn success(quality_score: f64, summary: &str, content: &str) -> Self {
        Self {
            status: StreamStatus::Success,
            quality_score,
            summary: summary.to_string(),
            content: content.to_string(),
            ..Default::default()
        }
    }

    /// A result explaining why a stream produced nothing usable.
    pub fn failure(status: StreamStatus, reason: &str) -> Self {
        Self {
            status,
            quality_score: 0.0,
            summary: reason.to_string(),
            ..Default::default()
        }
    }

    pub fn with_decisions<I, S>(mut self, decisions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.decisions = decisions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_next_steps<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.next_steps = steps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metric(mut self, key: &str, value: f64) -> Self {
        self.metrics.insert(key.to_string(), value);
        self
    }

    /// Approximate payload size in bytes.
    pub fn byte_len(&self) -> usize {
        self.summary.len()
            + self.content.len()
            + self.decisions.iter().map(String::len).sum::<usize>()
            + self.next_steps.iter().map(String::len).sum::<usize>()
    }
}

/// Bounds applied by the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestBounds {
    /// Maximum summary length in characters, marker included.
    pub max_summary_len: usize,
    pub max_decisions: usize,
    pub max_next_steps: usize,
}

impl Default for DigestBounds {
    fn default() -> Self {
        Self {
            max_summary_len: 100,
            max_decisions: 5,
            max_next_steps: 3,
        }
    }
}

/// Deterministically bounded view of a [`RawResult`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Digest {
    pub summary: String,
    pub status: StreamStatus,
    pub decisions: Vec<String>,
    pub next_steps: Vec<String>,
    pub metrics: BTreeMap<String, f64>,
}

impl Digest {
    /// Feed a digest back through the filter as a result with no content.
    pub fn to_raw(&self, quality_score: f64) -> RawResult {
        RawResult {
            status: self.status,
            quality_score,
            summary: self.summary.clone(),
            decisions: self.decisions.clone(),
            next_steps: self.next_steps.clone(),
            metrics: self.metrics.clone(),
            content: String::new(),
        }
    }

    /// True when the filter cut anything from the original result.
    pub fn was_truncated(&self) -> bool {
        [
            METRIC_SUMMARY_OVERFLOW,
            METRIC_DECISIONS_OVERFLOW,
            METRIC_NEXT_STEPS_OVERFLOW,
        ]
        .iter()
        .any(|key| self.metrics.contains_key(*key))
    }

    pub fn byte_len(&self) -> usize {
        self.summary.len()
            + self.decisions.iter().map(String::len).sum::<usize>()
            + self.next_steps.iter().map(String::len).sum::<usize>()
    }
}
