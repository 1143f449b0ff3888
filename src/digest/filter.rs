use std::sync::Arc;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};

use crate::digest::{
    DetailKey, DetailRef, DetailStore, Digest, DigestBounds, RawResult,
    METRIC_DECISIONS_OVERFLOW, METRIC_NEXT_STEPS_OVERFLOW, METRIC_SUMMARY_OVERFLOW,
};
use crate::error::Result;

/// Appended to a summary that was cut.
pub const TRUNCATION_MARKER: &str = "...";

/// Aggregate statistics over a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchStats {
    pub total: usize,
    /// Results with Success or Partial status.
    pub succeeded: usize,
    pub success_rate: f64,
    /// Bytes of raw output routed to the detail store.
    pub bytes_filtered: usize,
    /// Bytes kept in the digests.
    pub bytes_retained: usize,
}

#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub entries: Vec<(Digest, DetailRef)>,
    pub stats: BatchStats,
}

impl BatchOutcome {
    pub fn digests(&self) -> impl Iterator<Item = &Digest> {
        self.entries.iter().map(|(digest, _)| digest)
    }
}

/// Bounds raw results and moves their full content out of the working set.
#[derive(Clone)]
pub struct DigestFilter {
    bounds: DigestBounds,
    store: Arc<dyn DetailStore>,
}

impl DigestFilter {
    pub fn new(bounds: DigestBounds, store: Arc<dyn DetailStore>) -> Self {
        Self { bounds, store }
    }

    pub fn bounds(&self) -> DigestBounds {
        self.bounds
    }

    pub fn store(&self) -> &Arc<dyn DetailStore> {
        &self.store
    }

    /// Store the untruncated result and return its bounded digest.
    pub async fn filter(&self, key: &DetailKey, raw: &RawResult) -> Result<(Digest, DetailRef)> {
        let body = serde_json::to_vec(raw)?;
        let reference = self.store.put(key, body).await?;
        let digest = bound(raw, &self.bounds);
        if digest.was_truncated() {
            tracing::debug!(
                unit = %key.unit,
                stream = %key.name,
                raw_bytes = raw.byte_len(),
                digest_bytes = digest.byte_len(),
                "stream result truncated"
            );
        }
        Ok((digest, reference))
    }

    /// Filter many results concurrently and summarise the batch.
    pub async fn batch_filter(&self, items: &[(DetailKey, RawResult)]) -> Result<BatchOutcome> {
        let entries = try_join_all(items.iter().map(|(key, raw)| self.filter(key, raw))).await?;

        let total = items.len();
        let succeeded = items.iter().filter(|(_, raw)| raw.status.is_usable()).count();
        let stats = BatchStats {
            total,
            succeeded,
            success_rate: if total == 0 {
                0.0
            } else {
                succeeded as f64 / total as f64
            },
            bytes_filtered: items.iter().map(|(_, raw)| raw.byte_len()).sum(),
            bytes_retained: entries.iter().map(|(digest, _)| digest.byte_len()).sum(),
        };
        Ok(BatchOutcome { entries, stats })
    }
}

impl std::fmt::Debug for DigestFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigestFilter")
            .field("bounds", &self.bounds)
            .finish_non_exhaustive()
    }
}

/// Apply the bounds. Left-anchored and take-first-N, so it is deterministic,
/// and a second pass over its own output changes nothing.
pub(crate) fn bound(raw: &RawResult, bounds: &DigestBounds) -> Digest {
    let mut metrics = raw.metrics.clone();

    let (summary, cut) = truncate_summary(&raw.summary, bounds.max_summary_len);
    if cut > 0 {
        metrics.insert(METRIC_SUMMARY_OVERFLOW.to_string(), cut as f64);
    }

    let decisions = take_first(&raw.decisions, bounds.max_decisions);
    if raw.decisions.len() > decisions.len() {
        metrics.insert(
            METRIC_DECISIONS_OVERFLOW.to_string(),
            (raw.decisions.len() - decisions.len()) as f64,
        );
    }

    let next_steps = take_first(&raw.next_steps, bounds.max_next_steps);
    if raw.next_steps.len() > next_steps.len() {
        metrics.insert(
            METRIC_NEXT_STEPS_OVERFLOW.to_string(),
            (raw.next_steps.len() - next_steps.len()) as f64,
        );
    }

    Digest {
        summary,
        status: raw.status,
        decisions,
        next_steps,
        metrics,
    }
}

/// Returns the bounded summary and how many original characters were dropped.
fn truncate_summary(summary: &str, max_len: usize) -> (String, usize) {
    let len = summary.chars().count();
    if len <= max_len {
        return (summary.to_string(), 0);
    }
    let marker_len = TRUNCATION_MARKER.chars().count();
    if max_len < marker_len {
        return (summary.chars().take(max_len).collect(), len - max_len);
    }
    let keep = max_len - marker_len;
    let mut bounded: String = summary.chars().take(keep).collect();
    bounded.push_str(TRUNCATION_MARKER);
    (bounded, len - keep)
}

fn take_first(items: &[String], max: usize) -> Vec<String> {
    items.iter().take(max).cloned().collect()
}
