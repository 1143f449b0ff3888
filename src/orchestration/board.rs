//! Per-unit completion signals.
//!
//! Each unit gets a `watch` channel that flips from `None` to its
//! settlement exactly once per run. Waiting on it is a blocking await,
//! not a poll of the graph.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::watch;

use crate::core::unit::UnitId;

/// How a unit left the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Completed,
    Failed,
    /// Not run because an upstream unit failed.
    Skipped,
}

type Signal = watch::Sender<Option<Settlement>>;

#[derive(Debug, Default)]
pub struct CompletionBoard {
    signals: Mutex<HashMap<UnitId, Signal>>,
}

impl CompletionBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<UnitId, Signal>> {
        // Nothing panics while holding the lock, but a poisoned map is still usable.
        self.signals.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn signal(&self, unit: UnitId, settlement: Settlement) {
        self.lock()
            .entry(unit)
            .or_insert_with(|| watch::channel(None).0)
            .send_replace(Some(settlement));
    }

    pub fn settlement(&self, unit: UnitId) -> Option<Settlement> {
        self.lock().get(&unit).and_then(|tx| *tx.borrow())
    }

    /// Wait until `unit` settles.
    pub async fn wait(&self, unit: UnitId) -> Option<Settlement> {
        let mut rx = self
            .lock()
            .entry(unit)
            .or_insert_with(|| watch::channel(None).0)
            .subscribe();
        let settled = match rx.wait_for(Option::is_some).await {
            Ok(settled) => *settled,
            Err(_) => None,
        };
        settled
    }

    /// Forget every signal. Waiters from a previous run see their sender dropped.
    pub fn clear(&self) {
        self.lock().clear();
    }
}
