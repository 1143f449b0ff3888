//! Coordinator for parallel stream execution.
//!
//! The Coordinator walks the parallel groups of the [`DependencyGraph`] in
//! sequence. Units within a group run concurrently, bounded by
//! `max_unit_concurrency`; the streams of one unit run concurrently, bounded
//! by `max_stream_concurrency`. Every stream result passes through the
//! [`DigestFilter`] before the coordinator looks at it, so only digests and
//! detail references are ever held here.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, FailurePolicy};
use crate::core::dag::DependencyGraph;
use crate::core::unit::{UnitId, UnitStatus, WorkUnit};
use crate::digest::{
    DetailKey, DetailRef, DetailStore, Digest, DigestFilter, FileDetailStore, MemoryDetailStore,
    RawResult, StreamStatus,
};
use crate::error::{Error, Result};
use crate::orchestration::board::{CompletionBoard, Settlement};
use crate::orchestration::merge::{aggregate_quality, merge, Artifact};
use crate::orchestration::producer::{
    Bible, ConflictDetector, ContextBundle, NoConflicts, Producer, UpstreamArtifact,
};
use crate::orchestration::report::{CoordinatorEvent, RunReport, UnitResult};
use crate::orchestration::stream::{StreamResult, StreamRole, StreamRoster, StreamTask};
use crate::state::Checkpoint;

/// Drives a dependency graph to completion through a [`Producer`].
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use tokio::sync::RwLock;
/// use braid::config::Config;
/// use braid::core::DependencyGraph;
/// use braid::orchestration::Coordinator;
///
/// let graph = Arc::new(RwLock::new(DependencyGraph::new()));
/// let coordinator = Coordinator::new(Config::default(), graph, Arc::new(MyProducer))?;
/// let report = coordinator.run(serde_json::json!({"title": "..."})).await;
/// ```
pub struct Coordinator {
    config: Config,
    graph: Arc<RwLock<DependencyGraph>>,
    roster: StreamRoster,
    producer: Arc<dyn Producer>,
    filter: DigestFilter,
    detector: Arc<dyn ConflictDetector>,
    board: CompletionBoard,
    event_tx: Option<mpsc::Sender<CoordinatorEvent>>,
    last_completed_group: Mutex<Option<usize>>,
}

impl Coordinator {
    /// Create a coordinator.
    ///
    /// The detail store is file-backed when `detail_dir` is configured,
    /// in-memory otherwise.
    ///
    /// # Errors
    /// Returns [`Error::Validation`] if the config is invalid.
    pub fn new(
        config: Config,
        graph: Arc<RwLock<DependencyGraph>>,
        producer: Arc<dyn Producer>,
    ) -> Result<Self> {
        config.validate()?;
        let store: Arc<dyn DetailStore> = match config.detail_path() {
            Some(root) => Arc::new(FileDetailStore::new(root)),
            None => Arc::new(MemoryDetailStore::new()),
        };
        Ok(Self {
            roster: StreamRoster::new(config.streams.clone(), config.specialists.clone()),
            filter: DigestFilter::new(config.digest_bounds(), store),
            config,
            graph,
            producer,
            detector: Arc::new(NoConflicts),
            board: CompletionBoard::new(),
            event_tx: None,
            last_completed_group: Mutex::new(None),
        })
    }

    pub fn with_detail_store(mut self, store: Arc<dyn DetailStore>) -> Self {
        self.filter = DigestFilter::new(self.config.digest_bounds(), store);
        self
    }

    pub fn with_conflict_detector(mut self, detector: Arc<dyn ConflictDetector>) -> Self {
        self.detector = detector;
        self
    }

    /// Emit [`CoordinatorEvent`]s on this channel.
    ///
    /// Events are dropped, not awaited, when the channel is full.
    pub fn with_events(mut self, event_tx: mpsc::Sender<CoordinatorEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn graph(&self) -> Arc<RwLock<DependencyGraph>> {
        Arc::clone(&self.graph)
    }

    pub fn detail_store(&self) -> &Arc<dyn DetailStore> {
        self.filter.store()
    }

    pub async fn last_completed_group(&self) -> Option<usize> {
        *self.last_completed_group.lock().await
    }

    fn emit(&self, event: CoordinatorEvent) {
        if let Some(tx) = &self.event_tx {
            if let Err(mpsc::error::TrySendError::Full(event)) = tx.try_send(event) {
                tracing::warn!(?event, "event channel full, dropping event");
            }
        }
    }

    // ========== Run ==========

    /// Run every unit that is not already completed.
    pub async fn run(&self, bible: Bible) -> RunReport {
        self.run_with_cancel(bible, CancellationToken::new()).await
    }

    /// Run with a cancellation token. Cancelling stops in-flight streams;
    /// completed units keep their results.
    pub async fn run_with_cancel(&self, bible: Bible, cancel: CancellationToken) -> RunReport {
        let bible = Arc::new(bible);

        let (groups, mut results) = {
            let mut graph = self.graph.write().await;

            let cycles = graph.validate_acyclic();
            if !cycles.is_empty() {
                tracing::error!(count = cycles.len(), "dependency cycles, nothing scheduled");
                return RunReport {
                    unresolved_foreshadowing: graph.unresolved(),
                    cycles,
                    ..Default::default()
                };
            }
            let groups = match graph.all_parallel_groups() {
                Ok(groups) => groups,
                Err(e) => {
                    tracing::error!(error = %e, "no execution order");
                    return RunReport {
                        unresolved_foreshadowing: graph.unresolved(),
                        cycles: match e {
                            Error::Cycle { cycles } => cycles,
                            _ => Vec::new(),
                        },
                        ..Default::default()
                    };
                }
            };

            self.board.clear();
            let mut carried = BTreeMap::new();
            for id in graph.unit_ids() {
                let Some(unit) = graph.unit_mut(id) else {
                    continue;
                };
                if unit.is_completed() {
                    self.board.signal(id, Settlement::Completed);
                    carried.insert(id, restored_result(unit, self.config.quality_threshold));
                } else if unit.status != UnitStatus::Pending {
                    unit.reset();
                }
            }
            graph.refresh_ready();
            (groups, carried)
        };

        tracing::info!(
            groups = groups.len(),
            carried = results.len(),
            policy = ?self.config.failure_policy,
            "run started"
        );

        let mut skipped = BTreeSet::new();
        let mut blocked: HashSet<UnitId> = HashSet::new();
        let mut cancelled = false;
        let mut aborted = false;

        for (index, group) in groups.iter().enumerate() {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let runnable = {
                let graph = self.graph.read().await;
                let mut runnable = Vec::with_capacity(group.len());
                for &unit in group {
                    if graph.unit(unit).is_some_and(WorkUnit::is_completed) {
                        continue;
                    }
                    if self.config.failure_policy == FailurePolicy::SkipDependents
                        && graph.dependencies(unit).iter().any(|d| blocked.contains(d))
                    {
                        tracing::info!(unit = %unit, "skipping unit with failed dependency");
                        skipped.insert(unit);
                        blocked.insert(unit);
                        self.board.signal(unit, Settlement::Skipped);
                        continue;
                    }
                    runnable.push(unit);
                }
                runnable
            };

            let mut completed = 0;
            let mut failed = 0;
            if !runnable.is_empty() {
                tracing::debug!(group = index, units = ?runnable, "dispatching group");
                for result in self.execute_group(&runnable, Arc::clone(&bible), &cancel).await {
                    if result.is_failed() {
                        blocked.insert(result.unit);
                        failed += 1;
                    } else {
                        completed += 1;
                    }
                    results.insert(result.unit, result);
                }
            }

            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            self.graph.write().await.refresh_ready();
            *self.last_completed_group.lock().await = Some(index);
            self.emit(CoordinatorEvent::GroupSettled {
                index,
                completed,
                failed,
            });
            tracing::debug!(group = index, completed, failed, "group settled");

            if failed > 0 && self.config.failure_policy == FailurePolicy::Abort {
                tracing::warn!(group = index, failed, "aborting run after failed group");
                aborted = true;
                break;
            }
        }

        let completed_count = results.values().filter(|r| r.is_completed()).count();
        if cancelled {
            tracing::info!(completed = completed_count, "run cancelled");
            self.emit(CoordinatorEvent::RunCancelled {
                completed: completed_count,
            });
        }

        let graph = self.graph.read().await;
        let names = graph.foreshadowing().names();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        let report = RunReport {
            unit_results: results.into_values().collect(),
            unresolved_foreshadowing: graph.unresolved(),
            cycles: Vec::new(),
            warnings: graph.chain_warnings(&names),
            skipped: skipped.into_iter().collect(),
            cancelled,
            aborted,
            last_completed_group: self.last_completed_group().await,
        };
        tracing::info!(
            completed = report.completed().len(),
            failed = report.failed().len(),
            degraded = report.degraded().len(),
            skipped = report.skipped.len(),
            warnings = report.warnings.len(),
            "run finished"
        );
        report
    }

    /// Run a set of mutually independent units concurrently.
    ///
    /// Units interrupted by cancellation are returned to pending and left
    /// out of the result. A failing unit never affects its siblings.
    pub async fn execute_group(
        &self,
        units: &[UnitId],
        bible: Arc<Bible>,
        cancel: &CancellationToken,
    ) -> Vec<UnitResult> {
        let outcomes: Vec<(UnitId, Result<UnitResult>)> = stream::iter(units.iter().copied())
            .map(|unit| {
                let bible = Arc::clone(&bible);
                async move { (unit, self.execute_unit(unit, bible, cancel).await) }
            })
            .buffer_unordered(self.config.max_unit_concurrency)
            .collect()
            .await;

        let mut results = Vec::with_capacity(outcomes.len());
        for (unit, outcome) in outcomes {
            match outcome {
                Ok(result) => results.push(result),
                Err(Error::Cancelled) => tracing::debug!(unit = %unit, "unit interrupted"),
                Err(e) => tracing::error!(unit = %unit, error = %e, "unit could not run"),
            }
        }
        results.sort_by_key(|r| r.unit);
        results
    }

    /// Run every stream of one unit and settle it.
    ///
    /// Waits for all dependencies to settle first.
    ///
    /// # Errors
    /// [`Error::UnitNotFound`] for an unknown unit, [`Error::Cancelled`] if the
    /// token fires before the unit settles. Stream failures are not errors.
    pub async fn execute_unit(
        &self,
        unit: UnitId,
        bible: Arc<Bible>,
        cancel: &CancellationToken,
    ) -> Result<UnitResult> {
        let dependencies = {
            let graph = self.graph.read().await;
            if !graph.contains_unit(unit) {
                return Err(Error::UnitNotFound(unit));
            }
            graph.dependencies(unit)
        };
        self.await_dependencies(unit, &dependencies, cancel).await?;

        let (work_unit, context) = {
            let mut graph = self.graph.write().await;
            let upstream = dependencies
                .iter()
                .filter_map(|dep| graph.unit(*dep))
                .map(|dep| UpstreamArtifact {
                    unit: dep.id,
                    status: dep.status.clone(),
                    quality: dep.quality,
                    artifact: dep.artifact.clone(),
                })
                .collect();
            let foreshadowing = graph.foreshadowing_for(unit);
            let work_unit = graph.try_unit_mut(unit)?;
            if work_unit.status == UnitStatus::Pending {
                work_unit.mark_ready();
            }
            work_unit.start();
            let context = ContextBundle {
                unit,
                kind: work_unit.kind.clone(),
                bible,
                foreshadowing,
                upstream,
            };
            (work_unit.clone(), Arc::new(context))
        };

        let tasks = self
            .roster
            .tasks_for(&work_unit, self.config.per_stream_timeout());
        tracing::debug!(unit = %unit, streams = tasks.len(), "unit started");
        self.emit(CoordinatorEvent::UnitStarted {
            unit,
            streams: tasks.len(),
        });

        let outcomes: Vec<Result<StreamResult>> = stream::iter(tasks)
            .map(|task| self.run_stream(task, Arc::clone(&context), cancel))
            .buffer_unordered(self.config.max_stream_concurrency)
            .collect()
            .await;

        let mut streams = Vec::with_capacity(outcomes.len());
        let mut interrupted = false;
        for outcome in outcomes {
            match outcome {
                Ok(result) => streams.push(result),
                Err(Error::Cancelled) => interrupted = true,
                Err(e) => tracing::warn!(unit = %unit, error = %e, "stream lost"),
            }
        }
        if interrupted {
            if let Some(unit) = self.graph.write().await.unit_mut(unit) {
                unit.reset();
            }
            return Err(Error::Cancelled);
        }

        match aggregate_quality(&streams) {
            Some(quality) => self.complete_unit(unit, streams, quality).await,
            None => {
                let error = format!("all {} streams failed", streams.len());
                Ok(self.fail_unit(unit, streams, &error).await)
            }
        }
    }

    async fn await_dependencies(
        &self,
        unit: UnitId,
        dependencies: &[UnitId],
        cancel: &CancellationToken,
    ) -> Result<()> {
        for &dep in dependencies {
            let settled = self
                .graph
                .read()
                .await
                .unit(dep)
                .map_or(true, WorkUnit::is_settled);
            if settled {
                continue;
            }
            tracing::trace!(unit = %unit, dependency = %dep, "waiting on dependency");
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = self.board.wait(dep) => {}
            }
        }
        Ok(())
    }

    /// One stream: bounded by its timeout, retried with backoff, then filtered.
    async fn run_stream(
        &self,
        task: StreamTask,
        context: Arc<ContextBundle>,
        cancel: &CancellationToken,
    ) -> Result<StreamResult> {
        let max_attempts = self.config.max_retries + 1;
        let mut attempts = 0;

        let raw = loop {
            attempts += 1;
            // Each attempt runs on its own task so a panicking producer only
            // fails this stream.
            let mut handle = {
                let producer = Arc::clone(&self.producer);
                let task = task.clone();
                let context = Arc::clone(&context);
                tokio::spawn(async move { producer.produce(&task, &context).await })
            };
            let abort = handle.abort_handle();
            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    abort.abort();
                    return Err(Error::Cancelled);
                }
                outcome = tokio::time::timeout(task.timeout, &mut handle) => outcome,
            };

            let raw = match outcome {
                Ok(Ok(Ok(mut raw))) => {
                    raw.quality_score = clamp_quality(raw.quality_score);
                    raw
                }
                Ok(Ok(Err(e))) => RawResult::failure(
                    StreamStatus::Failed,
                    &format!("{} failed: {}", task.stream, e),
                ),
                Ok(Err(e)) => {
                    tracing::error!(
                        unit = %task.unit,
                        stream = %task.stream,
                        error = %e,
                        "producer task died"
                    );
                    RawResult::failure(
                        StreamStatus::Failed,
                        &format!("{} panicked: {}", task.stream, e),
                    )
                }
                Err(_) => {
                    abort.abort();
                    RawResult::failure(
                        StreamStatus::Timeout,
                        &format!("{} timed out after {:?}", task.stream, task.timeout),
                    )
                }
            };

            if raw.status.is_usable() || attempts >= max_attempts {
                break raw;
            }

            let delay = self.config.backoff_for(attempts);
            tracing::warn!(
                unit = %task.unit,
                stream = %task.stream,
                status = %raw.status,
                attempt = attempts,
                ?delay,
                "stream attempt failed, retrying"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        };

        let key = DetailKey::new(task.unit, &task.stream.key());
        let (digest, detail_ref) = self.filter.filter(&key, &raw).await?;

        self.emit(CoordinatorEvent::StreamSettled {
            unit: task.unit,
            stream: task.stream.clone(),
            status: raw.status,
            attempts,
        });

        Ok(StreamResult {
            stream: task.stream,
            status: raw.status,
            quality_score: if raw.status.is_usable() {
                raw.quality_score
            } else {
                0.0
            },
            weight: task.weight,
            attempts,
            digest,
            detail_ref,
        })
    }

    async fn complete_unit(
        &self,
        unit: UnitId,
        streams: Vec<StreamResult>,
        quality: f64,
    ) -> Result<UnitResult> {
        let usable: Vec<(&StreamRole, &Digest)> = streams
            .iter()
            .filter(|s| s.is_usable())
            .map(|s| (&s.stream, &s.digest))
            .collect();
        let conflicts = self.detector.detect(unit, &usable);
        if !conflicts.is_empty() {
            tracing::info!(unit = %unit, count = conflicts.len(), "stream conflicts flagged");
        }

        let artifact = merge(
            unit,
            &streams,
            conflicts,
            quality,
            self.config.quality_threshold,
        );
        let artifact_ref = match self.store_artifact(unit, &artifact).await {
            Ok(reference) => reference,
            Err(e) => {
                let error = format!("artifact could not be stored: {}", e);
                return Ok(self.fail_unit(unit, streams, &error).await);
            }
        };

        self.graph
            .write()
            .await
            .try_unit_mut(unit)?
            .complete(quality, artifact_ref.clone());
        self.board.signal(unit, Settlement::Completed);

        let degraded = artifact.metadata.degraded;
        if degraded {
            tracing::warn!(unit = %unit, quality, "unit completed below quality threshold");
        } else {
            tracing::info!(unit = %unit, quality, "unit completed");
        }
        self.emit(CoordinatorEvent::UnitCompleted {
            unit,
            quality,
            degraded,
        });

        Ok(UnitResult {
            unit,
            status: UnitStatus::Completed,
            quality,
            degraded,
            artifact_ref: Some(artifact_ref),
            artifact: Some(artifact),
            streams,
            restored: false,
        })
    }

    async fn fail_unit(&self, unit: UnitId, streams: Vec<StreamResult>, error: &str) -> UnitResult {
        if let Some(work_unit) = self.graph.write().await.unit_mut(unit) {
            work_unit.fail(error);
        }
        self.board.signal(unit, Settlement::Failed);
        tracing::warn!(unit = %unit, error, "unit failed");
        self.emit(CoordinatorEvent::UnitFailed {
            unit,
            error: error.to_string(),
        });
        UnitResult {
            streams,
            ..UnitResult::failed(unit, error)
        }
    }

    async fn store_artifact(
        &self,
        unit: UnitId,
        artifact: &Artifact,
    ) -> Result<DetailRef> {
        let body = serde_json::to_vec(artifact)?;
        self.filter
            .store()
            .put(&DetailKey::artifact(unit), body)
            .await
    }

    // ========== Checkpoint ==========

    /// Serialize the graph with unit statuses and group progress.
    pub async fn checkpoint(&self) -> Result<Vec<u8>> {
        let last = self.last_completed_group().await;
        let graph = self.graph.read().await;
        Checkpoint::capture(&graph, last).to_bytes()
    }

    /// Replace the graph with a checkpoint's. A following run skips the
    /// completed units and re-runs everything else.
    ///
    /// # Errors
    /// [`Error::Checkpoint`] for an unsupported version, [`Error::Json`]
    /// for a malformed blob.
    pub async fn restore(&self, blob: &[u8]) -> Result<()> {
        let checkpoint = Checkpoint::from_bytes(blob)?;
        let last = checkpoint.last_completed_group;
        let restored = checkpoint.into_graph()?;
        tracing::info!(
            units = restored.unit_count(),
            last_completed_group = ?last,
            "restored from checkpoint"
        );
        *self.graph.write().await = restored;
        *self.last_completed_group.lock().await = last;
        self.board.clear();
        Ok(())
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("config", &self.config)
            .field("roster", &self.roster)
            .finish_non_exhaustive()
    }
}

fn clamp_quality(score: f64) -> f64 {
    if score.is_finite() {
        score.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

fn restored_result(unit: &WorkUnit, quality_threshold: f64) -> UnitResult {
    let quality = unit.quality.unwrap_or_default();
    UnitResult {
        unit: unit.id,
        status: UnitStatus::Completed,
        quality,
        degraded: quality < quality_threshold,
        artifact_ref: unit.artifact.clone(),
        artifact: None,
        streams: Vec::new(),
        restored: true,
    }
}
