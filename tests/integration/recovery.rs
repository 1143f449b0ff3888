//! Cancellation, checkpoints and resuming interrupted runs.

use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use braid::core::{DependencyGraph, UnitId, UnitStatus};
use braid::orchestration::CoordinatorEvent;
use braid::state::{Checkpoint, CHECKPOINT_VERSION};
use braid::Error;

use crate::fixtures::{
    diamond_graph, ids, test_config, Behavior, CoordinatorHarness, ScriptedProducer,
};

/// Runs the diamond graph and cancels once unit 3 is in flight.
async fn interrupted_run() -> (CoordinatorHarness, braid::RunReport) {
    let producer = ScriptedProducer::new(90.0).script_unit(3, Behavior::Hang);
    let mut harness = CoordinatorHarness::new(
        diamond_graph(),
        producer,
        test_config().with_per_stream_timeout(Duration::from_secs(30)),
    );

    let token = CancellationToken::new();
    let report = {
        let coordinator = &harness.coordinator;
        let event_rx = &mut harness.event_rx;
        let (report, _) = tokio::join!(coordinator.run_with_cancel(json!({}), token.clone()), async {
            while let Some(event) = event_rx.recv().await {
                if matches!(event, CoordinatorEvent::UnitStarted { unit: UnitId(3), .. }) {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    token.cancel();
                    break;
                }
            }
        });
        report
    };
    (harness, report)
}

#[tokio::test]
async fn test_cancellation_keeps_completed_units() {
    let (mut harness, report) = interrupted_run().await;

    assert!(report.cancelled);
    assert_eq!(report.completed(), ids(&[1, 2]));
    assert!(report.result(UnitId(3)).is_none());
    assert_eq!(report.last_completed_group, Some(0));

    // The interrupted unit goes back to pending; nothing is rolled back.
    assert_eq!(harness.status(3).await, UnitStatus::Pending);
    assert_eq!(harness.status(1).await, UnitStatus::Completed);
    assert_eq!(harness.status(4).await, UnitStatus::Pending);

    let events = harness.drain_events();
    assert!(events.contains(&CoordinatorEvent::RunCancelled { completed: 2 }));
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let harness = CoordinatorHarness::new(diamond_graph(), ScriptedProducer::new(90.0), test_config());
    let token = CancellationToken::new();
    token.cancel();

    let report = harness.coordinator.run_with_cancel(json!({}), token).await;
    assert!(report.cancelled);
    assert!(report.unit_results.is_empty());
    assert!(harness.producer.units_called().is_empty());
}

#[tokio::test]
async fn test_resume_from_checkpoint_skips_completed_units() {
    let (harness, _) = interrupted_run().await;
    let blob = harness.coordinator.checkpoint().await.unwrap();

    let resumed = CoordinatorHarness::new(
        DependencyGraph::new(),
        ScriptedProducer::new(95.0),
        test_config(),
    );
    resumed.coordinator.restore(&blob).await.unwrap();
    assert_eq!(resumed.coordinator.last_completed_group().await, Some(0));

    let report = resumed.coordinator.run(json!({})).await;

    assert!(report.is_success());
    assert_eq!(report.completed(), ids(&[1, 2, 3, 4, 5]));
    assert_eq!(resumed.producer.units_called(), ids(&[3, 4, 5]));

    let one = report.result(UnitId(1)).unwrap();
    assert!(one.restored);
    assert_eq!(one.quality, 90.0);
    assert!(one.artifact_ref.is_some());
    assert!(!report.result(UnitId(3)).unwrap().restored);
    assert_eq!(report.last_completed_group, Some(2));

    // Unit 3 still sees the handles its restored dependencies left behind.
    let seen = resumed.producer.seen();
    let three = seen.iter().find(|s| s.unit == UnitId(3)).unwrap();
    assert_eq!(three.upstream_with_artifact, 2);
}

#[tokio::test]
async fn test_resume_reruns_failed_units() {
    let first = CoordinatorHarness::new(
        diamond_graph(),
        ScriptedProducer::new(90.0).script_unit(2, Behavior::Fail),
        test_config().with_max_retries(0),
    );
    let report = first.coordinator.run(json!({})).await;
    assert_eq!(report.failed(), ids(&[2]));

    let blob = first.coordinator.checkpoint().await.unwrap();
    let checkpoint = Checkpoint::from_bytes(&blob).unwrap();
    assert_eq!(checkpoint.version, CHECKPOINT_VERSION);

    let second = CoordinatorHarness::new(
        DependencyGraph::new(),
        ScriptedProducer::new(90.0),
        test_config(),
    );
    second.coordinator.restore(&blob).await.unwrap();
    assert_eq!(second.status(2).await, UnitStatus::Pending);

    let report = second.coordinator.run(json!({})).await;
    assert!(report.is_success());
    assert_eq!(second.producer.units_called(), ids(&[2]));
}

#[tokio::test]
async fn test_restore_rejects_unknown_version() {
    let harness = CoordinatorHarness::new(diamond_graph(), ScriptedProducer::new(90.0), test_config());
    let blob = harness.coordinator.checkpoint().await.unwrap();

    let mut value: serde_json::Value = serde_json::from_slice(&blob).unwrap();
    value["version"] = json!(CHECKPOINT_VERSION + 1);
    let tampered = serde_json::to_vec(&value).unwrap();

    let result = harness.coordinator.restore(&tampered).await;
    assert!(matches!(result, Err(Error::Checkpoint(_))));
    // The graph is untouched by a failed restore.
    assert_eq!(harness.graph.read().await.unit_count(), 5);
}

#[tokio::test]
async fn test_second_run_is_a_no_op_for_completed_graph() {
    let harness = CoordinatorHarness::new(diamond_graph(), ScriptedProducer::new(90.0), test_config());
    harness.coordinator.run(json!({})).await;
    let calls = harness.producer.calls_for(1);

    let report = harness.coordinator.run(json!({})).await;
    assert!(report.is_success());
    assert!(report.unit_results.iter().all(|r| r.restored));
    assert_eq!(harness.producer.calls_for(1), calls);
}
