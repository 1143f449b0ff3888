//! Concurrency bounds, failure isolation and policies, and what flows
//! between units.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use braid::config::FailurePolicy;
use braid::core::{UnitId, UnitStatus, WorkUnit};
use braid::digest::{Digest, StreamStatus};
use braid::orchestration::{
    Artifact, Conflict, ConflictDetector, Coordinator, StreamRole, StreamSpec,
};

use crate::fixtures::{
    diamond_graph, graph_from, ids, streams, test_config, Behavior, CoordinatorHarness,
    ScriptedProducer,
};

#[tokio::test(start_paused = true)]
async fn test_stream_concurrency_is_bounded_per_unit() {
    let mut config = test_config().with_streams(streams(&StreamRole::CORE));
    config.max_stream_concurrency = 3;
    let harness = CoordinatorHarness::new(
        graph_from(&[1], &[]),
        ScriptedProducer::new(90.0).with_delay(Duration::from_millis(20)),
        config,
    );

    let report = harness.coordinator.run(json!({})).await;
    assert!(report.is_success());
    assert_eq!(report.result(UnitId(1)).unwrap().streams.len(), 8);
    assert_eq!(harness.producer.max_in_flight(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_unit_concurrency_is_bounded_within_group() {
    let mut config = test_config().with_streams(streams(&[StreamRole::ProseCraft]));
    config.max_unit_concurrency = 2;
    let harness = CoordinatorHarness::new(
        graph_from(&[1, 2, 3, 4, 5, 6], &[]),
        ScriptedProducer::new(90.0).with_delay(Duration::from_millis(20)),
        config,
    );

    let report = harness.coordinator.run(json!({})).await;
    assert_eq!(report.completed().len(), 6);
    assert_eq!(harness.producer.max_in_flight(), 2);
}

#[tokio::test]
async fn test_failed_sibling_does_not_affect_group() {
    let producer = ScriptedProducer::new(85.0).script_unit(1, Behavior::Fail);
    let harness = CoordinatorHarness::new(
        diamond_graph(),
        producer,
        test_config().with_max_retries(0),
    );

    let report = harness.coordinator.run(json!({})).await;

    assert_eq!(report.failed(), ids(&[1]));
    assert!(report.result(UnitId(2)).unwrap().is_completed());
    // Proceed is the default: dependents of the failure still run.
    assert_eq!(report.completed(), ids(&[2, 3, 4, 5]));
    assert!(report.skipped.is_empty());
    assert!(!report.aborted);
}

#[tokio::test]
async fn test_panicking_stream_is_a_failed_attempt() {
    let producer = ScriptedProducer::new(90.0).script(1, StreamRole::ProseCraft, Behavior::Panic);
    let harness = CoordinatorHarness::new(
        graph_from(&[1, 2], &[]),
        producer,
        test_config().with_max_retries(1),
    );

    let report = harness.coordinator.run(json!({})).await;

    assert_eq!(report.completed(), ids(&[1, 2]));
    let unit = report.result(UnitId(1)).unwrap();
    let prose = unit
        .streams
        .iter()
        .find(|s| s.stream == StreamRole::ProseCraft)
        .unwrap();
    assert_eq!(prose.status, StreamStatus::Failed);
    assert_eq!(prose.attempts, 2);
    assert!(prose.digest.summary.contains("panicked"));
    // Three streams once, the panicking one twice.
    assert_eq!(harness.producer.calls_for(1), 5);
}

#[tokio::test]
async fn test_panicking_unit_does_not_take_down_siblings() {
    let producer = ScriptedProducer::new(88.0).script_unit(1, Behavior::Panic);
    let harness = CoordinatorHarness::new(
        graph_from(&[1, 2, 3], &[(1, 3)]),
        producer,
        test_config().with_max_retries(0),
    );

    let report = harness.coordinator.run(json!({})).await;

    assert_eq!(report.failed(), ids(&[1]));
    assert_eq!(report.completed(), ids(&[2, 3]));
    assert_eq!(report.result(UnitId(2)).unwrap().quality, 88.0);
    assert!(matches!(harness.status(1).await, UnitStatus::Failed { .. }));
}

#[tokio::test]
async fn test_skip_dependents_policy() {
    let producer = ScriptedProducer::new(85.0).script_unit(3, Behavior::Fail);
    let harness = CoordinatorHarness::new(
        diamond_graph(),
        producer,
        test_config()
            .with_max_retries(0)
            .with_failure_policy(FailurePolicy::SkipDependents),
    );

    let report = harness.coordinator.run(json!({})).await;

    assert_eq!(report.completed(), ids(&[1, 2]));
    assert_eq!(report.failed(), ids(&[3]));
    assert_eq!(report.skipped, ids(&[4, 5]));
    assert_eq!(harness.status(4).await, UnitStatus::Pending);
    assert_eq!(harness.producer.calls_for(4), 0);
    assert!(!report.is_success());
}

#[tokio::test]
async fn test_abort_policy_stops_after_failed_group() {
    let producer = ScriptedProducer::new(85.0).script_unit(2, Behavior::Fail);
    let harness = CoordinatorHarness::new(
        diamond_graph(),
        producer,
        test_config()
            .with_max_retries(0)
            .with_failure_policy(FailurePolicy::Abort),
    );

    let report = harness.coordinator.run(json!({})).await;

    assert!(report.aborted);
    assert_eq!(report.completed(), ids(&[1]));
    assert_eq!(report.failed(), ids(&[2]));
    assert_eq!(report.last_completed_group, Some(0));
    assert_eq!(harness.producer.calls_for(3), 0);
    assert_eq!(harness.status(3).await, UnitStatus::Pending);
}

#[tokio::test]
async fn test_retry_recovers_stream() {
    let producer =
        ScriptedProducer::new(90.0).script(1, StreamRole::ProseCraft, Behavior::FailTimes(1, 70.0));
    let harness = CoordinatorHarness::new(graph_from(&[1], &[]), producer, test_config());

    let report = harness.coordinator.run(json!({})).await;
    let prose = report
        .result(UnitId(1))
        .unwrap()
        .streams
        .iter()
        .find(|s| s.stream == StreamRole::ProseCraft)
        .cloned()
        .unwrap();

    assert_eq!(prose.status, StreamStatus::Success);
    assert_eq!(prose.attempts, 2);
    assert_eq!(prose.quality_score, 70.0);
}

#[tokio::test]
async fn test_upstream_artifacts_reach_dependents() {
    let harness = CoordinatorHarness::new(diamond_graph(), ScriptedProducer::new(90.0), test_config());
    harness.coordinator.run(json!({})).await;

    let seen = harness.producer.seen();
    let unit_three = seen.iter().find(|s| s.unit == UnitId(3)).unwrap();
    assert_eq!(unit_three.upstream, ids(&[1, 2]));
    assert_eq!(unit_three.upstream_with_artifact, 2);

    let unit_one = seen.iter().find(|s| s.unit == UnitId(1)).unwrap();
    assert!(unit_one.upstream.is_empty());
}

#[tokio::test]
async fn test_specialist_streams_for_unit_kind() {
    let mut graph = graph_from(&[], &[]);
    graph.add_unit(WorkUnit::with_kind(UnitId(1), "battle"));
    graph.add_unit(WorkUnit::new(UnitId(2)));

    let mut config = test_config();
    config.add_specialists(
        "battle",
        vec![
            StreamSpec::new(StreamRole::Specialist("tactics".to_string())),
            StreamSpec::new(StreamRole::Specialist("choreography".to_string())),
        ],
    );
    let harness = CoordinatorHarness::new(graph, ScriptedProducer::new(90.0), config);

    let report = harness.coordinator.run(json!({})).await;
    let battle = report.result(UnitId(1)).unwrap();
    assert_eq!(battle.streams.len(), 6);

    let sections: Vec<StreamRole> = battle
        .artifact
        .as_ref()
        .unwrap()
        .sections
        .iter()
        .map(|s| s.role.clone())
        .collect();
    assert_eq!(
        &sections[4..],
        &[
            StreamRole::Specialist("choreography".to_string()),
            StreamRole::Specialist("tactics".to_string()),
        ]
    );
    assert_eq!(report.result(UnitId(2)).unwrap().streams.len(), 4);
}

struct EyeColour;

impl ConflictDetector for EyeColour {
    fn detect(&self, _unit: UnitId, digests: &[(&StreamRole, &Digest)]) -> Vec<Conflict> {
        let roles: Vec<StreamRole> = digests
            .iter()
            .map(|(role, _)| (*role).clone())
            .filter(|role| {
                matches!(
                    role,
                    StreamRole::CharacterPsychology | StreamRole::DialogueMaster
                )
            })
            .collect();
        vec![Conflict {
            streams: roles,
            description: "hero's eye colour differs".to_string(),
        }]
    }
}

#[tokio::test]
async fn test_conflicts_surface_in_artifact_metadata() {
    let graph = Arc::new(tokio::sync::RwLock::new(graph_from(&[1], &[])));
    let coordinator = Coordinator::new(test_config(), graph, Arc::new(ScriptedProducer::new(90.0)))
        .unwrap()
        .with_conflict_detector(Arc::new(EyeColour));

    let report = coordinator.run(json!({})).await;
    let result = report.result(UnitId(1)).unwrap();

    // Flagged, not resolved: the unit still completes with both sections.
    assert!(result.is_completed());
    let artifact = result.artifact.as_ref().unwrap();
    assert_eq!(artifact.metadata.conflicts.len(), 1);
    assert_eq!(artifact.metadata.conflicts[0].streams.len(), 2);
    assert!(artifact.section(&StreamRole::DialogueMaster).is_some());
    assert!(artifact.render().contains("hero's eye colour differs"));
}

#[tokio::test]
async fn test_digests_are_bounded_and_detail_is_stored() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config();
    config.detail_dir = Some(dir.path().to_string_lossy().into_owned());
    let harness = CoordinatorHarness::new(
        graph_from(&[1], &[]),
        ScriptedProducer::new(90.0).with_summary_len(500),
        config,
    );

    let report = harness.coordinator.run(json!({})).await;
    let result = report.result(UnitId(1)).unwrap();

    for stream in &result.streams {
        assert_eq!(stream.digest.summary.chars().count(), 100);
        assert!(stream.digest.summary.ends_with("..."));
        assert!(stream.digest.was_truncated());

        let full = harness
            .coordinator
            .detail_store()
            .get(&stream.detail_ref)
            .await
            .unwrap();
        let raw: braid::digest::RawResult = serde_json::from_slice(&full).unwrap();
        assert_eq!(raw.summary.chars().count(), 500);
        assert!(raw.content.contains("full text of the stream"));
    }

    assert!(dir.path().join("unit-1").join("artifact.json").exists());
    assert!(dir.path().join("unit-1").join("prose_craft.json").exists());

    let artifact_ref = result.artifact_ref.as_ref().unwrap();
    let stored = harness.coordinator.detail_store().get(artifact_ref).await.unwrap();
    let artifact: Artifact = serde_json::from_slice(&stored).unwrap();
    assert_eq!(&artifact, result.artifact.as_ref().unwrap());
}
