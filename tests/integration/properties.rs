//! Property tests for graph ordering, foreshadowing validation, digests and
//! quality aggregation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use proptest::prelude::*;

use braid::core::{DependencyGraph, DependencyKind, UnitId, WorkUnit};
use braid::digest::{DetailKey, DigestBounds, DigestFilter, MemoryDetailStore, RawResult, StreamStatus};
use braid::orchestration::{aggregate_quality, StreamResult, StreamRole};

// Acyclic by construction: unit i may only depend on units 0..i, and labels
// are shuffled so id order says nothing about dependency order.
fn dag_strategy(max_units: usize) -> impl Strategy<Value = (Vec<u32>, Vec<(u32, u32)>)> {
    (1..=max_units).prop_flat_map(|n| {
        let labels = Just((1..=n as u32).collect::<Vec<u32>>()).prop_shuffle();
        let deps = proptest::collection::vec(proptest::collection::vec(any::<usize>(), 0..3), n);
        (labels, deps).prop_map(|(labels, deps)| {
            let mut edges = Vec::new();
            for (i, potential) in deps.into_iter().enumerate() {
                if i == 0 {
                    continue;
                }
                for dep in potential {
                    edges.push((labels[dep % i], labels[i]));
                }
            }
            (labels, edges)
        })
    })
}

fn build(units: &[u32], edges: &[(u32, u32)]) -> DependencyGraph {
    let mut graph = DependencyGraph::new();
    for &id in units {
        graph.add_unit(WorkUnit::new(UnitId(id)));
    }
    for &(source, target) in edges {
        graph.add_dependency(UnitId(source), UnitId(target), DependencyKind::Plot);
    }
    graph
}

fn positions(order: &[UnitId]) -> HashMap<UnitId, usize> {
    order.iter().enumerate().map(|(i, id)| (*id, i)).collect()
}

fn reachable(edges: &HashSet<(u32, u32)>, from: u32, to: u32) -> bool {
    let mut seen = HashSet::from([from]);
    let mut frontier = vec![from];
    while let Some(node) = frontier.pop() {
        if node == to {
            return true;
        }
        for &(source, target) in edges {
            if source == node && seen.insert(target) {
                frontier.push(target);
            }
        }
    }
    false
}

fn stream_result(score: f64, weight: f64, status: StreamStatus) -> StreamResult {
    StreamResult {
        stream: StreamRole::ProseCraft,
        status,
        quality_score: score,
        weight,
        attempts: 1,
        digest: Default::default(),
        detail_ref: braid::digest::DetailRef::new("mem:test"),
    }
}

proptest! {
    #[test]
    fn prop_execution_order_respects_edges((units, edges) in dag_strategy(12)) {
        let graph = build(&units, &edges);
        let order = graph.full_execution_order().unwrap();

        prop_assert_eq!(order.len(), units.len());
        let unique: HashSet<UnitId> = order.iter().copied().collect();
        prop_assert_eq!(unique.len(), units.len());

        let pos = positions(&order);
        for (source, target) in &edges {
            prop_assert!(pos[&UnitId(*source)] < pos[&UnitId(*target)]);
        }
        prop_assert!(graph.validate_acyclic().is_empty());
    }

    #[test]
    fn prop_parallel_groups_partition_and_level((units, edges) in dag_strategy(12)) {
        let graph = build(&units, &edges);
        let groups = graph.all_parallel_groups().unwrap();

        let flat: Vec<UnitId> = groups.iter().flatten().copied().collect();
        prop_assert_eq!(flat.len(), units.len());
        let unique: HashSet<UnitId> = flat.iter().copied().collect();
        prop_assert_eq!(unique.len(), units.len());
        prop_assert!(groups.iter().all(|g| !g.is_empty()));

        let group_of: HashMap<UnitId, usize> = groups
            .iter()
            .enumerate()
            .flat_map(|(i, g)| g.iter().map(move |id| (*id, i)))
            .collect();
        for (source, target) in &edges {
            prop_assert!(group_of[&UnitId(*source)] < group_of[&UnitId(*target)]);
        }
    }

    #[test]
    fn prop_back_edge_creates_reported_cycle(
        (units, edges) in dag_strategy(10),
        pick in any::<usize>(),
    ) {
        prop_assume!(!edges.is_empty());
        let (source, target) = edges[pick % edges.len()];
        let mut graph = build(&units, &edges);
        graph.add_dependency(UnitId(target), UnitId(source), DependencyKind::Foreshadowing);

        prop_assert!(graph.full_execution_order().is_err());
        prop_assert!(graph.all_parallel_groups().is_err());
        let cycles = graph.validate_acyclic();
        prop_assert!(!cycles.is_empty());
        prop_assert!(cycles
            .iter()
            .all(|c| c.contains(UnitId(source)) && c.contains(UnitId(target))));
    }

    #[test]
    fn prop_every_cyclic_edge_is_reported(
        (units, edges) in dag_strategy(8),
        picks in proptest::collection::vec(any::<usize>(), 1..4),
    ) {
        prop_assume!(!edges.is_empty());
        let mut all_edges = edges.clone();
        for pick in picks {
            let (source, target) = edges[pick % edges.len()];
            all_edges.push((target, source));
        }
        let graph = build(&units, &all_edges);
        let cycles = graph.validate_acyclic();

        let edge_set: HashSet<(u32, u32)> = all_edges.iter().copied().collect();
        let mut on_reported: HashSet<(u32, u32)> = HashSet::new();
        for cycle in &cycles {
            let nodes: Vec<u32> = cycle.0.iter().map(|id| id.0).collect();
            let distinct: HashSet<u32> = nodes.iter().copied().collect();
            prop_assert_eq!(distinct.len(), nodes.len());
            prop_assert_eq!(nodes.iter().min(), nodes.first());
            for (i, from) in nodes.iter().enumerate() {
                let to = nodes[(i + 1) % nodes.len()];
                prop_assert!(edge_set.contains(&(*from, to)));
                on_reported.insert((*from, to));
            }
        }

        // An edge lies on a cycle exactly when its source is reachable from its target.
        for &(source, target) in &edge_set {
            if reachable(&edge_set, target, source) {
                prop_assert!(on_reported.contains(&(source, target)));
            }
        }
    }

    #[test]
    fn prop_validate_chain_matches_order(
        (units, edges) in dag_strategy(10),
        setup in any::<usize>(),
        payoff in any::<usize>(),
    ) {
        let mut graph = build(&units, &edges);
        let setup = UnitId(units[setup % units.len()]);
        let payoff = UnitId(units[payoff % units.len()]);
        graph.add_foreshadowing("token", setup, payoff, "").unwrap();

        let pos = positions(&graph.full_execution_order().unwrap());
        prop_assert_eq!(graph.validate_chain(&["token"]), pos[&payoff] > pos[&setup]);
    }

    #[test]
    fn prop_digest_filter_is_idempotent(
        summary in "\\PC{0,300}",
        decisions in proptest::collection::vec("[a-z ]{0,20}", 0..10),
        steps in proptest::collection::vec("[a-z ]{0,20}", 0..6),
        max_summary_len in 1usize..120,
    ) {
        let bounds = DigestBounds { max_summary_len, max_decisions: 5, max_next_steps: 3 };
        let filter = DigestFilter::new(bounds, Arc::new(MemoryDetailStore::new()));
        let raw = RawResult::success(80.0, &summary, "")
            .with_decisions(decisions)
            .with_next_steps(steps);
        let key = DetailKey::new(UnitId(1), "prose_craft");

        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let (once, twice) = runtime.block_on(async {
            let (once, _) = filter.filter(&key, &raw).await.unwrap();
            let (twice, _) = filter.filter(&key, &once.to_raw(80.0)).await.unwrap();
            (once, twice)
        });

        prop_assert!(once.summary.chars().count() <= max_summary_len);
        prop_assert!(once.decisions.len() <= 5);
        prop_assert!(once.next_steps.len() <= 3);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn prop_quality_is_weighted_mean_of_usable(
        streams in proptest::collection::vec((0.0f64..=100.0, 0.1f64..5.0, any::<bool>()), 0..10),
    ) {
        let results: Vec<StreamResult> = streams
            .iter()
            .map(|(score, weight, ok)| {
                let status = if *ok { StreamStatus::Success } else { StreamStatus::Timeout };
                stream_result(*score, *weight, status)
            })
            .collect();

        let usable: Vec<&(f64, f64, bool)> = streams.iter().filter(|(_, _, ok)| *ok).collect();
        match aggregate_quality(&results) {
            None => prop_assert!(usable.is_empty()),
            Some(quality) => {
                let total: f64 = usable.iter().map(|(_, w, _)| w).sum();
                let expected = usable.iter().map(|(s, w, _)| s * w).sum::<f64>() / total;
                prop_assert!((quality - expected).abs() < 1e-9);
                prop_assert!((0.0..=100.0 + 1e-9).contains(&quality));
            }
        }
    }
}
