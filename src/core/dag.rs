//! Dependency graph of work units.
//!
//! This module provides the [`DependencyGraph`] that records typed
//! dependencies between work units, validates that they form a DAG, and
//! derives the execution order and the parallel groups the coordinator
//! runs. It also owns the foreshadowing table, since chain validation is
//! defined against the execution order.
//!
//! Edge insertion is cheap and never checks for cycles. Cycle detection is
//! an explicit, advisory step ([`DependencyGraph::validate_acyclic`]); only
//! the ordering operations fail hard on a cyclic graph.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, HashSet};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::graphmap::DiGraphMap;
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use crate::core::foreshadowing::{
    ForeshadowingTable, ForeshadowingToken, UnitForeshadowing, ValidationWarning,
};
use crate::core::unit::{UnitId, UnitStatus, WorkUnit};
use crate::error::{Error, Result};

/// Why one unit depends on another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    Plot,
    Character,
    Setting,
    Theme,
    Foreshadowing,
}

impl std::fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyKind::Plot => write!(f, "plot"),
            DependencyKind::Character => write!(f, "character"),
            DependencyKind::Setting => write!(f, "setting"),
            DependencyKind::Theme => write!(f, "theme"),
            DependencyKind::Foreshadowing => write!(f, "foreshadowing"),
        }
    }
}

/// A typed edge: `source` must complete before `target` runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub source: UnitId,
    pub target: UnitId,
    pub kind: DependencyKind,
}

impl DependencyEdge {
    pub fn new(source: impl Into<UnitId>, target: impl Into<UnitId>, kind: DependencyKind) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            kind,
        }
    }
}

/// A dependency cycle as the list of units on it, starting at the lowest id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cycle(pub Vec<UnitId>);

impl Cycle {
    /// Rotate so the smallest id comes first, making equal cycles compare equal.
    fn canonical(mut nodes: Vec<UnitId>) -> Self {
        if let Some(min_pos) = nodes
            .iter()
            .enumerate()
            .min_by_key(|(_, id)| **id)
            .map(|(i, _)| i)
        {
            nodes.rotate_left(min_pos);
        }
        Self(nodes)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, id: UnitId) -> bool {
        self.0.contains(&id)
    }
}

impl std::fmt::Display for Cycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for id in &self.0 {
            write!(f, "{} -> ", id)?;
        }
        match self.0.first() {
            Some(first) => write!(f, "{}", first),
            None => Ok(()),
        }
    }
}

/// Serializable form of the whole graph, used by export/import and checkpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub units: Vec<WorkUnit>,
    pub edges: Vec<DependencyEdge>,
    pub foreshadowing: Vec<ForeshadowingToken>,
}

/// Successor sets restricted to some unit subset. Parallel edges collapse.
type Adjacency = BTreeMap<UnitId, BTreeSet<UnitId>>;

/// The work unit dependency graph.
///
/// Nodes are work units, edges are typed dependencies. Several edges between
/// the same pair are allowed as long as their kinds differ.
pub struct DependencyGraph {
    graph: DiGraph<WorkUnit, DependencyKind>,
    unit_index: HashMap<UnitId, NodeIndex>,
    foreshadowing: ForeshadowingTable,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            unit_index: HashMap::new(),
            foreshadowing: ForeshadowingTable::new(),
        }
    }

    /// One-shot construction from units, edges and foreshadowing tokens.
    ///
    /// Callers must still run [`validate_acyclic`](Self::validate_acyclic)
    /// before executing the graph.
    ///
    /// # Errors
    /// Returns [`Error::DuplicateToken`] if two tokens share a name.
    pub fn build(
        units: impl IntoIterator<Item = WorkUnit>,
        edges: impl IntoIterator<Item = DependencyEdge>,
        foreshadowing: impl IntoIterator<Item = ForeshadowingToken>,
    ) -> Result<Self> {
        let mut graph = Self::new();
        for unit in units {
            graph.add_unit(unit);
        }
        for edge in edges {
            graph.add_dependency(edge.source, edge.target, edge.kind);
        }
        for token in foreshadowing {
            graph.foreshadowing.add(token)?;
        }
        tracing::debug!(
            units = graph.unit_count(),
            edges = graph.dependency_count(),
            tokens = graph.foreshadowing.len(),
            "dependency graph built"
        );
        Ok(graph)
    }

    /// Add a unit. An existing unit with the same id is kept as is.
    pub fn add_unit(&mut self, unit: WorkUnit) -> NodeIndex {
        if let Some(&index) = self.unit_index.get(&unit.id) {
            return index;
        }
        let id = unit.id;
        let index = self.graph.add_node(unit);
        self.unit_index.insert(id, index);
        index
    }

    fn ensure_unit(&mut self, id: UnitId) -> NodeIndex {
        match self.unit_index.get(&id) {
            Some(&index) => index,
            None => self.add_unit(WorkUnit::new(id)),
        }
    }

    /// Record that `source` must complete before `target`.
    ///
    /// Missing units are created as pending. No cycle check happens here;
    /// an identical (source, target, kind) edge is only stored once.
    pub fn add_dependency(&mut self, source: UnitId, target: UnitId, kind: DependencyKind) {
        let from = self.ensure_unit(source);
        let to = self.ensure_unit(target);
        let duplicate = self
            .graph
            .edges_connecting(from, to)
            .any(|edge| *edge.weight() == kind);
        if !duplicate {
            self.graph.add_edge(from, to, kind);
        }
    }

    pub fn unit(&self, id: UnitId) -> Option<&WorkUnit> {
        self.unit_index
            .get(&id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    pub fn unit_mut(&mut self, id: UnitId) -> Option<&mut WorkUnit> {
        match self.unit_index.get(&id) {
            Some(&index) => self.graph.node_weight_mut(index),
            None => None,
        }
    }

    /// Like [`unit_mut`](Self::unit_mut) but reports a missing unit as an error.
    pub fn try_unit_mut(&mut self, id: UnitId) -> Result<&mut WorkUnit> {
        self.unit_mut(id).ok_or(Error::UnitNotFound(id))
    }

    pub fn contains_unit(&self, id: UnitId) -> bool {
        self.unit_index.contains_key(&id)
    }

    /// Every unit id in ascending order.
    pub fn unit_ids(&self) -> Vec<UnitId> {
        let mut ids: Vec<UnitId> = self.unit_index.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Every unit, ordered by id.
    pub fn units(&self) -> Vec<&WorkUnit> {
        let mut units: Vec<&WorkUnit> = self.graph.node_weights().collect();
        units.sort_by_key(|u| u.id);
        units
    }

    pub fn unit_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Every edge, ordered by (source, target, kind).
    pub fn edges(&self) -> Vec<DependencyEdge> {
        let mut edges: Vec<DependencyEdge> = self
            .graph
            .edge_references()
            .map(|edge| DependencyEdge {
                source: self.graph[edge.source()].id,
                target: self.graph[edge.target()].id,
                kind: *edge.weight(),
            })
            .collect();
        edges.sort_by_key(|e| (e.source, e.target, e.kind));
        edges
    }

    /// Edges pointing into `id`, ordered by source.
    pub fn edges_into(&self, id: UnitId) -> Vec<DependencyEdge> {
        let Some(&index) = self.unit_index.get(&id) else {
            return Vec::new();
        };
        let mut edges: Vec<DependencyEdge> = self
            .graph
            .edges_directed(index, Direction::Incoming)
            .map(|edge| DependencyEdge {
                source: self.graph[edge.source()].id,
                target: id,
                kind: *edge.weight(),
            })
            .collect();
        edges.sort_by_key(|e| (e.source, e.kind));
        edges
    }

    /// Distinct units `id` depends on, ascending.
    pub fn dependencies(&self, id: UnitId) -> Vec<UnitId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Distinct units depending on `id`, ascending.
    pub fn dependents(&self, id: UnitId) -> Vec<UnitId> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: UnitId, direction: Direction) -> Vec<UnitId> {
        let Some(&index) = self.unit_index.get(&id) else {
            return Vec::new();
        };
        let set: BTreeSet<UnitId> = self
            .graph
            .neighbors_directed(index, direction)
            .map(|n| self.graph[n].id)
            .collect();
        set.into_iter().collect()
    }

    // ========== Validation ==========

    /// Report every elementary cycle, each rotated to start at its smallest
    /// id and listed in ascending order.
    ///
    /// Overlapping cycles are reported separately, so every edge that lies
    /// on some cycle shows up. An empty result means the graph is a DAG.
    /// Never mutates the graph.
    pub fn validate_acyclic(&self) -> Vec<Cycle> {
        let cycles = find_cycles(&self.adjacency(None));
        if !cycles.is_empty() {
            tracing::warn!(count = cycles.len(), "dependency cycles detected");
        }
        cycles
    }

    fn adjacency(&self, subset: Option<&BTreeSet<UnitId>>) -> Adjacency {
        let mut adjacency: Adjacency = BTreeMap::new();
        match subset {
            Some(subset) => {
                for id in subset {
                    adjacency.entry(*id).or_default();
                }
            }
            None => {
                for id in self.unit_index.keys() {
                    adjacency.entry(*id).or_default();
                }
            }
        }
        for edge in self.graph.edge_references() {
            let source = self.graph[edge.source()].id;
            let target = self.graph[edge.target()].id;
            if adjacency.contains_key(&source) && adjacency.contains_key(&target) {
                adjacency.entry(source).or_default().insert(target);
            }
        }
        adjacency
    }

    // ========== Scheduling ==========

    /// Topological order of `units` (Kahn's algorithm).
    ///
    /// Only edges between the given units count. Units unknown to the graph
    /// are treated as isolated. Ties between equally ready units go to the
    /// lower id.
    ///
    /// # Errors
    /// Returns [`Error::Cycle`] if the induced subgraph is cyclic.
    pub fn execution_order(&self, units: &[UnitId]) -> Result<Vec<UnitId>> {
        let subset: BTreeSet<UnitId> = units.iter().copied().collect();
        let adjacency = self.adjacency(Some(&subset));
        let mut indegree = indegrees(&adjacency);

        let mut ready: BinaryHeap<Reverse<UnitId>> = indegree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| Reverse(*id))
            .collect();
        let mut order = Vec::with_capacity(adjacency.len());

        while let Some(Reverse(id)) = ready.pop() {
            order.push(id);
            for succ in &adjacency[&id] {
                if let Some(deg) = indegree.get_mut(succ) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.push(Reverse(*succ));
                    }
                }
            }
        }

        if order.len() < adjacency.len() {
            return Err(Error::Cycle {
                cycles: find_cycles(&adjacency),
            });
        }
        Ok(order)
    }

    /// Execution order over every unit in the graph.
    pub fn full_execution_order(&self) -> Result<Vec<UnitId>> {
        self.execution_order(&self.unit_ids())
    }

    /// Partition `units` into levels that can each run concurrently.
    ///
    /// Level 0 holds the units with no dependency inside the set; level k+1
    /// holds units whose dependencies all sit in levels up to k. Each level
    /// is sorted by id.
    ///
    /// # Errors
    /// Returns [`Error::Cycle`] if the induced subgraph is cyclic.
    pub fn parallel_groups(&self, units: &[UnitId]) -> Result<Vec<Vec<UnitId>>> {
        let subset: BTreeSet<UnitId> = units.iter().copied().collect();
        let adjacency = self.adjacency(Some(&subset));
        let mut indegree = indegrees(&adjacency);

        let mut level: Vec<UnitId> = indegree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut groups = Vec::new();
        let mut placed = 0;

        while !level.is_empty() {
            placed += level.len();
            let mut next = BTreeSet::new();
            for id in &level {
                for succ in &adjacency[id] {
                    if let Some(deg) = indegree.get_mut(succ) {
                        *deg -= 1;
                        if *deg == 0 {
                            next.insert(*succ);
                        }
                    }
                }
            }
            groups.push(std::mem::take(&mut level));
            level = next.into_iter().collect();
        }

        if placed < adjacency.len() {
            return Err(Error::Cycle {
                cycles: find_cycles(&adjacency),
            });
        }
        Ok(groups)
    }

    /// Parallel groups over every unit in the graph.
    pub fn all_parallel_groups(&self) -> Result<Vec<Vec<UnitId>>> {
        self.parallel_groups(&self.unit_ids())
    }

    /// Longest dependency chain from `from` to `to`, both inclusive.
    ///
    /// Reporting only; scheduling never consults it. Returns an empty path
    /// when `to` is not reachable from `from`.
    ///
    /// # Errors
    /// Returns [`Error::UnitNotFound`] for unknown endpoints and
    /// [`Error::Cycle`] if the graph is cyclic.
    pub fn critical_path(&self, from: UnitId, to: UnitId) -> Result<Vec<UnitId>> {
        for id in [from, to] {
            if !self.contains_unit(id) {
                return Err(Error::UnitNotFound(id));
            }
        }
        let order = self.full_execution_order()?;
        let adjacency = self.adjacency(None);

        let mut distance: HashMap<UnitId, usize> = HashMap::from([(from, 0)]);
        let mut previous: HashMap<UnitId, UnitId> = HashMap::new();
        for id in order {
            let Some(&d) = distance.get(&id) else {
                continue;
            };
            for succ in &adjacency[&id] {
                if distance.get(succ).map_or(true, |&current| d + 1 > current) {
                    distance.insert(*succ, d + 1);
                    previous.insert(*succ, id);
                }
            }
        }

        if !distance.contains_key(&to) {
            return Ok(Vec::new());
        }
        let mut path = vec![to];
        let mut cursor = to;
        while cursor != from {
            match previous.get(&cursor) {
                Some(&prev) => {
                    path.push(prev);
                    cursor = prev;
                }
                None => break,
            }
        }
        path.reverse();
        Ok(path)
    }

    // ========== Status ==========

    /// Move pending units whose dependencies all completed to Ready.
    ///
    /// Returns the ids that changed, ascending.
    pub fn refresh_ready(&mut self) -> Vec<UnitId> {
        let mut promoted = Vec::new();
        for id in self.unit_ids() {
            let pending = self
                .unit(id)
                .is_some_and(|u| u.status == UnitStatus::Pending);
            if !pending {
                continue;
            }
            let satisfied = self
                .dependencies(id)
                .iter()
                .all(|dep| self.unit(*dep).is_some_and(WorkUnit::is_completed));
            if satisfied {
                if let Some(unit) = self.unit_mut(id) {
                    unit.mark_ready();
                    promoted.push(id);
                }
            }
        }
        promoted
    }

    /// Units currently Ready, ascending.
    pub fn ready_units(&self) -> Vec<UnitId> {
        self.units()
            .into_iter()
            .filter(|u| u.status == UnitStatus::Ready)
            .map(|u| u.id)
            .collect()
    }

    // ========== Foreshadowing ==========

    /// Declare a token whose payoff must follow its setup.
    ///
    /// # Errors
    /// Returns [`Error::DuplicateToken`] if the name is taken.
    pub fn add_foreshadowing(
        &mut self,
        name: &str,
        setup_unit: UnitId,
        payoff_unit: UnitId,
        description: &str,
    ) -> Result<()> {
        self.foreshadowing.add(ForeshadowingToken::new(
            name,
            setup_unit,
            payoff_unit,
            description,
        ))
    }

    pub fn mark_planted(&mut self, name: &str) -> Result<()> {
        self.foreshadowing.mark_planted(name)
    }

    pub fn mark_resolved(&mut self, name: &str) -> Result<()> {
        self.foreshadowing.mark_resolved(name)
    }

    /// Names of tokens not yet resolved.
    pub fn unresolved(&self) -> Vec<String> {
        self.foreshadowing.unresolved()
    }

    pub fn foreshadowing(&self) -> &ForeshadowingTable {
        &self.foreshadowing
    }

    /// Ordering findings for the named tokens against the current order.
    pub fn chain_warnings(&self, names: &[&str]) -> Vec<ValidationWarning> {
        match self.full_execution_order() {
            Ok(order) => self.foreshadowing.check_order(names, &positions(&order)),
            Err(_) => vec![ValidationWarning::NoExecutionOrder],
        }
    }

    /// True iff every named token pays off strictly after its setup.
    ///
    /// Returns false rather than failing on unknown tokens or a cyclic graph.
    pub fn validate_chain(&self, names: &[&str]) -> bool {
        self.chain_warnings(names).is_empty()
    }

    /// Tokens to set up, pay off, or keep alive in `unit`.
    pub fn foreshadowing_for(&self, unit: UnitId) -> UnitForeshadowing {
        let order = self.full_execution_order().unwrap_or_default();
        self.foreshadowing.for_unit(unit, &positions(&order))
    }

    // ========== Persistence ==========

    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            units: self.units().into_iter().cloned().collect(),
            edges: self.edges(),
            foreshadowing: self.foreshadowing.tokens().cloned().collect(),
        }
    }

    pub fn from_snapshot(snapshot: GraphSnapshot) -> Result<Self> {
        Self::build(snapshot.units, snapshot.edges, snapshot.foreshadowing)
    }

    /// Serialize the graph, unit states and foreshadowing table to JSON.
    pub fn export(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.snapshot())?)
    }

    /// Rebuild a graph from [`export`](Self::export) output.
    pub fn import(blob: &[u8]) -> Result<Self> {
        let snapshot: GraphSnapshot = serde_json::from_slice(blob)?;
        Self::from_snapshot(snapshot)
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("units", &self.unit_count())
            .field("dependencies", &self.dependency_count())
            .field("foreshadowing", &self.foreshadowing.len())
            .finish()
    }
}

fn positions(order: &[UnitId]) -> HashMap<UnitId, usize> {
    order.iter().enumerate().map(|(i, id)| (*id, i)).collect()
}

fn indegrees(adjacency: &Adjacency) -> BTreeMap<UnitId, usize> {
    let mut indegree: BTreeMap<UnitId, usize> = adjacency.keys().map(|id| (*id, 0)).collect();
    for successors in adjacency.values() {
        for succ in successors {
            *indegree.entry(*succ).or_default() += 1;
        }
    }
    indegree
}

/// Every elementary cycle, by Johnson's algorithm.
///
/// Each unit in ascending order searches for circuits through itself within
/// its strongly connected component of the units not below it, so every
/// cycle is found exactly once, rooted at its smallest id.
fn find_cycles(adjacency: &Adjacency) -> Vec<Cycle> {
    let mut found: BTreeSet<Cycle> = BTreeSet::new();

    for &start in adjacency.keys() {
        let remaining: DiGraphMap<UnitId, ()> = DiGraphMap::from_edges(
            adjacency
                .range(start..)
                .flat_map(|(source, targets)| targets.range(start..).map(move |t| (*source, *t))),
        );
        let Some(component) = tarjan_scc(&remaining)
            .into_iter()
            .find(|scc| scc.contains(&start))
        else {
            continue;
        };
        let component: BTreeSet<UnitId> = component.into_iter().collect();
        if component.len() == 1 && !remaining.contains_edge(start, start) {
            continue;
        }

        let mut search = CircuitSearch {
            adjacency,
            component: &component,
            start,
            path: Vec::new(),
            blocked: HashSet::new(),
            blocked_by: HashMap::new(),
        };
        search.circuit(start, &mut found);
    }

    found.into_iter().collect()
}

struct CircuitSearch<'a> {
    adjacency: &'a Adjacency,
    component: &'a BTreeSet<UnitId>,
    start: UnitId,
    path: Vec<UnitId>,
    blocked: HashSet<UnitId>,
    blocked_by: HashMap<UnitId, HashSet<UnitId>>,
}

impl CircuitSearch<'_> {
    fn successors(&self, node: UnitId) -> Vec<UnitId> {
        self.adjacency
            .get(&node)
            .into_iter()
            .flatten()
            .copied()
            .filter(|succ| self.component.contains(succ))
            .collect()
    }

    /// Returns true if some circuit through `start` passes `node`.
    fn circuit(&mut self, node: UnitId, found: &mut BTreeSet<Cycle>) -> bool {
        let mut closed = false;
        self.path.push(node);
        self.blocked.insert(node);

        for succ in self.successors(node) {
            if succ == self.start {
                found.insert(Cycle::canonical(self.path.clone()));
                closed = true;
            } else if !self.blocked.contains(&succ) && self.circuit(succ, found) {
                closed = true;
            }
        }

        if closed {
            self.unblock(node);
        } else {
            for succ in self.successors(node) {
                self.blocked_by.entry(succ).or_default().insert(node);
            }
        }
        self.path.pop();
        closed
    }

    fn unblock(&mut self, node: UnitId) {
        self.blocked.remove(&node);
        if let Some(waiting) = self.blocked_by.remove(&node) {
            for other in waiting {
                if self.blocked.contains(&other) {
                    self.unblock(other);
                }
            }
        }
    }
}
