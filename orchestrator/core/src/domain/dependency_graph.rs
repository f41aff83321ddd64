// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Dependency Graph Validator
//!
//! Validates the prerequisite graph over work items before the store commits
//! a mutation. Edges point from a dependent item to its prerequisite.
//!
//! Feasibility is checked with Kahn's algorithm (repeatedly remove nodes of
//! in-degree zero). When nodes remain, an iterative depth-first search over
//! the remainder recovers one concrete cycle for the error message. Both
//! passes are O(V + E).

use crate::domain::work_item::{DependencyEdge, WorkItemId};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("dependency cycle detected: {}", format_cycle(.cycle))]
    Cycle { cycle: Vec<WorkItemId> },
    #[error("work item {0} cannot depend on itself")]
    SelfDependency(WorkItemId),
    #[error("dependency references unknown work item {0}")]
    UnknownItem(WorkItemId),
}

fn format_cycle(cycle: &[WorkItemId]) -> String {
    let mut parts: Vec<String> = cycle.iter().map(|id| id.to_string()).collect();
    if let Some(first) = cycle.first() {
        parts.push(first.to_string());
    }
    parts.join(" -> ")
}

/// Adjacency view of the dependency edge set.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: BTreeSet<WorkItemId>,
    /// dependent -> prerequisites
    edges: BTreeMap<WorkItemId, BTreeSet<WorkItemId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(
        nodes: impl IntoIterator<Item = WorkItemId>,
        edges: impl IntoIterator<Item = DependencyEdge>,
    ) -> Result<Self, GraphError> {
        let mut graph = Self::new();
        for node in nodes {
            graph.add_node(node);
        }
        for edge in edges {
            graph.add_edge(edge)?;
        }
        Ok(graph)
    }

    pub fn add_node(&mut self, id: WorkItemId) {
        self.nodes.insert(id);
    }

    pub fn contains(&self, id: WorkItemId) -> bool {
        self.nodes.contains(&id)
    }

    /// Inserts an edge without checking acyclicity. Endpoint existence and
    /// self-edges are still rejected.
    pub fn add_edge(&mut self, edge: DependencyEdge) -> Result<(), GraphError> {
        if edge.dependent == edge.prerequisite {
            return Err(GraphError::SelfDependency(edge.dependent));
        }
        for endpoint in [edge.dependent, edge.prerequisite] {
            if !self.nodes.contains(&endpoint) {
                return Err(GraphError::UnknownItem(endpoint));
            }
        }
        self.edges.entry(edge.dependent).or_default().insert(edge.prerequisite);
        Ok(())
    }

    pub fn remove_edge(&mut self, edge: DependencyEdge) -> bool {
        match self.edges.get_mut(&edge.dependent) {
            Some(prerequisites) => prerequisites.remove(&edge.prerequisite),
            None => false,
        }
    }

    pub fn prerequisites(&self, id: WorkItemId) -> impl Iterator<Item = WorkItemId> + '_ {
        self.edges.get(&id).into_iter().flat_map(|set| set.iter().copied())
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(BTreeSet::len).sum()
    }

    pub fn edges(&self) -> Vec<DependencyEdge> {
        self.edges
            .iter()
            .flat_map(|(dependent, prerequisites)| {
                prerequisites
                    .iter()
                    .map(move |prerequisite| DependencyEdge::new(*dependent, *prerequisite))
            })
            .collect()
    }

    /// Checks the whole graph; returns the offending cycle on failure.
    pub fn validate(&self) -> Result<(), GraphError> {
        let remaining = self.kahn_remainder();
        if remaining.is_empty() {
            return Ok(());
        }
        let cycle = self.find_cycle(&remaining);
        Err(GraphError::Cycle { cycle })
    }

    /// Validates the graph as it would look with `edge` added, leaving
    /// `self` untouched on failure.
    pub fn check_insert(&self, edge: DependencyEdge) -> Result<(), GraphError> {
        let mut candidate = self.clone();
        candidate.add_edge(edge)?;
        candidate.validate()
    }

    /// Topological order, prerequisites first.
    pub fn topological_order(&self) -> Result<Vec<WorkItemId>, GraphError> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let remaining = self.kahn(|id| order.push(id));
        if remaining.is_empty() {
            Ok(order)
        } else {
            Err(GraphError::Cycle { cycle: self.find_cycle(&remaining) })
        }
    }

    fn kahn_remainder(&self) -> BTreeSet<WorkItemId> {
        self.kahn(|_| {})
    }

    /// Runs Kahn's algorithm, calling `visit` for each removed node in
    /// topological order. Returns the nodes that could not be removed.
    fn kahn(&self, mut visit: impl FnMut(WorkItemId)) -> BTreeSet<WorkItemId> {
        // in-degree counts unmet prerequisites; reverse maps prerequisite -> dependents
        let mut in_degree: BTreeMap<WorkItemId, usize> =
            self.nodes.iter().map(|id| (*id, 0)).collect();
        let mut dependents: BTreeMap<WorkItemId, Vec<WorkItemId>> = BTreeMap::new();
        for (dependent, prerequisites) in &self.edges {
            for prerequisite in prerequisites {
                *in_degree.entry(*dependent).or_insert(0) += 1;
                dependents.entry(*prerequisite).or_default().push(*dependent);
            }
        }

        let mut frontier: VecDeque<WorkItemId> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();

        while let Some(id) = frontier.pop_front() {
            in_degree.remove(&id);
            visit(id);
            if let Some(next) = dependents.get(&id) {
                for dependent in next {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            frontier.push_back(*dependent);
                        }
                    }
                }
            }
        }

        in_degree.into_keys().collect()
    }

    /// Iterative DFS restricted to `candidates` (the Kahn remainder, which
    /// is guaranteed to contain a cycle).
    fn find_cycle(&self, candidates: &BTreeSet<WorkItemId>) -> Vec<WorkItemId> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        let mut marks: BTreeMap<WorkItemId, Mark> =
            candidates.iter().map(|id| (*id, Mark::Unvisited)).collect();

        for start in candidates {
            if marks[start] != Mark::Unvisited {
                continue;
            }

            // Explicit stack of (node, pending neighbours) plus the current path.
            let mut path: Vec<WorkItemId> = Vec::new();
            let mut stack: Vec<(WorkItemId, Vec<WorkItemId>)> = Vec::new();

            marks.insert(*start, Mark::OnStack);
            path.push(*start);
            stack.push((*start, self.candidate_neighbours(*start, candidates)));

            while let Some((node, neighbours)) = stack.last_mut() {
                let node = *node;
                match neighbours.pop() {
                    Some(next) => match marks[&next] {
                        Mark::OnStack => {
                            if let Some(pos) = path.iter().position(|id| *id == next) {
                                return path[pos..].to_vec();
                            }
                        }
                        Mark::Unvisited => {
                            marks.insert(next, Mark::OnStack);
                            path.push(next);
                            let next_neighbours = self.candidate_neighbours(next, candidates);
                            stack.push((next, next_neighbours));
                        }
                        Mark::Done => {}
                    },
                    None => {
                        marks.insert(node, Mark::Done);
                        path.pop();
                        stack.pop();
                    }
                }
            }
        }

        // Unreachable for a real Kahn remainder; report the remainder itself.
        candidates.iter().copied().collect()
    }

    fn candidate_neighbours(
        &self,
        id: WorkItemId,
        candidates: &BTreeSet<WorkItemId>,
    ) -> Vec<WorkItemId> {
        let mut neighbours: Vec<WorkItemId> = self
            .prerequisites(id)
            .filter(|prerequisite| candidates.contains(prerequisite))
            .collect();
        // popped from the back, so reverse to walk in ascending id order
        neighbours.reverse();
        neighbours
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: i64) -> WorkItemId {
        WorkItemId(n)
    }

    fn edge(dependent: i64, prerequisite: i64) -> DependencyEdge {
        DependencyEdge::new(id(dependent), id(prerequisite))
    }

    fn graph(nodes: &[i64], edges: &[(i64, i64)]) -> DependencyGraph {
        DependencyGraph::from_parts(
            nodes.iter().map(|n| id(*n)),
            edges.iter().map(|(d, p)| edge(*d, *p)),
        )
        .unwrap()
    }

    #[test]
    fn test_acyclic_graph_validates() {
        let g = graph(&[1, 2, 3, 4], &[(2, 1), (3, 1), (4, 2), (4, 3)]);
        assert!(g.validate().is_ok());

        let order = g.topological_order().unwrap();
        let pos = |n: i64| order.iter().position(|x| *x == id(n)).unwrap();
        assert!(pos(1) < pos(2));
        assert!(pos(1) < pos(3));
        assert!(pos(2) < pos(4));
        assert!(pos(3) < pos(4));
    }

    #[test]
    fn test_cycle_is_reported_with_members() {
        let mut g = graph(&[1, 2, 3, 4], &[(2, 1), (3, 2)]);
        g.add_edge(edge(1, 3)).unwrap();

        match g.validate() {
            Err(GraphError::Cycle { cycle }) => {
                let mut members = cycle.clone();
                members.sort();
                assert_eq!(members, vec![id(1), id(2), id(3)]);
                assert!(!cycle.contains(&id(4)));
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_check_insert_leaves_graph_unchanged() {
        let g = graph(&[1, 2, 3], &[(2, 1), (3, 2)]);
        let before = g.edges();

        let err = g.check_insert(edge(1, 3)).unwrap_err();
        assert!(matches!(err, GraphError::Cycle { .. }));
        assert_eq!(g.edges(), before);

        assert!(g.check_insert(edge(3, 1)).is_ok());
    }

    #[test]
    fn test_self_and_unknown_edges_rejected() {
        let mut g = graph(&[1, 2], &[]);
        assert_eq!(g.add_edge(edge(1, 1)), Err(GraphError::SelfDependency(id(1))));
        assert_eq!(g.add_edge(edge(1, 9)), Err(GraphError::UnknownItem(id(9))));
        assert_eq!(g.edge_count(), 0);
    }

    #[test]
    fn test_cycle_message_closes_loop() {
        let err = GraphError::Cycle { cycle: vec![id(1), id(2)] };
        assert_eq!(err.to_string(), "dependency cycle detected: #1 -> #2 -> #1");
    }

    #[test]
    fn test_remove_edge() {
        let mut g = graph(&[1, 2], &[(2, 1)]);
        assert!(g.remove_edge(edge(2, 1)));
        assert!(!g.remove_edge(edge(2, 1)));
        assert_eq!(g.edge_count(), 0);
    }
}
