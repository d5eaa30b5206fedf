//! Greedy, deterministic clustering of eligible nodes into fusable subgraphs
//!
//! ## Algorithm
//!
//! 1. Visit nodes in stable topological order
//! 2. An eligible node absorbs the clusters of its eligible producers, lowest
//!    cluster first, as long as the merged set has no path that leaves it and
//!    comes back (that path would make the fused node depend on itself)
//! 3. Merge any two clusters joined by an edge whose union has no such path,
//!    until no pair is left
//! 4. Emit clusters in a topological order of the contracted graph, ties
//!    broken by each cluster's earliest member

use crate::error::{CompilerError, Result};
use crate::graph::{ComputeGraph, NodeId};
use rustc_hash::FxHashSet;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// One fused unit: member nodes plus its boundary tensors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubgraphDescriptor {
    nodes: Vec<NodeId>,
    inputs: Vec<String>,
    outputs: Vec<String>,
}

impl SubgraphDescriptor {
    fn build(graph: &ComputeGraph, nodes: Vec<NodeId>) -> Self {
        let members: FxHashSet<NodeId> = nodes.iter().copied().collect();
        let mut inputs: Vec<String> = Vec::new();
        let mut outputs: Vec<String> = Vec::new();

        for &id in &nodes {
            let Some(node) = graph.node(id) else {
                continue;
            };

            for name in node.input_names.iter().filter(|n| !n.is_empty()) {
                let internal = graph.producer_of(name).is_some_and(|p| members.contains(&p));
                if !internal && !inputs.contains(name) {
                    inputs.push(name.clone());
                }
            }

            let external_consumers: Vec<NodeId> = graph
                .consumers(id)
                .into_iter()
                .filter(|c| !members.contains(c))
                .collect();
            for name in node.output_names.iter().filter(|n| !n.is_empty()) {
                let escapes = graph.is_graph_output(name)
                    || external_consumers
                        .iter()
                        .filter_map(|&c| graph.node(c))
                        .any(|consumer| consumer.input_names.contains(name));
                if escapes && !outputs.contains(name) {
                    outputs.push(name.clone());
                }
            }
        }

        Self { nodes, inputs, outputs }
    }

    /// Member nodes in topological order
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Tensors read from outside the subgraph, in first-use order
    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    /// Tensors produced inside and read outside (or graph outputs)
    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.nodes.contains(&node_id)
    }

    pub fn first_node(&self) -> Option<NodeId> {
        self.nodes.first().copied()
    }
}

/// Clusters eligible nodes into maximal, acyclic subgraphs
#[derive(Debug, Default, Clone, Copy)]
pub struct GraphPartitioner;

impl GraphPartitioner {
    pub fn new() -> Self {
        Self
    }

    /// Partition `graph`, claiming only nodes for which `is_supported` holds.
    ///
    /// The same graph and predicate always produce the same list.
    pub fn partition<F>(&self, graph: &ComputeGraph, is_supported: F) -> Result<Vec<SubgraphDescriptor>>
    where
        F: Fn(NodeId) -> bool,
    {
        let order = graph.topological_order()?;
        let slots = order.iter().map(|id| id.index() + 1).max().unwrap_or(0);
        let mut position = vec![usize::MAX; slots];
        for (pos, id) in order.iter().enumerate() {
            position[id.index()] = pos;
        }

        let mut cluster_of: Vec<Option<usize>> = vec![None; slots];
        let mut clusters: Vec<Vec<NodeId>> = Vec::new();

        for (pos, &node_id) in order.iter().enumerate() {
            if !is_supported(node_id) {
                continue;
            }

            let mut candidates: Vec<usize> = graph
                .producers(node_id)
                .into_iter()
                .filter_map(|p| cluster_of[p.index()])
                .collect();
            candidates.sort_unstable();
            candidates.dedup();

            let mut members: FxHashSet<NodeId> = FxHashSet::default();
            members.insert(node_id);
            let mut absorbed: Vec<usize> = Vec::new();

            for cluster_id in candidates {
                let mut trial = members.clone();
                trial.extend(clusters[cluster_id].iter().copied());
                if has_reentrant_path(graph, &trial, &position, pos) {
                    tracing::trace!(
                        node = %graph.display_name(node_id),
                        cluster = cluster_id,
                        "merge skipped: would create a cycle"
                    );
                    continue;
                }
                members = trial;
                absorbed.push(cluster_id);
            }

            let target = match absorbed.first() {
                Some(&first) => first,
                None => {
                    clusters.push(Vec::new());
                    clusters.len() - 1
                }
            };
            for &cluster_id in absorbed.iter().skip(1) {
                let moved = std::mem::take(&mut clusters[cluster_id]);
                clusters[target].extend(moved);
            }
            clusters[target].push(node_id);
            for member in &clusters[target] {
                cluster_of[member.index()] = Some(target);
            }
        }

        merge_adjacent_clusters(graph, &mut clusters, &mut cluster_of, &position);

        let mut live: Vec<Vec<NodeId>> = clusters.into_iter().filter(|c| !c.is_empty()).collect();
        for members in &mut live {
            members.sort_by_key(|id| position[id.index()]);
        }

        let emitted = emit_in_dependency_order(graph, &order, &position, live)?;
        let descriptors: Vec<SubgraphDescriptor> = emitted
            .into_iter()
            .map(|nodes| SubgraphDescriptor::build(graph, nodes))
            .collect();

        tracing::debug!(
            nodes = order.len(),
            subgraphs = descriptors.len(),
            claimed = descriptors.iter().map(SubgraphDescriptor::len).sum::<usize>(),
            "partitioned graph"
        );
        Ok(descriptors)
    }
}

/// Fixpoint over neighbouring clusters: a producer cluster and a consumer
/// cluster merge whenever their union has no re-entrant path. Lower cluster
/// ids are tried first.
fn merge_adjacent_clusters(
    graph: &ComputeGraph,
    clusters: &mut [Vec<NodeId>],
    cluster_of: &mut [Option<usize>],
    position: &[usize],
) {
    loop {
        let mut merged = false;
        'scan: for a in 0..clusters.len() {
            let mut neighbours: Vec<usize> = clusters[a]
                .iter()
                .flat_map(|&m| graph.consumers(m))
                .filter_map(|c| cluster_of[c.index()])
                .filter(|&b| b != a)
                .collect();
            neighbours.sort_unstable();
            neighbours.dedup();

            for b in neighbours {
                let trial: FxHashSet<NodeId> = clusters[a].iter().chain(&clusters[b]).copied().collect();
                if has_reentrant_path(graph, &trial, position, usize::MAX) {
                    continue;
                }
                let moved = std::mem::take(&mut clusters[b]);
                for member in &moved {
                    cluster_of[member.index()] = Some(a);
                }
                clusters[a].extend(moved);
                merged = true;
                break 'scan;
            }
        }
        if !merged {
            break;
        }
    }
}

/// True when some path starts inside `members`, leaves, and re-enters.
///
/// Only nodes positioned before `limit` can lie on such a path: every member
/// is, and a later node can never reach an earlier one.
fn has_reentrant_path(graph: &ComputeGraph, members: &FxHashSet<NodeId>, position: &[usize], limit: usize) -> bool {
    let within = |id: &NodeId| position.get(id.index()).is_some_and(|&p| p < limit);

    let mut stack: Vec<NodeId> = members
        .iter()
        .flat_map(|&m| graph.consumers(m))
        .filter(|c| !members.contains(c) && within(c))
        .collect();
    let mut visited: FxHashSet<NodeId> = FxHashSet::default();

    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        for next in graph.consumers(id) {
            if members.contains(&next) {
                return true;
            }
            if within(&next) && !visited.contains(&next) {
                stack.push(next);
            }
        }
    }
    false
}

/// Kahn's algorithm over clusters plus unclaimed singleton nodes
fn emit_in_dependency_order(
    graph: &ComputeGraph,
    order: &[NodeId],
    position: &[usize],
    clusters: Vec<Vec<NodeId>>,
) -> Result<Vec<Vec<NodeId>>> {
    let cluster_count = clusters.len();
    let mut unit_of: Vec<usize> = vec![usize::MAX; position.len()];
    let mut unit_key: Vec<usize> = Vec::with_capacity(order.len());

    for (unit, members) in clusters.iter().enumerate() {
        for member in members {
            unit_of[member.index()] = unit;
        }
        unit_key.push(members.first().map(|m| position[m.index()]).unwrap_or(usize::MAX));
    }
    for &id in order {
        if unit_of[id.index()] == usize::MAX {
            unit_of[id.index()] = unit_key.len();
            unit_key.push(position[id.index()]);
        }
    }

    let unit_count = unit_key.len();
    let mut successors: Vec<FxHashSet<usize>> = vec![FxHashSet::default(); unit_count];
    let mut in_degree = vec![0usize; unit_count];
    for &id in order {
        let from = unit_of[id.index()];
        for consumer in graph.consumers(id) {
            let to = unit_of[consumer.index()];
            if from != to && successors[from].insert(to) {
                in_degree[to] += 1;
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<(usize, usize)>> = (0..unit_count)
        .filter(|&u| in_degree[u] == 0)
        .map(|u| Reverse((unit_key[u], u)))
        .collect();

    let mut slots: Vec<Option<Vec<NodeId>>> = clusters.into_iter().map(Some).collect();
    let mut emitted = Vec::with_capacity(cluster_count);
    while let Some(Reverse((_, unit))) = ready.pop() {
        if unit < cluster_count {
            if let Some(members) = slots[unit].take() {
                emitted.push(members);
            }
        }
        let mut next: Vec<usize> = successors[unit].iter().copied().collect();
        next.sort_unstable();
        for to in next {
            in_degree[to] -= 1;
            if in_degree[to] == 0 {
                ready.push(Reverse((unit_key[to], to)));
            }
        }
    }

    if emitted.len() != cluster_count {
        return Err(CompilerError::InvalidModel(
            "fused subgraphs form a dependency cycle".to_string(),
        ));
    }
    Ok(emitted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(graph: &ComputeGraph, subgraph: &SubgraphDescriptor) -> Vec<String> {
        subgraph.nodes().iter().map(|&id| graph.display_name(id)).collect()
    }

    #[test]
    fn test_chain_fuses_into_one() {
        let mut graph = ComputeGraph::new();
        graph.add_op("Relu").name("a").input("x").outputs(["a_out"]).finish();
        graph.add_op("Exp").name("b").input("a_out").outputs(["b_out"]).finish();
        graph.add_op("Neg").name("c").input("b_out").outputs(["c_out"]).finish();

        let parts = GraphPartitioner::new().partition(&graph, |_| true).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(names(&graph, &parts[0]), vec!["a", "b", "c"]);
        assert_eq!(parts[0].inputs(), &["x".to_string()]);
        assert!(parts[0].outputs().is_empty());
    }

    #[test]
    fn test_ineligible_node_splits_chain() {
        let mut graph = ComputeGraph::new();
        graph.add_op("Relu").name("a").input("x").outputs(["a_out"]).finish();
        let blocker = graph.add_op("Custom").name("b").input("a_out").outputs(["b_out"]).finish();
        graph.add_op("Neg").name("c").input("b_out").outputs(["c_out"]).finish();

        let parts = GraphPartitioner::new().partition(&graph, |id| id != blocker).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(names(&graph, &parts[0]), vec!["a"]);
        assert_eq!(names(&graph, &parts[1]), vec!["c"]);
        assert_eq!(parts[0].outputs(), &["a_out".to_string()]);
        assert_eq!(parts[1].inputs(), &["b_out".to_string()]);
    }

    #[test]
    fn test_diamond_through_ineligible_is_not_merged() {
        // a -> blocker -> d, a -> d: fusing a with d would route through blocker
        let mut graph = ComputeGraph::new();
        graph.add_op("Relu").name("a").input("x").outputs(["a_out"]).finish();
        let blocker = graph.add_op("Custom").name("blocker").input("a_out").outputs(["k"]).finish();
        graph.add_op("Add").name("d").inputs(["a_out", "k"]).outputs(["d_out"]).finish();

        let parts = GraphPartitioner::new().partition(&graph, |id| id != blocker).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(names(&graph, &parts[0]), vec!["a"]);
        assert_eq!(names(&graph, &parts[1]), vec!["d"]);
    }

    #[test]
    fn test_siblings_join_shared_producer() {
        let mut graph = ComputeGraph::new();
        graph.add_op("Relu").name("root").input("x").outputs(["r"]).finish();
        graph.add_op("Exp").name("left").input("r").outputs(["l"]).finish();
        graph.add_op("Neg").name("right").input("r").outputs(["n"]).finish();
        graph.add_op("Add").name("join").inputs(["l", "n"]).outputs(["y"]).finish();

        let parts = GraphPartitioner::new().partition(&graph, |_| true).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].len(), 4);
    }

    #[test]
    fn test_graph_output_is_a_boundary_output() {
        let mut graph = ComputeGraph::new();
        graph.add_output(crate::proto::ValueInfoProto {
            name: "mid".into(),
            ..Default::default()
        });
        graph.add_op("Relu").input("x").outputs(["mid"]).finish();
        graph.add_op("Exp").input("mid").outputs(["y"]).finish();

        let parts = GraphPartitioner::new().partition(&graph, |_| true).unwrap();
        assert_eq!(parts[0].outputs(), &["mid".to_string()]);
    }

    #[test]
    fn test_empty_graph() {
        let graph = ComputeGraph::new();
        assert!(GraphPartitioner::new().partition(&graph, |_| true).unwrap().is_empty());
    }
}
