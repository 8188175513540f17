//! On-demand graph queries over a committed snapshot

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::Serialize;

use crate::model::NodeId;
use crate::snapshot::GraphSnapshot;

/// Upper bound on DFS expansions per chain start. Longest simple path is
/// exponential in the worst case.
const CHAIN_SEARCH_BUDGET: usize = 10_000;

/// A path found by [`DependencyGraph::shortest_path`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PathResult {
    pub nodes: Vec<NodeId>,
    /// Sum of `1 / weight` over the traversed links.
    pub distance: f64,
}

/// Adjacency view of a snapshot. Only links whose endpoints both exist are included.
pub struct DependencyGraph {
    inner: DiGraph<NodeId, f64>,
    index: HashMap<NodeId, NodeIndex>,
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("node_count", &self.inner.node_count())
            .field("edge_count", &self.inner.edge_count())
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
struct Frontier {
    cost: f64,
    seq: u64,
    node: NodeIndex,
}

impl PartialEq for Frontier {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Frontier {}

impl PartialOrd for Frontier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Frontier {
    // Min-heap on cost, earliest discovery first on ties.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .cost
            .total_cmp(&self.cost)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl DependencyGraph {
    pub fn from_snapshot(snapshot: &GraphSnapshot) -> Self {
        let mut inner = DiGraph::with_capacity(snapshot.node_count(), snapshot.link_count());
        let mut index = HashMap::with_capacity(snapshot.node_count());

        for id in snapshot.nodes.keys() {
            index.insert(id.clone(), inner.add_node(id.clone()));
        }
        for link in snapshot.resolved_links() {
            if let (Some(&s), Some(&t)) = (index.get(&link.source), index.get(&link.target)) {
                inner.add_edge(s, t, link.weight);
            }
        }

        DependencyGraph { inner, index }
    }

    pub fn node_count(&self) -> usize {
        self.inner.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.inner.edge_count()
    }

    /// Outgoing neighbors in link insertion order.
    fn successors(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let mut out: Vec<NodeIndex> = self.inner.neighbors_directed(node, Direction::Outgoing).collect();
        out.reverse();
        out
    }

    fn id(&self, node: NodeIndex) -> NodeId {
        self.inner[node].clone()
    }

    /// Dijkstra with distance `1 / weight`. Links with a non-positive weight are impassable.
    pub fn shortest_path(&self, from: &NodeId, to: &NodeId) -> Option<PathResult> {
        let start = *self.index.get(from)?;
        let goal = *self.index.get(to)?;

        let mut dist: HashMap<NodeIndex, f64> = HashMap::new();
        let mut prev: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut done: HashSet<NodeIndex> = HashSet::new();
        let mut heap = BinaryHeap::new();
        let mut seq = 0u64;

        dist.insert(start, 0.0);
        heap.push(Frontier { cost: 0.0, seq, node: start });

        while let Some(Frontier { cost, node, .. }) = heap.pop() {
            if !done.insert(node) {
                continue;
            }
            if node == goal {
                break;
            }

            let mut edges: Vec<_> = self.inner.edges_directed(node, Direction::Outgoing).collect();
            edges.reverse();
            for edge in edges {
                let weight = *edge.weight();
                if weight <= 0.0 || !weight.is_finite() {
                    continue;
                }
                let next = edge.target();
                let candidate = cost + 1.0 / weight;
                // Strictly better only: the first discovered route keeps ties.
                if dist.get(&next).is_none_or(|&d| candidate < d) {
                    dist.insert(next, candidate);
                    prev.insert(next, node);
                    seq += 1;
                    heap.push(Frontier { cost: candidate, seq, node: next });
                }
            }
        }

        let distance = *dist.get(&goal)?;
        let mut nodes = vec![self.id(goal)];
        let mut cursor = goal;
        while let Some(&p) = prev.get(&cursor) {
            nodes.push(self.id(p));
            cursor = p;
        }
        nodes.reverse();
        Some(PathResult { nodes, distance })
    }

    /// All cycles reachable by DFS from every node, each closed (`[a, b, c, a]`).
    pub fn find_cycles(&self) -> Vec<Vec<NodeId>> {
        let mut visited: HashSet<NodeIndex> = HashSet::new();
        let mut cycles = Vec::new();

        for start in self.inner.node_indices() {
            if visited.contains(&start) {
                continue;
            }

            // Iterative DFS: (node, successors, next successor position)
            let mut path: Vec<NodeIndex> = Vec::new();
            let mut on_stack: HashSet<NodeIndex> = HashSet::new();
            let mut stack: Vec<(NodeIndex, Vec<NodeIndex>, usize)> = Vec::new();

            visited.insert(start);
            on_stack.insert(start);
            path.push(start);
            stack.push((start, self.successors(start), 0));

            while let Some((_, successors, cursor)) = stack.last_mut() {
                let Some(&next) = successors.get(*cursor) else {
                    if let Some((done, _, _)) = stack.pop() {
                        on_stack.remove(&done);
                        path.pop();
                    }
                    continue;
                };
                *cursor += 1;

                if on_stack.contains(&next) {
                    if let Some(pos) = path.iter().position(|&n| n == next) {
                        let mut cycle: Vec<NodeId> = path[pos..].iter().map(|&n| self.id(n)).collect();
                        cycle.push(self.id(next));
                        cycles.push(cycle);
                    }
                } else if visited.insert(next) {
                    on_stack.insert(next);
                    path.push(next);
                    stack.push((next, self.successors(next), 0));
                }
            }
        }

        cycles
    }

    /// Longest simple dependency chains, one per unvisited start node in node order,
    /// keeping those longer than 2.
    pub fn dependency_chains(&self) -> Vec<Vec<NodeId>> {
        let mut visited: HashSet<NodeIndex> = HashSet::new();
        let mut chains = Vec::new();
        for start in self.inner.node_indices() {
            if visited.contains(&start) {
                continue;
            }
            let chain = self.longest_chain_from(start);
            visited.extend(chain.iter().copied());
            if chain.len() > 2 {
                chains.push(chain.into_iter().map(|n| self.id(n)).collect());
            }
        }
        chains
    }

    fn longest_chain_from(&self, start: NodeIndex) -> Vec<NodeIndex> {
        let mut best = vec![start];
        let mut path = vec![start];
        let mut on_path: HashSet<NodeIndex> = HashSet::from([start]);
        let mut stack: Vec<(Vec<NodeIndex>, usize)> = vec![(self.successors(start), 0)];
        let mut budget = CHAIN_SEARCH_BUDGET;

        while let Some((successors, cursor)) = stack.last_mut() {
            let next = successors.get(*cursor).copied();
            *cursor += 1;
            match next {
                Some(next) if budget > 0 && !on_path.contains(&next) => {
                    budget -= 1;
                    on_path.insert(next);
                    path.push(next);
                    if path.len() > best.len() {
                        best = path.clone();
                    }
                    stack.push((self.successors(next), 0));
                }
                Some(_) => {}
                None => {
                    stack.pop();
                    if let Some(done) = path.pop() {
                        on_path.remove(&done);
                    }
                }
            }
        }
        best
    }
}
