//! Dependency graph builder.
//!
//! Flattens a component group tree into a DAG over its leaf resources:
//! - explicit `depends_on` edges, with group references expanded to the
//!   leaves behind the group's exposed outputs
//! - implicit edges from every output cell an input reads to its owner
//!
//! Edges point from a dependency to its dependent. The graph is rebuilt for
//! every apply and never mutated while one runs.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use tracing::debug;

use super::cell::OutputCell;
use super::error::GraphError;
use super::group::ComponentGroup;
use super::resource::ResourceNode;
use crate::domain::NodeId;

/// How an edge was discovered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// Declared with `depends_on`
    Explicit,

    /// An input reads one of the dependency's outputs
    Implicit,
}

/// Immutable DAG of resource nodes
#[derive(Debug)]
pub struct DependencyGraph {
    name: String,
    graph: DiGraph<NodeId, EdgeKind>,
    nodes: Vec<ResourceNode>,
    index: HashMap<NodeId, NodeIndex>,
    outputs: BTreeMap<String, OutputCell>,
}

#[derive(PartialEq, Clone, Copy)]
enum Mark {
    White,
    Gray,
    Black,
}

impl DependencyGraph {
    /// Build the graph for a component group tree
    pub fn build(root: ComponentGroup) -> Result<Self, GraphError> {
        let name = root.path().to_string();
        let outputs = root.outputs().clone();
        let group_targets = collect_group_targets(&root)?;

        let nodes = root.into_resources();
        let mut graph = DiGraph::with_capacity(nodes.len(), 0);
        let mut index = HashMap::with_capacity(nodes.len());

        for node in &nodes {
            let id = node.id().clone();
            if index.contains_key(&id) || group_targets.contains_key(id.as_str()) {
                return Err(GraphError::DuplicateIdentifier { id: id.to_string() });
            }
            let idx = graph.add_node(id.clone());
            index.insert(id, idx);
        }

        let mut seen = HashSet::new();
        for (i, node) in nodes.iter().enumerate() {
            let to = NodeIndex::new(i);

            for dependency in node.explicit_dependencies() {
                let targets = match index.get(dependency.as_str()) {
                    Some(&idx) => vec![idx],
                    None => match group_targets.get(dependency.as_str()) {
                        Some(leaves) => leaves
                            .iter()
                            .filter_map(|leaf| index.get(leaf).copied())
                            .collect(),
                        None => {
                            return Err(GraphError::UnknownDependency {
                                node: node.id().clone(),
                                dependency: dependency.clone(),
                            })
                        }
                    },
                };
                for from in targets {
                    if seen.insert((from, to)) {
                        graph.add_edge(from, to, EdgeKind::Explicit);
                    }
                }
            }

            for owner in node.implicit_dependencies() {
                let Some(&from) = index.get(&owner) else {
                    return Err(GraphError::UnknownDependency {
                        node: node.id().clone(),
                        dependency: owner.to_string(),
                    });
                };
                if seen.insert((from, to)) {
                    graph.add_edge(from, to, EdgeKind::Implicit);
                }
            }
        }

        let built = Self {
            name,
            graph,
            nodes,
            index,
            outputs,
        };
        built.check_acyclic()?;

        debug!(
            nodes = built.graph.node_count(),
            edges = built.graph.edge_count(),
            "Built dependency graph"
        );
        Ok(built)
    }

    /// Depth-first search reporting the first cycle found as a closed path
    fn check_acyclic(&self) -> Result<(), GraphError> {
        let mut marks = vec![Mark::White; self.nodes.len()];
        let mut stack = Vec::new();

        for start in 0..self.nodes.len() {
            if marks[start] == Mark::White {
                if let Some(cycle) = self.visit(start, &mut marks, &mut stack) {
                    return Err(GraphError::CycleDetected { cycle });
                }
            }
        }
        Ok(())
    }

    fn visit(&self, i: usize, marks: &mut [Mark], stack: &mut Vec<usize>) -> Option<Vec<NodeId>> {
        marks[i] = Mark::Gray;
        stack.push(i);

        for next in self.neighbors(i, Direction::Outgoing) {
            match marks[next] {
                Mark::Gray => {
                    let start = stack.iter().position(|&s| s == next).unwrap_or(0);
                    let mut cycle: Vec<NodeId> =
                        stack[start..].iter().map(|&s| self.graph[NodeIndex::new(s)].clone()).collect();
                    cycle.push(self.graph[NodeIndex::new(next)].clone());
                    return Some(cycle);
                }
                Mark::White => {
                    if let Some(cycle) = self.visit(next, marks, stack) {
                        return Some(cycle);
                    }
                }
                Mark::Black => {}
            }
        }

        stack.pop();
        marks[i] = Mark::Black;
        None
    }

    /// Neighbor indices in declaration order
    pub(crate) fn neighbors(&self, i: usize, direction: Direction) -> Vec<usize> {
        let mut neighbors: Vec<usize> = self
            .graph
            .neighbors_directed(NodeIndex::new(i), direction)
            .map(NodeIndex::index)
            .collect();
        neighbors.sort_unstable();
        neighbors.dedup();
        neighbors
    }

    /// Number of edges pointing at each node in the given direction
    pub(crate) fn degrees(&self, direction: Direction) -> Vec<usize> {
        (0..self.nodes.len())
            .map(|i| self.neighbors(i, direction).len())
            .collect()
    }

    /// Name of the root group
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Leaf nodes in declaration order
    pub fn nodes(&self) -> &[ResourceNode] {
        &self.nodes
    }

    /// Look up a node by id
    pub fn node(&self, id: &str) -> Option<&ResourceNode> {
        self.index.get(id).map(|idx| &self.nodes[idx.index()])
    }

    pub(crate) fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).map(|idx| idx.index())
    }

    /// Node ids in declaration order
    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.iter().map(ResourceNode::id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Outputs exposed by the root group
    pub fn outputs(&self) -> &BTreeMap<String, OutputCell> {
        &self.outputs
    }

    /// Direct dependencies of a node
    pub fn dependencies(&self, id: &str) -> Vec<&NodeId> {
        self.related(id, Direction::Incoming)
    }

    /// Direct dependents of a node
    pub fn dependents(&self, id: &str) -> Vec<&NodeId> {
        self.related(id, Direction::Outgoing)
    }

    fn related(&self, id: &str, direction: Direction) -> Vec<&NodeId> {
        match self.position(id) {
            Some(i) => self
                .neighbors(i, direction)
                .into_iter()
                .map(|n| self.nodes[n].id())
                .collect(),
            None => Vec::new(),
        }
    }

    /// How the edge `from -> to` was discovered, if it exists
    pub fn edge_kind(&self, from: &str, to: &str) -> Option<EdgeKind> {
        let from = *self.index.get(from)?;
        let to = *self.index.get(to)?;
        self.graph
            .find_edge(from, to)
            .and_then(|edge| self.graph.edge_weight(edge).copied())
    }

    /// Every node reachable through dependents, breadth first
    pub fn transitive_dependents(&self, id: &str) -> Vec<&NodeId> {
        let Some(start) = self.position(id) else {
            return Vec::new();
        };

        let mut visited = vec![false; self.nodes.len()];
        visited[start] = true;
        let mut queue = VecDeque::from([start]);
        let mut found = Vec::new();

        while let Some(i) = queue.pop_front() {
            for next in self.neighbors(i, Direction::Outgoing) {
                if !visited[next] {
                    visited[next] = true;
                    found.push(self.nodes[next].id());
                    queue.push_back(next);
                }
            }
        }
        found
    }

    /// Deterministic topological order.
    ///
    /// Kahn's algorithm, breaking ties by declaration order.
    pub fn topological_order(&self) -> Vec<&NodeId> {
        let mut in_degree = self.degrees(Direction::Incoming);
        let mut queue: VecDeque<usize> = (0..self.nodes.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(i) = queue.pop_front() {
            order.push(self.nodes[i].id());
            for next in self.neighbors(i, Direction::Outgoing) {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }
        order
    }

    /// Nodes grouped by depth: level 0 has no dependencies, level n depends
    /// on something at level n - 1
    pub fn levels(&self) -> Vec<Vec<&NodeId>> {
        let mut depth = vec![0usize; self.nodes.len()];
        for id in self.topological_order() {
            let Some(i) = self.position(id.as_str()) else {
                continue;
            };
            depth[i] = self
                .neighbors(i, Direction::Incoming)
                .into_iter()
                .map(|d| depth[d] + 1)
                .max()
                .unwrap_or(0);
        }

        let mut levels: Vec<Vec<&NodeId>> = Vec::new();
        for (i, &d) in depth.iter().enumerate() {
            if levels.len() <= d {
                levels.resize_with(d + 1, Vec::new);
            }
            levels[d].push(self.nodes[i].id());
        }
        levels
    }
}

/// Map every group path to the leaves a dependency on it expands to
fn collect_group_targets(root: &ComponentGroup) -> Result<HashMap<String, Vec<NodeId>>, GraphError> {
    let mut targets = HashMap::new();

    for group in root.groups() {
        let leaves: Vec<NodeId> = if group.outputs().is_empty() {
            group.resources().map(|node| node.id().clone()).collect()
        } else {
            let mut owners: Vec<NodeId> = Vec::new();
            for cell in group.outputs().values() {
                if !owners.contains(cell.owner()) {
                    owners.push(cell.owner().clone());
                }
            }
            owners
        };

        if targets.insert(group.path().to_string(), leaves).is_some() {
            return Err(GraphError::DuplicateIdentifier {
                id: group.path().to_string(),
            });
        }
    }
    Ok(targets)
}
