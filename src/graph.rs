//! The dependency graph.
//!
//! Nodes live in a [`NodeArena`] which owns every edge. A [`DependencyGraph`]
//! is a named view over an arena: the set of nodes that belong to it, plus a
//! registry mapping each requirement asked of the graph to the specification
//! that satisfies it. Several graphs can share one arena, which is how
//! sub-graphs and concurrently built views reuse nodes.
//!
//! ## Lifecycle
//!
//! 1. A [`DependencyGraphBuilder`] resolves requirements into nodes, binding
//!    each node to a function and wiring producers to consumers.
//! 2. [`DependencyGraph::remove_unnecessary_values`] prunes every output that
//!    is neither terminal nor consumed, to a fixed point. Nodes left with no
//!    outputs at all are removed, which may free outputs of their producers in
//!    turn.
//! 3. From then on the graph is only read: the dispatcher walks it in
//!    [`execution_order`](DependencyGraph::execution_order).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use petgraph::Direction;
use petgraph::algo::tarjan_scc;

use crate::error::GraphError;
use crate::value::{ComputationTargetSpecification, ValueRequirement, ValueSpecification};

mod builder;
mod node;

pub use builder::{CompilationContext, DependencyGraphBuilder, GraphBuildOutcome};
pub use node::{DependencyNode, NodeArena};

/// Index of a node in its [`NodeArena`].
pub type NodeId = petgraph::stable_graph::NodeIndex;

/// Summary of a pruning pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PruneReport {
    pub removed_outputs: usize,
    pub removed_nodes: Vec<NodeId>,
    pub passes: usize,
}

pub struct DependencyGraph {
    name: String,
    arena: Arc<NodeArena>,
    nodes: BTreeSet<NodeId>,
    terminal_outputs: BTreeMap<ValueRequirement, ValueSpecification>,
}

impl DependencyGraph {
    pub fn new(name: impl Into<String>, arena: Arc<NodeArena>) -> Self {
        Self {
            name: name.into(),
            arena,
            nodes: BTreeSet::new(),
            terminal_outputs: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arena(&self) -> &Arc<NodeArena> {
        &self.arena
    }

    /// Member nodes in id order. Nodes removed from the arena through another
    /// graph are skipped.
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .copied()
            .filter(|node| self.arena.contains(*node))
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains(&node) && self.arena.contains(node)
    }

    pub fn len(&self) -> usize {
        self.nodes().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn node(&self, node: NodeId) -> Option<DependencyNode> {
        if self.nodes.contains(&node) {
            self.arena.node(node)
        } else {
            None
        }
    }

    /// Creates a node in the arena and makes it a member of this graph.
    pub fn add_node(&mut self, target: ComputationTargetSpecification) -> NodeId {
        let node = self.arena.add_node(target);
        self.nodes.insert(node);
        node
    }

    /// Makes an existing arena node a member of this graph.
    pub fn insert_node(&mut self, node: NodeId) -> Result<(), GraphError> {
        if !self.arena.contains(node) {
            return Err(GraphError::NodeNotFound(node));
        }
        self.nodes.insert(node);
        Ok(())
    }

    /// Deletes a node from the arena, tearing down its edges. Other graphs
    /// sharing the arena stop seeing it as well.
    pub fn remove_node(&mut self, node: NodeId) -> Option<DependencyNode> {
        if !self.nodes.remove(&node) {
            return None;
        }

        let removed = self.arena.remove_node(node)?;
        self.terminal_outputs
            .retain(|_, spec| !removed.terminal_output_values().contains(spec));

        Some(removed)
    }

    /// The member node producing `value`, if any.
    pub fn producer_of(&self, value: &ValueSpecification) -> Option<NodeId> {
        self.nodes().find(|node| {
            self.arena
                .node(*node)
                .is_some_and(|data| data.has_output_value(value))
        })
    }

    /// Marks `value` on `node` as terminal and records it as the answer to
    /// `requirement`.
    pub fn add_terminal_output(
        &mut self,
        requirement: ValueRequirement,
        node: NodeId,
        value: ValueSpecification,
    ) -> Result<(), GraphError> {
        if !self.contains(node) {
            return Err(GraphError::NodeNotFound(node));
        }
        self.arena.add_terminal_output_value(node, value.clone())?;
        self.terminal_outputs.insert(requirement, value);
        Ok(())
    }

    /// Forgets the answer to `requirement`. The producing node keeps its
    /// terminal marking while another requirement still resolves to the same
    /// specification.
    pub fn remove_terminal_output(
        &mut self,
        requirement: &ValueRequirement,
    ) -> Result<Option<ValueSpecification>, GraphError> {
        let Some(value) = self.terminal_outputs.remove(requirement) else {
            return Ok(None);
        };

        let shared = self.terminal_outputs.values().any(|other| *other == value);
        if !shared && let Some(node) = self.producer_of(&value) {
            self.arena.remove_terminal_output_value(node, &value)?;
        }

        Ok(Some(value))
    }

    pub fn terminal_outputs(&self) -> &BTreeMap<ValueRequirement, ValueSpecification> {
        &self.terminal_outputs
    }

    pub fn terminal_output(&self, requirement: &ValueRequirement) -> Option<&ValueSpecification> {
        self.terminal_outputs.get(requirement)
    }

    /// [`NodeArena::replace_output_value`], keeping the terminal registry
    /// pointed at the replacement.
    pub fn replace_output_value(
        &mut self,
        node: NodeId,
        existing: &ValueSpecification,
        replacement: ValueSpecification,
    ) -> Result<usize, GraphError> {
        let updated = self
            .arena
            .replace_output_value(node, existing, replacement.clone())?;

        for spec in self.terminal_outputs.values_mut() {
            if *spec == *existing {
                *spec = replacement.clone();
            }
        }

        Ok(updated)
    }

    /// Prunes outputs which are neither terminal nor consumed, repeating until
    /// nothing changes. Nodes left without outputs are removed from the graph.
    pub fn remove_unnecessary_values(&mut self) -> Result<PruneReport, GraphError> {
        let mut report = PruneReport::default();

        loop {
            report.passes += 1;
            let mut changed = false;

            for node in self.nodes().collect::<Vec<_>>() {
                let removed = self.arena.remove_unnecessary_outputs(node)?;
                if !removed.is_empty() {
                    tracing::debug!("pruned {} outputs of node {:?}", removed.len(), node);
                    report.removed_outputs += removed.len();
                    changed = true;
                }

                if self.arena.output_values(node)?.is_empty() {
                    self.remove_node(node);
                    report.removed_nodes.push(node);
                    changed = true;
                }
            }

            if !changed {
                break;
            }
        }

        Ok(report)
    }

    /// Merges member nodes bound to the same parameterized function on the
    /// same target into one, unless one of them depends on the other. Market
    /// data leaves keep their single output and are never merged. Returns the
    /// number of nodes removed.
    pub fn collapse_duplicates(&mut self) -> Result<usize, GraphError> {
        let mut groups: HashMap<(ComputationTargetSpecification, String), Vec<NodeId>> =
            HashMap::new();

        for node in self.nodes() {
            let Some(data) = self.arena.node(node) else {
                continue;
            };
            if let Some(function) = data.function()
                && !data.is_market_data()
            {
                groups
                    .entry((data.target().clone(), function.unique_id().to_string()))
                    .or_default()
                    .push(node);
            }
        }

        let mut removed = 0;
        for (_, mut group) in groups {
            group.sort();
            let Some((&keeper, duplicates)) = group.split_first() else {
                continue;
            };
            for &duplicate in duplicates {
                // Merging nodes joined by a path would close a cycle.
                if self.arena.reaches(keeper, duplicate) || self.arena.reaches(duplicate, keeper) {
                    tracing::debug!("keeping {:?} apart from {:?}", duplicate, keeper);
                    continue;
                }
                self.arena.replace_with(duplicate, keeper)?;
                self.remove_node(duplicate);
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::debug!("collapsed {} duplicate nodes in graph '{}'", removed, self.name);
        }

        Ok(removed)
    }

    /// Removes every member node on a cycle, together with everything
    /// depending on one. Returns the requirements whose answer was removed.
    pub fn remove_cycles(&mut self) -> Result<Vec<ValueRequirement>, GraphError> {
        let cyclic: BTreeSet<NodeId> = self.arena.with_graph(|graph| {
            tarjan_scc(graph)
                .into_iter()
                .filter(|component| {
                    component.len() > 1
                        || component
                            .first()
                            .is_some_and(|node| graph.find_edge(*node, *node).is_some())
                })
                .flatten()
                .filter(|node| self.nodes.contains(node))
                .collect()
        });
        if cyclic.is_empty() {
            return Ok(Vec::new());
        }

        let doomed: BTreeSet<NodeId> = self
            .nodes()
            .filter(|node| cyclic.iter().any(|start| self.arena.reaches(*start, *node)))
            .collect();

        let requirements: Vec<ValueRequirement> = self
            .terminal_outputs
            .iter()
            .filter(|(_, spec)| self.producer_of(spec).is_some_and(|node| doomed.contains(&node)))
            .map(|(requirement, _)| requirement.clone())
            .collect();
        for requirement in &requirements {
            self.remove_terminal_output(requirement)?;
        }
        for node in doomed {
            self.remove_node(node);
        }

        tracing::warn!(
            "removed {} cyclic nodes from graph '{}', {} requirements lost",
            cyclic.len(),
            self.name,
            requirements.len()
        );

        Ok(requirements)
    }

    /// Member nodes ordered so that every node comes after all of its input
    /// nodes. Ties are broken by node id.
    pub fn execution_order(&self) -> Result<Vec<NodeId>, GraphError> {
        let (mut pending, dependents) = self.arena.with_graph(|graph| {
            let mut pending: BTreeMap<NodeId, usize> = BTreeMap::new();
            let mut dependents: HashMap<NodeId, Vec<NodeId>> = HashMap::new();

            for &node in self.nodes.iter().filter(|node| graph.contains_node(**node)) {
                let inputs: Vec<NodeId> = graph
                    .neighbors_directed(node, Direction::Incoming)
                    .filter(|input| self.nodes.contains(input))
                    .collect();

                pending.insert(node, inputs.len());
                for input in inputs {
                    dependents.entry(input).or_default().push(node);
                }
            }

            (pending, dependents)
        });

        let mut ready: BTreeSet<NodeId> = pending
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(node, _)| *node)
            .collect();
        let mut order = Vec::with_capacity(pending.len());

        while let Some(node) = ready.pop_first() {
            order.push(node);
            for dependent in dependents.get(&node).into_iter().flatten() {
                if let Some(count) = pending.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(*dependent);
                    }
                }
            }
        }

        if order.len() < pending.len() {
            let stuck = pending
                .iter()
                .find(|(_, count)| **count > 0)
                .map(|(node, _)| *node);
            if let Some(node) = stuck {
                return Err(GraphError::Cycle(node));
            }
        }

        Ok(order)
    }

    /// A graph over the same arena restricted to the nodes accepted by
    /// `predicate`. Terminal outputs produced outside the selection are left
    /// out of the new registry.
    pub fn subgraph<F>(&self, name: impl Into<String>, predicate: F) -> DependencyGraph
    where
        F: Fn(NodeId, &DependencyNode) -> bool,
    {
        let nodes: BTreeSet<NodeId> = self
            .nodes()
            .filter(|node| {
                self.arena
                    .node(*node)
                    .is_some_and(|data| predicate(*node, &data))
            })
            .collect();

        let terminal_outputs = self
            .terminal_outputs
            .iter()
            .filter(|(_, spec)| {
                self.producer_of(spec)
                    .is_some_and(|producer| nodes.contains(&producer))
            })
            .map(|(requirement, spec)| (requirement.clone(), spec.clone()))
            .collect();

        DependencyGraph {
            name: name.into(),
            arena: Arc::clone(&self.arena),
            nodes,
            terminal_outputs,
        }
    }

    /// Nodes whose output is sourced from market data.
    pub fn market_data_nodes(&self) -> Vec<NodeId> {
        self.nodes()
            .filter(|node| self.arena.node(*node).is_some_and(|data| data.is_market_data()))
            .collect()
    }

    /// Every value produced by a member node.
    pub fn output_values(&self) -> BTreeSet<ValueSpecification> {
        self.nodes()
            .filter_map(|node| self.arena.output_values(node).ok())
            .flatten()
            .collect()
    }

    /// Checks that construction finished: every node has a function and
    /// market data nodes have no inputs.
    pub fn validate(&self) -> Result<(), GraphError> {
        for node in self.nodes() {
            let data = self.arena.node(node).ok_or(GraphError::NodeNotFound(node))?;
            if data.function().is_none() {
                return Err(GraphError::FunctionNotSet(node));
            }
            if data.is_market_data() && !self.arena.input_nodes(node).is_empty() {
                return Err(GraphError::LeafHasInputs(node));
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("name", &self.name)
            .field("nodes", &self.nodes)
            .field("terminal_outputs", &self.terminal_outputs.len())
            .finish()
    }
}

/// Renders the graph as a Mermaid flowchart.
impl std::fmt::Display for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        let mut data = BTreeMap::new();
        for node in self.nodes() {
            if let Some(node_data) = self.arena.node(node) {
                data.insert(node, node_data);
            }
        }

        for (node, node_data) in &data {
            let function = node_data
                .function()
                .map(|function| function.unique_id())
                .unwrap_or("?");
            let label = format!("{} @ {}", function, node_data.target()).replace('"', "\\\"");

            if node_data.is_market_data() {
                writeln!(f, "    {}[(\"{}\")]", node.index(), label)?;
            } else {
                writeln!(f, "    {}[\"{}\"]", node.index(), label)?;
            }

            if !node_data.terminal_output_values().is_empty() {
                writeln!(f, "    {} --> Output", node.index())?;
            }
        }

        writeln!(f, "    Output[Output]")?;

        for (node, node_data) in &data {
            for input in self.arena.input_nodes(*node) {
                let Some(producer) = data.get(&input) else {
                    continue;
                };
                let names: BTreeSet<&str> = node_data
                    .input_values()
                    .iter()
                    .filter(|value| producer.has_output_value(value))
                    .map(|value| value.value_name())
                    .collect();
                let names: Vec<&str> = names.into_iter().collect();

                writeln!(
                    f,
                    "    {} -- \"{}\" --> {}",
                    input.index(),
                    names.join(", "),
                    node.index()
                )?;
            }
        }

        Ok(())
    }
}
