use std::collections::BTreeSet;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use petgraph::Direction;
use petgraph::algo::has_path_connecting;
use petgraph::stable_graph::StableDiGraph;
use petgraph::visit::EdgeRef;

use crate::error::GraphError;
use crate::function::{FunctionKind, ParameterizedFunction};
use crate::graph::NodeId;
use crate::value::{ComputationTargetSpecification, ValueSpecification};

/// One unit of work: a function bound to a target, with the values it
/// consumes and produces.
///
/// Edges to producers and consumers are not stored here, they live in the
/// [`NodeArena`] so that both directions are always updated together.
#[derive(Debug, Clone)]
pub struct DependencyNode {
    target: ComputationTargetSpecification,
    function: Option<ParameterizedFunction>,
    kind: FunctionKind,
    input_values: BTreeSet<ValueSpecification>,
    output_values: BTreeSet<ValueSpecification>,
    terminal_output_values: BTreeSet<ValueSpecification>,
}

impl DependencyNode {
    fn new(target: ComputationTargetSpecification) -> Self {
        Self {
            target,
            function: None,
            kind: FunctionKind::Computed,
            input_values: BTreeSet::new(),
            output_values: BTreeSet::new(),
            terminal_output_values: BTreeSet::new(),
        }
    }

    pub fn target(&self) -> &ComputationTargetSpecification {
        &self.target
    }

    pub fn function(&self) -> Option<&ParameterizedFunction> {
        self.function.as_ref()
    }

    pub fn kind(&self) -> FunctionKind {
        self.kind
    }

    pub fn is_market_data(&self) -> bool {
        self.kind == FunctionKind::MarketDataSourced
    }

    pub fn input_values(&self) -> &BTreeSet<ValueSpecification> {
        &self.input_values
    }

    pub fn output_values(&self) -> &BTreeSet<ValueSpecification> {
        &self.output_values
    }

    pub fn terminal_output_values(&self) -> &BTreeSet<ValueSpecification> {
        &self.terminal_output_values
    }

    pub fn has_output_value(&self, value: &ValueSpecification) -> bool {
        self.output_values.contains(value)
    }
}

type Inner = StableDiGraph<DependencyNode, ()>;

/// Storage for dependency nodes that may be shared by several graphs.
///
/// An edge `a -> b` means "`a` is an input node of `b`", equivalently "`b` is
/// a dependent node of `a`". Both views are read from the same edge, so the
/// relation is symmetric by construction. Every mutation runs under a single
/// write lock, so readers never observe a half-applied operation.
#[derive(Default)]
pub struct NodeArena {
    graph: RwLock<Inner>,
}

impl NodeArena {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.graph.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.graph.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_node(&self, target: ComputationTargetSpecification) -> NodeId {
        self.write().add_node(DependencyNode::new(target))
    }

    /// Detaches a node from all of its neighbours and drops it.
    pub fn remove_node(&self, node: NodeId) -> Option<DependencyNode> {
        self.write().remove_node(node)
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.read().contains_node(node)
    }

    pub fn len(&self) -> usize {
        self.read().node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A snapshot of a node's data.
    pub fn node(&self, node: NodeId) -> Option<DependencyNode> {
        self.read().node_weight(node).cloned()
    }

    pub fn input_nodes(&self, node: NodeId) -> BTreeSet<NodeId> {
        self.read()
            .neighbors_directed(node, Direction::Incoming)
            .collect()
    }

    pub fn dependent_nodes(&self, node: NodeId) -> BTreeSet<NodeId> {
        self.read()
            .neighbors_directed(node, Direction::Outgoing)
            .collect()
    }

    pub fn output_values(&self, node: NodeId) -> Result<BTreeSet<ValueSpecification>, GraphError> {
        let graph = self.read();
        Ok(weight(&graph, node)?.output_values.clone())
    }

    pub fn input_values(&self, node: NodeId) -> Result<BTreeSet<ValueSpecification>, GraphError> {
        let graph = self.read();
        Ok(weight(&graph, node)?.input_values.clone())
    }

    pub fn terminal_output_values(
        &self,
        node: NodeId,
    ) -> Result<BTreeSet<ValueSpecification>, GraphError> {
        let graph = self.read();
        Ok(weight(&graph, node)?.terminal_output_values.clone())
    }

    /// Whether `to` can be reached from `from` by following dependent edges.
    /// A node reaches itself.
    pub fn reaches(&self, from: NodeId, to: NodeId) -> bool {
        let graph = self.read();
        graph.contains_node(from)
            && graph.contains_node(to)
            && has_path_connecting(&*graph, from, to, None)
    }

    /// Runs a read-only closure over the underlying storage.
    pub(crate) fn with_graph<R>(&self, f: impl FnOnce(&Inner) -> R) -> R {
        f(&self.read())
    }

    pub fn add_input_node(&self, node: NodeId, input: NodeId) -> Result<(), GraphError> {
        self.add_input_nodes(node, [input])
    }

    /// Registers producers of `node`. Either every edge is added or none.
    pub fn add_input_nodes(
        &self,
        node: NodeId,
        inputs: impl IntoIterator<Item = NodeId>,
    ) -> Result<(), GraphError> {
        let inputs: Vec<NodeId> = inputs.into_iter().collect();
        let mut graph = self.write();

        if weight(&graph, node)?.is_market_data() && !inputs.is_empty() {
            return Err(GraphError::LeafHasInputs(node));
        }
        for &input in &inputs {
            weight(&graph, input)?;
            if input == node {
                return Err(GraphError::SelfLoop(node));
            }
        }

        for input in inputs {
            graph.update_edge(input, node, ());
        }

        Ok(())
    }

    pub fn add_output_value(&self, node: NodeId, value: ValueSpecification) -> Result<(), GraphError> {
        self.add_output_values(node, [value])
    }

    pub fn add_output_values(
        &self,
        node: NodeId,
        values: impl IntoIterator<Item = ValueSpecification>,
    ) -> Result<(), GraphError> {
        let mut graph = self.write();
        weight_mut(&mut graph, node)?.output_values.extend(values);
        Ok(())
    }

    /// Records a consumed value. Which node produces it is tracked separately
    /// through [`add_input_node`](Self::add_input_node).
    pub fn add_input_value(&self, node: NodeId, value: ValueSpecification) -> Result<(), GraphError> {
        let mut graph = self.write();
        weight_mut(&mut graph, node)?.input_values.insert(value);
        Ok(())
    }

    /// Removes an output no dependent node consumes anymore.
    pub fn remove_output_value(
        &self,
        node: NodeId,
        value: &ValueSpecification,
    ) -> Result<(), GraphError> {
        let mut graph = self.write();

        if !weight(&graph, node)?.output_values.contains(value) {
            return Err(GraphError::OutputNotFound {
                node,
                value: value.clone(),
            });
        }
        if let Some(dependent) = consumer_of(&graph, node, value) {
            return Err(GraphError::OutputStillReferenced {
                node,
                value: value.clone(),
                dependent,
            });
        }

        let weight = weight_mut(&mut graph, node)?;
        weight.output_values.remove(value);
        weight.terminal_output_values.remove(value);
        Ok(())
    }

    /// Removes every non-terminal output that no dependent node consumes and
    /// returns what was removed.
    pub fn remove_unnecessary_outputs(
        &self,
        node: NodeId,
    ) -> Result<BTreeSet<ValueSpecification>, GraphError> {
        let mut graph = self.write();

        let unnecessary: BTreeSet<ValueSpecification> = {
            let weight = weight(&graph, node)?;
            weight
                .output_values
                .iter()
                .filter(|value| !weight.terminal_output_values.contains(*value))
                .filter(|value| consumer_of(&graph, node, value).is_none())
                .cloned()
                .collect()
        };

        let weight = weight_mut(&mut graph, node)?;
        for value in &unnecessary {
            weight.output_values.remove(value);
        }

        Ok(unnecessary)
    }

    /// Swaps the identity of an output and rewrites every dependent node that
    /// consumes it. Returns the number of dependents updated.
    pub fn replace_output_value(
        &self,
        node: NodeId,
        existing: &ValueSpecification,
        replacement: ValueSpecification,
    ) -> Result<usize, GraphError> {
        let mut graph = self.write();

        {
            let weight = weight_mut(&mut graph, node)?;
            if !weight.output_values.remove(existing) {
                return Err(GraphError::OutputNotFound {
                    node,
                    value: existing.clone(),
                });
            }
            weight.output_values.insert(replacement.clone());
            if weight.terminal_output_values.remove(existing) {
                weight.terminal_output_values.insert(replacement.clone());
            }
        }

        let dependents: Vec<NodeId> = graph
            .neighbors_directed(node, Direction::Outgoing)
            .collect();

        let mut updated = 0;
        for dependent in dependents {
            let weight = weight_mut(&mut graph, dependent)?;
            if weight.input_values.remove(existing) {
                weight.input_values.insert(replacement.clone());
                updated += 1;
            }
        }

        Ok(updated)
    }

    /// Re-points the producer of one input of `node` from `previous` to
    /// `replacement`. The edge from `previous` is removed when it no longer
    /// produces any other value `node` consumes.
    pub fn replace_input(
        &self,
        node: NodeId,
        value: &ValueSpecification,
        previous: NodeId,
        replacement: NodeId,
    ) -> Result<(), GraphError> {
        let mut graph = self.write();

        let consumer = weight(&graph, node)?;
        if !consumer.input_values.contains(value) {
            return Err(GraphError::InputNotFound {
                node,
                value: value.clone(),
            });
        }
        if !weight(&graph, replacement)?.output_values.contains(value) {
            return Err(GraphError::OutputNotFound {
                node: replacement,
                value: value.clone(),
            });
        }
        if replacement == node {
            return Err(GraphError::SelfLoop(node));
        }

        let previous_outputs = &weight(&graph, previous)?.output_values;
        let still_used = consumer
            .input_values
            .iter()
            .any(|input| input != value && previous_outputs.contains(input));

        graph.update_edge(replacement, node, ());
        if !still_used && previous != replacement {
            if let Some(edge) = graph.find_edge(previous, node) {
                graph.remove_edge(edge);
            }
        }

        Ok(())
    }

    /// Moves every input and dependent edge of `node` onto `replacement`.
    ///
    /// The outputs of `node` are re-targeted to the replacement's target and
    /// added to it, terminal markings included, and consumers are rewritten to
    /// read the re-targeted values. Afterwards `node` is detached and has no
    /// outputs left.
    pub fn replace_with(&self, node: NodeId, replacement: NodeId) -> Result<(), GraphError> {
        if node == replacement {
            return Ok(());
        }

        let mut graph = self.write();

        let old = weight(&graph, node)?.clone();
        let target = weight(&graph, replacement)?.target.clone();

        let inputs: Vec<NodeId> = graph
            .neighbors_directed(node, Direction::Incoming)
            .collect();
        let dependents: Vec<NodeId> = graph
            .neighbors_directed(node, Direction::Outgoing)
            .collect();

        let retarget = |value: &ValueSpecification| value.with_target(target.clone());

        let leaf = weight(&graph, replacement)?;
        if leaf.is_market_data() {
            if inputs.iter().any(|input| *input != replacement) {
                return Err(GraphError::LeafHasInputs(replacement));
            }
            if old
                .output_values
                .iter()
                .any(|value| !leaf.output_values.contains(&retarget(value)))
            {
                return Err(GraphError::LeafHasOutputs(replacement));
            }
        }

        {
            let weight = weight_mut(&mut graph, replacement)?;
            weight.input_values.extend(old.input_values.iter().cloned());
            weight.output_values.extend(old.output_values.iter().map(retarget));
            weight
                .terminal_output_values
                .extend(old.terminal_output_values.iter().map(retarget));
        }

        for dependent in &dependents {
            let weight = weight_mut(&mut graph, *dependent)?;
            for value in &old.output_values {
                if weight.input_values.remove(value) {
                    weight.input_values.insert(retarget(value));
                }
            }
        }

        for input in inputs {
            if input != replacement {
                graph.update_edge(input, replacement, ());
            }
        }
        for dependent in dependents {
            if dependent != replacement {
                graph.update_edge(replacement, dependent, ());
            }
        }

        let edges: Vec<_> = graph
            .edges_directed(node, Direction::Incoming)
            .chain(graph.edges_directed(node, Direction::Outgoing))
            .map(|edge| edge.id())
            .collect();
        for edge in edges {
            graph.remove_edge(edge);
        }

        let weight = weight_mut(&mut graph, node)?;
        weight.output_values.clear();
        weight.terminal_output_values.clear();

        Ok(())
    }

    /// Binds the function. A node's function can only be set once.
    pub fn set_function(&self, node: NodeId, function: ParameterizedFunction) -> Result<(), GraphError> {
        let mut graph = self.write();

        let has_inputs = graph
            .neighbors_directed(node, Direction::Incoming)
            .next()
            .is_some();
        let weight = weight_mut(&mut graph, node)?;

        if weight.function.is_some() {
            return Err(GraphError::FunctionAlreadySet(node));
        }
        let kind = function.kind();
        if kind == FunctionKind::MarketDataSourced && has_inputs {
            return Err(GraphError::LeafHasInputs(node));
        }

        weight.kind = kind;
        weight.function = Some(function);
        Ok(())
    }

    /// Exempts an output from pruning. The value is added to the outputs if
    /// it was not there yet.
    pub fn add_terminal_output_value(
        &self,
        node: NodeId,
        value: ValueSpecification,
    ) -> Result<(), GraphError> {
        let mut graph = self.write();
        let weight = weight_mut(&mut graph, node)?;
        weight.output_values.insert(value.clone());
        weight.terminal_output_values.insert(value);
        Ok(())
    }

    pub fn remove_terminal_output_value(
        &self,
        node: NodeId,
        value: &ValueSpecification,
    ) -> Result<bool, GraphError> {
        let mut graph = self.write();
        Ok(weight_mut(&mut graph, node)?
            .terminal_output_values
            .remove(value))
    }
}

fn weight(graph: &Inner, node: NodeId) -> Result<&DependencyNode, GraphError> {
    graph.node_weight(node).ok_or(GraphError::NodeNotFound(node))
}

fn weight_mut(graph: &mut Inner, node: NodeId) -> Result<&mut DependencyNode, GraphError> {
    graph
        .node_weight_mut(node)
        .ok_or(GraphError::NodeNotFound(node))
}

/// Finds a dependent of `node` which lists `value` as an input.
fn consumer_of(graph: &Inner, node: NodeId, value: &ValueSpecification) -> Option<NodeId> {
    graph
        .neighbors_directed(node, Direction::Outgoing)
        .find(|dependent| {
            graph
                .node_weight(*dependent)
                .is_some_and(|weight| weight.input_values.contains(value))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::{FunctionDefinition, FunctionRepository};
    use crate::testing::TestFunction;
    use crate::value::{ComputationTargetType, ValueProperties};
    use std::sync::Arc;

    fn target(id: &str) -> ComputationTargetSpecification {
        ComputationTargetSpecification::security(id)
    }

    fn spec(name: &str, target_id: &str) -> ValueSpecification {
        ValueSpecification::new(name, target(target_id), ValueProperties::new())
    }

    fn function(id: &str) -> ParameterizedFunction {
        let definition: Arc<dyn FunctionDefinition> =
            Arc::new(TestFunction::new(id, ComputationTargetType::Security));
        ParameterizedFunction::with_defaults(definition)
    }

    fn assert_symmetric(arena: &NodeArena, nodes: &[NodeId]) {
        for &a in nodes {
            for &b in nodes {
                assert_eq!(
                    arena.dependent_nodes(a).contains(&b),
                    arena.input_nodes(b).contains(&a),
                    "asymmetric edge between {a:?} and {b:?}"
                );
            }
        }
    }

    /// A produces V1, consumed by B.
    fn chain() -> (NodeArena, NodeId, NodeId) {
        let arena = NodeArena::new();
        let a = arena.add_node(target("A"));
        let b = arena.add_node(target("B"));
        arena.add_output_value(a, spec("V1", "A")).unwrap();
        arena.add_input_value(b, spec("V1", "A")).unwrap();
        arena.add_input_node(b, a).unwrap();
        (arena, a, b)
    }

    #[test]
    fn test_add_input_node_is_symmetric() {
        let (arena, a, b) = chain();
        assert!(arena.input_nodes(b).contains(&a));
        assert!(arena.dependent_nodes(a).contains(&b));
        assert_symmetric(&arena, &[a, b]);
    }

    #[test]
    fn test_add_input_node_twice_keeps_one_edge() {
        let (arena, a, b) = chain();
        arena.add_input_nodes(b, [a, a]).unwrap();
        assert_eq!(arena.input_nodes(b).len(), 1);
        arena.with_graph(|graph| assert_eq!(graph.edge_count(), 1));
    }

    #[test]
    fn test_add_input_nodes_is_all_or_nothing() {
        let (arena, a, b) = chain();
        let c = arena.add_node(target("C"));
        let gone = arena.add_node(target("GONE"));
        arena.remove_node(gone);

        let result = arena.add_input_nodes(c, [a, gone]);
        assert_eq!(result, Err(GraphError::NodeNotFound(gone)));
        assert!(arena.input_nodes(c).is_empty());
        assert_symmetric(&arena, &[a, b, c]);
    }

    #[test]
    fn test_self_loop_rejected() {
        let (arena, a, _) = chain();
        assert_eq!(arena.add_input_node(a, a), Err(GraphError::SelfLoop(a)));
    }

    #[test]
    fn test_remove_output_value_still_referenced() {
        let (arena, a, b) = chain();
        let result = arena.remove_output_value(a, &spec("V1", "A"));
        assert_eq!(
            result,
            Err(GraphError::OutputStillReferenced {
                node: a,
                value: spec("V1", "A"),
                dependent: b,
            })
        );
        assert!(arena.output_values(a).unwrap().contains(&spec("V1", "A")));
    }

    #[test]
    fn test_remove_output_value_missing() {
        let (arena, a, _) = chain();
        let result = arena.remove_output_value(a, &spec("V9", "A"));
        assert!(matches!(result, Err(GraphError::OutputNotFound { .. })));
    }

    #[test]
    fn test_remove_output_value_unreferenced() {
        let (arena, a, _) = chain();
        arena.add_output_value(a, spec("V2", "A")).unwrap();
        arena.remove_output_value(a, &spec("V2", "A")).unwrap();
        assert_eq!(arena.output_values(a).unwrap().len(), 1);
    }

    #[test]
    fn test_remove_unnecessary_outputs() {
        let (arena, a, b) = chain();
        arena
            .add_output_values(a, [spec("V2", "A"), spec("V3", "A")])
            .unwrap();
        arena.add_terminal_output_value(a, spec("V3", "A")).unwrap();
        arena.add_output_value(b, spec("V4", "B")).unwrap();

        let removed = arena.remove_unnecessary_outputs(a).unwrap();
        assert_eq!(removed, BTreeSet::from([spec("V2", "A")]));
        assert_eq!(
            arena.output_values(a).unwrap(),
            BTreeSet::from([spec("V1", "A"), spec("V3", "A")])
        );

        let removed = arena.remove_unnecessary_outputs(b).unwrap();
        assert_eq!(removed, BTreeSet::from([spec("V4", "B")]));
        assert!(arena.output_values(b).unwrap().is_empty());
    }

    #[test]
    fn test_replace_output_value_rewrites_dependents() {
        let (arena, a, b) = chain();
        let c = arena.add_node(target("C"));
        arena.add_input_value(c, spec("V1", "A")).unwrap();
        arena.add_input_node(c, a).unwrap();

        let refined = ValueSpecification::new(
            "V1",
            target("A"),
            ValueProperties::new().with("Currency", "USD"),
        );
        let updated = arena
            .replace_output_value(a, &spec("V1", "A"), refined.clone())
            .unwrap();

        assert_eq!(updated, 2);
        for node in [b, c] {
            let inputs = arena.input_values(node).unwrap();
            assert!(!inputs.contains(&spec("V1", "A")));
            assert!(inputs.contains(&refined));
        }
        assert!(arena.output_values(a).unwrap().contains(&refined));
    }

    #[test]
    fn test_replace_output_value_keeps_terminal_marking() {
        let arena = NodeArena::new();
        let a = arena.add_node(target("A"));
        arena.add_terminal_output_value(a, spec("V1", "A")).unwrap();

        let refined = spec("V1b", "A");
        assert_eq!(arena.replace_output_value(a, &spec("V1", "A"), refined.clone()), Ok(0));
        assert_eq!(
            arena.terminal_output_values(a).unwrap(),
            BTreeSet::from([refined])
        );
    }

    #[test]
    fn test_replace_output_value_missing() {
        let (arena, a, _) = chain();
        let result = arena.replace_output_value(a, &spec("NOPE", "A"), spec("V1", "A"));
        assert!(matches!(result, Err(GraphError::OutputNotFound { .. })));
    }

    #[test]
    fn test_replace_input_drops_unused_edge() {
        let (arena, a, b) = chain();
        let a2 = arena.add_node(target("A2"));
        arena.add_output_value(a2, spec("V1", "A")).unwrap();

        arena.replace_input(b, &spec("V1", "A"), a, a2).unwrap();

        assert_eq!(arena.input_nodes(b), BTreeSet::from([a2]));
        assert!(arena.dependent_nodes(a).is_empty());
        assert_symmetric(&arena, &[a, a2, b]);
    }

    #[test]
    fn test_replace_input_keeps_edge_still_in_use() {
        let (arena, a, b) = chain();
        arena.add_output_value(a, spec("V2", "A")).unwrap();
        arena.add_input_value(b, spec("V2", "A")).unwrap();

        let a2 = arena.add_node(target("A2"));
        arena.add_output_value(a2, spec("V1", "A")).unwrap();
        arena.replace_input(b, &spec("V1", "A"), a, a2).unwrap();

        assert_eq!(arena.input_nodes(b), BTreeSet::from([a, a2]));
        assert_symmetric(&arena, &[a, a2, b]);
    }

    #[test]
    fn test_replace_with_moves_edges_and_retargets_outputs() {
        let arena = NodeArena::new();
        let source = arena.add_node(target("S"));
        let old = arena.add_node(target("OLD"));
        let new = arena.add_node(target("NEW"));
        let sink = arena.add_node(target("SINK"));

        arena.add_output_value(source, spec("IN", "S")).unwrap();
        arena.add_input_value(old, spec("IN", "S")).unwrap();
        arena.add_input_node(old, source).unwrap();
        arena.add_output_value(old, spec("OUT", "OLD")).unwrap();
        arena.add_terminal_output_value(old, spec("TERM", "OLD")).unwrap();
        arena.add_input_value(sink, spec("OUT", "OLD")).unwrap();
        arena.add_input_node(sink, old).unwrap();

        arena.replace_with(old, new).unwrap();

        assert_eq!(arena.input_nodes(new), BTreeSet::from([source]));
        assert_eq!(arena.dependent_nodes(new), BTreeSet::from([sink]));
        assert!(arena.input_nodes(old).is_empty());
        assert!(arena.dependent_nodes(old).is_empty());
        assert!(arena.output_values(old).unwrap().is_empty());

        let outputs = arena.output_values(new).unwrap();
        assert!(outputs.contains(&spec("OUT", "NEW")));
        assert!(outputs.contains(&spec("TERM", "NEW")));
        assert!(arena.terminal_output_values(new).unwrap().contains(&spec("TERM", "NEW")));
        assert!(arena.input_values(sink).unwrap().contains(&spec("OUT", "NEW")));
        assert!(arena.input_values(new).unwrap().contains(&spec("IN", "S")));
        assert_symmetric(&arena, &[source, old, new, sink]);
    }

    #[test]
    fn test_set_function_once() {
        let (arena, a, _) = chain();
        arena.set_function(a, function("F")).unwrap();
        assert_eq!(
            arena.set_function(a, function("G")),
            Err(GraphError::FunctionAlreadySet(a))
        );
        let bound = arena.node(a).unwrap();
        assert_eq!(bound.function().map(|f| f.unique_id()), Some("F"));
    }

    #[test]
    fn test_market_data_node_is_a_leaf() {
        let repository = FunctionRepository::new();
        let (arena, a, b) = chain();

        assert_eq!(
            arena.set_function(b, repository.market_data_function()),
            Err(GraphError::LeafHasInputs(b))
        );

        let leaf = arena.add_node(target("L"));
        arena
            .set_function(leaf, repository.market_data_function())
            .unwrap();
        assert!(arena.node(leaf).unwrap().is_market_data());
        assert_eq!(arena.add_input_node(leaf, a), Err(GraphError::LeafHasInputs(leaf)));
    }

    #[test]
    fn test_replace_with_keeps_leaf_output_single() {
        let repository = FunctionRepository::new();
        let arena = NodeArena::new();
        let leaf = arena.add_node(target("L"));
        arena
            .set_function(leaf, repository.market_data_function())
            .unwrap();
        arena.add_output_value(leaf, spec("Price", "L")).unwrap();

        let twin = arena.add_node(target("L"));
        arena.add_output_value(twin, spec("Price", "L")).unwrap();
        arena.replace_with(twin, leaf).unwrap();
        assert_eq!(arena.output_values(leaf).unwrap().len(), 1);

        let other = arena.add_node(target("O"));
        arena.add_output_value(other, spec("Yield", "O")).unwrap();
        assert_eq!(
            arena.replace_with(other, leaf),
            Err(GraphError::LeafHasOutputs(leaf))
        );
        assert_eq!(
            arena.output_values(leaf).unwrap(),
            BTreeSet::from([spec("Price", "L")])
        );
        assert!(arena.output_values(other).unwrap().contains(&spec("Yield", "O")));
    }

    #[test]
    fn test_reaches_follows_dependents() {
        let (arena, a, b) = chain();
        let c = arena.add_node(target("C"));
        arena.add_input_node(c, b).unwrap();

        assert!(arena.reaches(a, c));
        assert!(arena.reaches(a, a));
        assert!(!arena.reaches(c, a));

        arena.remove_node(b);
        assert!(!arena.reaches(a, c));
    }

    #[test]
    fn test_terminal_outputs() {
        let (arena, a, _) = chain();
        arena.add_terminal_output_value(a, spec("T", "A")).unwrap();
        assert!(arena.output_values(a).unwrap().contains(&spec("T", "A")));
        assert!(arena.remove_terminal_output_value(a, &spec("T", "A")).unwrap());
        assert!(!arena.remove_terminal_output_value(a, &spec("T", "A")).unwrap());
    }

    #[test]
    fn test_concurrent_mutation_keeps_symmetry() {
        let arena = Arc::new(NodeArena::new());
        let hub = arena.add_node(target("HUB"));
        arena.add_output_value(hub, spec("H", "HUB")).unwrap();

        let nodes: Vec<NodeId> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let arena = Arc::clone(&arena);
                    s.spawn(move || {
                        let mut created = Vec::new();
                        for j in 0..16 {
                            let node = arena.add_node(target(&format!("N{i}-{j}")));
                            arena.add_input_value(node, spec("H", "HUB")).unwrap();
                            arena.add_input_node(node, hub).unwrap();
                            created.push(node);
                        }
                        created
                    })
                })
                .collect();

            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(arena.dependent_nodes(hub).len(), nodes.len());
        for node in nodes {
            assert_eq!(arena.input_nodes(node), BTreeSet::from([hub]));
        }
    }
}
