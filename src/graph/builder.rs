use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rayon::prelude::*;

use crate::error::{CompilationError, GraphError, ResolutionFailure};
use crate::function::{FunctionRepository, MARKET_DATA_FUNCTION_ID};
use crate::graph::{DependencyGraph, NodeArena, NodeId, PruneReport};
use crate::market_data::MarketDataProvider;
use crate::resolver::{FunctionResolver, ResolutionCandidate};
use crate::value::{ComputationTargetSpecification, ValueRequirement, ValueSpecification};

const DEFAULT_MAX_DEPTH: usize = 64;

/// Everything graph construction reads from: the function catalog, the
/// resolver ordering its functions, and the market data source deciding which
/// requirements become leaves.
pub struct CompilationContext {
    functions: Arc<FunctionRepository>,
    resolver: Arc<FunctionResolver>,
    market_data: Arc<dyn MarketDataProvider>,
    max_depth: usize,
}

impl CompilationContext {
    pub fn new(
        functions: Arc<FunctionRepository>,
        resolver: Arc<FunctionResolver>,
        market_data: Arc<dyn MarketDataProvider>,
    ) -> Self {
        Self {
            functions,
            resolver,
            market_data,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    /// Bounds the length of a requirement chain.
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn functions(&self) -> &Arc<FunctionRepository> {
        &self.functions
    }

    pub fn resolver(&self) -> &Arc<FunctionResolver> {
        &self.resolver
    }

    pub fn market_data(&self) -> &Arc<dyn MarketDataProvider> {
        &self.market_data
    }
}

pub struct GraphBuildOutcome {
    pub graph: DependencyGraph,
    /// Requirements which could not be resolved. The rest of the graph is
    /// still usable.
    pub failures: Vec<ResolutionFailure>,
    pub prune: PruneReport,
}

type ProducedKey = (String, ComputationTargetSpecification);
type Resolution = Result<(NodeId, ValueSpecification), ResolutionFailure>;

#[derive(Default)]
struct BuildState {
    nodes: BTreeSet<NodeId>,
    terminal: Vec<(ValueRequirement, NodeId, ValueSpecification)>,
    failures: Vec<ResolutionFailure>,
    /// Outputs whose inputs have been resolved, by value name and target.
    produced: HashMap<ProducedKey, Vec<(ValueSpecification, NodeId)>>,
    /// Fully wired nodes, by target and parameterized function id.
    by_function: HashMap<(ComputationTargetSpecification, String), NodeId>,
}

impl BuildState {
    fn index(&mut self, node: NodeId, outputs: impl IntoIterator<Item = ValueSpecification>) {
        for output in outputs {
            let key = (output.value_name().to_string(), output.target().clone());
            let entry = self.produced.entry(key).or_default();
            if !entry.iter().any(|(spec, _)| *spec == output) {
                entry.push((output, node));
            }
        }
    }

    fn find(&self, requirement: &ValueRequirement) -> Option<(NodeId, ValueSpecification)> {
        let key = (
            requirement.value_name().to_string(),
            requirement.target().clone(),
        );
        self.produced
            .get(&key)?
            .iter()
            .find(|(spec, _)| spec.satisfies(requirement))
            .map(|(spec, node)| (*node, spec.clone()))
    }
}

/// Builds one dependency graph by walking backward from the requested values.
///
/// Requirements can be added from several threads at once. Nodes become
/// visible for reuse only after they are fully wired, so two threads racing
/// for the same function on the same target may both create a node; the
/// duplicates are merged when the graph is built. A function whose outputs
/// depend on each other ends up on separate nodes, which are never merged.
pub struct DependencyGraphBuilder {
    name: String,
    context: Arc<CompilationContext>,
    arena: Arc<NodeArena>,
    state: Mutex<BuildState>,
}

impl DependencyGraphBuilder {
    pub fn new(name: impl Into<String>, context: Arc<CompilationContext>) -> Self {
        Self::with_arena(name, context, Arc::new(NodeArena::new()))
    }

    /// Builds into an existing arena, sharing its nodes with other graphs.
    pub fn with_arena(
        name: impl Into<String>,
        context: Arc<CompilationContext>,
        arena: Arc<NodeArena>,
    ) -> Self {
        Self {
            name: name.into(),
            context,
            arena,
            state: Mutex::default(),
        }
    }

    fn state(&self) -> MutexGuard<'_, BuildState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves a requirement and marks the result as a terminal output.
    /// Returns whether it resolved; failures are kept for the build outcome.
    pub fn add_target(&self, requirement: ValueRequirement) -> Result<bool, GraphError> {
        let mut stack = Vec::new();

        match self.resolve(&requirement, &mut stack)? {
            Ok((node, spec)) => {
                tracing::debug!("resolved {} to {}", requirement, spec);
                self.state().terminal.push((requirement, node, spec));
                Ok(true)
            }
            Err(failure) => {
                tracing::warn!("{}", failure);
                self.state().failures.push(failure);
                Ok(false)
            }
        }
    }

    pub fn add_targets(
        &self,
        requirements: impl IntoIterator<Item = ValueRequirement>,
    ) -> Result<usize, GraphError> {
        let mut resolved = 0;
        for requirement in requirements {
            if self.add_target(requirement)? {
                resolved += 1;
            }
        }
        Ok(resolved)
    }

    /// Like [`add_targets`](Self::add_targets), resolving on the current rayon
    /// pool.
    pub fn add_targets_parallel(&self, requirements: Vec<ValueRequirement>) -> Result<usize, GraphError> {
        let resolved = requirements
            .into_par_iter()
            .map(|requirement| self.add_target(requirement))
            .collect::<Result<Vec<bool>, GraphError>>()?;

        Ok(resolved.into_iter().filter(|ok| *ok).count())
    }

    fn resolve(
        &self,
        requirement: &ValueRequirement,
        stack: &mut Vec<ValueRequirement>,
    ) -> Result<Resolution, GraphError> {
        if stack.contains(requirement) {
            return Ok(Err(ResolutionFailure::Cycle(requirement.clone())));
        }
        if stack.len() >= self.context.max_depth {
            return Ok(Err(ResolutionFailure::TooDeep(requirement.clone())));
        }

        if let Some(found) = self.state().find(requirement) {
            return Ok(Ok(found));
        }

        if let Some(available) = self.context.market_data.availability(requirement) {
            return self.add_market_data_node(available).map(Ok);
        }

        let candidates = self.context.resolver.candidates(requirement);
        if candidates.is_empty() {
            return Ok(Err(ResolutionFailure::NoFunctions(requirement.clone())));
        }

        let mut failures = Vec::new();
        for candidate in candidates {
            match self.try_candidate(requirement, candidate, stack)? {
                Ok(resolved) => return Ok(Ok(resolved)),
                Err(failure) => {
                    tracing::debug!("{}", failure);
                    failures.push(failure);
                }
            }
        }

        Ok(Err(failures.swap_remove(0)))
    }

    fn add_market_data_node(&self, available: ValueSpecification) -> Result<(NodeId, ValueSpecification), GraphError> {
        let spec = available.with_function(MARKET_DATA_FUNCTION_ID);

        let node = self.arena.add_node(spec.target().clone());
        self.arena
            .set_function(node, self.context.functions.market_data_function())?;
        self.arena.add_output_value(node, spec.clone())?;

        let mut state = self.state();
        if let Some(existing) = state.find(&spec.to_requirement()) {
            drop(state);
            self.arena.remove_node(node);
            return Ok(existing);
        }
        state.nodes.insert(node);
        state.index(node, [spec.clone()]);

        Ok((node, spec))
    }

    fn try_candidate(
        &self,
        requirement: &ValueRequirement,
        candidate: ResolutionCandidate,
        stack: &mut Vec<ValueRequirement>,
    ) -> Result<Resolution, GraphError> {
        let ResolutionCandidate {
            function,
            output,
            outputs,
        } = candidate;
        let definition = function.definition();
        let target = requirement.target();

        let Some(input_requirements) =
            definition.requirements(target, &output, function.parameters())
        else {
            return Ok(Err(ResolutionFailure::RejectedByFunction {
                requirement: requirement.clone(),
                function: function.unique_id().to_string(),
            }));
        };

        stack.push(requirement.clone());
        let mut inputs = Vec::with_capacity(input_requirements.len());
        let mut causes = Vec::new();
        for input in &input_requirements {
            match self.resolve(input, stack) {
                Ok(Ok(resolved)) => inputs.push(resolved),
                Ok(Err(failure)) => causes.push(failure),
                Err(error) => {
                    stack.pop();
                    return Err(error);
                }
            }
        }
        stack.pop();

        if !causes.is_empty() {
            return Ok(Err(ResolutionFailure::UnsatisfiedInputs {
                requirement: requirement.clone(),
                function: function.unique_id().to_string(),
                causes,
            }));
        }

        let key = (target.clone(), function.unique_id().to_string());
        // A node can take on another output only while none of the new inputs
        // depend on it.
        let reused = self.state().by_function.get(&key).copied();
        let reused = reused.filter(|node| {
            self.arena.contains(*node)
                && !inputs
                    .iter()
                    .any(|(input, _)| self.arena.reaches(*node, *input))
        });

        let node = match reused {
            Some(node) => node,
            None => {
                let node = self.arena.add_node(target.clone());
                self.arena.set_function(node, function.clone())?;
                self.arena.add_output_values(node, outputs)?;
                node
            }
        };

        for (_, input_spec) in &inputs {
            self.arena.add_input_value(node, input_spec.clone())?;
        }
        self.arena
            .add_input_nodes(node, inputs.iter().map(|(input_node, _)| *input_node))?;

        let input_values = self.arena.input_values(node)?;
        let resolved = definition.refine_result(target, &input_values, &output);
        let current = self.arena.output_values(node)?;
        if current.contains(&output) && resolved != output {
            self.arena.replace_output_value(node, &output, resolved.clone())?;
        } else if !current.contains(&resolved) {
            self.arena.add_output_value(node, resolved.clone())?;
        }

        // Only the expanded output is offered for reuse. The node's other
        // candidate outputs have not had their own inputs resolved.
        let mut state = self.state();
        state.nodes.insert(node);
        state.by_function.entry(key).or_insert(node);
        state.index(node, [resolved.clone()]);

        Ok(Ok((node, resolved)))
    }

    /// Assembles the graph: marks terminal outputs, merges duplicate nodes and
    /// prunes everything not needed by a terminal output.
    pub fn build(self) -> Result<GraphBuildOutcome, CompilationError> {
        let state = self
            .state
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);

        let mut graph = DependencyGraph::new(self.name, self.arena);
        for node in state.nodes {
            graph.insert_node(node)?;
        }

        let terminal: BTreeMap<_, _> = state
            .terminal
            .into_iter()
            .map(|(requirement, node, spec)| (requirement, (node, spec)))
            .collect();
        for (requirement, (node, spec)) in terminal {
            graph.add_terminal_output(requirement, node, spec)?;
        }

        graph.collapse_duplicates()?;
        let mut failures = state.failures;
        for requirement in graph.remove_cycles()? {
            failures.push(ResolutionFailure::Cycle(requirement));
        }
        let prune = graph.remove_unnecessary_values()?;
        graph.validate()?;

        tracing::info!(
            "compiled graph '{}': {} nodes, {} terminal outputs, {} unresolved",
            graph.name(),
            graph.len(),
            graph.terminal_outputs().len(),
            failures.len()
        );

        Ok(GraphBuildOutcome {
            graph,
            failures,
            prune,
        })
    }
}
