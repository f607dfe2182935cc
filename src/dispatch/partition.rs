use std::collections::{BTreeSet, HashMap};

use crate::error::GraphError;
use crate::graph::{DependencyGraph, NodeId};
use crate::identifier::{IdentifierMap, ValueSpecificationId};
use crate::job::CalculationJobItem;

/// A batch of nodes planned to run as one job.
#[derive(Debug, Clone)]
pub struct PlannedJob {
    pub nodes: Vec<NodeId>,
    pub items: Vec<CalculationJobItem>,
    /// Indices of planned jobs producing inputs of this one.
    pub depends_on: BTreeSet<usize>,
}

impl PlannedJob {
    pub fn outputs(&self) -> impl Iterator<Item = ValueSpecificationId> + '_ {
        self.items.iter().flat_map(|item| item.outputs.iter().copied())
    }
}

/// Splits a pruned graph into jobs.
///
/// Nodes are visited in execution order. A node joins the job of its
/// producer when that producer is its only input node in the plan, is the
/// last item of its job, and the job still has room. Everything else starts
/// a new job. Market data nodes are not planned: their values are in the
/// cache before any job runs.
pub fn partition(
    graph: &DependencyGraph,
    identifiers: &dyn IdentifierMap,
    max_job_items: usize,
) -> Result<Vec<PlannedJob>, GraphError> {
    let max_job_items = max_job_items.max(1);
    let arena = graph.arena();

    let mut jobs: Vec<PlannedJob> = Vec::new();
    let mut job_of: HashMap<NodeId, usize> = HashMap::new();

    for node in graph.execution_order()? {
        let data = arena.node(node).ok_or(GraphError::NodeNotFound(node))?;
        if data.is_market_data() {
            continue;
        }
        let function = data.function().ok_or(GraphError::FunctionNotSet(node))?;

        let item = CalculationJobItem {
            function_id: function.definition().unique_id().to_string(),
            parameters: function.parameters().clone(),
            target: data.target().clone(),
            inputs: data
                .input_values()
                .iter()
                .map(|spec| identifiers.identifier(spec))
                .collect(),
            outputs: data
                .output_values()
                .iter()
                .map(|spec| identifiers.identifier(spec))
                .collect(),
        };

        let planned_inputs: Vec<NodeId> = arena
            .input_nodes(node)
            .into_iter()
            .filter(|input| job_of.contains_key(input))
            .collect();
        let producers: BTreeSet<usize> = planned_inputs.iter().map(|input| job_of[input]).collect();

        let chain = match planned_inputs.as_slice() {
            [producer] => {
                let index = job_of[producer];
                let job = &jobs[index];
                (job.nodes.last() == Some(producer) && job.nodes.len() < max_job_items)
                    .then_some(index)
            }
            _ => None,
        };

        let index = match chain {
            Some(index) => index,
            None => {
                jobs.push(PlannedJob {
                    nodes: Vec::new(),
                    items: Vec::new(),
                    depends_on: producers,
                });
                jobs.len() - 1
            }
        };

        jobs[index].nodes.push(node);
        jobs[index].items.push(item);
        job_of.insert(node, index);
    }

    tracing::debug!(
        "partitioned {} nodes of '{}' into {} jobs",
        job_of.len(),
        graph.name(),
        jobs.len()
    );

    Ok(jobs)
}
