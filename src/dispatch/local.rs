use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use crate::cache::CacheEntry;
use crate::core::ComputedValue;
use crate::dispatch::{CalculationNode, CalculationNodeQuery};
use crate::error::CacheError;
use crate::function::{FunctionInputs, FunctionRepository};
use crate::identifier::{IdentifierMap, ValueSpecificationId};
use crate::job::{
    CalculationJob, CalculationJobItem, CalculationJobResult, FailureReason, JobItemResult,
};
use crate::target::ComputationTargetResolver;

/// Runs jobs in-process, on whatever thread calls [`execute`](CalculationNode::execute).
pub struct LocalCalculationNode {
    name: String,
    functions: Arc<FunctionRepository>,
    targets: Arc<dyn ComputationTargetResolver>,
    identifiers: Arc<dyn IdentifierMap>,
    query: Arc<dyn CalculationNodeQuery>,
}

impl LocalCalculationNode {
    pub fn new(
        name: impl Into<String>,
        functions: Arc<FunctionRepository>,
        targets: Arc<dyn ComputationTargetResolver>,
        identifiers: Arc<dyn IdentifierMap>,
        query: Arc<dyn CalculationNodeQuery>,
    ) -> Self {
        Self {
            name: name.into(),
            functions,
            targets,
            identifiers,
            query,
        }
    }

    fn execute_item(
        &self,
        item: &CalculationJobItem,
        available: &HashMap<ValueSpecificationId, ComputedValue>,
    ) -> JobItemResult {
        let Some(function) = self.functions.get(&item.function_id) else {
            return JobItemResult::Failure(FailureReason::UnknownFunction(item.function_id.clone()));
        };
        let Some(target) = self.targets.resolve(&item.target) else {
            return JobItemResult::Failure(FailureReason::TargetNotResolved(item.target.clone()));
        };

        let missing: Vec<ValueSpecificationId> = item
            .inputs
            .iter()
            .filter(|id| !available.contains_key(id))
            .copied()
            .collect();
        if !missing.is_empty() {
            return JobItemResult::Failure(FailureReason::MissingInputs(missing));
        }

        let specifications = match self
            .identifiers
            .value_specifications(&[item.inputs.as_slice(), item.outputs.as_slice()].concat())
        {
            Ok(specifications) => specifications,
            Err(error) => return JobItemResult::Failure(FailureReason::FunctionFailed(error.to_string())),
        };

        let inputs = FunctionInputs::new(
            item.inputs
                .iter()
                .filter_map(|id| Some((specifications.get(id)?.clone(), available.get(id)?.clone())))
                .collect(),
        );
        let desired: BTreeSet<_> = item
            .outputs
            .iter()
            .filter_map(|id| specifications.get(id).cloned())
            .collect();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            function.execute(&target, &inputs, &desired, &item.parameters)
        }));

        let outputs = match result {
            Ok(Ok(outputs)) => outputs,
            Ok(Err(error)) => {
                return JobItemResult::Failure(FailureReason::FunctionFailed(format!("{error:#}")));
            }
            Err(panic) => {
                let message = if let Some(s) = panic.downcast_ref::<&str>() {
                    format!("Function panicked: {s}")
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    format!("Function panicked: {s}")
                } else {
                    String::from("Function panicked with unknown payload")
                };
                return JobItemResult::Failure(FailureReason::FunctionFailed(message));
            }
        };

        let mut values = Vec::with_capacity(item.outputs.len());
        for id in &item.outputs {
            let value = specifications.get(id).and_then(|spec| outputs.get(spec));
            match value {
                Some(value) => values.push((*id, value.clone())),
                None => {
                    return JobItemResult::Failure(FailureReason::FunctionFailed(format!(
                        "'{}' did not produce {}",
                        item.function_id,
                        specifications
                            .get(id)
                            .map(ToString::to_string)
                            .unwrap_or_else(|| id.to_string())
                    )));
                }
            }
        }

        JobItemResult::Success(values)
    }
}

impl CalculationNode for LocalCalculationNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, job: &CalculationJob) -> CalculationJobResult {
        let start = Instant::now();

        let produced: BTreeSet<ValueSpecificationId> = job
            .items
            .iter()
            .flat_map(|item| item.outputs.iter().copied())
            .collect();
        let external: Vec<ValueSpecificationId> = job
            .items
            .iter()
            .flat_map(|item| item.inputs.iter().copied())
            .filter(|id| !produced.contains(id))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut available: HashMap<ValueSpecificationId, ComputedValue> =
            match self.query.query(job.epoch, &external) {
                Ok(entries) => entries
                    .into_iter()
                    .filter_map(|(id, entry)| match entry {
                        CacheEntry::Computed { value, .. } => Some((id, value)),
                        CacheEntry::Failed(_) => None,
                    })
                    .collect(),
                Err(CacheError::StaleEpoch { .. }) => {
                    return CalculationJobResult::failed(job, &self.name, FailureReason::Cancelled);
                }
                Err(error) => {
                    return CalculationJobResult::failed(
                        job,
                        &self.name,
                        FailureReason::NodeUnreachable(error.to_string()),
                    );
                }
            };

        let mut items = Vec::with_capacity(job.items.len());
        for item in &job.items {
            let result = self.execute_item(item, &available);
            if let JobItemResult::Success(values) = &result {
                available.extend(values.iter().cloned());
            } else {
                tracing::debug!("{} failed in {} on {}", item.function_id, job.id, self.name);
            }
            items.push(result);
        }

        CalculationJobResult {
            id: job.id,
            node: self.name.clone(),
            duration: start.elapsed(),
            items,
        }
    }
}
