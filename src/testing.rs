//! Configurable toy functions shared by the unit tests.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::json;

use crate::core::ComputedValue;
use crate::function::{FunctionDefinition, FunctionInputs, FunctionOutputs, FunctionParameters};
use crate::target::ComputationTarget;
use crate::value::{
    ComputationTargetSpecification, ComputationTargetType, ValueProperties, ValueRequirement,
    ValueSpecification,
};

type Compute = dyn Fn(&FunctionInputs) -> anyhow::Result<ComputedValue> + Send + Sync;
type Refine = dyn Fn(&BTreeSet<ValueSpecification>, &ValueSpecification) -> ValueSpecification
    + Send
    + Sync;

struct Input {
    value_name: String,
    target: Option<ComputationTargetSpecification>,
    constraints: ValueProperties,
    /// Restricts the input to one output of the function.
    output: Option<String>,
}

/// A function declared entirely through its builder. By default it sums its
/// numeric inputs, or returns `1.0` when it has none.
pub(crate) struct TestFunction {
    id: String,
    target_type: ComputationTargetType,
    outputs: Vec<(String, ValueProperties)>,
    inputs: Vec<Input>,
    compute: Arc<Compute>,
    refine: Option<Arc<Refine>>,
    rejecting: bool,
    calls: Arc<AtomicUsize>,
}

impl TestFunction {
    pub(crate) fn new(id: &str, target_type: ComputationTargetType) -> Self {
        Self {
            id: id.to_string(),
            target_type,
            outputs: Vec::new(),
            inputs: Vec::new(),
            compute: Arc::new(|inputs: &FunctionInputs| Ok(sum(inputs))),
            refine: None,
            rejecting: false,
            calls: Arc::default(),
        }
    }

    pub(crate) fn output(self, value_name: &str) -> Self {
        self.output_with(value_name, ValueProperties::new())
    }

    pub(crate) fn output_with(mut self, value_name: &str, properties: ValueProperties) -> Self {
        self.outputs.push((value_name.to_string(), properties));
        self
    }

    /// Requires a value on the same target the function runs on.
    pub(crate) fn input(mut self, value_name: &str) -> Self {
        self.inputs.push(Input {
            value_name: value_name.to_string(),
            target: None,
            constraints: ValueProperties::new(),
            output: None,
        });
        self
    }

    /// Requires a value on the same target, only when computing `output`.
    pub(crate) fn input_for(mut self, output: &str, value_name: &str) -> Self {
        self.inputs.push(Input {
            value_name: value_name.to_string(),
            target: None,
            constraints: ValueProperties::new(),
            output: Some(output.to_string()),
        });
        self
    }

    pub(crate) fn input_on(mut self, value_name: &str, target: ComputationTargetSpecification) -> Self {
        self.inputs.push(Input {
            value_name: value_name.to_string(),
            target: Some(target),
            constraints: ValueProperties::new(),
            output: None,
        });
        self
    }

    pub(crate) fn compute<F>(mut self, compute: F) -> Self
    where
        F: Fn(&FunctionInputs) -> anyhow::Result<ComputedValue> + Send + Sync + 'static,
    {
        self.compute = Arc::new(compute);
        self
    }

    pub(crate) fn refine<F>(mut self, refine: F) -> Self
    where
        F: Fn(&BTreeSet<ValueSpecification>, &ValueSpecification) -> ValueSpecification
            + Send
            + Sync
            + 'static,
    {
        self.refine = Some(Arc::new(refine));
        self
    }

    /// Declares outputs but refuses every requirement.
    pub(crate) fn rejecting(mut self) -> Self {
        self.rejecting = true;
        self
    }

    /// Shared counter of `execute` invocations.
    pub(crate) fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

pub(crate) fn sum(inputs: &FunctionInputs) -> ComputedValue {
    if inputs.is_empty() {
        return json!(1.0);
    }

    let total: f64 = inputs
        .iter()
        .filter_map(|(_, value)| value.as_f64())
        .sum();

    json!(total)
}

impl FunctionDefinition for TestFunction {
    fn unique_id(&self) -> &str {
        &self.id
    }

    fn target_type(&self) -> ComputationTargetType {
        self.target_type
    }

    fn results(&self, target: &ComputationTargetSpecification) -> BTreeSet<ValueSpecification> {
        self.outputs
            .iter()
            .map(|(name, properties)| {
                ValueSpecification::new(name.as_str(), target.clone(), properties.clone())
            })
            .collect()
    }

    fn requirements(
        &self,
        target: &ComputationTargetSpecification,
        desired: &ValueSpecification,
        _: &FunctionParameters,
    ) -> Option<BTreeSet<ValueRequirement>> {
        if self.rejecting {
            return None;
        }

        let requirements = self
            .inputs
            .iter()
            .filter(|input| {
                input
                    .output
                    .as_deref()
                    .is_none_or(|output| output == desired.value_name())
            })
            .map(|input| {
                ValueRequirement::with_constraints(
                    input.value_name.as_str(),
                    input.target.clone().unwrap_or_else(|| target.clone()),
                    input.constraints.clone(),
                )
            })
            .collect();

        Some(requirements)
    }

    fn refine_result(
        &self,
        _: &ComputationTargetSpecification,
        inputs: &BTreeSet<ValueSpecification>,
        output: &ValueSpecification,
    ) -> ValueSpecification {
        match &self.refine {
            Some(refine) => refine(inputs, output),
            None => output.clone(),
        }
    }

    fn execute(
        &self,
        _: &ComputationTarget,
        inputs: &FunctionInputs,
        desired: &BTreeSet<ValueSpecification>,
        _: &FunctionParameters,
    ) -> anyhow::Result<FunctionOutputs> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut outputs = FunctionOutputs::new();
        for spec in desired {
            outputs.insert(spec.clone(), (self.compute)(inputs)?);
        }
        Ok(outputs)
    }
}
