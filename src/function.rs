//! Functions compute values. They are described to the engine through
//! [`FunctionDefinition`], bound to a parameter set as a
//! [`ParameterizedFunction`], and collected in a [`FunctionRepository`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::core::{ArcStr, Blake3Hasher, ComputedValue, Hash32};
use crate::target::ComputationTarget;
use crate::value::{
    ComputationTargetSpecification, ComputationTargetType, ValueRequirement, ValueSpecification,
};

/// Overrides and defaults for a function, keyed by parameter name.
pub type FunctionParameters = BTreeMap<String, String>;

/// Values produced by a single function invocation.
pub type FunctionOutputs = HashMap<ValueSpecification, ComputedValue>;

/// Unique id of the built-in market data sourcing function.
pub const MARKET_DATA_FUNCTION_ID: &str = "MarketDataSourcingFunction";

/// What a dependency node does when it runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum FunctionKind {
    /// Executed by a calculation node from its inputs.
    #[default]
    Computed,
    /// A leaf: its single output is injected from an external market data
    /// source instead of being computed.
    MarketDataSourced,
}

/// The capability set every function exposes to the resolver and to the
/// calculation nodes.
pub trait FunctionDefinition: Send + Sync {
    /// Stable identifier, unique within a repository.
    fn unique_id(&self) -> &str;

    /// Human readable name, matched by priority rules.
    fn short_name(&self) -> &str {
        self.unique_id()
    }

    fn kind(&self) -> FunctionKind {
        FunctionKind::Computed
    }

    fn target_type(&self) -> ComputationTargetType;

    fn can_apply_to(&self, target: &ComputationTargetSpecification) -> bool {
        target.target_type() == self.target_type()
    }

    fn default_parameters(&self) -> FunctionParameters {
        FunctionParameters::new()
    }

    /// The maximal set of values this function can produce on the target.
    fn results(&self, target: &ComputationTargetSpecification) -> BTreeSet<ValueSpecification>;

    /// The inputs needed to produce `desired`, or `None` when the function
    /// cannot satisfy it on this target.
    fn requirements(
        &self,
        target: &ComputationTargetSpecification,
        desired: &ValueSpecification,
        parameters: &FunctionParameters,
    ) -> Option<BTreeSet<ValueRequirement>>;

    /// Refines one output once the exact input specifications are known, for
    /// example to carry a property through from an input. Returns the output
    /// unchanged by default.
    fn refine_result(
        &self,
        _target: &ComputationTargetSpecification,
        _inputs: &BTreeSet<ValueSpecification>,
        output: &ValueSpecification,
    ) -> ValueSpecification {
        output.clone()
    }

    /// Computes the desired outputs from the resolved inputs.
    fn execute(
        &self,
        target: &ComputationTarget,
        inputs: &FunctionInputs,
        desired: &BTreeSet<ValueSpecification>,
        parameters: &FunctionParameters,
    ) -> anyhow::Result<FunctionOutputs>;
}

/// Input values handed to [`FunctionDefinition::execute`].
#[derive(Debug, Default, Clone)]
pub struct FunctionInputs {
    values: HashMap<ValueSpecification, ComputedValue>,
}

impl FunctionInputs {
    pub fn new(values: HashMap<ValueSpecification, ComputedValue>) -> Self {
        Self { values }
    }

    pub fn get(&self, specification: &ValueSpecification) -> Option<&ComputedValue> {
        self.values.get(specification)
    }

    /// Finds an input by value name, regardless of its properties and target.
    pub fn by_name(&self, value_name: &str) -> Option<&ComputedValue> {
        self.values
            .iter()
            .find(|(spec, _)| spec.value_name() == value_name)
            .map(|(_, value)| value)
    }

    /// All inputs with the given value name.
    pub fn all_by_name<'a>(
        &'a self,
        value_name: &'a str,
    ) -> impl Iterator<Item = (&'a ValueSpecification, &'a ComputedValue)> + 'a {
        self.values
            .iter()
            .filter(move |(spec, _)| spec.value_name() == value_name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ValueSpecification, &ComputedValue)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A function bound to a concrete parameter set.
#[derive(Clone)]
pub struct ParameterizedFunction {
    definition: Arc<dyn FunctionDefinition>,
    parameters: FunctionParameters,
    unique_id: ArcStr,
}

impl ParameterizedFunction {
    pub fn new(definition: Arc<dyn FunctionDefinition>, parameters: FunctionParameters) -> Self {
        let unique_id = if parameters == definition.default_parameters() {
            ArcStr::from(definition.unique_id())
        } else {
            let mut hasher = Blake3Hasher::default();
            parameters.hash(&mut hasher);
            let hash: Hash32 = hasher.into();
            let hex = hash.to_hex();
            ArcStr::from(format!("{}#{}", definition.unique_id(), &hex[..12]))
        };

        Self {
            definition,
            parameters,
            unique_id,
        }
    }

    /// Binds the function to its default parameters.
    pub fn with_defaults(definition: Arc<dyn FunctionDefinition>) -> Self {
        let parameters = definition.default_parameters();
        Self::new(definition, parameters)
    }

    pub fn definition(&self) -> &Arc<dyn FunctionDefinition> {
        &self.definition
    }

    pub fn parameters(&self) -> &FunctionParameters {
        &self.parameters
    }

    /// Identifies the function together with its parameters. Two
    /// parameterizations of the same function have different ids.
    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn kind(&self) -> FunctionKind {
        self.definition.kind()
    }
}

impl PartialEq for ParameterizedFunction {
    fn eq(&self, other: &Self) -> bool {
        self.unique_id == other.unique_id && self.parameters == other.parameters
    }
}

impl Eq for ParameterizedFunction {}

impl Hash for ParameterizedFunction {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.unique_id.hash(state);
    }
}

impl std::fmt::Debug for ParameterizedFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterizedFunction")
            .field("unique_id", &self.unique_id)
            .field("parameters", &self.parameters)
            .finish()
    }
}

/// The leaf function. Nodes bound to it are never executed, the processing
/// cycle writes their output from a market data snapshot.
#[derive(Debug, Default)]
pub struct MarketDataSourcingFunction;

impl FunctionDefinition for MarketDataSourcingFunction {
    fn unique_id(&self) -> &str {
        MARKET_DATA_FUNCTION_ID
    }

    fn kind(&self) -> FunctionKind {
        FunctionKind::MarketDataSourced
    }

    fn target_type(&self) -> ComputationTargetType {
        ComputationTargetType::Primitive
    }

    fn can_apply_to(&self, _: &ComputationTargetSpecification) -> bool {
        true
    }

    fn results(&self, _: &ComputationTargetSpecification) -> BTreeSet<ValueSpecification> {
        BTreeSet::new()
    }

    fn requirements(
        &self,
        _: &ComputationTargetSpecification,
        _: &ValueSpecification,
        _: &FunctionParameters,
    ) -> Option<BTreeSet<ValueRequirement>> {
        Some(BTreeSet::new())
    }

    fn execute(
        &self,
        target: &ComputationTarget,
        _: &FunctionInputs,
        _: &BTreeSet<ValueSpecification>,
        _: &FunctionParameters,
    ) -> anyhow::Result<FunctionOutputs> {
        anyhow::bail!(
            "market data for {} is injected, not computed",
            target.specification()
        )
    }
}

/// The catalog of functions known to the engine.
#[derive(Clone)]
pub struct FunctionRepository {
    functions: BTreeMap<String, Arc<dyn FunctionDefinition>>,
    market_data: Arc<dyn FunctionDefinition>,
}

impl FunctionRepository {
    pub fn new() -> Self {
        let market_data: Arc<dyn FunctionDefinition> = Arc::new(MarketDataSourcingFunction);
        let mut functions = BTreeMap::new();
        functions.insert(MARKET_DATA_FUNCTION_ID.to_string(), Arc::clone(&market_data));

        Self {
            functions,
            market_data,
        }
    }

    /// Registers a function, replacing any previous one with the same id.
    pub fn add(&mut self, function: impl FunctionDefinition + 'static) -> &mut Self {
        self.add_arc(Arc::new(function))
    }

    pub fn add_arc(&mut self, function: Arc<dyn FunctionDefinition>) -> &mut Self {
        let id = function.unique_id().to_string();
        if self.functions.insert(id.clone(), function).is_some() {
            tracing::warn!("function '{}' registered twice, keeping the latest", id);
        }
        self
    }

    pub fn get(&self, unique_id: &str) -> Option<&Arc<dyn FunctionDefinition>> {
        self.functions.get(unique_id)
    }

    /// All computed functions, ordered by unique id.
    pub fn functions(&self) -> impl Iterator<Item = &Arc<dyn FunctionDefinition>> {
        self.functions
            .values()
            .filter(|function| function.kind() == FunctionKind::Computed)
    }

    pub fn market_data_function(&self) -> ParameterizedFunction {
        ParameterizedFunction::with_defaults(Arc::clone(&self.market_data))
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl Default for FunctionRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestFunction;
    use crate::value::ValueProperties;

    #[test]
    fn test_parameterized_ids() {
        let function: Arc<dyn FunctionDefinition> =
            Arc::new(TestFunction::new("PV", ComputationTargetType::Security).output("PresentValue"));

        let defaults = ParameterizedFunction::with_defaults(Arc::clone(&function));
        assert_eq!(defaults.unique_id(), "PV");

        let mut parameters = FunctionParameters::new();
        parameters.insert("Model".into(), "Black".into());
        let overridden = ParameterizedFunction::new(Arc::clone(&function), parameters.clone());
        assert!(overridden.unique_id().starts_with("PV#"));
        assert_ne!(defaults, overridden);

        let again = ParameterizedFunction::new(function, parameters);
        assert_eq!(overridden, again);
        assert_eq!(overridden.unique_id(), again.unique_id());
    }

    #[test]
    fn test_repository_lookup() {
        let mut repository = FunctionRepository::new();
        repository
            .add(TestFunction::new("B", ComputationTargetType::Security).output("X"))
            .add(TestFunction::new("A", ComputationTargetType::Security).output("Y"));

        assert!(repository.get("A").is_some());
        assert!(repository.get(MARKET_DATA_FUNCTION_ID).is_some());

        let ids: Vec<_> = repository.functions().map(|f| f.unique_id().to_string()).collect();
        assert_eq!(ids, vec!["A", "B"]);
    }

    #[test]
    fn test_market_data_function_is_not_executable() {
        let function = MarketDataSourcingFunction;
        let spec = ComputationTargetSpecification::primitive("USD");
        let target = ComputationTarget::new(spec.clone(), ());
        let result = function.execute(
            &target,
            &FunctionInputs::default(),
            &BTreeSet::new(),
            &FunctionParameters::new(),
        );
        assert!(result.is_err());
        assert_eq!(function.kind(), FunctionKind::MarketDataSourced);
        assert!(
            function
                .requirements(
                    &spec,
                    &ValueSpecification::new("Spot", spec.clone(), ValueProperties::new()),
                    &FunctionParameters::new()
                )
                .is_some_and(|inputs| inputs.is_empty())
        );
    }
}
