//! One pass of computing a view.
//!
//! A [`ComputationCycle`] compiles the view's requirements into a pruned
//! dependency graph, subscribes its market data, writes the current market
//! data snapshot into the cache, dispatches every remaining node and reads
//! the terminal outputs back. The result is partial by nature: whatever
//! failed is listed next to whatever was computed.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::cache::{CacheEntry, CacheEpoch, ComputationCache};
use crate::context::ViewProcessingContext;
use crate::core::ComputedValue;
use crate::diagnostics::Diagnostics;
use crate::dispatch::CycleCancellation;
use crate::error::{CacheError, CompilationError, CycleError, ResolutionFailure};
use crate::graph::{DependencyGraph, DependencyGraphBuilder, GraphBuildOutcome};
use crate::job::FailureReason;
use crate::value::{ValueRequirement, ValueSpecification};

/// The values a view asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewDefinition {
    pub name: String,
    pub requirements: Vec<ValueRequirement>,
}

impl ViewDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            requirements: Vec::new(),
        }
    }

    pub fn with(mut self, requirement: ValueRequirement) -> Self {
        self.requirements.push(requirement);
        self
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[derive(Debug)]
pub struct CycleResult {
    pub view: String,
    pub epoch: CacheEpoch,
    /// Computed terminal outputs.
    pub values: BTreeMap<ValueRequirement, ComputedValue>,
    /// The specification each resolved requirement was satisfied with.
    pub specifications: BTreeMap<ValueRequirement, ValueSpecification>,
    /// Every value of the graph which was not computed, with its cause.
    pub failures: BTreeMap<ValueSpecification, FailureReason>,
    /// Requirements no function could satisfy.
    pub unresolved: Vec<ResolutionFailure>,
    /// Market data the cache already held a different value for. The cached
    /// value was used.
    pub conflicts: Vec<ValueSpecification>,
    pub cancelled: bool,
    pub diagnostics: Diagnostics,
}

impl CycleResult {
    pub fn value(&self, requirement: &ValueRequirement) -> Option<&ComputedValue> {
        self.values.get(requirement)
    }

    /// Why the value satisfying `requirement` is missing, if it was resolved.
    pub fn failure(&self, requirement: &ValueRequirement) -> Option<&FailureReason> {
        self.failures.get(self.specifications.get(requirement)?)
    }

    /// Whether every requested value was computed from current inputs.
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
            && self.conflicts.is_empty()
            && self.values.len() == self.specifications.len()
    }
}

pub struct ComputationCycle<'a> {
    context: &'a ViewProcessingContext,
    view: ViewDefinition,
    cancellation: CycleCancellation,
}

impl<'a> ComputationCycle<'a> {
    pub fn new(context: &'a ViewProcessingContext, view: ViewDefinition) -> Self {
        Self {
            context,
            view,
            cancellation: CycleCancellation::new(),
        }
    }

    /// A handle which cancels this cycle from another thread.
    pub fn cancellation(&self) -> CycleCancellation {
        self.cancellation.clone()
    }

    /// Resolves the view into a pruned graph.
    pub fn compile(&self) -> Result<GraphBuildOutcome, CompilationError> {
        let builder = DependencyGraphBuilder::new(
            self.view.name.clone(),
            std::sync::Arc::clone(self.context.compilation()),
        );
        let requirements = self.view.requirements.clone();

        if self.context.config().parallel_build {
            self.context
                .pool()
                .install(|| builder.add_targets_parallel(requirements))?;
        } else {
            builder.add_targets(requirements)?;
        }

        builder.build()
    }

    pub fn run(self) -> Result<CycleResult, CycleError> {
        let start = Instant::now();
        let GraphBuildOutcome {
            graph,
            failures: unresolved,
            ..
        } = self.compile()?;
        let compile_time = start.elapsed();

        let quotes = self.market_data_quotes(&graph)?;
        let cache = self.open_cache(&quotes);
        let mut failures = BTreeMap::new();

        let outputs = graph.output_values();
        cache.identifiers().identifiers(&mut outputs.iter());

        let conflicts = self.inject_market_data(quotes, &cache, &mut failures)?;

        let start = Instant::now();
        let outcome = self
            .context
            .dispatcher()
            .dispatch(&graph, &cache, &self.cancellation)?;
        let dispatch_time = start.elapsed();

        let ids: Vec<_> = outcome.failures.keys().copied().collect();
        let specifications = cache.identifiers().value_specifications(&ids)?;
        for (id, reason) in outcome.failures {
            if let Some(spec) = specifications.get(&id) {
                failures.insert(spec.clone(), reason);
            }
        }

        let mut values = BTreeMap::new();
        for (requirement, spec) in graph.terminal_outputs() {
            match cache.get(spec) {
                Some(CacheEntry::Computed { value, .. }) => {
                    values.insert(requirement.clone(), value);
                }
                Some(CacheEntry::Failed(reason)) => {
                    failures.entry(spec.clone()).or_insert(reason);
                }
                // Dropped because the cache moved on or the cycle was cancelled.
                None => {
                    failures.entry(spec.clone()).or_insert(FailureReason::Cancelled);
                }
            }
        }

        tracing::info!(
            "cycle '{}' done: {}/{} values, {} failures, {} unresolved, {} conflicts",
            self.view.name,
            values.len(),
            graph.terminal_outputs().len(),
            failures.len(),
            unresolved.len(),
            conflicts.len()
        );

        Ok(CycleResult {
            view: self.view.name,
            epoch: cache.epoch(),
            values,
            specifications: graph.terminal_outputs().clone(),
            failures,
            unresolved,
            conflicts,
            cancelled: outcome.cancelled,
            diagnostics: Diagnostics {
                compile_time,
                dispatch_time,
                executions: outcome.executions,
            },
        })
    }

    /// Subscribes the leaves of `graph` and reads their current values.
    /// Leaves without a quote become failed entries.
    fn market_data_quotes(
        &self,
        graph: &DependencyGraph,
    ) -> Result<Vec<(ValueSpecification, CacheEntry)>, CycleError> {
        let leaves: BTreeSet<ValueSpecification> = graph
            .market_data_nodes()
            .into_iter()
            .filter_map(|node| graph.arena().output_values(node).ok())
            .flatten()
            .collect();
        if leaves.is_empty() {
            return Ok(Vec::new());
        }

        let market_data = self.context.market_data();
        market_data.subscribe(&leaves);
        let snapshot = market_data.snapshot();

        let mut quotes = Vec::with_capacity(leaves.len());
        for spec in leaves {
            let entry = match snapshot.value(&spec) {
                Some(value) => CacheEntry::computed(value)?,
                None => CacheEntry::Failed(FailureReason::MarketDataUnavailable),
            };
            quotes.push((spec, entry));
        }
        Ok(quotes)
    }

    /// Opens the cache, moving it to a new epoch first when it holds market
    /// data which no longer matches `quotes`.
    fn open_cache(&self, quotes: &[(ValueSpecification, CacheEntry)]) -> ComputationCache {
        let source = self.context.cache_source();
        let cache = source.open();

        let moved = quotes.iter().find(|(spec, entry)| {
            cache
                .get(spec)
                .is_some_and(|cached| !cached.same_as(entry))
        });
        match moved {
            Some((spec, _)) => {
                tracing::info!("{} moved since epoch {}, invalidating the cache", spec, cache.epoch().0);
                source.invalidate();
                source.open()
            }
            None => cache,
        }
    }

    /// Writes `quotes` into the cache. Returns the leaves another writer
    /// already cached a different value for in this epoch.
    fn inject_market_data(
        &self,
        quotes: Vec<(ValueSpecification, CacheEntry)>,
        cache: &ComputationCache,
        failures: &mut BTreeMap<ValueSpecification, FailureReason>,
    ) -> Result<Vec<ValueSpecification>, CycleError> {
        let mut conflicts = Vec::new();
        let injected = quotes.len();

        for (spec, entry) in quotes {
            if let CacheEntry::Failed(reason) = &entry {
                tracing::warn!("no market data for {}", spec);
                failures.insert(spec.clone(), reason.clone());
            }

            let id = cache.identifiers().identifier(&spec);
            match cache.put_entries(vec![(id, entry)]) {
                Ok(()) => {}
                Err(CacheError::Conflict(_)) => {
                    tracing::warn!("{} already cached in epoch {}, keeping it", spec, cache.epoch().0);
                    conflicts.push(spec);
                }
                Err(error) => return Err(error.into()),
            }
        }

        tracing::debug!("injected {} market data values", injected);
        Ok(conflicts)
    }
}

impl ViewProcessingContext {
    /// Runs a single cycle of `view` to completion.
    pub fn run_cycle(&self, view: &ViewDefinition) -> Result<CycleResult, CycleError> {
        ComputationCycle::new(self, view.clone()).run()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ComputationCacheSource;
    use crate::context::EngineConfig;
    use crate::function::FunctionRepository;
    use crate::market_data::InMemoryMarketData;
    use crate::target::InMemoryTargetResolver;
    use crate::testing::TestFunction;
    use crate::value::{ComputationTargetSpecification, ComputationTargetType, ValueProperties};
    use serde_json::json;
    use std::sync::Arc;

    const SEC: ComputationTargetType = ComputationTargetType::Security;

    fn security() -> ComputationTargetSpecification {
        ComputationTargetSpecification::security("SEC-1")
    }

    fn context(repository: FunctionRepository, market_data: Arc<InMemoryMarketData>) -> ViewProcessingContext {
        let targets = InMemoryTargetResolver::new();
        targets.insert(security(), "bond");

        ViewProcessingContext::builder()
            .config(EngineConfig {
                threads: 2,
                ..Default::default()
            })
            .market_data(market_data)
            .functions(Arc::new(repository))
            .targets(Arc::new(targets))
            .cache_source(ComputationCacheSource::in_memory())
            .build()
            .unwrap()
    }

    fn repository() -> FunctionRepository {
        let mut repository = FunctionRepository::new();
        repository
            .add(TestFunction::new("PV", SEC).output("PV").input("Yield"))
            .add(
                TestFunction::new("Yield", SEC)
                    .output("Yield")
                    .input("Price")
                    .compute(|inputs| {
                        let price = inputs.by_name("Price").and_then(|v| v.as_f64()).unwrap_or_default();
                        Ok(json!(100.0 - price))
                    }),
            )
            .add(TestFunction::new("Broken", SEC).output("Vega").compute(|_| anyhow::bail!("no surface")));
        repository
    }

    #[test]
    fn test_partial_results() {
        let market_data = Arc::new(InMemoryMarketData::new());
        market_data.set("Price", security(), json!(97.5));
        let context = context(repository(), market_data);

        let pv = ValueRequirement::new("PV", security());
        let vega = ValueRequirement::new("Vega", security());
        let gamma = ValueRequirement::new("Gamma", security());
        let view = ViewDefinition::new("risk")
            .with(pv.clone())
            .with(vega.clone())
            .with(gamma);

        let result = context.run_cycle(&view).unwrap();

        assert_eq!(result.value(&pv), Some(&json!(2.5)));
        assert_eq!(
            result.failure(&vega),
            Some(&FailureReason::FunctionFailed("no surface".into()))
        );
        assert_eq!(result.unresolved.len(), 1);
        assert!(!result.is_complete());
        assert!(!result.cancelled);
    }

    #[test]
    fn test_missing_market_data() {
        let market_data = Arc::new(InMemoryMarketData::new());
        let context = context(repository(), Arc::clone(&market_data));

        let pv = ValueRequirement::new("PV", security());
        let result = context
            .run_cycle(&ViewDefinition::new("risk").with(pv.clone()))
            .unwrap();

        // Without a quote the leaf is not available, so nothing resolves.
        assert!(result.values.is_empty());
        assert_eq!(result.unresolved.len(), 1);

        market_data.set("Price", security(), json!(100.0));
        let result = context
            .run_cycle(&ViewDefinition::new("risk").with(pv.clone()))
            .unwrap();
        assert_eq!(result.value(&pv), Some(&json!(0.0)));
        assert!(result.is_complete());
    }

    #[test]
    fn test_market_data_update_moves_epoch() {
        let market_data = Arc::new(InMemoryMarketData::new());
        market_data.set("Price", security(), json!(97.5));
        let context = context(repository(), Arc::clone(&market_data));
        let pv = ValueRequirement::new("PV", security());
        let view = ViewDefinition::new("risk").with(pv.clone());

        let first = context.run_cycle(&view).unwrap();
        assert_eq!(first.value(&pv), Some(&json!(2.5)));

        market_data.set("Price", security(), json!(90.0));
        let second = context.run_cycle(&view).unwrap();
        assert_eq!(second.value(&pv), Some(&json!(10.0)));
        assert_ne!(second.epoch, first.epoch);
        assert!(second.conflicts.is_empty());

        let third = context.run_cycle(&view).unwrap();
        assert_eq!(third.epoch, second.epoch);
    }

    #[test]
    fn test_conflicting_market_data_is_reported() {
        let market_data = Arc::new(InMemoryMarketData::new());
        let context = context(repository(), market_data);
        let cycle = ComputationCycle::new(&context, ViewDefinition::new("risk"));

        let price = ValueSpecification::new("Price", security(), ValueProperties::new());
        let cache = context.cache_source().open();
        cache.put(&price, json!(97.5)).unwrap();

        let mut failures = BTreeMap::new();
        let conflicts = cycle
            .inject_market_data(
                vec![(price.clone(), CacheEntry::computed(json!(90.0)).unwrap())],
                &cache,
                &mut failures,
            )
            .unwrap();

        assert_eq!(conflicts, vec![price.clone()]);
        assert_eq!(cache.get_value(&price), Some(json!(97.5)));
        assert!(failures.is_empty());
    }

    #[test]
    fn test_cancelled_cycle() {
        let market_data = Arc::new(InMemoryMarketData::new());
        market_data.set("Price", security(), json!(97.5));
        let context = context(repository(), market_data);

        let pv = ValueRequirement::new("PV", security());
        let cycle = ComputationCycle::new(&context, ViewDefinition::new("risk").with(pv.clone()));
        cycle.cancellation().cancel();

        let result = cycle.run().unwrap();
        assert!(result.cancelled);
        assert_eq!(result.value(&pv), None);
        assert_eq!(result.failure(&pv), Some(&FailureReason::Cancelled));
    }

    #[test]
    fn test_view_from_json() {
        let view = ViewDefinition::from_json(
            r#"{
                "name": "risk",
                "requirements": []
            }"#,
        )
        .unwrap();
        assert_eq!(view, ViewDefinition::new("risk"));
    }
}
