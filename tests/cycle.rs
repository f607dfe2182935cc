use std::collections::BTreeSet;
use std::sync::Arc;

use keisan::cache::ComputationCacheSource;
use keisan::context::EngineConfig;
use keisan::cycle::{ComputationCycle, ViewDefinition};
use keisan::function::{
    FunctionDefinition, FunctionInputs, FunctionOutputs, FunctionParameters, FunctionRepository,
};
use keisan::market_data::InMemoryMarketData;
use keisan::target::{ComputationTarget, InMemoryTargetResolver};
use keisan::{
    ComputationTargetSpecification, ComputationTargetType, ComputedValue, ResolutionFailure,
    ValueProperties, ValueRequirement, ValueSpecification, ViewProcessingContext,
};
use serde_json::json;

type Inputs = dyn Fn(&ComputationTargetSpecification) -> Vec<ValueRequirement> + Send + Sync;
type Compute = dyn Fn(&ComputationTarget, &FunctionInputs) -> anyhow::Result<ComputedValue> + Send + Sync;

struct Function {
    id: &'static str,
    target_type: ComputationTargetType,
    output: &'static str,
    inputs: Box<Inputs>,
    compute: Box<Compute>,
}

impl FunctionDefinition for Function {
    fn unique_id(&self) -> &str {
        self.id
    }

    fn target_type(&self) -> ComputationTargetType {
        self.target_type
    }

    fn results(&self, target: &ComputationTargetSpecification) -> BTreeSet<ValueSpecification> {
        BTreeSet::from([ValueSpecification::new(
            self.output,
            target.clone(),
            ValueProperties::new(),
        )])
    }

    fn requirements(
        &self,
        target: &ComputationTargetSpecification,
        _: &ValueSpecification,
        _: &FunctionParameters,
    ) -> Option<BTreeSet<ValueRequirement>> {
        Some((self.inputs)(target).into_iter().collect())
    }

    fn execute(
        &self,
        target: &ComputationTarget,
        inputs: &FunctionInputs,
        desired: &BTreeSet<ValueSpecification>,
        _: &FunctionParameters,
    ) -> anyhow::Result<FunctionOutputs> {
        let value = (self.compute)(target, inputs)?;
        Ok(desired.iter().map(|spec| (spec.clone(), value.clone())).collect())
    }
}

struct Holding {
    quantity: f64,
}

fn security(id: &str) -> ComputationTargetSpecification {
    ComputationTargetSpecification::security(id)
}

fn position(id: &str) -> ComputationTargetSpecification {
    ComputationTargetSpecification::position(id)
}

fn book() -> ComputationTargetSpecification {
    ComputationTargetSpecification::new(ComputationTargetType::PortfolioNode, "BOOK")
}

fn held_security(position: &str) -> &'static str {
    match position {
        "POS-1" => "B1",
        "POS-2" => "B2",
        _ => "B3",
    }
}

fn functions() -> FunctionRepository {
    let mut functions = FunctionRepository::new();
    functions
        .add(Function {
            id: "PositionValue",
            target_type: ComputationTargetType::Position,
            output: "Value",
            inputs: Box::new(|target| {
                vec![ValueRequirement::new("Price", security(held_security(target.id())))]
            }),
            compute: Box::new(|target, inputs| {
                let holding = target
                    .value::<Holding>()
                    .ok_or_else(|| anyhow::anyhow!("{} is not a holding", target.specification()))?;
                let price = inputs
                    .by_name("Price")
                    .and_then(|price| price.as_f64())
                    .ok_or_else(|| anyhow::anyhow!("price is not a number"))?;
                Ok(json!(holding.quantity * price))
            }),
        })
        .add(Function {
            id: "BookValue",
            target_type: ComputationTargetType::PortfolioNode,
            output: "Value",
            inputs: Box::new(|_| {
                vec![
                    ValueRequirement::new("Value", position("POS-1")),
                    ValueRequirement::new("Value", position("POS-2")),
                ]
            }),
            compute: Box::new(|_, inputs| {
                let total: f64 = inputs.iter().filter_map(|(_, value)| value.as_f64()).sum();
                Ok(json!(total))
            }),
        });
    functions
}

fn targets() -> InMemoryTargetResolver {
    let targets = InMemoryTargetResolver::new();
    targets.insert(position("POS-1"), Holding { quantity: 10.0 });
    targets.insert(position("POS-2"), Holding { quantity: 5.0 });
    targets.insert(position("POS-3"), Holding { quantity: 1.0 });
    targets.insert(book(), ());
    targets
}

fn market_data() -> Arc<InMemoryMarketData> {
    let market_data = Arc::new(InMemoryMarketData::new());
    market_data.set("Price", security("B1"), json!(98.0));
    market_data.set("Price", security("B2"), json!(101.0));
    market_data
}

fn view() -> ViewDefinition {
    ViewDefinition::new("book")
        .with(ValueRequirement::new("Value", book()))
        .with(ValueRequirement::new("Value", position("POS-1")))
        .with(ValueRequirement::new("Value", position("POS-3")))
}

fn context(market_data: Arc<InMemoryMarketData>, config: EngineConfig) -> ViewProcessingContext {
    ViewProcessingContext::builder()
        .config(config)
        .market_data(market_data)
        .functions(Arc::new(functions()))
        .targets(Arc::new(targets()))
        .cache_source(ComputationCacheSource::in_memory())
        .build()
        .unwrap()
}

fn config() -> EngineConfig {
    EngineConfig {
        threads: 4,
        max_job_items: 2,
        ..Default::default()
    }
}

#[test]
fn test_book_valuation() {
    let context = context(market_data(), config());
    let result = context.run_cycle(&view()).unwrap();

    assert_eq!(result.value(&ValueRequirement::new("Value", book())), Some(&json!(1485.0)));
    assert_eq!(
        result.value(&ValueRequirement::new("Value", position("POS-1"))),
        Some(&json!(980.0))
    );

    // POS-3 holds a bond without a price.
    assert_eq!(result.unresolved.len(), 1);
    assert!(matches!(
        &result.unresolved[0],
        ResolutionFailure::UnsatisfiedInputs { .. }
    ));
    assert!(result.failures.is_empty());
    assert!(!result.is_complete());

    let spec = &result.specifications[&ValueRequirement::new("Value", book())];
    assert_eq!(spec.function_id(), Some("BookValue"));
    assert!(result.diagnostics.job_count() >= 2);
    assert!(!result.diagnostics.render_timeline().is_empty());
}

#[test]
fn test_parallel_build_matches_sequential() {
    let sequential = context(market_data(), config()).run_cycle(&view()).unwrap();
    let parallel = context(
        market_data(),
        EngineConfig {
            parallel_build: true,
            ..config()
        },
    )
    .run_cycle(&view())
    .unwrap();

    assert_eq!(sequential.values, parallel.values);
    assert_eq!(sequential.specifications, parallel.specifications);
}

#[test]
fn test_rerun_after_market_data_update() {
    let market_data = market_data();
    let context = context(Arc::clone(&market_data), config());
    let book_value = ValueRequirement::new("Value", book());

    let first = context.run_cycle(&view()).unwrap();
    let again = context.run_cycle(&view()).unwrap();
    assert_eq!(first.values, again.values);
    assert_eq!(first.epoch, again.epoch);

    market_data.set("Price", security("B2"), json!(100.0));
    let moved = context.run_cycle(&view()).unwrap();
    assert_eq!(moved.value(&book_value), Some(&json!(1480.0)));
    assert_ne!(moved.epoch, first.epoch);
    assert!(moved.conflicts.is_empty());

    context.cache_source().invalidate();
    let cleared = context.run_cycle(&view()).unwrap();
    assert_eq!(cleared.values, moved.values);
    assert_ne!(cleared.epoch, moved.epoch);
}

#[test]
fn test_compiled_graph() {
    let context = context(market_data(), config());
    let cycle = ComputationCycle::new(&context, view());
    let outcome = cycle.compile().unwrap();

    // book, two positions and two prices
    assert_eq!(outcome.graph.len(), 5);
    assert_eq!(outcome.graph.market_data_nodes().len(), 2);
    assert_eq!(outcome.graph.execution_order().unwrap().len(), 5);

    let mermaid = outcome.graph.to_string();
    assert!(mermaid.starts_with("graph LR"));
    assert!(mermaid.contains("BookValue"));
}

#[cfg(feature = "tokio")]
#[test]
fn test_remote_calculation_node() {
    use std::time::Duration;

    use keisan::dispatch::{
        LocalCalculationNode, RemoteCalculationNode, Transport, TransportFuture, handle_request,
    };

    let cache_source = ComputationCacheSource::in_memory();
    let functions = Arc::new(functions());
    let targets = Arc::new(targets());

    let server = Arc::new(LocalCalculationNode::new(
        "server",
        Arc::clone(&functions),
        targets.clone(),
        Arc::clone(cache_source.identifiers()),
        Arc::new(cache_source.clone()),
    ));
    let transport: Transport = Arc::new(move |request: Vec<u8>| -> TransportFuture {
        let server = Arc::clone(&server);
        Box::pin(async move { Ok(handle_request(server.as_ref(), &request)?) })
    });

    let context = ViewProcessingContext::builder()
        .config(config())
        .market_data(market_data())
        .functions(functions)
        .targets(targets)
        .cache_source(cache_source)
        .calculation_node(Arc::new(RemoteCalculationNode::new(
            "remote-0",
            transport,
            Duration::from_secs(5),
        )))
        .build()
        .unwrap();

    let result = context.run_cycle(&view()).unwrap();

    assert_eq!(result.value(&ValueRequirement::new("Value", book())), Some(&json!(1485.0)));
    assert!(
        result
            .diagnostics
            .executions
            .iter()
            .all(|exec| exec.node == "remote-0")
    );
}
