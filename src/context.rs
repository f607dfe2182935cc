//! The composition root of a processing cycle.
//!
//! A [`ViewProcessingContext`] owns every collaborator a cycle needs. It is
//! assembled once with [`ViewProcessingContext::builder`] and then shared by
//! all cycles of a view. Nothing in the engine reaches for global state.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::ComputationCacheSource;
use crate::dispatch::{CalculationNode, CalculationNodeQuery, JobDispatcher, LocalCalculationNode};
use crate::error::ContextError;
use crate::function::FunctionRepository;
use crate::graph::CompilationContext;
use crate::market_data::MarketDataProvider;
use crate::resolver::{FunctionResolver, PriorityRuleConfig, PriorityRules};
use crate::target::ComputationTargetResolver;

/// Engine settings, usually deserialized from a configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker threads of the execution pool, `0` lets rayon decide.
    pub threads: usize,
    /// Upper bound on the number of nodes sent as one job.
    pub max_job_items: usize,
    /// Per-job timeout in milliseconds.
    pub job_timeout: Option<u64>,
    /// Resolve terminal outputs on the execution pool.
    pub parallel_build: bool,
    /// Longest requirement chain followed during resolution.
    pub max_depth: usize,
    /// Function priorities, first matching pattern wins.
    pub priorities: Vec<PriorityRuleConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            max_job_items: 64,
            job_timeout: Some(30_000),
            parallel_build: false,
            max_depth: 64,
            priorities: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout.map(Duration::from_millis)
    }
}

/// Everything a processing cycle runs against.
pub struct ViewProcessingContext {
    config: EngineConfig,
    market_data: Arc<dyn MarketDataProvider>,
    functions: Arc<FunctionRepository>,
    resolver: Arc<FunctionResolver>,
    targets: Arc<dyn ComputationTargetResolver>,
    cache_source: ComputationCacheSource,
    dispatcher: Arc<JobDispatcher>,
    query: Arc<dyn CalculationNodeQuery>,
    compilation: Arc<CompilationContext>,
    pool: Arc<rayon::ThreadPool>,
}

impl ViewProcessingContext {
    pub fn builder() -> ViewProcessingContextBuilder {
        ViewProcessingContextBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn market_data(&self) -> &Arc<dyn MarketDataProvider> {
        &self.market_data
    }

    pub fn functions(&self) -> &Arc<FunctionRepository> {
        &self.functions
    }

    pub fn resolver(&self) -> &Arc<FunctionResolver> {
        &self.resolver
    }

    pub fn targets(&self) -> &Arc<dyn ComputationTargetResolver> {
        &self.targets
    }

    pub fn cache_source(&self) -> &ComputationCacheSource {
        &self.cache_source
    }

    pub fn dispatcher(&self) -> &Arc<JobDispatcher> {
        &self.dispatcher
    }

    /// The channel calculation nodes read cached inputs through.
    pub fn query(&self) -> &Arc<dyn CalculationNodeQuery> {
        &self.query
    }

    pub fn compilation(&self) -> &Arc<CompilationContext> {
        &self.compilation
    }

    pub fn pool(&self) -> &Arc<rayon::ThreadPool> {
        &self.pool
    }
}

/// Collects the collaborators of a [`ViewProcessingContext`].
///
/// Market data, functions, targets and the cache source are required. The
/// resolver, pool, query channel and calculation nodes default to in-process
/// ones derived from the configuration.
#[derive(Default)]
pub struct ViewProcessingContextBuilder {
    config: EngineConfig,
    market_data: Option<Arc<dyn MarketDataProvider>>,
    functions: Option<Arc<FunctionRepository>>,
    resolver: Option<Arc<FunctionResolver>>,
    targets: Option<Arc<dyn ComputationTargetResolver>>,
    cache_source: Option<ComputationCacheSource>,
    query: Option<Arc<dyn CalculationNodeQuery>>,
    nodes: Vec<Arc<dyn CalculationNode>>,
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl ViewProcessingContextBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn market_data(mut self, market_data: Arc<dyn MarketDataProvider>) -> Self {
        self.market_data = Some(market_data);
        self
    }

    pub fn functions(mut self, functions: Arc<FunctionRepository>) -> Self {
        self.functions = Some(functions);
        self
    }

    pub fn resolver(mut self, resolver: Arc<FunctionResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn targets(mut self, targets: Arc<dyn ComputationTargetResolver>) -> Self {
        self.targets = Some(targets);
        self
    }

    pub fn cache_source(mut self, cache_source: ComputationCacheSource) -> Self {
        self.cache_source = Some(cache_source);
        self
    }

    pub fn query(mut self, query: Arc<dyn CalculationNodeQuery>) -> Self {
        self.query = Some(query);
        self
    }

    /// Adds a calculation node. Without any, a single local node is used.
    pub fn calculation_node(mut self, node: Arc<dyn CalculationNode>) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn pool(mut self, pool: Arc<rayon::ThreadPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn build(self) -> Result<ViewProcessingContext, ContextError> {
        let config = self.config;
        let market_data = self.market_data.ok_or(ContextError::Missing("market data provider"))?;
        let functions = self.functions.ok_or(ContextError::Missing("function repository"))?;
        let targets = self.targets.ok_or(ContextError::Missing("computation target resolver"))?;
        let cache_source = self.cache_source.ok_or(ContextError::Missing("computation cache source"))?;

        let resolver = match self.resolver {
            Some(resolver) => resolver,
            None => {
                let priorities = PriorityRules::from_config(&config.priorities)?;
                Arc::new(FunctionResolver::new(&functions, &priorities))
            }
        };

        let pool = match self.pool {
            Some(pool) => pool,
            None => Arc::new(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(config.threads)
                    .thread_name(|index| format!("keisan-{index}"))
                    .build()?,
            ),
        };

        let query = self
            .query
            .unwrap_or_else(|| Arc::new(cache_source.clone()) as Arc<dyn CalculationNodeQuery>);

        let mut nodes = self.nodes;
        if nodes.is_empty() {
            nodes.push(Arc::new(LocalCalculationNode::new(
                "local-0",
                Arc::clone(&functions),
                Arc::clone(&targets),
                Arc::clone(cache_source.identifiers()),
                Arc::clone(&query),
            )));
        }

        let dispatcher = JobDispatcher::new(Arc::clone(&pool), nodes)
            .with_timeout(config.job_timeout())
            .with_max_job_items(config.max_job_items);

        let compilation = CompilationContext::new(
            Arc::clone(&functions),
            Arc::clone(&resolver),
            Arc::clone(&market_data),
        )
        .with_max_depth(config.max_depth);

        tracing::debug!(
            "context ready: {} functions, {} calculation nodes, {} threads",
            functions.len(),
            dispatcher.nodes().len(),
            pool.current_num_threads()
        );

        Ok(ViewProcessingContext {
            config,
            market_data,
            functions,
            resolver,
            targets,
            cache_source,
            dispatcher: Arc::new(dispatcher),
            query,
            compilation: Arc::new(compilation),
            pool,
        })
    }
}
