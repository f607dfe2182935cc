#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod core;
mod error;
mod utils;

pub mod cache;
pub mod context;
pub mod cycle;
pub mod diagnostics;
pub mod dispatch;
pub mod function;
pub mod graph;
pub mod identifier;
pub mod job;
pub mod market_data;
pub mod resolver;
pub mod target;
pub mod value;

#[cfg(test)]
mod testing;

pub use crate::core::{ComputedValue, Hash32};
pub use crate::error::*;
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;

pub use crate::cache::{ComputationCache, ComputationCacheSource};
pub use crate::context::{EngineConfig, ViewProcessingContext};
pub use crate::cycle::{ComputationCycle, CycleResult, ViewDefinition};
pub use crate::dispatch::{CalculationNode, CycleCancellation, JobDispatcher};
pub use crate::function::{FunctionDefinition, FunctionRepository};
pub use crate::graph::{DependencyGraph, DependencyGraphBuilder, NodeId};
pub use crate::identifier::{IdentifierMap, ValueSpecificationId};
pub use crate::value::{
    ComputationTargetSpecification, ComputationTargetType, ValueProperties, ValueRequirement,
    ValueSpecification,
};
