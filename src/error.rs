use thiserror::Error;

use crate::cache::CacheEpoch;
use crate::graph::NodeId;
use crate::identifier::ValueSpecificationId;
use crate::value::{ValueRequirement, ValueSpecification};

/// Contract violations while building or mutating a dependency graph. These
/// abort the construction operation that triggered them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Node {0:?} does not exist")]
    NodeNotFound(NodeId),

    #[error("Function already set on node {0:?}")]
    FunctionAlreadySet(NodeId),

    #[error("Node {0:?} has no function bound")]
    FunctionNotSet(NodeId),

    #[error("Output {value} of node {node:?} is still consumed by node {dependent:?}")]
    OutputStillReferenced {
        node: NodeId,
        value: ValueSpecification,
        dependent: NodeId,
    },

    #[error("Node {node:?} does not produce {value}")]
    OutputNotFound { node: NodeId, value: ValueSpecification },

    #[error("Node {node:?} does not consume {value}")]
    InputNotFound { node: NodeId, value: ValueSpecification },

    #[error("Market data node {0:?} cannot have input nodes")]
    LeafHasInputs(NodeId),

    #[error("Market data node {0:?} produces a single output")]
    LeafHasOutputs(NodeId),

    #[error("Node {0:?} cannot be its own input")]
    SelfLoop(NodeId),

    #[error("Cycle detected in dependency graph at node {0:?}")]
    Cycle(NodeId),
}

/// Why a requirement could not be turned into a node. Reported back to the
/// caller of graph construction; other requirements keep resolving.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolutionFailure {
    #[error("No function can produce {0}")]
    NoFunctions(ValueRequirement),

    #[error("Cyclic requirement chain through {0}")]
    Cycle(ValueRequirement),

    #[error("Requirement chain for {0} is too deep")]
    TooDeep(ValueRequirement),

    #[error("Function '{function}' rejected {requirement}")]
    RejectedByFunction {
        requirement: ValueRequirement,
        function: String,
    },

    #[error("Function '{function}' could not satisfy the inputs of {requirement}")]
    UnsatisfiedInputs {
        requirement: ValueRequirement,
        function: String,
        causes: Vec<ResolutionFailure>,
    },
}

impl ResolutionFailure {
    pub fn requirement(&self) -> &ValueRequirement {
        match self {
            ResolutionFailure::NoFunctions(requirement)
            | ResolutionFailure::Cycle(requirement)
            | ResolutionFailure::TooDeep(requirement)
            | ResolutionFailure::RejectedByFunction { requirement, .. }
            | ResolutionFailure::UnsatisfiedInputs { requirement, .. } => requirement,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("Identifier {0:?} was never issued")]
    NotFound(ValueSpecificationId),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Conflicting write for {0:?} in the same epoch")]
    Conflict(ValueSpecificationId),

    #[error("Write targets epoch {written:?}, but the cache is at {current:?}")]
    StaleEpoch {
        written: CacheEpoch,
        current: CacheEpoch,
    },

    #[error("Couldn't fingerprint value.\n{0}")]
    Fingerprint(#[from] serde_json::Error),
}

/// A required collaborator was not supplied to the processing context.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Missing required collaborator: {0}")]
    Missing(&'static str),

    #[error("Couldn't build the execution thread pool.\n{0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Invalid function priority pattern.\n{0}")]
    Priority(#[from] glob::PatternError),
}

/// Errors of the job wire format.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("Couldn't encode message.\n{0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("Couldn't decode message.\n{0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("No calculation nodes configured")]
    NoCalculationNodes,

    #[error("Job result channel closed unexpectedly")]
    ChannelClosed,

    #[error("No job can make progress, {0} jobs never became ready")]
    Stalled(usize),
}

/// Errors aborting a whole graph build.
#[derive(Debug, Error)]
pub enum CompilationError {
    #[error("Graph construction failed.\n{0}")]
    Graph(#[from] GraphError),
}

/// Errors aborting a whole processing cycle. Per-value execution failures are
/// never reported here, they are part of the cycle result.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Compilation(#[from] CompilationError),

    #[error("Error while dispatching jobs.\n{0}")]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Identifier(#[from] IdentifierError),
}
