//! The calculation node wire contract.
//!
//! A [`CalculationJob`] lists the nodes to run, each as a function reference
//! plus the interned ids of its inputs and outputs. The answer is a
//! [`CalculationJobResult`] with one [`JobItemResult`] per item, in the same
//! order. Both travel as CBOR.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::CacheEpoch;
use crate::core::ComputedValue;
use crate::error::WireError;
use crate::function::FunctionParameters;
use crate::identifier::ValueSpecificationId;
use crate::value::ComputationTargetSpecification;

/// Correlation id of a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Why a value was not computed. Recorded in the cache in place of the value
/// and reported in the cycle result.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    #[error("Function failed: {0}")]
    FunctionFailed(String),

    #[error("Missing inputs {0:?}")]
    MissingInputs(Vec<ValueSpecificationId>),

    #[error("Calculation node did not respond in time")]
    Timeout,

    #[error("Calculation node unreachable: {0}")]
    NodeUnreachable(String),

    #[error("Target {0} could not be resolved")]
    TargetNotResolved(ComputationTargetSpecification),

    #[error("Function '{0}' is not known to the calculation node")]
    UnknownFunction(String),

    #[error("No market data for this value")]
    MarketDataUnavailable,

    #[error("Cycle was cancelled")]
    Cancelled,
}

/// One dependency node to execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationJobItem {
    /// Unique id of the function definition, without parameters.
    pub function_id: String,
    pub parameters: FunctionParameters,
    pub target: ComputationTargetSpecification,
    pub inputs: Vec<ValueSpecificationId>,
    pub outputs: Vec<ValueSpecificationId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationJob {
    pub id: JobId,
    /// Name of the view the job belongs to.
    pub view: String,
    /// Cache epoch the inputs are read from.
    pub epoch: CacheEpoch,
    /// Items in execution order: an item may consume outputs of earlier items.
    pub items: Vec<CalculationJobItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobItemResult {
    Success(Vec<(ValueSpecificationId, ComputedValue)>),
    Failure(FailureReason),
}

impl JobItemResult {
    pub fn is_success(&self) -> bool {
        matches!(self, JobItemResult::Success(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationJobResult {
    pub id: JobId,
    /// Name of the calculation node which ran the job.
    pub node: String,
    pub duration: Duration,
    pub items: Vec<JobItemResult>,
}

impl CalculationJobResult {
    /// A result failing every item of `job` for the same reason.
    pub fn failed(job: &CalculationJob, node: &str, reason: FailureReason) -> Self {
        Self {
            id: job.id,
            node: node.to_string(),
            duration: Duration::ZERO,
            items: job
                .items
                .iter()
                .map(|_| JobItemResult::Failure(reason.clone()))
                .collect(),
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    let mut buffer = Vec::new();
    ciborium::into_writer(value, &mut buffer)?;
    Ok(buffer)
}

impl CalculationJob {
    pub fn to_cbor(&self) -> Result<Vec<u8>, WireError> {
        encode(self)
    }

    pub fn from_cbor(bytes: &[u8]) -> Result<Self, WireError> {
        Ok(ciborium::from_reader(bytes)?)
    }
}

impl CalculationJobResult {
    pub fn to_cbor(&self) -> Result<Vec<u8>, WireError> {
        encode(self)
    }

    pub fn from_cbor(bytes: &[u8]) -> Result<Self, WireError> {
        Ok(ciborium::from_reader(bytes)?)
    }
}
