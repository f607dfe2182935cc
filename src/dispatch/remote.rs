use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::dispatch::CalculationNode;
use crate::error::WireError;
use crate::job::{CalculationJob, CalculationJobResult, FailureReason};

pub type TransportFuture = Pin<Box<dyn Future<Output = anyhow::Result<Vec<u8>>> + Send>>;

/// Sends an encoded job to a remote node and resolves to the encoded answer.
pub type Transport = Arc<dyn Fn(Vec<u8>) -> TransportFuture + Send + Sync>;

/// A calculation node on the other side of a [`Transport`].
///
/// Jobs are encoded as CBOR. A failing transport fails every item of the job
/// with [`FailureReason::NodeUnreachable`], a slow one with
/// [`FailureReason::Timeout`].
pub struct RemoteCalculationNode {
    name: String,
    transport: Transport,
    timeout: Duration,
}

impl RemoteCalculationNode {
    pub fn new(name: impl Into<String>, transport: Transport, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            transport,
            timeout,
        }
    }

    async fn round_trip(&self, request: Vec<u8>) -> Result<Vec<u8>, FailureReason> {
        match tokio::time::timeout(self.timeout, (self.transport)(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(error)) => Err(FailureReason::NodeUnreachable(format!("{error:#}"))),
            Err(_) => Err(FailureReason::Timeout),
        }
    }

    fn call(&self, job: &CalculationJob) -> Result<CalculationJobResult, FailureReason> {
        let lost = |error: &dyn std::fmt::Display| FailureReason::NodeUnreachable(error.to_string());

        let request = job.to_cbor().map_err(|e| lost(&e))?;

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| lost(&e))?;

        let response = rt.block_on(self.round_trip(request))?;
        let result = CalculationJobResult::from_cbor(&response).map_err(|e| lost(&e))?;

        if result.id != job.id || result.items.len() != job.items.len() {
            return Err(FailureReason::NodeUnreachable(format!(
                "{} answered {} with {} items, expected {} with {}",
                self.name,
                result.id,
                result.items.len(),
                job.id,
                job.items.len()
            )));
        }

        Ok(result)
    }
}

impl CalculationNode for RemoteCalculationNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, job: &CalculationJob) -> CalculationJobResult {
        match self.call(job) {
            Ok(result) => result,
            Err(reason) => {
                tracing::warn!("{} on {} failed: {reason}", job.id, self.name);
                CalculationJobResult::failed(job, &self.name, reason)
            }
        }
    }
}

/// Serves one encoded job on the receiving end of a transport.
pub fn handle_request(node: &dyn CalculationNode, request: &[u8]) -> Result<Vec<u8>, WireError> {
    let job = CalculationJob::from_cbor(request)?;
    node.execute(&job).to_cbor()
}
