//! Job dispatch.
//!
//! The dispatcher splits a compiled graph into [`CalculationJob`]s, hands
//! them to [`CalculationNode`]s as soon as the jobs they depend on are done,
//! and writes every result into the computation cache. Jobs run on a rayon
//! pool; the dispatching thread only schedules and publishes.

mod local;
mod partition;
#[cfg(feature = "tokio")]
mod remote;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, channel};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::cache::{CacheEntry, CacheEpoch, ComputationCache, ComputationCacheSource};
use crate::diagnostics::JobExecution;
use crate::error::{CacheError, DispatchError};
use crate::graph::DependencyGraph;
use crate::identifier::ValueSpecificationId;
use crate::job::{CalculationJob, CalculationJobResult, FailureReason, JobId, JobItemResult};

pub use local::LocalCalculationNode;
pub use partition::{PlannedJob, partition};
#[cfg(feature = "tokio")]
pub use remote::{RemoteCalculationNode, Transport, TransportFuture, handle_request};

/// Something that executes calculation jobs.
///
/// Failures of individual items, including the node being unreachable, are
/// reported inside the returned result.
pub trait CalculationNode: Send + Sync {
    fn name(&self) -> &str;

    fn execute(&self, job: &CalculationJob) -> CalculationJobResult;
}

/// Read access to the computation cache for calculation nodes.
pub trait CalculationNodeQuery: Send + Sync {
    /// Entries of `ids` present in the cache. Fails with
    /// [`CacheError::StaleEpoch`] once the cache has moved past `epoch`.
    fn query(
        &self,
        epoch: CacheEpoch,
        ids: &[ValueSpecificationId],
    ) -> Result<HashMap<ValueSpecificationId, CacheEntry>, CacheError>;
}

impl CalculationNodeQuery for ComputationCacheSource {
    fn query(
        &self,
        epoch: CacheEpoch,
        ids: &[ValueSpecificationId],
    ) -> Result<HashMap<ValueSpecificationId, CacheEntry>, CacheError> {
        ComputationCacheSource::query(self, epoch, ids)
    }
}

/// Cooperative cancellation flag shared between a cycle and its owner.
///
/// Jobs already running are allowed to finish. Jobs not yet dispatched are
/// reported as [`FailureReason::Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct CycleCancellation(Arc<AtomicBool>);

impl CycleCancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What came out of dispatching one graph.
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    /// Values which were not computed, with the reason.
    pub failures: BTreeMap<ValueSpecificationId, FailureReason>,
    pub executions: Vec<JobExecution>,
    /// Number of planned jobs, including cancelled ones.
    pub jobs: usize,
    pub cancelled: bool,
    /// Set when the cache moved to a new epoch mid-dispatch. Results after
    /// that point were dropped.
    pub stale: bool,
}

/// Sends jobs to calculation nodes and publishes their results.
pub struct JobDispatcher {
    nodes: Vec<Arc<dyn CalculationNode>>,
    pool: Arc<rayon::ThreadPool>,
    job_timeout: Option<Duration>,
    max_job_items: usize,
    next_job: AtomicU64,
    next_node: AtomicUsize,
}

type Message = (usize, CalculationJobResult);

impl JobDispatcher {
    pub fn new(pool: Arc<rayon::ThreadPool>, nodes: Vec<Arc<dyn CalculationNode>>) -> Self {
        Self {
            nodes,
            pool,
            job_timeout: None,
            max_job_items: 64,
            next_job: AtomicU64::new(0),
            next_node: AtomicUsize::new(0),
        }
    }

    /// Jobs not answered within `timeout` fail with [`FailureReason::Timeout`].
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_max_job_items(mut self, max_job_items: usize) -> Self {
        self.max_job_items = max_job_items.max(1);
        self
    }

    pub fn nodes(&self) -> &[Arc<dyn CalculationNode>] {
        &self.nodes
    }

    fn pick_node(&self) -> &Arc<dyn CalculationNode> {
        let index = self.next_node.fetch_add(1, Ordering::Relaxed) % self.nodes.len();
        &self.nodes[index]
    }

    /// Executes every function node of `graph`, writing outputs into `cache`.
    ///
    /// A job becomes ready when all jobs producing its inputs have finished,
    /// whether they succeeded or not. Failed values are cached as failures,
    /// so consumers see them as missing inputs.
    pub fn dispatch(
        &self,
        graph: &DependencyGraph,
        cache: &ComputationCache,
        cancellation: &CycleCancellation,
    ) -> Result<DispatchOutcome, DispatchError> {
        if self.nodes.is_empty() {
            return Err(DispatchError::NoCalculationNodes);
        }

        let plan = partition(graph, cache.identifiers().as_ref(), self.max_job_items)?;
        if plan.is_empty() {
            return Ok(DispatchOutcome::default());
        }

        let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();
        let mut pending: Vec<usize> = Vec::with_capacity(plan.len());
        for (index, job) in plan.iter().enumerate() {
            for &dependency in &job.depends_on {
                dependents.entry(dependency).or_default().push(index);
            }
            pending.push(job.depends_on.len());
        }

        let root_span = tracing::span!(Level::INFO, "dispatching_jobs", view = graph.name());
        root_span.pb_set_length(plan.len() as u64);
        root_span.pb_set_style(&crate::utils::progress_style());
        root_span.pb_set_message(&format!("Computing {}...", graph.name()));
        let _enter = root_span.enter();

        let (sender, receiver) = channel::<Message>();
        let mut run = Run {
            dispatcher: self,
            view: graph.name(),
            cache,
            plan: &plan,
            dependents,
            pending,
            done: vec![false; plan.len()],
            completed: 0,
            in_flight: HashMap::new(),
            outcome: DispatchOutcome {
                jobs: plan.len(),
                ..Default::default()
            },
        };

        let mut ready: VecDeque<usize> = run
            .pending
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == 0)
            .map(|(index, _)| index)
            .collect();

        loop {
            while let Some(index) = ready.pop_front() {
                if cancellation.is_cancelled() {
                    run.outcome.cancelled = true;
                    run.cancel(index, &mut ready);
                    root_span.pb_inc(1);
                    continue;
                }
                run.spawn(index, &sender);
            }

            if run.completed == plan.len() {
                break;
            }
            if run.in_flight.is_empty() {
                return Err(DispatchError::Stalled(plan.len() - run.completed));
            }

            for (index, result) in run.receive(&receiver)? {
                run.finish(index, result, &mut ready)?;
                root_span.pb_inc(1);
            }
        }

        tracing::info!(
            "Dispatched {} jobs for '{}', {} values failed",
            plan.len(),
            graph.name(),
            run.outcome.failures.len()
        );

        Ok(run.outcome)
    }
}

struct InFlight {
    job: CalculationJob,
    node: String,
    start: Instant,
}

/// Scheduler state of a single [`JobDispatcher::dispatch`] call.
struct Run<'a> {
    dispatcher: &'a JobDispatcher,
    view: &'a str,
    cache: &'a ComputationCache,
    plan: &'a [PlannedJob],
    dependents: HashMap<usize, Vec<usize>>,
    pending: Vec<usize>,
    done: Vec<bool>,
    completed: usize,
    in_flight: HashMap<usize, InFlight>,
    outcome: DispatchOutcome,
}

impl Run<'_> {
    fn spawn(&mut self, index: usize, sender: &std::sync::mpsc::Sender<Message>) {
        let job = CalculationJob {
            id: JobId(self.dispatcher.next_job.fetch_add(1, Ordering::Relaxed)),
            view: self.view.to_string(),
            epoch: self.cache.epoch(),
            items: self.plan[index].items.clone(),
        };

        let node = Arc::clone(self.dispatcher.pick_node());
        tracing::debug!("sending {} ({} items) to {}", job.id, job.items.len(), node.name());

        self.in_flight.insert(
            index,
            InFlight {
                job: job.clone(),
                node: node.name().to_string(),
                start: Instant::now(),
            },
        );

        let sender = sender.clone();
        let style = crate::utils::job_style();
        self.dispatcher.pool.spawn(move || {
            let span = tracing::span!(Level::INFO, "job", id = job.id.0);
            span.pb_set_style(&style);
            span.pb_set_message(&format!("{} on {}", job.id, node.name()));
            let _enter = span.enter();

            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| node.execute(&job)))
                .unwrap_or_else(|_| {
                    CalculationJobResult::failed(
                        &job,
                        node.name(),
                        FailureReason::NodeUnreachable(String::from("calculation node panicked")),
                    )
                });
            // The dispatcher may have given up on this job already.
            let _ = sender.send((index, result));
        });
    }

    /// Waits for the next result, or for the earliest deadline to pass.
    fn receive(&mut self, receiver: &Receiver<Message>) -> Result<Vec<Message>, DispatchError> {
        let Some(timeout) = self.dispatcher.job_timeout else {
            return Ok(vec![receiver.recv().map_err(|_| DispatchError::ChannelClosed)?]);
        };

        let deadline = self
            .in_flight
            .values()
            .map(|flight| flight.start + timeout)
            .min()
            .unwrap_or_else(Instant::now);

        match receiver.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(message) => Ok(vec![message]),
            Err(RecvTimeoutError::Disconnected) => Err(DispatchError::ChannelClosed),
            Err(RecvTimeoutError::Timeout) => {
                let now = Instant::now();
                Ok(self
                    .in_flight
                    .iter()
                    .filter(|(_, flight)| flight.start + timeout <= now)
                    .map(|(index, flight)| {
                        tracing::warn!("{} on {} timed out", flight.job.id, flight.node);
                        (
                            *index,
                            CalculationJobResult::failed(&flight.job, &flight.node, FailureReason::Timeout),
                        )
                    })
                    .collect())
            }
        }
    }

    fn finish(
        &mut self,
        index: usize,
        result: CalculationJobResult,
        ready: &mut VecDeque<usize>,
    ) -> Result<(), DispatchError> {
        // Late answer to a job which already timed out.
        if self.done[index] {
            tracing::debug!("ignoring late result of {}", result.id);
            return Ok(());
        }
        let Some(flight) = self.in_flight.remove(&index) else {
            return Ok(());
        };

        let timed_out = result
            .items
            .iter()
            .any(|item| matches!(item, JobItemResult::Failure(FailureReason::Timeout)));

        let plan = self.plan;
        let planned = &plan[index];
        let mut failed_items = 0;
        for (position, item) in planned.items.iter().enumerate() {
            let outcome = result.items.get(position).cloned().unwrap_or_else(|| {
                JobItemResult::Failure(FailureReason::NodeUnreachable(format!(
                    "{} returned {} of {} results",
                    result.node,
                    result.items.len(),
                    planned.items.len()
                )))
            });

            let entries = match outcome {
                JobItemResult::Success(values) => {
                    let mut values: HashMap<_, _> = values.into_iter().collect();
                    let complete = item.outputs.iter().all(|id| values.contains_key(id));
                    if complete {
                        item.outputs
                            .iter()
                            .filter_map(|id| Some((*id, values.remove(id)?)))
                            .map(|(id, value)| Ok((id, CacheEntry::computed(value)?)))
                            .collect::<Result<Vec<_>, CacheError>>()?
                    } else {
                        failed_items += 1;
                        self.fail_outputs(item, FailureReason::FunctionFailed(format!(
                            "'{}' returned incomplete outputs",
                            item.function_id
                        )))
                    }
                }
                JobItemResult::Failure(reason) => {
                    failed_items += 1;
                    self.fail_outputs(item, reason)
                }
            };

            self.publish(entries);
        }

        self.outcome.executions.push(JobExecution {
            job: flight.job.id,
            node: flight.node,
            start: flight.start,
            duration: flight.start.elapsed(),
            reported: result.duration,
            items: planned.items.len(),
            failed_items,
            timed_out,
        });

        self.complete(index, ready);
        Ok(())
    }

    fn fail_outputs(
        &mut self,
        item: &crate::job::CalculationJobItem,
        reason: FailureReason,
    ) -> Vec<(ValueSpecificationId, CacheEntry)> {
        item.outputs
            .iter()
            .map(|id| {
                self.outcome.failures.insert(*id, reason.clone());
                (*id, CacheEntry::Failed(reason.clone()))
            })
            .collect()
    }

    fn publish(&mut self, entries: Vec<(ValueSpecificationId, CacheEntry)>) {
        if self.outcome.stale || entries.is_empty() {
            return;
        }

        match self.cache.put_entries(entries) {
            Ok(()) => {}
            Err(CacheError::StaleEpoch { written, current }) => {
                tracing::warn!(
                    "cache moved from epoch {} to {} during '{}', dropping results",
                    written.0,
                    current.0,
                    self.view
                );
                self.outcome.stale = true;
            }
            Err(error) => tracing::warn!("could not publish results for '{}': {error}", self.view),
        }
    }

    /// Gives up on a job which has not been dispatched.
    fn cancel(&mut self, index: usize, ready: &mut VecDeque<usize>) {
        for id in self.plan[index].outputs() {
            self.outcome.failures.insert(id, FailureReason::Cancelled);
        }
        self.complete(index, ready);
    }

    fn complete(&mut self, index: usize, ready: &mut VecDeque<usize>) {
        self.done[index] = true;
        self.completed += 1;

        if let Some(dependents) = self.dependents.get(&index) {
            for &dependent in dependents {
                self.pending[dependent] -= 1;
                if self.pending[dependent] == 0 {
                    ready.push_back(dependent);
                }
            }
        }
    }
}
