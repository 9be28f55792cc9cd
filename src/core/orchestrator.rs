//! Main orchestrator for graph execution.
//!
//! Schedules a [`DependencyGraph`] onto the tokio runtime:
//! - nodes with no unfinished dependencies are dispatched concurrently,
//!   bounded by the configured concurrency limit
//! - a success resolves the node's output cells and releases its dependents
//! - a failure (after retries) fails the node's cells and skips every
//!   transitive dependent, while unaffected branches keep running
//! - cancellation stops new dispatch and waits for running nodes
//!
//! Teardown runs the same loop over reversed edges. Every transition is
//! written to the attached journal, if any.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use petgraph::Direction;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::domain::{
    ApplyEvent, ApplyKind, ApplyReport, DeploymentState, ErrorKind, EventType, Inputs, NodeError,
    NodeReport, NodeState, Operation, Outputs, ResourceRecord, Verdict,
};
use crate::provisioners::ProvisionError;

use super::cell::CellStatus;
use super::graph::DependencyGraph;
use super::journal::{idempotency_key, Journal};
use super::resource::ResourceNode;
use super::retry::RetryPolicy;

/// Main graph orchestrator
pub struct Orchestrator {
    config: EngineConfig,
    journal: Option<Arc<Journal>>,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Orchestrator {
    /// Create an orchestrator with the given settings
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            journal: None,
        }
    }

    /// Record every transition to `journal`
    pub fn with_journal(mut self, journal: Arc<Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Apply a graph with no recorded state
    pub async fn apply(&self, graph: &DependencyGraph) -> ApplyReport {
        self.apply_with(graph, &DeploymentState::default(), CancellationToken::new())
            .await
    }

    /// Apply a graph against recorded deployment state.
    ///
    /// Nodes whose inputs match their record are left unchanged; recorded
    /// nodes with different inputs are updated; the rest are created.
    #[instrument(skip_all, fields(graph = %graph.name()))]
    pub async fn apply_with(
        &self,
        graph: &DependencyGraph,
        state: &DeploymentState,
        cancel: CancellationToken,
    ) -> ApplyReport {
        self.execute(graph, ApplyKind::Apply, state, cancel).await
    }

    /// Tear down recorded resources, dependents before dependencies
    #[instrument(skip_all, fields(graph = %graph.name()))]
    pub async fn destroy(
        &self,
        graph: &DependencyGraph,
        state: &DeploymentState,
        cancel: CancellationToken,
    ) -> ApplyReport {
        self.execute(graph, ApplyKind::Destroy, state, cancel).await
    }

    async fn execute(
        &self,
        graph: &DependencyGraph,
        kind: ApplyKind,
        state: &DeploymentState,
        cancel: CancellationToken,
    ) -> ApplyReport {
        let apply_id = Uuid::new_v4();
        let started_at = Utc::now();
        let recorder = Recorder {
            apply_id,
            journal: self.journal.clone(),
        };

        info!(%apply_id, ?kind, nodes = graph.len(), "Starting apply");
        recorder
            .record(ApplyEvent::new(
                apply_id,
                None,
                EventType::ApplyStarted,
                format!("{:?} of '{}' started ({} nodes)", kind, graph.name(), graph.len()),
            ))
            .await;

        let mut run = Scheduler::new(graph, kind, recorder.clone());
        if kind == ApplyKind::Apply {
            if let Some(cell) = spent_cell(graph) {
                error!(%cell, "Graph was already applied; nothing dispatched");
                run.reject(NodeError::new(
                    ErrorKind::DoubleResolution,
                    format!(
                        "output '{}' was resolved by an earlier apply; rebuild the graph to apply again",
                        cell
                    ),
                ));
            }
        }
        let limit = self.config.concurrency_limit.filter(|&n| n > 0);
        let mut tasks: JoinSet<Completion> = JoinSet::new();
        let mut aborted = false;

        loop {
            if !aborted && cancel.is_cancelled() {
                aborted = true;
                warn!("Apply cancelled; waiting for running nodes");
            }

            if !aborted {
                while limit.map_or(true, |max| tasks.len() < max) {
                    let Some(index) = run.ready.pop_front() else {
                        break;
                    };
                    let job = self.job(graph, kind, state, index, recorder.clone());
                    run.mark_running(index);
                    spawn_job(&mut tasks, job);
                }
            }

            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled(), if !aborted => {
                    aborted = true;
                    warn!(running = tasks.len(), "Apply cancelled; waiting for running nodes");
                }
                Some(joined) = tasks.join_next() => match joined {
                    Ok(completion) => run.complete(completion).await,
                    Err(e) => error!(error = %e, "Node task ended without reporting"),
                },
                else => break,
            }
        }

        run.finish(aborted).await;

        let verdict = if aborted {
            Verdict::Aborted
        } else if run
            .reports
            .iter()
            .all(|r| r.state == NodeState::Succeeded)
        {
            Verdict::Succeeded
        } else {
            Verdict::Failed
        };

        let (event_type, summary) = match verdict {
            Verdict::Succeeded => (EventType::ApplyCompleted, "completed"),
            Verdict::Failed => (EventType::ApplyFailed, "failed"),
            Verdict::Aborted => (EventType::ApplyAborted, "aborted"),
        };
        let completed_at = Utc::now();
        let duration_ms = (completed_at - started_at).num_milliseconds().max(0) as u64;
        recorder
            .record(
                ApplyEvent::new(
                    apply_id,
                    None,
                    event_type,
                    format!("{:?} of '{}' {}", kind, graph.name(), summary),
                )
                .with_duration(duration_ms),
            )
            .await;

        match verdict {
            Verdict::Succeeded => info!(%apply_id, duration_ms, "Apply completed successfully"),
            Verdict::Failed => error!(
                %apply_id,
                failed = run.count(NodeState::Failed),
                skipped = run.count(NodeState::Skipped),
                "Apply failed"
            ),
            Verdict::Aborted => warn!(%apply_id, "Apply aborted"),
        }

        ApplyReport {
            apply_id,
            name: graph.name().to_string(),
            kind,
            verdict,
            started_at,
            completed_at,
            nodes: run.reports,
        }
    }

    fn job(
        &self,
        graph: &DependencyGraph,
        kind: ApplyKind,
        state: &DeploymentState,
        index: usize,
        recorder: Recorder,
    ) -> Job {
        let node = graph.nodes()[index].clone();
        Job {
            index,
            kind,
            record: state.get(node.id()).cloned(),
            timeout: node.timeout().or(self.config.default_timeout),
            retry: node
                .retry_policy()
                .cloned()
                .unwrap_or_else(|| self.config.retry_policy.clone()),
            node,
            recorder,
        }
    }
}

/// Writes journal events, logging rather than failing on I/O errors
#[derive(Clone)]
struct Recorder {
    apply_id: Uuid,
    journal: Option<Arc<Journal>>,
}

impl Recorder {
    async fn record(&self, event: ApplyEvent) {
        if let Some(ref journal) = self.journal {
            if let Err(e) = journal.append(&event).await {
                warn!(error = %e, event = ?event.event_type, "Failed to write journal event");
            }
        }
    }

    fn event(&self, node: &ResourceNode, event_type: EventType, summary: String) -> ApplyEvent {
        ApplyEvent::new(self.apply_id, Some(node.id().clone()), event_type, summary)
    }
}

/// Bookkeeping for one apply
struct Scheduler<'g> {
    graph: &'g DependencyGraph,
    kind: ApplyKind,
    recorder: Recorder,
    /// Edges followed when a node finishes
    forward: Direction,
    /// Unfinished dependencies per node
    waiting: Vec<usize>,
    ready: VecDeque<usize>,
    reports: Vec<NodeReport>,
}

impl<'g> Scheduler<'g> {
    fn new(graph: &'g DependencyGraph, kind: ApplyKind, recorder: Recorder) -> Self {
        let (forward, backward) = match kind {
            ApplyKind::Apply => (Direction::Outgoing, Direction::Incoming),
            ApplyKind::Destroy => (Direction::Incoming, Direction::Outgoing),
        };
        let waiting = graph.degrees(backward);

        let mut reports: Vec<NodeReport> = graph
            .nodes()
            .iter()
            .map(|node| NodeReport::pending(node.id().clone(), node.provisioner().name()))
            .collect();

        let ready: VecDeque<usize> = (0..waiting.len()).filter(|&i| waiting[i] == 0).collect();
        for &i in &ready {
            reports[i].state = NodeState::Ready;
        }

        Self {
            graph,
            kind,
            recorder,
            forward,
            waiting,
            ready,
            reports,
        }
    }

    fn node(&self, index: usize) -> &'g ResourceNode {
        &self.graph.nodes()[index]
    }

    fn count(&self, state: NodeState) -> usize {
        self.reports.iter().filter(|r| r.state == state).count()
    }

    fn mark_running(&mut self, index: usize) {
        debug!(node = %self.node(index).id(), "Dispatching node");
        let report = &mut self.reports[index];
        report.state = NodeState::Running;
        report.started_at = Some(Utc::now());
    }

    async fn complete(&mut self, completion: Completion) {
        let index = completion.index;
        let node = self.node(index);

        {
            let report = &mut self.reports[index];
            report.operation = completion.operation;
            report.attempts = completion.attempts;
            report.finished_at = Some(Utc::now());
            report.duration_ms = Some(completion.duration_ms);
            report.inputs = completion.inputs.clone();
        }

        let outputs = match completion.result {
            Ok(outputs) => outputs,
            Err(error) => return self.fail(index, error).await,
        };

        if self.kind == ApplyKind::Apply {
            for (name, cell) in node.outputs() {
                let value = outputs.get(name).cloned().unwrap_or_default();
                if let Err(e) = cell.resolve(value) {
                    let error = NodeError::new(ErrorKind::DoubleResolution, e.to_string());
                    return self.fail(index, error).await;
                }
            }
        }

        let operation = completion.operation.unwrap_or(Operation::Create);
        let event = match self.kind {
            ApplyKind::Apply => {
                let mut event = self
                    .recorder
                    .event(
                        node,
                        EventType::NodeSucceeded,
                        format!("'{}' {} in {}ms", node.id(), operation, completion.duration_ms),
                    )
                    .with_operation(operation)
                    .with_duration(completion.duration_ms);
                if let (Some(key), Some(inputs)) = (completion.idempotency_key, completion.inputs) {
                    event = event.with_record(key, inputs, outputs.clone());
                }
                event
            }
            ApplyKind::Destroy => self
                .recorder
                .event(node, EventType::NodeDeleted, format!("'{}' {}", node.id(), operation))
                .with_operation(operation)
                .with_duration(completion.duration_ms),
        };
        self.recorder.record(event).await;

        info!(node = %node.id(), %operation, duration_ms = completion.duration_ms, "Node succeeded");

        let report = &mut self.reports[index];
        report.state = NodeState::Succeeded;
        if self.kind == ApplyKind::Apply {
            report.outputs = Some(outputs);
        }

        for next in self.graph.neighbors(index, self.forward) {
            self.waiting[next] = self.waiting[next].saturating_sub(1);
            if self.waiting[next] == 0 && self.reports[next].state == NodeState::Pending {
                self.reports[next].state = NodeState::Ready;
                self.ready.push_back(next);
            }
        }
    }

    async fn fail(&mut self, index: usize, error: NodeError) {
        let node = self.node(index);
        error!(node = %node.id(), error = %error, "Node failed");

        if self.kind == ApplyKind::Apply {
            for cell in node.outputs().values() {
                let _ = cell.fail(error.clone());
            }
        }

        let mut event = self
            .recorder
            .event(node, EventType::NodeFailed, format!("'{}' failed: {}", node.id(), error))
            .with_attempt(self.reports[index].attempts)
            .with_error(error.clone());
        if let Some(operation) = self.reports[index].operation {
            event = event.with_operation(operation);
        }
        self.recorder.record(event).await;

        let report = &mut self.reports[index];
        report.state = NodeState::Failed;
        report.finished_at.get_or_insert_with(Utc::now);
        report.error = Some(error);

        self.skip_dependents(index).await;
    }

    /// Breadth-first over dependents, recording the path back to `failed`
    async fn skip_dependents(&mut self, failed: usize) {
        let mut parent: Vec<Option<usize>> = vec![None; self.reports.len()];
        let mut visited = vec![false; self.reports.len()];
        visited[failed] = true;
        let mut queue = VecDeque::from([failed]);

        while let Some(current) = queue.pop_front() {
            for next in self.graph.neighbors(current, self.forward) {
                if visited[next] {
                    continue;
                }
                visited[next] = true;
                parent[next] = Some(current);
                queue.push_back(next);

                if !matches!(self.reports[next].state, NodeState::Pending | NodeState::Ready) {
                    continue;
                }

                let mut chain = vec![self.node(next).id().clone()];
                let mut cursor = parent[next];
                while let Some(p) = cursor {
                    chain.push(self.node(p).id().clone());
                    cursor = parent[p];
                }
                chain.reverse();

                self.skip(next, NodeError::upstream(chain)).await;
            }
        }
    }

    async fn skip(&mut self, index: usize, error: NodeError) {
        let node = self.node(index);
        warn!(node = %node.id(), reason = %error.message, "Skipping node");

        if self.kind == ApplyKind::Apply {
            for cell in node.outputs().values() {
                let _ = cell.fail(error.clone());
            }
        }
        self.ready.retain(|&i| i != index);

        self.recorder
            .record(
                self.recorder
                    .event(node, EventType::NodeSkipped, format!("'{}' {}", node.id(), error.message))
                    .with_error(error.clone()),
            )
            .await;

        let report = &mut self.reports[index];
        report.state = NodeState::Skipped;
        report.finished_at = Some(Utc::now());
        report.error = Some(error);
    }

    /// Settle nodes the loop never finished
    /// Fail every node without dispatching anything
    fn reject(&mut self, error: NodeError) {
        self.ready.clear();
        for report in &mut self.reports {
            report.state = NodeState::Failed;
            report.error = Some(error.clone());
        }
    }

    async fn finish(&mut self, aborted: bool) {
        for index in 0..self.reports.len() {
            if self.reports[index].state == NodeState::Running {
                let error = NodeError::new(
                    ErrorKind::ProvisionerPermanent,
                    "node task ended without reporting a result",
                );
                self.fail(index, error).await;
            }
        }

        for index in 0..self.reports.len() {
            if matches!(self.reports[index].state, NodeState::Pending | NodeState::Ready) {
                let error = if aborted {
                    NodeError::aborted()
                } else {
                    NodeError::new(ErrorKind::Aborted, "node was never scheduled")
                };
                if self.kind == ApplyKind::Apply {
                    for cell in self.node(index).outputs().values() {
                        let _ = cell.fail(error.clone());
                    }
                }
                let report = &mut self.reports[index];
                report.state = NodeState::Pending;
                report.error = Some(error);
            }
        }
    }
}

/// Everything a node task needs, owned
struct Job {
    index: usize,
    kind: ApplyKind,
    node: ResourceNode,
    record: Option<ResourceRecord>,
    timeout: Option<Duration>,
    retry: RetryPolicy,
    recorder: Recorder,
}

/// What a node task reports back to the scheduler
struct Completion {
    index: usize,
    operation: Option<Operation>,
    attempts: u32,
    duration_ms: u64,
    inputs: Option<Inputs>,
    idempotency_key: Option<String>,
    result: Result<Outputs, NodeError>,
}

fn spawn_job(tasks: &mut JoinSet<Completion>, job: Job) {
    let index = job.index;
    tasks.spawn(async move {
        let start = Instant::now();
        // Inner task so a panicking provisioner still reports its node
        match tokio::spawn(run_job(job)).await {
            Ok(completion) => completion,
            Err(e) => Completion {
                index,
                operation: None,
                attempts: 0,
                duration_ms: start.elapsed().as_millis() as u64,
                inputs: None,
                idempotency_key: None,
                result: Err(NodeError::new(
                    ErrorKind::ProvisionerPermanent,
                    format!("provisioner task failed: {}", e),
                )),
            },
        }
    });
}

#[instrument(skip_all, fields(node = %job.node.id()))]
async fn run_job(job: Job) -> Completion {
    match job.kind {
        ApplyKind::Apply => run_apply(job).await,
        ApplyKind::Destroy => run_destroy(job).await,
    }
}

async fn run_apply(job: Job) -> Completion {
    let start = Instant::now();
    let node = &job.node;
    let mut completion = Completion {
        index: job.index,
        operation: None,
        attempts: 0,
        duration_ms: 0,
        inputs: None,
        idempotency_key: None,
        result: Ok(Outputs::new()),
    };

    let inputs = match node.resolve_inputs().await {
        Ok(inputs) => inputs,
        Err(error) => {
            completion.result = Err(error);
            return completion;
        }
    };
    let key = idempotency_key(node.id(), &inputs);

    let result = match job.record {
        Some(ref record) if record.idempotency_key == key && records_all_outputs(node, record) => {
            debug!("Inputs unchanged, reusing recorded outputs");
            completion.operation = Some(Operation::Unchanged);
            Ok(record.outputs.clone())
        }
        Some(ref record) => {
            completion.operation = Some(Operation::Update);
            let provisioner = node.provisioner().as_ref();
            let id = node.id();
            let inputs = &inputs;
            let (attempts, result) = call_with_retry(&job, Operation::Update, move || {
                provisioner.update(id, &record.inputs, &record.outputs, inputs)
            })
            .await;
            completion.attempts = attempts;
            result
        }
        None => {
            completion.operation = Some(Operation::Create);
            let provisioner = node.provisioner().as_ref();
            let id = node.id();
            let inputs = &inputs;
            let (attempts, result) =
                call_with_retry(&job, Operation::Create, move || provisioner.create(id, inputs)).await;
            completion.attempts = attempts;
            result
        }
    };

    completion.result = result.and_then(|outputs| check_declared_outputs(node, outputs));
    completion.duration_ms = start.elapsed().as_millis() as u64;
    completion.inputs = Some(inputs);
    completion.idempotency_key = Some(key);
    completion
}

async fn run_destroy(job: Job) -> Completion {
    let start = Instant::now();
    let node = &job.node;

    let (operation, attempts, result) = match job.record {
        None => {
            debug!("Nothing recorded, treating as absent");
            (Operation::Absent, 0, Ok(Outputs::new()))
        }
        Some(ref record) => {
            let provisioner = node.provisioner().as_ref();
            let id = node.id();
            let outputs = &record.outputs;
            let (attempts, result) =
                call_with_retry(&job, Operation::Delete, move || provisioner.delete(id, outputs)).await;
            (Operation::Delete, attempts, result.map(|()| Outputs::new()))
        }
    };

    Completion {
        index: job.index,
        operation: Some(operation),
        attempts,
        duration_ms: start.elapsed().as_millis() as u64,
        inputs: None,
        idempotency_key: None,
        result,
    }
}

/// Run a provisioner call under the job's timeout, retrying retryable
/// failures with backoff. Returns the attempt count and the final result.
async fn call_with_retry<T, F, Fut>(job: &Job, operation: Operation, mut call: F) -> (u32, Result<T, NodeError>)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProvisionError>>,
{
    let node = &job.node;
    job.recorder
        .record(
            job.recorder
                .event(node, EventType::NodeStarted, format!("Starting {} of '{}'", operation, node.id()))
                .with_operation(operation),
        )
        .await;

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let result = with_timeout(call(), job.timeout, operation).await;

        match result {
            Ok(value) => return (attempt, Ok(value)),
            Err(error) if error.kind.is_retryable() && job.retry.should_retry(attempt) => {
                let delay = job.retry.delay_for_attempt(attempt);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Node operation failed, retrying"
                );
                job.recorder
                    .record(
                        job.recorder
                            .event(
                                node,
                                EventType::NodeRetrying,
                                format!("'{}' {} failed, retrying in {:?}", node.id(), operation, delay),
                            )
                            .with_operation(operation)
                            .with_attempt(attempt)
                            .with_error(error),
                    )
                    .await;
                tokio::time::sleep(delay).await;
            }
            Err(error) => return (attempt, Err(error)),
        }
    }
}

async fn with_timeout<T, Fut>(call: Fut, timeout: Option<Duration>, operation: Operation) -> Result<T, NodeError>
where
    Fut: Future<Output = Result<T, ProvisionError>>,
{
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => {
                return Err(NodeError::new(
                    ErrorKind::Timeout,
                    format!("{} exceeded {:?}", operation, limit),
                ))
            }
        },
        None => call.await,
    };
    result.map_err(|e| NodeError::new(e.kind(), e.to_string()))
}

/// First output cell that is no longer pending, as `node.output`
fn spent_cell(graph: &DependencyGraph) -> Option<String> {
    graph
        .nodes()
        .iter()
        .flat_map(|node| node.outputs().values())
        .find(|cell| cell.status() != CellStatus::Pending)
        .map(|cell| cell.qualified_name())
}

fn records_all_outputs(node: &ResourceNode, record: &ResourceRecord) -> bool {
    node.outputs().keys().all(|name| record.outputs.contains_key(name))
}

fn check_declared_outputs(node: &ResourceNode, outputs: Outputs) -> Result<Outputs, NodeError> {
    let missing: Vec<&str> = node
        .outputs()
        .keys()
        .filter(|name| !outputs.contains_key(name.as_str()))
        .map(String::as_str)
        .collect();

    if missing.is_empty() {
        Ok(outputs)
    } else {
        Err(NodeError::new(
            ErrorKind::MissingOutput,
            format!(
                "provisioner '{}' did not return declared output(s): {}",
                node.provisioner().name(),
                missing.join(", ")
            ),
        ))
    }
}
