use crate::aggregate::{aggregate, AggregateFunctions, AggregateInput};
use crate::dispatch::{Dispatcher, ResolvedInputs};
use crate::retry::{decide, RetryDecision};
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use orchcore::{
    AggregationStrategy, ConfigurationError, EventBus, ExecutionEvent, FailureKind, FailurePolicy,
    FlowError, NodeError, NodeId, NodeKind, NodeRunState, NodeSpec, NodeStatus, ReferenceError,
    RunError, RunId, RunResult, RunStatus, SkipReason, Value, VariableStore, WorkflowGraph,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Settings for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Upper bound on concurrently running dispatches.
    pub max_parallel_nodes: usize,
    pub failure_policy: FailurePolicy,
    /// Per-attempt timeout for nodes that do not set their own.
    pub default_timeout_ms: Option<u64>,
    /// How long an interrupted dispatch may take to wind down before it is abandoned.
    pub cancel_grace_ms: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: 10,
            failure_policy: FailurePolicy::FailFast,
            default_timeout_ms: None,
            cancel_grace_ms: 250,
        }
    }
}

impl RunConfig {
    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_max_parallel(mut self, max_parallel_nodes: usize) -> Self {
        self.max_parallel_nodes = max_parallel_nodes;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_parallel_nodes == 0 {
            return Err(ConfigurationError::InvalidSetting {
                field: "max_parallel_nodes",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }
}

/// Executes validated workflow graphs with bounded parallelism
pub struct WorkflowExecutor {
    config: RunConfig,
    functions: Arc<AggregateFunctions>,
    events: Option<Arc<EventBus>>,
}

impl WorkflowExecutor {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            functions: Arc::new(AggregateFunctions::new()),
            events: None,
        }
    }

    pub fn with_functions(mut self, functions: Arc<AggregateFunctions>) -> Self {
        self.functions = functions;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Execute `graph` to completion.
    ///
    /// Node failures are captured in the returned [`RunResult`]; `Err` is
    /// reserved for an invalid executor configuration.
    pub async fn run(
        &self,
        graph: Arc<WorkflowGraph>,
        initial_context: BTreeMap<String, Value>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<RunResult, FlowError> {
        self.run_with_cancellation(graph, initial_context, dispatcher, CancellationToken::new())
            .await
    }

    /// Execute `graph`, stopping early once `cancel` fires.
    pub async fn run_with_cancellation(
        &self,
        graph: Arc<WorkflowGraph>,
        initial_context: BTreeMap<String, Value>,
        dispatcher: Arc<dyn Dispatcher>,
        cancel: CancellationToken,
    ) -> Result<RunResult, FlowError> {
        self.run_with_id(RunId::new_v4(), graph, initial_context, dispatcher, cancel)
            .await
    }

    pub async fn run_with_id(
        &self,
        run_id: RunId,
        graph: Arc<WorkflowGraph>,
        initial_context: BTreeMap<String, Value>,
        dispatcher: Arc<dyn Dispatcher>,
        cancel: CancellationToken,
    ) -> Result<RunResult, FlowError> {
        self.config.validate()?;
        let start_time = Instant::now();

        tracing::info!(
            run_id = %run_id,
            graph = graph.name(),
            nodes = graph.len(),
            policy = ?self.config.failure_policy,
            "Starting run"
        );

        let mut run = Run {
            run_id,
            graph: graph.clone(),
            config: &self.config,
            functions: &self.functions,
            events: self.events.as_deref(),
            states: graph
                .nodes()
                .map(|n| (n.id.clone(), NodeRunState::default()))
                .collect(),
            store: VariableStore::new(initial_context),
            ready: BTreeSet::new(),
            errors: Vec::new(),
            halt: cancel.child_token(),
            halted: false,
            cancelled: false,
            in_flight: 0,
        };

        run.emit(ExecutionEvent::RunStarted {
            run_id,
            graph: graph.name().to_string(),
            nodes: graph.len(),
            timestamp: Utc::now(),
        });

        let mut running: FuturesUnordered<JoinHandle<Completion>> = FuturesUnordered::new();

        loop {
            if !run.cancelled && cancel.is_cancelled() {
                run.observe_cancel();
            }

            let mut progressed = run.refresh();
            if run.halted {
                progressed |= run.skip_ready();
            } else {
                progressed |= run.dispatch_ready(&mut running, &dispatcher);
            }

            if running.is_empty() {
                if progressed {
                    continue;
                }
                break;
            }

            tokio::select! {
                _ = cancel.cancelled(), if !run.cancelled => {
                    run.observe_cancel();
                }
                Some(joined) = running.next() => {
                    let completion = joined
                        .map_err(|e| FlowError::Execution(format!("Task join error: {}", e)))?;
                    run.complete(completion, &mut running);
                }
            }
        }

        run.settle_remaining();

        let status = if run.cancelled {
            RunStatus::Cancelled
        } else if run.states.values().any(|s| s.status == NodeStatus::Failed) {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };
        let duration_ms = start_time.elapsed().as_millis() as u64;

        tracing::info!(run_id = %run_id, ?status, duration_ms, "Run finished");
        run.emit(ExecutionEvent::RunCompleted {
            run_id,
            status,
            duration_ms,
            timestamp: Utc::now(),
        });

        Ok(RunResult {
            run_id,
            graph: graph.name().to_string(),
            status,
            variables: run.store.snapshot(),
            node_states: run.states,
            errors: run.errors,
            duration_ms,
        })
    }
}

/// Message returned by every spawned task back to the executor loop.
enum Completion {
    Attempt {
        node_id: NodeId,
        outcome: Result<Value, NodeError>,
        elapsed: Duration,
    },
    Backoff {
        node_id: NodeId,
        interrupted: bool,
    },
}

enum Readiness {
    Wait,
    Eligible,
    Skip(SkipReason),
}

/// Mutable state of one run. Only the executor loop touches it.
struct Run<'a> {
    run_id: RunId,
    graph: Arc<WorkflowGraph>,
    config: &'a RunConfig,
    functions: &'a AggregateFunctions,
    events: Option<&'a EventBus>,
    states: BTreeMap<NodeId, NodeRunState>,
    store: VariableStore,
    ready: BTreeSet<NodeId>,
    errors: Vec<RunError>,
    /// Child of the caller's token; fired on cancellation and on fail-fast.
    halt: CancellationToken,
    halted: bool,
    cancelled: bool,
    in_flight: usize,
}

impl Run<'_> {
    fn emit(&self, event: ExecutionEvent) {
        if let Some(bus) = self.events {
            bus.emit(event);
        }
    }

    fn state_mut(&mut self, id: &str) -> &mut NodeRunState {
        self.states.entry(id.to_string()).or_default()
    }

    fn status(&self, id: &str) -> NodeStatus {
        self.states
            .get(id)
            .map(|s| s.status)
            .unwrap_or(NodeStatus::Pending)
    }

    fn halt_reason(&self) -> SkipReason {
        if self.cancelled {
            SkipReason::Cancelled
        } else {
            SkipReason::Halted
        }
    }

    fn observe_cancel(&mut self) {
        tracing::warn!(run_id = %self.run_id, in_flight = self.in_flight, "Run cancelled");
        self.cancelled = true;
        self.halted = true;
        self.halt.cancel();
        self.errors.push(RunError {
            node_id: None,
            kind: FailureKind::Cancelled,
            message: "run cancelled".to_string(),
        });
    }

    /// One readiness pass in topological order. Returns whether any node moved.
    fn refresh(&mut self) -> bool {
        let mut progressed = false;
        let order: Vec<NodeId> = self.graph.topological_order().to_vec();

        for id in order {
            if self.status(&id) != NodeStatus::Pending {
                continue;
            }
            let Some(node) = self.graph.node(&id).cloned() else {
                continue;
            };

            match self.readiness(&node) {
                Readiness::Wait => continue,
                Readiness::Skip(reason) => self.skip(&id, reason),
                Readiness::Eligible if self.halted => self.skip(&id, self.halt_reason()),
                Readiness::Eligible => match &node.kind {
                    NodeKind::Aggregator { strategy } => self.run_aggregator(&node, strategy),
                    NodeKind::Conditional { predicate } => match predicate.evaluate(&self.store) {
                        Ok(true) => self.mark_ready(&id),
                        Ok(false) => self.skip(&id, SkipReason::ConditionFalse),
                        Err(e) => {
                            self.state_mut(&id).attempts += 1;
                            self.fail(&id, NodeError::Reference(e));
                        }
                    },
                    _ => self.mark_ready(&id),
                },
            }
            progressed = true;
        }

        progressed
    }

    fn readiness(&self, node: &NodeSpec) -> Readiness {
        let mut all_terminal = true;
        let mut failed_dep = None;
        let mut skipped_dep = None;

        for dep in &node.depends_on {
            match self.status(dep) {
                NodeStatus::Succeeded => {}
                NodeStatus::Failed => {
                    failed_dep.get_or_insert_with(|| dep.clone());
                }
                NodeStatus::Skipped => {
                    skipped_dep.get_or_insert_with(|| dep.clone());
                }
                _ => all_terminal = false,
            }
        }

        // Aggregators join on every dependency and tolerate individual losses.
        if node.kind.aggregation().is_some() {
            return if all_terminal {
                Readiness::Eligible
            } else {
                Readiness::Wait
            };
        }

        if let Some(node) = failed_dep {
            return Readiness::Skip(SkipReason::UpstreamFailed { node });
        }
        if let Some(node) = skipped_dep {
            return Readiness::Skip(SkipReason::UpstreamSkipped { node });
        }
        if all_terminal {
            Readiness::Eligible
        } else {
            Readiness::Wait
        }
    }

    fn mark_ready(&mut self, id: &str) {
        self.state_mut(id).status = NodeStatus::Ready;
        self.ready.insert(id.to_string());
    }

    fn skip(&mut self, id: &str, reason: SkipReason) {
        tracing::debug!(run_id = %self.run_id, node_id = id, ?reason, "Node skipped");
        self.state_mut(id).skip(reason.clone());
        self.emit(ExecutionEvent::NodeSkipped {
            run_id: self.run_id,
            node_id: id.to_string(),
            reason,
            timestamp: Utc::now(),
        });
    }

    fn skip_ready(&mut self) -> bool {
        let ready = std::mem::take(&mut self.ready);
        let progressed = !ready.is_empty();
        let reason = self.halt_reason();
        for id in ready {
            self.skip(&id, reason.clone());
        }
        progressed
    }

    fn succeed(&mut self, id: &str, value: Value) {
        if let Err(e) = self.store.publish(id, value) {
            tracing::error!(run_id = %self.run_id, "{}", e);
        }
        let state = self.state_mut(id);
        state.status = NodeStatus::Succeeded;
        let (attempts, duration_ms) = (state.attempts, state.duration_ms);

        tracing::info!("Node {} succeeded after {} attempt(s) in {}ms", id, attempts, duration_ms);
        self.emit(ExecutionEvent::NodeSucceeded {
            run_id: self.run_id,
            node_id: id.to_string(),
            attempts,
            duration_ms,
            timestamp: Utc::now(),
        });
    }

    fn fail(&mut self, id: &str, err: NodeError) {
        tracing::error!("Node {} failed: {}", id, err);

        let state = self.state_mut(id);
        state.status = NodeStatus::Failed;
        state.record_error(&err);
        self.errors.push(RunError {
            node_id: Some(id.to_string()),
            kind: err.kind(),
            message: err.to_string(),
        });
        self.emit(ExecutionEvent::NodeFailed {
            run_id: self.run_id,
            node_id: id.to_string(),
            error: err.to_string(),
            timestamp: Utc::now(),
        });

        if self.config.failure_policy == FailurePolicy::FailFast && !self.halted {
            tracing::warn!(run_id = %self.run_id, node_id = id, "Fail-fast: halting run");
            self.halted = true;
            self.halt.cancel();
        }
    }

    fn run_aggregator(&mut self, node: &NodeSpec, strategy: &AggregationStrategy) {
        let inputs: Vec<AggregateInput> = node
            .depends_on
            .iter()
            .map(|dep| AggregateInput {
                node_id: dep.clone(),
                value: self.store.output(dep).cloned(),
                status: self.status(dep),
            })
            .collect();

        let started = Instant::now();
        let result = aggregate(strategy, &inputs, self.functions);
        let state = self.state_mut(&node.id);
        state.attempts += 1;
        state.duration_ms += started.elapsed().as_millis() as u64;

        match result {
            Ok(value) => self.succeed(&node.id, value),
            Err(e) => self.fail(&node.id, NodeError::Aggregation(e)),
        }
    }

    /// Dispatch ready nodes in ascending id order up to the parallelism limit.
    fn dispatch_ready(
        &mut self,
        running: &mut FuturesUnordered<JoinHandle<Completion>>,
        dispatcher: &Arc<dyn Dispatcher>,
    ) -> bool {
        let mut progressed = false;

        while self.in_flight < self.config.max_parallel_nodes && !self.halted {
            let Some(id) = self.ready.pop_first() else {
                break;
            };
            let Some(node) = self.graph.node(&id).cloned() else {
                continue;
            };
            progressed = true;

            let state = self.state_mut(&id);
            state.attempts += 1;
            let attempt = state.attempts;

            // Inputs are read now, after every dependency has published.
            let inputs = match resolve_inputs(&node, &self.store) {
                Ok(inputs) => inputs,
                Err(e) => {
                    self.fail(&id, NodeError::Reference(e));
                    continue;
                }
            };

            self.state_mut(&id).status = NodeStatus::Running;
            tracing::debug!(
                run_id = %self.run_id,
                node_id = %id,
                attempt,
                kind = %node.tag(),
                "Dispatching node"
            );
            self.emit(ExecutionEvent::NodeStarted {
                run_id: self.run_id,
                node_id: id.clone(),
                kind: node.tag(),
                attempt,
                timestamp: Utc::now(),
            });

            let timeout = node
                .timeout_ms
                .or(self.config.default_timeout_ms)
                .map(Duration::from_millis);
            let grace = Duration::from_millis(self.config.cancel_grace_ms);

            running.push(tokio::spawn(run_attempt(
                node,
                inputs,
                dispatcher.clone(),
                self.halt.child_token(),
                timeout,
                grace,
            )));
            self.in_flight += 1;
        }

        progressed
    }

    fn complete(
        &mut self,
        completion: Completion,
        running: &mut FuturesUnordered<JoinHandle<Completion>>,
    ) {
        match completion {
            Completion::Attempt {
                node_id,
                outcome,
                elapsed,
            } => {
                self.in_flight -= 1;
                self.state_mut(&node_id).duration_ms += elapsed.as_millis() as u64;

                match outcome {
                    Ok(value) => self.succeed(&node_id, value),
                    Err(NodeError::Cancelled) => self.skip(&node_id, self.halt_reason()),
                    Err(err) => self.retry_or_fail(&node_id, err, running),
                }
            }
            Completion::Backoff {
                node_id,
                interrupted,
            } => {
                if interrupted || self.halted {
                    self.skip(&node_id, self.halt_reason());
                } else {
                    self.mark_ready(&node_id);
                }
            }
        }
    }

    fn retry_or_fail(
        &mut self,
        id: &str,
        err: NodeError,
        running: &mut FuturesUnordered<JoinHandle<Completion>>,
    ) {
        let Some(node) = self.graph.node(id).cloned() else {
            return;
        };
        let attempts = self.states.get(id).map(|s| s.attempts).unwrap_or(0);

        match decide(&node.retry, attempts, &err) {
            RetryDecision::RetryAfter(delay) if !self.halted => {
                tracing::warn!(
                    run_id = %self.run_id,
                    node_id = id,
                    attempt = attempts,
                    max_attempts = node.retry.max_attempts,
                    backoff_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying node"
                );
                let state = self.state_mut(id);
                state.status = NodeStatus::Retrying;
                state.record_error(&err);
                self.emit(ExecutionEvent::NodeRetrying {
                    run_id: self.run_id,
                    node_id: id.to_string(),
                    attempt: attempts,
                    delay_ms: delay.as_millis() as u64,
                    error: err.to_string(),
                    timestamp: Utc::now(),
                });
                running.push(tokio::spawn(backoff(id.to_string(), delay, self.halt.clone())));
            }
            _ => self.fail(id, err),
        }
    }

    /// Anything still unfinished once nothing is running can never run.
    fn settle_remaining(&mut self) {
        let reason = self.halt_reason();
        let leftover: Vec<NodeId> = self
            .states
            .iter()
            .filter(|(_, s)| !s.status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for id in leftover {
            self.skip(&id, reason.clone());
        }
    }
}

/// Resolve a node's bindings, upstream outputs and templates from the store.
fn resolve_inputs(
    node: &NodeSpec,
    store: &VariableStore,
) -> Result<ResolvedInputs, ReferenceError> {
    let mut inputs = ResolvedInputs::default();

    for (name, reference) in &node.inputs {
        inputs.values.insert(name.clone(), store.resolve(reference)?);
    }
    for dep in &node.depends_on {
        if let Some(value) = store.output(dep) {
            inputs.upstream.insert(dep.clone(), value.clone());
        }
    }

    match &node.kind {
        NodeKind::AgentCall { prompt, .. } => {
            inputs.prompt = Some(store.render(prompt, &inputs.values)?);
        }
        NodeKind::ToolCall { args, .. } => {
            for (key, value) in args {
                let rendered = match value {
                    Value::String(template) => store.interpolate(template, &inputs.values)?,
                    other => other.clone(),
                };
                inputs.args.insert(key.clone(), rendered);
            }
        }
        _ => {}
    }

    Ok(inputs)
}

/// One attempt of one node, raced against its timeout and the attempt token.
///
/// Timeout and cancellation take the same path: the token is fired and the
/// dispatch gets `grace` to return before it is dropped.
async fn run_attempt(
    node: Arc<NodeSpec>,
    inputs: ResolvedInputs,
    dispatcher: Arc<dyn Dispatcher>,
    token: CancellationToken,
    timeout: Option<Duration>,
    grace: Duration,
) -> Completion {
    let started = Instant::now();
    let node_id = node.id.clone();

    let dispatch =
        AssertUnwindSafe(dispatcher.dispatch(node, inputs, token.clone())).catch_unwind();
    tokio::pin!(dispatch);

    let deadline = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    // An attempt interrupted by the run halting never reports its own result.
    let interrupt = tokio::select! {
        biased;
        _ = token.cancelled() => NodeError::Cancelled,
        result = &mut dispatch => {
            let outcome = match result {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(NodeError::Dispatch(e)),
                Err(panic) => Err(NodeError::Panicked(panic_message(panic.as_ref()))),
            };
            return Completion::Attempt {
                node_id,
                outcome,
                elapsed: started.elapsed(),
            };
        }
        _ = &mut deadline => NodeError::Timeout {
            ms: timeout.map(|t| t.as_millis() as u64).unwrap_or_default(),
        },
    };

    token.cancel();
    if tokio::time::timeout(grace, &mut dispatch).await.is_err() {
        tracing::warn!(
            node_id = %node_id,
            "Dispatch did not stop within grace period; abandoning it"
        );
    }

    Completion::Attempt {
        node_id,
        outcome: Err(interrupt),
        elapsed: started.elapsed(),
    }
}

async fn backoff(node_id: NodeId, delay: Duration, halt: CancellationToken) -> Completion {
    let interrupted = tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = halt.cancelled() => true,
    };
    Completion::Backoff {
        node_id,
        interrupted,
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
