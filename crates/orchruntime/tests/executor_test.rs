// crates/orchruntime/tests/executor_test.rs

use async_trait::async_trait;
use orchcore::{
    AggregationStrategy, DispatchError, EventBus, ExecutionEvent, FailureKind, FailurePolicy,
    NodeKindTag, NodeSpec, NodeStatus, Predicate, RunStatus, SkipReason, Value, WorkflowGraph,
};
use orchruntime::{
    CancellationToken, DispatchTable, Dispatcher, FlowRuntime, ResolvedInputs, RunConfig,
    WorkflowExecutor,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// What the scripted dispatcher does for a given node id
#[derive(Clone)]
enum Script {
    /// Return the rendered prompt, or the node id when there is none.
    Echo,
    /// Sleep, then echo.
    Delay(u64),
    /// Wait until cancelled.
    Hang,
    /// Ignore cancellation and sleep.
    Stubborn(u64),
    FailTerminal,
    /// Fail retryably this many times, then echo.
    FailTimes(usize),
    /// Sleep on the first attempt, echo afterwards.
    SlowFirst(u64),
    Panic,
}

#[derive(Default)]
struct ScriptedDispatcher {
    scripts: HashMap<String, Script>,
    calls: Mutex<Vec<String>>,
    attempts: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedDispatcher {
    fn new(scripts: &[(&str, Script)]) -> Arc<Self> {
        Arc::new(Self {
            scripts: scripts
                .iter()
                .map(|(id, s)| (id.to_string(), s.clone()))
                .collect(),
            ..Default::default()
        })
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

fn echo(node: &NodeSpec, inputs: &ResolvedInputs) -> Result<Value, DispatchError> {
    Ok(Value::from(inputs.prompt.clone().unwrap_or_else(|| node.id.clone())))
}

#[async_trait]
impl Dispatcher for ScriptedDispatcher {
    async fn dispatch(
        &self,
        node: Arc<NodeSpec>,
        inputs: ResolvedInputs,
        cancel: CancellationToken,
    ) -> Result<Value, DispatchError> {
        self.calls.lock().unwrap().push(node.id.clone());
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let n = attempts.entry(node.id.clone()).or_insert(0);
            *n += 1;
            *n
        };
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let script = self.scripts.get(&node.id).cloned().unwrap_or(Script::Echo);
        let result = match script {
            Script::Echo => echo(&node, &inputs),
            Script::Delay(ms) => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                echo(&node, &inputs)
            }
            Script::Hang => {
                cancel.cancelled().await;
                Err(DispatchError::terminal("cancelled"))
            }
            Script::Stubborn(ms) => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                echo(&node, &inputs)
            }
            Script::FailTerminal => Err(DispatchError::terminal("bad request")),
            Script::FailTimes(n) if attempt <= n => Err(DispatchError::retryable("rate limited")),
            Script::FailTimes(_) => echo(&node, &inputs),
            Script::SlowFirst(ms) if attempt == 1 => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                echo(&node, &inputs)
            }
            Script::SlowFirst(_) => echo(&node, &inputs),
            Script::Panic => panic!("dispatcher exploded"),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

fn table(dispatcher: Arc<ScriptedDispatcher>) -> Arc<dyn Dispatcher> {
    Arc::new(
        DispatchTable::new()
            .with(NodeKindTag::AgentCall, dispatcher.clone())
            .with(NodeKindTag::ToolCall, dispatcher),
    )
}

fn graph(nodes: Vec<NodeSpec>) -> Arc<WorkflowGraph> {
    Arc::new(WorkflowGraph::build("test", nodes).expect("graph should validate"))
}

fn context(pairs: &[(&str, &str)]) -> BTreeMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Value::from(*v)))
        .collect()
}

fn executor(policy: FailurePolicy) -> WorkflowExecutor {
    WorkflowExecutor::new(RunConfig::default().with_policy(policy))
}

#[tokio::test]
async fn test_sequential_chain_threads_outputs() {
    let dispatcher = ScriptedDispatcher::new(&[]);
    let graph = graph(vec![
        NodeSpec::agent("a", "writer", "start {{ctx.topic}}"),
        NodeSpec::agent("b", "writer", "next {{previous}}")
            .depends_on(["a"])
            .with_input("previous", "a.output"),
        NodeSpec::agent("c", "writer", "last {{previous}}")
            .depends_on(["b"])
            .with_input("previous", "b.output"),
    ]);

    let result = executor(FailurePolicy::FailFast)
        .run(graph, context(&[("topic", "rust")]), table(dispatcher.clone()))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(dispatcher.calls(), vec!["a", "b", "c"]);
    assert_eq!(result.output("c"), Some(&Value::from("last next start rust")));
    assert_eq!(result.state("b").unwrap().attempts, 1);
}

#[tokio::test]
async fn test_ensemble_branches_run_concurrently_before_aggregation() {
    let dispatcher = ScriptedDispatcher::new(&[
        ("b1", Script::Delay(100)),
        ("b2", Script::Delay(100)),
        ("b3", Script::Delay(100)),
    ]);
    let graph = graph(vec![
        NodeSpec::passthrough("input").with_input("question", "ctx.question"),
        NodeSpec::tool("b1", "search").depends_on(["input"]),
        NodeSpec::tool("b2", "search").depends_on(["input"]),
        NodeSpec::tool("b3", "search").depends_on(["input"]),
        NodeSpec::aggregator("aggregate", AggregationStrategy::concat())
            .depends_on(["b1", "b2", "b3"]),
    ]);

    let started = Instant::now();
    let result = executor(FailurePolicy::FailFast)
        .run(graph, context(&[("question", "why")]), table(dispatcher.clone()))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(dispatcher.max_in_flight(), 3, "all branches should overlap");
    assert!(started.elapsed() < Duration::from_millis(280));
    assert_eq!(result.output("input"), Some(&Value::from("why")));
    assert_eq!(result.output("aggregate"), Some(&Value::from("b1\n\nb2\n\nb3")));
}

#[tokio::test]
async fn test_fail_fast_stops_dependents_of_failed_root() {
    let dispatcher = ScriptedDispatcher::new(&[("a", Script::FailTerminal)]);
    let graph = graph(vec![
        NodeSpec::tool("a", "fetch").with_retry(3, 0),
        NodeSpec::tool("b", "fetch").depends_on(["a"]),
        NodeSpec::tool("c", "fetch").depends_on(["a"]),
        NodeSpec::tool("d", "fetch").depends_on(["b"]),
    ]);

    let result = executor(FailurePolicy::FailFast)
        .run(graph, BTreeMap::new(), table(dispatcher.clone()))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(dispatcher.calls(), vec!["a"], "terminal errors are not retried");
    assert_eq!(result.status_of("a"), Some(NodeStatus::Failed));
    for id in ["b", "c", "d"] {
        assert_eq!(result.status_of(id), Some(NodeStatus::Skipped), "{} should be skipped", id);
    }
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].node_id.as_deref(), Some("a"));
}

#[tokio::test]
async fn test_fail_fast_cancels_in_flight_siblings() {
    let dispatcher = ScriptedDispatcher::new(&[("b", Script::FailTerminal), ("c", Script::Hang)]);
    let graph = graph(vec![
        NodeSpec::tool("a", "fetch"),
        NodeSpec::tool("b", "fetch").depends_on(["a"]),
        NodeSpec::tool("c", "fetch").depends_on(["a"]),
        NodeSpec::tool("d", "fetch").depends_on(["b"]),
    ]);

    let started = Instant::now();
    let result = executor(FailurePolicy::FailFast)
        .run(graph, BTreeMap::new(), table(dispatcher.clone()))
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.status_of("a"), Some(NodeStatus::Succeeded));
    assert_eq!(result.status_of("b"), Some(NodeStatus::Failed));
    assert_eq!(result.state("c").unwrap().skip_reason, Some(SkipReason::Halted));
    assert_eq!(result.status_of("d"), Some(NodeStatus::Skipped));
    assert!(!dispatcher.calls().contains(&"d".to_string()));
}

#[tokio::test]
async fn test_best_effort_keeps_independent_branches() {
    let dispatcher =
        ScriptedDispatcher::new(&[("b", Script::FailTerminal), ("c", Script::Delay(30))]);
    let graph = graph(vec![
        NodeSpec::tool("a", "fetch"),
        NodeSpec::tool("b", "fetch").depends_on(["a"]),
        NodeSpec::tool("c", "fetch").depends_on(["a"]),
        NodeSpec::tool("d", "fetch").depends_on(["b"]),
    ]);

    let result = executor(FailurePolicy::BestEffort)
        .run(graph, BTreeMap::new(), table(dispatcher.clone()))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.status_of("c"), Some(NodeStatus::Succeeded));
    assert_eq!(result.output("c"), Some(&Value::from("c")));
    assert_eq!(
        result.state("d").unwrap().skip_reason,
        Some(SkipReason::UpstreamFailed { node: "b".into() })
    );
    assert!(result.output("d").is_none());
}

#[tokio::test]
async fn test_retryable_failure_succeeds_on_second_attempt() {
    let dispatcher = ScriptedDispatcher::new(&[("flaky", Script::FailTimes(1))]);
    let graph = graph(vec![NodeSpec::tool("flaky", "fetch").with_retry(3, 10)]);
    let bus = Arc::new(EventBus::new(64));
    let mut events = bus.subscribe();

    let result = executor(FailurePolicy::FailFast)
        .with_events(bus.clone())
        .run(graph, BTreeMap::new(), table(dispatcher.clone()))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    let state = result.state("flaky").unwrap();
    assert_eq!(state.attempts, 2);
    assert_eq!(state.last_error.as_ref().map(|e| e.kind), Some(FailureKind::Dispatch));
    assert_eq!(dispatcher.calls().len(), 2);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(matches!(seen.first(), Some(ExecutionEvent::RunStarted { .. })));
    assert!(matches!(
        seen.last(),
        Some(ExecutionEvent::RunCompleted { status: RunStatus::Succeeded, .. })
    ));
    assert!(seen
        .iter()
        .any(|e| matches!(e, ExecutionEvent::NodeRetrying { attempt: 1, delay_ms: 10, .. })));
}

#[tokio::test]
async fn test_retry_budget_is_exhausted() {
    let dispatcher = ScriptedDispatcher::new(&[("flaky", Script::FailTimes(5))]);
    let graph = graph(vec![NodeSpec::tool("flaky", "fetch").with_retry(3, 0)]);

    let result = executor(FailurePolicy::FailFast)
        .run(graph, BTreeMap::new(), table(dispatcher.clone()))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.state("flaky").unwrap().attempts, 3);
    assert_eq!(dispatcher.calls().len(), 3);
}

#[tokio::test]
async fn test_timeout_is_retried() {
    let dispatcher = ScriptedDispatcher::new(&[("slow", Script::SlowFirst(2_000))]);
    let graph = graph(vec![NodeSpec::tool("slow", "fetch")
        .with_timeout_ms(50)
        .with_retry(2, 0)]);

    let started = Instant::now();
    let result = executor(FailurePolicy::FailFast)
        .run(graph, BTreeMap::new(), table(dispatcher))
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(result.status, RunStatus::Succeeded);
    let state = result.state("slow").unwrap();
    assert_eq!(state.attempts, 2);
    assert_eq!(state.last_error.as_ref().map(|e| e.kind), Some(FailureKind::Timeout));
}

#[tokio::test]
async fn test_uncooperative_dispatch_is_abandoned_after_grace() {
    let dispatcher = ScriptedDispatcher::new(&[("stuck", Script::Stubborn(5_000))]);
    let graph = graph(vec![NodeSpec::tool("stuck", "fetch").with_timeout_ms(20)]);
    let config = RunConfig {
        cancel_grace_ms: 20,
        ..RunConfig::default()
    };

    let started = Instant::now();
    let result = WorkflowExecutor::new(config)
        .run(graph, BTreeMap::new(), table(dispatcher))
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.errors[0].kind, FailureKind::Timeout);
}

#[tokio::test]
async fn test_unresolvable_reference_fails_without_dispatch_or_retry() {
    let dispatcher = ScriptedDispatcher::new(&[]);
    let graph = graph(vec![NodeSpec::agent("a", "writer", "{{topic}}")
        .with_input("topic", "ctx.missing")
        .with_retry(3, 0)]);

    let result = executor(FailurePolicy::FailFast)
        .run(graph, BTreeMap::new(), table(dispatcher.clone()))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert!(dispatcher.calls().is_empty());
    let state = result.state("a").unwrap();
    assert_eq!(state.attempts, 1);
    assert_eq!(state.last_error.as_ref().map(|e| e.kind), Some(FailureKind::Reference));
}

#[tokio::test]
async fn test_external_cancellation_skips_remaining_nodes() {
    let dispatcher = ScriptedDispatcher::new(&[("a", Script::Hang)]);
    let graph = graph(vec![
        NodeSpec::tool("a", "fetch"),
        NodeSpec::tool("b", "fetch").depends_on(["a"]),
        NodeSpec::tool("c", "fetch").depends_on(["b"]),
    ]);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let result = executor(FailurePolicy::BestEffort)
        .run_with_cancellation(graph, BTreeMap::new(), table(dispatcher.clone()), cancel)
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Cancelled);
    assert_eq!(dispatcher.calls(), vec!["a"]);
    for id in ["a", "b", "c"] {
        assert_eq!(result.status_of(id), Some(NodeStatus::Skipped), "{} should be skipped", id);
    }
    assert_eq!(result.state("a").unwrap().skip_reason, Some(SkipReason::Cancelled));
    assert!(result
        .errors
        .iter()
        .any(|e| e.node_id.is_none() && e.kind == FailureKind::Cancelled));
}

#[tokio::test]
async fn test_false_condition_skips_branch_but_aggregator_runs() {
    let dispatcher = ScriptedDispatcher::new(&[]);
    let graph = graph(vec![
        NodeSpec::conditional("gate", Predicate::equals("ctx.mode", "thorough")),
        NodeSpec::tool("deep", "research").depends_on(["gate"]),
        NodeSpec::tool("quick", "search"),
        NodeSpec::aggregator("merge", AggregationStrategy::concat()).depends_on(["deep", "quick"]),
    ]);

    let result = executor(FailurePolicy::FailFast)
        .run(graph, context(&[("mode", "fast")]), table(dispatcher.clone()))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.state("gate").unwrap().skip_reason, Some(SkipReason::ConditionFalse));
    assert_eq!(
        result.state("deep").unwrap().skip_reason,
        Some(SkipReason::UpstreamSkipped { node: "gate".into() })
    );
    assert_eq!(dispatcher.calls(), vec!["quick"]);
    assert_eq!(result.output("merge"), Some(&Value::from("quick")));
}

#[tokio::test]
async fn test_true_condition_forwards_and_continues() {
    let dispatcher = ScriptedDispatcher::new(&[]);
    let graph = graph(vec![
        NodeSpec::conditional("gate", Predicate::equals("ctx.mode", "thorough")),
        NodeSpec::tool("deep", "research").depends_on(["gate"]),
    ]);

    let result = executor(FailurePolicy::FailFast)
        .run(graph, context(&[("mode", "thorough")]), table(dispatcher.clone()))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.status_of("gate"), Some(NodeStatus::Succeeded));
    assert_eq!(dispatcher.calls(), vec!["deep"]);
}

#[tokio::test]
async fn test_aggregator_with_no_successful_inputs_fails() {
    let dispatcher =
        ScriptedDispatcher::new(&[("a", Script::FailTerminal), ("b", Script::FailTerminal)]);
    let graph = graph(vec![
        NodeSpec::tool("a", "fetch"),
        NodeSpec::tool("b", "fetch"),
        NodeSpec::aggregator("vote", AggregationStrategy::vote()).depends_on(["a", "b"]),
    ]);

    let result = executor(FailurePolicy::BestEffort)
        .run(graph, BTreeMap::new(), table(dispatcher))
        .await
        .unwrap();

    assert_eq!(result.status_of("vote"), Some(NodeStatus::Failed));
    assert_eq!(
        result.state("vote").unwrap().last_error.as_ref().map(|e| e.kind),
        Some(FailureKind::Aggregation)
    );
}

#[tokio::test]
async fn test_parallelism_is_bounded() {
    let ids = ["n1", "n2", "n3", "n4", "n5", "n6"];
    let scripts: Vec<(&str, Script)> = ids.iter().map(|id| (*id, Script::Delay(30))).collect();
    let dispatcher = ScriptedDispatcher::new(&scripts);
    let graph = graph(ids.iter().map(|id| NodeSpec::tool(*id, "fetch")).collect());

    let result = WorkflowExecutor::new(RunConfig::default().with_max_parallel(2))
        .run(graph, BTreeMap::new(), table(dispatcher.clone()))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(dispatcher.calls().len(), 6);
    assert!(dispatcher.max_in_flight() <= 2, "saw {} in flight", dispatcher.max_in_flight());
}

#[tokio::test]
async fn test_zero_parallelism_is_a_configuration_error() {
    let graph = graph(vec![NodeSpec::tool("a", "fetch")]);
    let result = WorkflowExecutor::new(RunConfig::default().with_max_parallel(0))
        .run(graph, BTreeMap::new(), table(ScriptedDispatcher::new(&[])))
        .await;
    assert!(matches!(result, Err(orchcore::FlowError::Configuration(_))));
}

#[tokio::test]
async fn test_panicking_dispatcher_is_captured() {
    let dispatcher = ScriptedDispatcher::new(&[("boom", Script::Panic)]);
    let graph = graph(vec![NodeSpec::tool("boom", "fetch"), NodeSpec::tool("fine", "fetch")]);

    let result = executor(FailurePolicy::BestEffort)
        .run(graph, BTreeMap::new(), table(dispatcher))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.status_of("fine"), Some(NodeStatus::Succeeded));
    let failure = result.state("boom").unwrap().last_error.clone().unwrap();
    assert_eq!(failure.kind, FailureKind::Panicked);
    assert!(failure.message.contains("dispatcher exploded"));
}

#[tokio::test]
async fn test_tool_args_are_interpolated() {
    let seen = Arc::new(Mutex::new(None));
    let capture = seen.clone();
    let dispatcher = orchruntime::FnDispatcher::new(move |_node, inputs: ResolvedInputs, _cancel| {
        let capture = capture.clone();
        async move {
            *capture.lock().unwrap() = Some(inputs.args.clone());
            Ok(Value::Null)
        }
    });
    let graph = graph(vec![NodeSpec::tool("search", "web")
        .with_arg("query", "about {{ctx.topic}}")
        .with_arg("limit", 5i64)]);

    let result = executor(FailurePolicy::FailFast)
        .run(graph, context(&[("topic", "lifetimes")]), Arc::new(dispatcher))
        .await
        .unwrap();

    assert!(result.is_success());
    let args = seen.lock().unwrap().clone().unwrap();
    assert_eq!(args.get("query"), Some(&Value::from("about lifetimes")));
    assert_eq!(args.get("limit"), Some(&Value::from(5i64)));
}

#[tokio::test]
async fn test_runtime_handle_can_cancel() {
    let dispatcher = ScriptedDispatcher::new(&[("a", Script::Hang)]);
    let mut runtime = FlowRuntime::new();
    runtime.register_dispatcher(NodeKindTag::ToolCall, dispatcher);
    let graph = graph(vec![NodeSpec::tool("a", "fetch")]);

    let handle = runtime.start(graph, BTreeMap::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(runtime.active_runs().await, vec![handle.run_id()]);
    handle.cancel();

    let result = handle.wait().await.unwrap();
    assert_eq!(result.status, RunStatus::Cancelled);
    assert!(runtime.active_runs().await.is_empty());
}

#[tokio::test]
async fn test_run_can_be_cancelled_by_id_right_after_start() {
    let dispatcher = ScriptedDispatcher::new(&[("a", Script::Hang)]);
    let mut runtime = FlowRuntime::new();
    runtime.register_dispatcher(NodeKindTag::ToolCall, dispatcher.clone());
    let graph = graph(vec![
        NodeSpec::tool("a", "fetch"),
        NodeSpec::tool("b", "fetch").depends_on(["a"]),
    ]);

    let handle = runtime.start(graph, BTreeMap::new()).await.unwrap();
    let run_id = handle.run_id();
    assert_eq!(runtime.active_runs().await, vec![run_id]);
    assert!(runtime.cancel_run(run_id).await, "run should be registered as active");

    let result = handle.wait().await.unwrap();
    assert_eq!(result.status, RunStatus::Cancelled);
    assert!(!dispatcher.calls().contains(&"b".to_string()));
    assert!(!runtime.cancel_run(run_id).await);
}

#[tokio::test]
async fn test_simultaneously_ready_nodes_dispatch_in_id_order() {
    let dispatcher = ScriptedDispatcher::new(&[]);
    let graph = graph(vec![
        NodeSpec::tool("c", "fetch"),
        NodeSpec::tool("a", "fetch"),
        NodeSpec::tool("b", "fetch"),
    ]);

    let result = WorkflowExecutor::new(RunConfig::default().with_max_parallel(1))
        .run(graph, BTreeMap::new(), table(dispatcher.clone()))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(dispatcher.calls(), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_conditional_with_bad_reference_fails_after_one_attempt() {
    let dispatcher = ScriptedDispatcher::new(&[]);
    let graph = graph(vec![
        NodeSpec::conditional("gate", Predicate::equals("mode", "thorough")),
        NodeSpec::tool("deep", "research").depends_on(["gate"]),
    ]);

    let result = executor(FailurePolicy::BestEffort)
        .run(graph, BTreeMap::new(), table(dispatcher.clone()))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    let gate = result.state("gate").unwrap();
    assert_eq!(gate.status, NodeStatus::Failed);
    assert_eq!(gate.attempts, 1);
    assert_eq!(gate.last_error.as_ref().map(|e| e.kind), Some(FailureKind::Reference));
    assert_eq!(result.status_of("deep"), Some(NodeStatus::Skipped));
    assert!(dispatcher.calls().is_empty());
}
