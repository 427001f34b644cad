use crate::aggregate::AggregateFunctions;
use crate::dispatch::{DispatchTable, Dispatcher};
use crate::executor::{RunConfig, WorkflowExecutor};
use orchcore::{
    ConfigurationError, EventBus, ExecutionEvent, FailurePolicy, FlowError, NodeKindTag, RunId,
    RunResult, Value, WorkflowGraph,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Main runtime for executing workflows
pub struct FlowRuntime {
    config: RuntimeConfig,
    dispatchers: DispatchTable,
    functions: Arc<AggregateFunctions>,
    event_bus: Arc<EventBus>,
    active: Arc<RwLock<HashMap<RunId, CancellationToken>>>,
}

impl FlowRuntime {
    /// Create a new runtime with default settings
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a new runtime with custom configuration
    pub fn with_config(config: RuntimeConfig) -> Self {
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        Self {
            config,
            dispatchers: DispatchTable::new(),
            functions: Arc::new(AggregateFunctions::new()),
            event_bus,
            active: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Route nodes of `kind` to `dispatcher`
    pub fn register_dispatcher(&mut self, kind: NodeKindTag, dispatcher: Arc<dyn Dispatcher>) {
        self.dispatchers.register(kind, dispatcher);
    }

    pub fn dispatchers(&self) -> &DispatchTable {
        &self.dispatchers
    }

    /// Named scorers, similarity functions and reducers available to aggregators
    pub fn functions_mut(&mut self) -> &mut AggregateFunctions {
        Arc::make_mut(&mut self.functions)
    }

    /// Start a run in the background using the runtime's configuration
    pub async fn start(
        &self,
        graph: Arc<WorkflowGraph>,
        context: BTreeMap<String, Value>,
    ) -> Result<RunHandle, FlowError> {
        self.start_with(graph, context, self.config.run_config()).await
    }

    /// Start a run in the background with per-run settings.
    ///
    /// The run is registered as active before this returns, so it can be
    /// cancelled by id immediately.
    pub async fn start_with(
        &self,
        graph: Arc<WorkflowGraph>,
        context: BTreeMap<String, Value>,
        run_config: RunConfig,
    ) -> Result<RunHandle, FlowError> {
        run_config.validate()?;

        let run_id = RunId::new_v4();
        let cancel = CancellationToken::new();
        let executor = WorkflowExecutor::new(run_config)
            .with_functions(self.functions.clone())
            .with_events(self.event_bus.clone());
        let dispatcher: Arc<dyn Dispatcher> = Arc::new(self.dispatchers.clone());
        let active = self.active.clone();
        let token = cancel.clone();

        active.write().await.insert(run_id, token.clone());
        let task = tokio::spawn(async move {
            let result = executor
                .run_with_id(run_id, graph, context, dispatcher, token)
                .await;
            active.write().await.remove(&run_id);
            result
        });

        Ok(RunHandle {
            run_id,
            cancel,
            task,
        })
    }

    /// Run a workflow to completion
    pub async fn execute(
        &self,
        graph: Arc<WorkflowGraph>,
        context: BTreeMap<String, Value>,
    ) -> Result<RunResult, FlowError> {
        self.start(graph, context).await?.wait().await
    }

    /// Cancel a run started by this runtime. Returns `false` if it is not active.
    pub async fn cancel_run(&self, run_id: RunId) -> bool {
        match self.active.read().await.get(&run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Ids of runs that have not finished yet
    pub async fn active_runs(&self) -> Vec<RunId> {
        self.active.read().await.keys().copied().collect()
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    /// Get the event bus for direct access
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }
}

impl Default for FlowRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a run executing in the background
pub struct RunHandle {
    run_id: RunId,
    cancel: CancellationToken,
    task: JoinHandle<Result<RunResult, FlowError>>,
}

impl RunHandle {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Request cancellation. In-flight dispatches are signalled and nothing new starts.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the run to finish
    pub async fn wait(self) -> Result<RunResult, FlowError> {
        self.task
            .await
            .map_err(|e| FlowError::Execution(format!("Run task failed: {}", e)))?
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub max_parallel_nodes: usize,
    pub failure_policy: FailurePolicy,
    pub default_timeout_ms: Option<u64>,
    pub cancel_grace_ms: u64,
    pub event_buffer_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let run = RunConfig::default();
        Self {
            max_parallel_nodes: run.max_parallel_nodes,
            failure_policy: run.failure_policy,
            default_timeout_ms: run.default_timeout_ms,
            cancel_grace_ms: run.cancel_grace_ms,
            event_buffer_size: 1000,
        }
    }
}

impl RuntimeConfig {
    /// Parse a JSON configuration document; absent fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, FlowError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.event_buffer_size == 0 {
            return Err(ConfigurationError::InvalidSetting {
                field: "event_buffer_size",
                reason: "must be at least 1",
            });
        }
        self.run_config().validate()
    }

    /// Per-run settings derived from this configuration
    pub fn run_config(&self) -> RunConfig {
        RunConfig {
            max_parallel_nodes: self.max_parallel_nodes,
            failure_policy: self.failure_policy,
            default_timeout_ms: self.default_timeout_ms,
            cancel_grace_ms: self.cancel_grace_ms,
        }
    }
}
