use async_trait::async_trait;
use orchcore::{DispatchError, NodeId, NodeKindTag, NodeSpec, Value};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The engine's only hook into external collaborators.
///
/// Implementations perform the actual work for a node (agent call, tool
/// call, ...) and must be safe to call concurrently for distinct nodes.
/// They should return promptly once `cancel` fires; the executor stops
/// waiting after its grace period either way.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(
        &self,
        node: Arc<NodeSpec>,
        inputs: ResolvedInputs,
        cancel: CancellationToken,
    ) -> Result<Value, DispatchError>;
}

/// Inputs resolved from the variable store immediately before a dispatch
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResolvedInputs {
    /// Values of the node's named input bindings.
    pub values: BTreeMap<String, Value>,
    /// Published outputs of the node's direct dependencies.
    pub upstream: BTreeMap<NodeId, Value>,
    /// Rendered prompt, for agent calls.
    pub prompt: Option<String>,
    /// Rendered arguments, for tool calls.
    pub args: BTreeMap<String, Value>,
}

impl ResolvedInputs {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Bound inputs layered over upstream outputs, collapsed to a single
    /// value when there is exactly one entry.
    pub fn merged(&self) -> Value {
        let mut merged: BTreeMap<String, Value> = self.upstream.clone();
        merged.extend(self.values.clone());
        match merged.len() {
            0 => Value::Null,
            1 => merged.into_values().next().unwrap_or_default(),
            _ => Value::Object(merged),
        }
    }
}

/// Adapts an async closure into a [`Dispatcher`]
pub struct FnDispatcher<F> {
    f: F,
}

impl<F> FnDispatcher<F> {
    pub fn new<Fut>(f: F) -> Self
    where
        F: Fn(Arc<NodeSpec>, ResolvedInputs, CancellationToken) -> Fut + Send + Sync,
        Fut: Future<Output = Result<Value, DispatchError>> + Send,
    {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Dispatcher for FnDispatcher<F>
where
    F: Fn(Arc<NodeSpec>, ResolvedInputs, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, DispatchError>> + Send,
{
    async fn dispatch(
        &self,
        node: Arc<NodeSpec>,
        inputs: ResolvedInputs,
        cancel: CancellationToken,
    ) -> Result<Value, DispatchError> {
        (self.f)(node, inputs, cancel).await
    }
}

/// Forwards upstream outputs; the built-in handler for passthrough and
/// conditional nodes.
pub struct ForwardDispatcher;

#[async_trait]
impl Dispatcher for ForwardDispatcher {
    async fn dispatch(
        &self,
        _node: Arc<NodeSpec>,
        inputs: ResolvedInputs,
        _cancel: CancellationToken,
    ) -> Result<Value, DispatchError> {
        Ok(inputs.merged())
    }
}

/// Dispatchers keyed by node kind.
///
/// The table is itself a [`Dispatcher`], so the executor never looks at
/// what kind of node it is running.
#[derive(Clone)]
pub struct DispatchTable {
    handlers: HashMap<NodeKindTag, Arc<dyn Dispatcher>>,
}

impl DispatchTable {
    /// Table with the built-in passthrough and conditional handlers.
    pub fn new() -> Self {
        let mut table = Self::empty();
        let forward: Arc<dyn Dispatcher> = Arc::new(ForwardDispatcher);
        table.register(NodeKindTag::Passthrough, forward.clone());
        table.register(NodeKindTag::Conditional, forward);
        table
    }

    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler, replacing any previous one for that kind
    pub fn register(&mut self, kind: NodeKindTag, handler: Arc<dyn Dispatcher>) {
        tracing::info!("Registering dispatcher for kind: {}", kind);
        self.handlers.insert(kind, handler);
    }

    pub fn with(mut self, kind: NodeKindTag, handler: Arc<dyn Dispatcher>) -> Self {
        self.register(kind, handler);
        self
    }

    pub fn handler(&self, kind: NodeKindTag) -> Option<&Arc<dyn Dispatcher>> {
        self.handlers.get(&kind)
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> Vec<NodeKindTag> {
        let mut kinds: Vec<NodeKindTag> = self.handlers.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dispatcher for DispatchTable {
    async fn dispatch(
        &self,
        node: Arc<NodeSpec>,
        inputs: ResolvedInputs,
        cancel: CancellationToken,
    ) -> Result<Value, DispatchError> {
        let kind = node.tag();
        let handler = self.handlers.get(&kind).cloned().ok_or_else(|| {
            DispatchError::terminal(format!("no dispatcher registered for kind {}", kind))
                .with_code("unregistered_kind")
        })?;
        handler.dispatch(node, inputs, cancel).await
    }
}
