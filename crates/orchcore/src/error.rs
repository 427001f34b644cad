use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned to the caller of the engine.
///
/// Ordinary node failures never surface here; they are recorded in the
/// run result. Only malformed input and contract violations do.
#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Structural problems found while building a workflow graph.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Graph has no nodes")]
    Empty,

    #[error("Invalid node id '{id}': {reason}")]
    InvalidId { id: String, reason: &'static str },

    #[error("Duplicate node id: {0}")]
    DuplicateId(String),

    #[error("Node '{node}' depends on unknown node '{dependency}'")]
    UnknownDependency { node: String, dependency: String },

    #[error("Graph has no root nodes (cycle through {})", .cycle.join(" -> "))]
    NoRoots { cycle: Vec<String> },

    #[error("Cyclic dependency detected between: {}", .nodes.join(", "))]
    Cycle { nodes: Vec<String> },

    #[error("Invalid retry policy on node '{node}': {reason}")]
    InvalidRetryPolicy { node: String, reason: &'static str },
}

impl ValidationError {
    /// Nodes participating in the detected cycle, if the error is cycle-related.
    pub fn cycle_nodes(&self) -> Option<&[String]> {
        match self {
            ValidationError::Cycle { nodes } => Some(nodes),
            ValidationError::NoRoots { cycle } => Some(cycle),
            _ => None,
        }
    }
}

/// Bad template or runtime parameters, surfaced before anything executes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("{template} template requires at least one {what}")]
    Empty {
        template: &'static str,
        what: &'static str,
    },

    #[error("Duplicate step id: {0}")]
    DuplicateStep(String),

    #[error("Step id '{0}' is reserved by the template")]
    ReservedId(String),

    #[error("Invalid runtime setting '{field}': {reason}")]
    InvalidSetting {
        field: &'static str,
        reason: &'static str,
    },
}

/// Returned when a node output is published twice.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("output of node '{0}' already published")]
pub struct AlreadyPublished(pub String);

/// Failure reported by an external collaborator during one node attempt.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{message}")]
pub struct DispatchError {
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl DispatchError {
    /// A transient failure that may succeed if attempted again.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            code: None,
        }
    }

    /// A failure that no amount of retrying will fix.
    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// A reference into the variable store could not be resolved.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("Malformed reference '{reference}': {reason}")]
    Malformed {
        reference: String,
        reason: &'static str,
    },

    #[error("Unknown context variable: {0}")]
    UnknownVariable(String),

    #[error("Output of node '{0}' has not been published")]
    Unpublished(String),

    #[error("Reference '{reference}' has no field '{segment}'")]
    MissingField { reference: String, segment: String },
}

/// An aggregator could not combine its upstream outputs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregationError {
    #[error("No successful inputs to aggregate")]
    NoSuccessfulInputs,

    #[error("Unknown {category} function: {name}")]
    UnknownFunction {
        category: &'static str,
        name: String,
    },

    #[error("Reducer failed: {0}")]
    Reducer(String),
}

/// Failure of a single node attempt, as seen by the executor.
#[derive(Error, Debug, Clone)]
pub enum NodeError {
    #[error("Dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Reference resolution failed: {0}")]
    Reference(#[from] ReferenceError),

    #[error("Aggregation failed: {0}")]
    Aggregation(#[from] AggregationError),

    #[error("Dispatch panicked: {0}")]
    Panicked(String),

    #[error("Cancelled")]
    Cancelled,
}

impl NodeError {
    pub fn kind(&self) -> FailureKind {
        match self {
            NodeError::Dispatch(_) => FailureKind::Dispatch,
            NodeError::Timeout { .. } => FailureKind::Timeout,
            NodeError::Reference(_) => FailureKind::Reference,
            NodeError::Aggregation(_) => FailureKind::Aggregation,
            NodeError::Panicked(_) => FailureKind::Panicked,
            NodeError::Cancelled => FailureKind::Cancelled,
        }
    }

    /// Whether the error, on its own, permits another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            NodeError::Dispatch(e) => e.retryable,
            NodeError::Timeout { .. } => true,
            _ => false,
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            NodeError::Dispatch(e) => e.code.as_deref(),
            _ => None,
        }
    }
}

/// Serializable category of a node failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Dispatch,
    Timeout,
    Reference,
    Aggregation,
    Panicked,
    Cancelled,
}

/// Serializable failure detail stored in run results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeFailure {
    pub kind: FailureKind,
    pub message: String,
    pub retryable: bool,
}

impl From<&NodeError> for NodeFailure {
    fn from(err: &NodeError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}
