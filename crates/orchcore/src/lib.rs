//! Core abstractions for the orchestration engine
//!
//! This crate provides the data model shared by every other component:
//! node specifications, validated workflow graphs, the run-scoped variable
//! store, per-node run state and the error taxonomy. It spawns nothing.

mod error;
pub mod events;
mod graph;
mod node;
mod predicate;
mod run;
mod value;
mod variables;

pub use error::{
    AggregationError, AlreadyPublished, ConfigurationError, DispatchError, FailureKind, FlowError,
    NodeError, NodeFailure, ReferenceError, ValidationError,
};
pub use events::*;
pub use graph::WorkflowGraph;
pub use node::{
    AggregationStrategy, Backoff, NodeId, NodeKind, NodeKindTag, NodeSpec, RetryOn, RetryPolicy,
};
pub use predicate::Predicate;
pub use run::{
    FailurePolicy, NodeRunState, NodeStatus, RunError, RunId, RunResult, RunStatus, SkipReason,
};
pub use value::Value;
pub use variables::{Reference, VariableSnapshot, VariableStore, CONTEXT_PREFIX};

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, FlowError>;
