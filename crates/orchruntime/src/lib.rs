//! Workflow execution runtime
//!
//! This crate provides the engine that runs validated workflow graphs:
//! the dispatch seam to external collaborators, retry decisions, the
//! built-in aggregators and the DAG scheduler with bounded parallelism,
//! timeouts and cancellation.

mod aggregate;
mod dispatch;
mod executor;
pub mod retry;
mod runtime;

pub use aggregate::{
    aggregate, AggregateFunctions, AggregateInput, ReduceFn, ScoreFn, SimilarityFn,
};
pub use dispatch::{DispatchTable, Dispatcher, FnDispatcher, ForwardDispatcher, ResolvedInputs};
pub use executor::{RunConfig, WorkflowExecutor};
pub use runtime::{FlowRuntime, RunHandle, RuntimeConfig};
pub use tokio_util::sync::CancellationToken;
