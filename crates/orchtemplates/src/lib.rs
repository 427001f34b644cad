//! Built-in workflow templates
//!
//! Builders that turn a compact configuration into a validated
//! [`WorkflowGraph`](orchcore::WorkflowGraph): a sequential chain, a
//! parallel ensemble joined by an aggregator, and a voting ensemble.
//! Builders only produce graphs; nothing here executes.

mod document;
mod ensemble;
mod error;
mod sequential;
mod step;

pub use document::{WorkflowDocument, TEMPLATE_NAMES};
pub use ensemble::{
    ensemble, voting, EnsembleConfig, VotingConfig, AGGREGATE_ID, ROOT_ID, ROOT_INPUT,
};
pub use error::TemplateError;
pub use sequential::{sequential, SequentialConfig, PREVIOUS_INPUT};
pub use step::{StepAction, StepConfig};
