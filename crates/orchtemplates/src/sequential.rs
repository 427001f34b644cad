use crate::step::{assign_ids, StepConfig};
use crate::TemplateError;
use orchcore::{ConfigurationError, NodeSpec, WorkflowGraph};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Input name under which each step sees the previous step's output.
pub const PREVIOUS_INPUT: &str = "previous";

/// A linear chain of steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequentialConfig {
    #[serde(default = "default_name")]
    pub name: String,
    pub steps: Vec<StepConfig>,
}

fn default_name() -> String {
    "sequential".to_string()
}

impl SequentialConfig {
    pub fn new(name: impl Into<String>, steps: Vec<StepConfig>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }
}

/// Build a chain where step *k* depends only on step *k-1*.
///
/// Every step after the first gets an input named `previous` bound to the
/// output of the step before it, unless it binds that name itself.
pub fn sequential(config: SequentialConfig) -> Result<WorkflowGraph, TemplateError> {
    if config.steps.is_empty() {
        return Err(ConfigurationError::Empty {
            template: "sequential",
            what: "step",
        }
        .into());
    }

    let ids = assign_ids("step", &config.steps);
    let mut seen = BTreeSet::new();
    for id in &ids {
        if !seen.insert(id.as_str()) {
            return Err(ConfigurationError::DuplicateStep(id.clone()).into());
        }
    }

    let mut nodes: Vec<NodeSpec> = Vec::with_capacity(ids.len());
    for (step, id) in config.steps.into_iter().zip(&ids) {
        let mut node = step.into_node(id.clone());
        if let Some(prev) = nodes.last() {
            node.depends_on.insert(prev.id.clone());
            node.inputs
                .entry(PREVIOUS_INPUT.to_string())
                .or_insert_with(|| format!("{}.output", prev.id));
        }
        nodes.push(node);
    }

    tracing::debug!(name = %config.name, steps = nodes.len(), "Built sequential workflow");
    Ok(WorkflowGraph::build(config.name, nodes)?)
}
