use crate::step::{assign_ids, StepConfig};
use crate::TemplateError;
use orchcore::{AggregationStrategy, ConfigurationError, NodeId, NodeSpec, WorkflowGraph};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Default id of the synthetic root node.
pub const ROOT_ID: &str = "input";
/// Default id of the aggregator node.
pub const AGGREGATE_ID: &str = "aggregate";
/// Input name under which each branch sees the root's output.
pub const ROOT_INPUT: &str = "input";

/// N parallel branches fanned out from one root and joined by one aggregator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleConfig {
    #[serde(default = "default_ensemble_name")]
    pub name: String,

    /// Explicit root step. Without one, a passthrough node named `input` is added.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<StepConfig>,

    /// Reference the synthetic root forwards, e.g. `ctx.question`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,

    pub branches: Vec<StepConfig>,

    #[serde(default)]
    pub strategy: AggregationStrategy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_id: Option<NodeId>,
}

fn default_ensemble_name() -> String {
    "ensemble".to_string()
}

impl EnsembleConfig {
    pub fn new(name: impl Into<String>, branches: Vec<StepConfig>) -> Self {
        Self {
            name: name.into(),
            root: None,
            input: None,
            branches,
            strategy: AggregationStrategy::default(),
            aggregate_id: None,
        }
    }

    pub fn with_root(mut self, root: StepConfig) -> Self {
        self.root = Some(root);
        self
    }

    pub fn with_input(mut self, reference: impl Into<String>) -> Self {
        self.input = Some(reference.into());
        self
    }

    pub fn with_strategy(mut self, strategy: AggregationStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

/// Build root -> N branches -> aggregator.
pub fn ensemble(config: EnsembleConfig) -> Result<WorkflowGraph, TemplateError> {
    fan_out("ensemble", config)
}

/// Ensemble shape whose aggregator always votes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VotingConfig {
    #[serde(default = "default_voting_name")]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<StepConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,

    pub voters: Vec<StepConfig>,

    /// Named similarity function used to group answers instead of normalized equality.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_id: Option<NodeId>,
}

fn default_voting_name() -> String {
    "voting".to_string()
}

impl VotingConfig {
    pub fn new(name: impl Into<String>, voters: Vec<StepConfig>) -> Self {
        Self {
            name: name.into(),
            root: None,
            input: None,
            voters,
            similarity: None,
            aggregate_id: None,
        }
    }

    pub fn with_input(mut self, reference: impl Into<String>) -> Self {
        self.input = Some(reference.into());
        self
    }

    pub fn with_similarity(mut self, name: impl Into<String>) -> Self {
        self.similarity = Some(name.into());
        self
    }
}

/// Build root -> N voters -> majority vote. Ties go to the lowest voter id.
pub fn voting(config: VotingConfig) -> Result<WorkflowGraph, TemplateError> {
    fan_out(
        "voting",
        EnsembleConfig {
            name: config.name,
            root: config.root,
            input: config.input,
            branches: config.voters,
            strategy: AggregationStrategy::Vote {
                similarity: config.similarity,
            },
            aggregate_id: config.aggregate_id,
        },
    )
}

fn fan_out(template: &'static str, config: EnsembleConfig) -> Result<WorkflowGraph, TemplateError> {
    if config.branches.is_empty() {
        return Err(ConfigurationError::Empty {
            template,
            what: "branch",
        }
        .into());
    }

    let root = match config.root {
        Some(step) => {
            let id = step.id.clone().unwrap_or_else(|| ROOT_ID.to_string());
            step.into_node(id)
        }
        None => {
            let node = NodeSpec::passthrough(ROOT_ID);
            match &config.input {
                Some(reference) => node.with_input(ROOT_INPUT, reference.clone()),
                None => node,
            }
        }
    };
    let aggregate_id = config
        .aggregate_id
        .unwrap_or_else(|| AGGREGATE_ID.to_string());
    if aggregate_id == root.id {
        return Err(ConfigurationError::ReservedId(aggregate_id).into());
    }

    let ids = assign_ids("branch", &config.branches);
    let mut seen = BTreeSet::new();
    for id in &ids {
        if *id == root.id || *id == aggregate_id {
            return Err(ConfigurationError::ReservedId(id.clone()).into());
        }
        if !seen.insert(id.as_str()) {
            return Err(ConfigurationError::DuplicateStep(id.clone()).into());
        }
    }

    let root_ref = format!("{}.output", root.id);
    let branches: Vec<NodeSpec> = config
        .branches
        .into_iter()
        .zip(&ids)
        .map(|(step, id)| {
            let mut node = step.into_node(id.clone());
            node.depends_on.insert(root.id.clone());
            node.inputs
                .entry(ROOT_INPUT.to_string())
                .or_insert_with(|| root_ref.clone());
            node
        })
        .collect();

    let aggregator =
        NodeSpec::aggregator(aggregate_id, config.strategy).depends_on(ids.iter().cloned());

    tracing::debug!(
        template,
        name = %config.name,
        branches = branches.len(),
        "Built fan-out workflow"
    );

    let mut nodes = Vec::with_capacity(branches.len() + 2);
    nodes.push(root);
    nodes.extend(branches);
    nodes.push(aggregator);
    Ok(WorkflowGraph::build(config.name, nodes)?)
}
