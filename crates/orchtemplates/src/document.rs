use crate::{
    ensemble, sequential, voting, EnsembleConfig, SequentialConfig, StepConfig, TemplateError,
    VotingConfig,
};
use orchcore::{AggregationStrategy, FlowError, NodeSpec, Predicate, RetryPolicy, WorkflowGraph};
use serde::{Deserialize, Serialize};

/// Names accepted by [`WorkflowDocument::example`]
pub const TEMPLATE_NAMES: &[&str] = &["graph", "sequential", "ensemble", "voting"];

/// A workflow definition as stored on disk: either a hand-authored graph
/// or the configuration of one of the built-in templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "template", rename_all = "snake_case")]
pub enum WorkflowDocument {
    Graph { name: String, nodes: Vec<NodeSpec> },
    Sequential(SequentialConfig),
    Ensemble(EnsembleConfig),
    Voting(VotingConfig),
}

impl WorkflowDocument {
    pub fn from_json(json: &str) -> Result<Self, FlowError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json_pretty(&self) -> Result<String, FlowError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn template(&self) -> &'static str {
        match self {
            WorkflowDocument::Graph { .. } => "graph",
            WorkflowDocument::Sequential(_) => "sequential",
            WorkflowDocument::Ensemble(_) => "ensemble",
            WorkflowDocument::Voting(_) => "voting",
        }
    }

    /// Produce the validated graph this document describes
    pub fn build(self) -> Result<WorkflowGraph, TemplateError> {
        match self {
            WorkflowDocument::Graph { name, nodes } => Ok(WorkflowGraph::build(name, nodes)?),
            WorkflowDocument::Sequential(config) => sequential(config),
            WorkflowDocument::Ensemble(config) => ensemble(config),
            WorkflowDocument::Voting(config) => voting(config),
        }
    }

    /// A small starter document for `template`
    pub fn example(template: &str) -> Option<Self> {
        let doc = match template {
            "graph" => WorkflowDocument::Graph {
                name: "research-and-write".to_string(),
                nodes: vec![
                    NodeSpec::tool("search", "web_search").with_arg("query", "{{ctx.topic}}"),
                    NodeSpec::conditional("has_results", Predicate::exists("search.output"))
                        .depends_on(["search"]),
                    NodeSpec::agent("draft", "writer", "Write about {{ctx.topic}} using: {{notes}}")
                        .depends_on(["has_results"])
                        .with_input("notes", "search.output")
                        .with_retry_policy(RetryPolicy::exponential(3, 200, 2_000))
                        .with_timeout_ms(30_000),
                ],
            },
            "sequential" => WorkflowDocument::Sequential(SequentialConfig::new(
                "outline-draft-edit",
                vec![
                    StepConfig::agent("planner", "Outline an article about {{ctx.topic}}"),
                    StepConfig::agent("writer", "Expand this outline: {{previous}}"),
                    StepConfig::agent("editor", "Tighten this draft: {{previous}}"),
                ],
            )),
            "ensemble" => WorkflowDocument::Ensemble(
                EnsembleConfig::new(
                    "three-perspectives",
                    vec![
                        StepConfig::agent("optimist", "Answer: {{input}}"),
                        StepConfig::agent("skeptic", "Answer: {{input}}"),
                        StepConfig::agent("pragmatist", "Answer: {{input}}"),
                    ],
                )
                .with_input("ctx.question")
                .with_strategy(AggregationStrategy::rank_best("length")),
            ),
            "voting" => WorkflowDocument::Voting(
                VotingConfig::new(
                    "majority-answer",
                    vec![
                        StepConfig::agent("solver", "Answer with one word: {{input}}"),
                        StepConfig::agent("solver", "Answer with one word: {{input}}"),
                        StepConfig::agent("solver", "Answer with one word: {{input}}"),
                    ],
                )
                .with_input("ctx.question"),
            ),
            _ => return None,
        };
        Some(doc)
    }
}
