use crate::{FailureKind, NodeError, NodeFailure, NodeId, Value, VariableSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub type RunId = Uuid;

/// Lifecycle status of one node within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    Retrying,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeStatus::Succeeded | NodeStatus::Failed | NodeStatus::Skipped)
    }
}

/// Why a node was skipped instead of executed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// The node's own branch predicate evaluated false.
    ConditionFalse,
    UpstreamFailed { node: NodeId },
    UpstreamSkipped { node: NodeId },
    /// Fail-fast stopped the run after another node failed.
    Halted,
    /// The run was cancelled externally.
    Cancelled,
}

/// Per-(run, node) execution state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRunState {
    pub status: NodeStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<NodeFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    /// Wall-clock time spent in attempts, summed.
    pub duration_ms: u64,
}

impl Default for NodeRunState {
    fn default() -> Self {
        Self {
            status: NodeStatus::Pending,
            attempts: 0,
            last_error: None,
            skip_reason: None,
            duration_ms: 0,
        }
    }
}

impl NodeRunState {
    pub fn record_error(&mut self, err: &NodeError) {
        self.last_error = Some(NodeFailure::from(err));
    }

    pub fn skip(&mut self, reason: SkipReason) {
        self.status = NodeStatus::Skipped;
        self.skip_reason = Some(reason);
    }
}

/// How a failed node affects the rest of the run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop dispatching, cancel in-flight work and skip everything not yet finished.
    #[default]
    FailFast,
    /// Skip only the failed node's dependents and let independent branches finish.
    BestEffort,
}

impl std::str::FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fail-fast" | "fail_fast" => Ok(FailurePolicy::FailFast),
            "best-effort" | "best_effort" => Ok(FailurePolicy::BestEffort),
            other => Err(format!("unknown failure policy: {}", other)),
        }
    }
}

/// Overall outcome of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Cancelled,
}

/// One failure recorded during a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    /// `None` for run-level errors such as cancellation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    pub kind: FailureKind,
    pub message: String,
}

/// Final, serializable outcome of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub graph: String,
    pub status: RunStatus,
    pub node_states: BTreeMap<NodeId, NodeRunState>,
    pub variables: VariableSnapshot,
    pub errors: Vec<RunError>,
    pub duration_ms: u64,
}

impl RunResult {
    pub fn state(&self, node: &str) -> Option<&NodeRunState> {
        self.node_states.get(node)
    }

    pub fn status_of(&self, node: &str) -> Option<NodeStatus> {
        self.state(node).map(|s| s.status)
    }

    pub fn output(&self, node: &str) -> Option<&Value> {
        self.variables.outputs.get(node)
    }

    pub fn nodes_with_status(&self, status: NodeStatus) -> Vec<&str> {
        self.node_states
            .iter()
            .filter(|(_, s)| s.status == status)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }
}
