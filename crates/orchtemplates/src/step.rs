use orchcore::{NodeId, NodeKind, NodeSpec, RetryPolicy, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One unit of work inside a template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
    /// Explicit node id; the template assigns one when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<NodeId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(flatten)]
    pub action: StepAction,

    /// Extra input bindings on top of the ones the template adds.
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// What a step dispatches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepAction {
    Agent {
        agent: String,
        prompt: String,
    },
    Tool {
        tool: String,
        #[serde(default)]
        args: BTreeMap<String, Value>,
    },
}

impl StepConfig {
    pub fn agent(agent: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self::from_action(StepAction::Agent {
            agent: agent.into(),
            prompt: prompt.into(),
        })
    }

    pub fn tool(tool: impl Into<String>) -> Self {
        Self::from_action(StepAction::Tool {
            tool: tool.into(),
            args: BTreeMap::new(),
        })
    }

    fn from_action(action: StepAction) -> Self {
        Self {
            id: None,
            name: None,
            action,
            inputs: BTreeMap::new(),
            retry: None,
            timeout_ms: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<NodeId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, reference: impl Into<String>) -> Self {
        self.inputs.insert(name.into(), reference.into());
        self
    }

    /// Add a tool argument. Ignored for agent steps.
    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if let StepAction::Tool { args, .. } = &mut self.action {
            args.insert(key.into(), value.into());
        }
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Turn the step into a node with the given id.
    pub(crate) fn into_node(self, id: NodeId) -> NodeSpec {
        let kind = match self.action {
            StepAction::Agent { agent, prompt } => NodeKind::AgentCall { agent, prompt },
            StepAction::Tool { tool, args } => NodeKind::ToolCall { tool, args },
        };

        let mut node = NodeSpec::new(id, kind);
        node.name = self.name;
        node.inputs = self.inputs;
        node.timeout_ms = self.timeout_ms;
        if let Some(retry) = self.retry {
            node.retry = retry;
        }
        node
    }
}

/// Assign ids to `steps`, defaulting to `<prefix>_<k>` zero-padded so that
/// lexical order matches step order.
pub(crate) fn assign_ids(prefix: &str, steps: &[StepConfig]) -> Vec<NodeId> {
    let width = steps.len().to_string().len();
    steps
        .iter()
        .enumerate()
        .map(|(i, step)| {
            step.id
                .clone()
                .unwrap_or_else(|| format!("{}_{:0width$}", prefix, i + 1, width = width))
        })
        .collect()
}
