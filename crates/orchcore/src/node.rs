use crate::{Predicate, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

/// Node ids are plain strings, unique within a graph.
pub type NodeId = String;

/// Specification of one schedulable unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Kind-specific payload, flattened next to the common fields.
    #[serde(flatten)]
    pub kind: NodeKind,

    #[serde(default)]
    pub depends_on: BTreeSet<NodeId>,

    /// Local input name -> variable store reference, resolved at dispatch.
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// Per-attempt wall-clock limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl NodeSpec {
    pub fn new(id: impl Into<NodeId>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            name: None,
            kind,
            depends_on: BTreeSet::new(),
            inputs: BTreeMap::new(),
            retry: RetryPolicy::default(),
            timeout_ms: None,
        }
    }

    pub fn agent(
        id: impl Into<NodeId>,
        agent: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self::new(
            id,
            NodeKind::AgentCall {
                agent: agent.into(),
                prompt: prompt.into(),
            },
        )
    }

    pub fn tool(id: impl Into<NodeId>, tool: impl Into<String>) -> Self {
        Self::new(
            id,
            NodeKind::ToolCall {
                tool: tool.into(),
                args: BTreeMap::new(),
            },
        )
    }

    pub fn conditional(id: impl Into<NodeId>, predicate: Predicate) -> Self {
        Self::new(id, NodeKind::Conditional { predicate })
    }

    pub fn aggregator(id: impl Into<NodeId>, strategy: AggregationStrategy) -> Self {
        Self::new(id, NodeKind::Aggregator { strategy })
    }

    pub fn passthrough(id: impl Into<NodeId>) -> Self {
        Self::new(id, NodeKind::Passthrough)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, reference: impl Into<String>) -> Self {
        self.inputs.insert(name.into(), reference.into());
        self
    }

    /// Add a tool argument. Has no effect on non-tool nodes.
    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if let NodeKind::ToolCall { args, .. } = &mut self.kind {
            args.insert(key.into(), value.into());
        }
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, delay_ms: u64) -> Self {
        self.retry = RetryPolicy::fixed(max_attempts, delay_ms);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn tag(&self) -> NodeKindTag {
        self.kind.tag()
    }

    pub fn is_root(&self) -> bool {
        self.depends_on.is_empty()
    }
}

/// Kind of work a node performs, together with its configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    /// Ask a named agent; `prompt` may contain `{{reference}}` placeholders.
    AgentCall { agent: String, prompt: String },

    /// Invoke a named tool; string arguments may contain placeholders.
    ToolCall {
        tool: String,
        #[serde(default)]
        args: BTreeMap<String, Value>,
    },

    /// Runs only when its predicate holds once dependencies succeed.
    Conditional { predicate: Predicate },

    /// Combines the outputs of all its dependencies.
    Aggregator { strategy: AggregationStrategy },

    /// Forwards upstream outputs unchanged.
    Passthrough,
}

impl NodeKind {
    pub fn tag(&self) -> NodeKindTag {
        match self {
            NodeKind::AgentCall { .. } => NodeKindTag::AgentCall,
            NodeKind::ToolCall { .. } => NodeKindTag::ToolCall,
            NodeKind::Conditional { .. } => NodeKindTag::Conditional,
            NodeKind::Aggregator { .. } => NodeKindTag::Aggregator,
            NodeKind::Passthrough => NodeKindTag::Passthrough,
        }
    }

    pub fn predicate(&self) -> Option<&Predicate> {
        match self {
            NodeKind::Conditional { predicate } => Some(predicate),
            _ => None,
        }
    }

    pub fn aggregation(&self) -> Option<&AggregationStrategy> {
        match self {
            NodeKind::Aggregator { strategy } => Some(strategy),
            _ => None,
        }
    }
}

/// Payload-free discriminant of [`NodeKind`], used as a dispatch-table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKindTag {
    AgentCall,
    ToolCall,
    Conditional,
    Aggregator,
    Passthrough,
}

impl fmt::Display for NodeKindTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeKindTag::AgentCall => "agent_call",
            NodeKindTag::ToolCall => "tool_call",
            NodeKindTag::Conditional => "conditional",
            NodeKindTag::Aggregator => "aggregator",
            NodeKindTag::Passthrough => "passthrough",
        };
        f.write_str(s)
    }
}

/// How an aggregator node combines its upstream outputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum AggregationStrategy {
    /// Join successful outputs in ascending node id order.
    Concat {
        #[serde(default = "default_separator")]
        separator: String,
    },

    /// Plurality vote over normalized outputs; ties go to the lowest node id.
    Vote {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        similarity: Option<String>,
    },

    /// Highest score from a named scoring function; ties go to the lowest node id.
    RankBest { scorer: String },

    /// Named reducer over all successful outputs.
    Custom { reducer: String },
}

fn default_separator() -> String {
    "\n\n".to_string()
}

impl Default for AggregationStrategy {
    fn default() -> Self {
        AggregationStrategy::Concat {
            separator: default_separator(),
        }
    }
}

impl AggregationStrategy {
    pub fn concat() -> Self {
        Self::default()
    }

    pub fn vote() -> Self {
        AggregationStrategy::Vote { similarity: None }
    }

    pub fn rank_best(scorer: impl Into<String>) -> Self {
        AggregationStrategy::RankBest {
            scorer: scorer.into(),
        }
    }

    pub fn custom(reducer: impl Into<String>) -> Self {
        AggregationStrategy::Custom {
            reducer: reducer.into(),
        }
    }
}

/// Retry policy for node execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
    #[serde(default)]
    pub retry_on: RetryOn,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::default(),
            retry_on: RetryOn::default(),
        }
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed { delay_ms },
            retry_on: RetryOn::default(),
        }
    }

    pub fn exponential(max_attempts: u32, initial_ms: u64, max_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential {
                initial_ms,
                multiplier: 2.0,
                max_ms,
            },
            retry_on: RetryOn::default(),
        }
    }

    pub fn retry_on(mut self, retry_on: RetryOn) -> Self {
        self.retry_on = retry_on;
        self
    }

    /// Delay before the attempt following `failed_attempts` failures.
    pub fn delay_after(&self, failed_attempts: u32) -> Duration {
        self.backoff.delay(failed_attempts)
    }
}

/// Shape of the delay between attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    Exponential {
        initial_ms: u64,
        multiplier: f64,
        max_ms: u64,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed { delay_ms: 0 }
    }
}

impl Backoff {
    pub fn delay(&self, failed_attempts: u32) -> Duration {
        match self {
            Backoff::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            Backoff::Exponential {
                initial_ms,
                multiplier,
                max_ms,
            } => {
                let exponent = failed_attempts.saturating_sub(1).min(63) as i32;
                let ms = (*initial_ms as f64) * multiplier.powi(exponent);
                Duration::from_millis(ms.min(*max_ms as f64) as u64)
            }
        }
    }
}

/// Which failures are eligible for another attempt
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetryOn {
    /// Failures the collaborator tagged retryable, and timeouts.
    #[default]
    Retryable,
    Always,
    Never,
    /// Dispatch errors carrying one of these codes, and timeouts.
    Codes { codes: Vec<String> },
}
