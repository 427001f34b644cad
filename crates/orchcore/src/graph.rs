use crate::{NodeId, NodeSpec, ValidationError, CONTEXT_PREFIX};
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Immutable, validated dependency graph of nodes.
///
/// The only way to obtain one is [`WorkflowGraph::build`], so every graph
/// handed to the executor is known to be acyclic with intact references.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    name: String,
    nodes: BTreeMap<NodeId, Arc<NodeSpec>>,
    order: Vec<NodeId>,
    dependents: BTreeMap<NodeId, BTreeSet<NodeId>>,
}

impl WorkflowGraph {
    /// Validate `nodes` and freeze them into a graph.
    pub fn build(
        name: impl Into<String>,
        nodes: impl IntoIterator<Item = NodeSpec>,
    ) -> Result<Self, ValidationError> {
        let name = name.into();
        let specs: Vec<NodeSpec> = nodes.into_iter().collect();
        if specs.is_empty() {
            return Err(ValidationError::Empty);
        }

        let mut by_id: BTreeMap<NodeId, Arc<NodeSpec>> = BTreeMap::new();
        for spec in specs {
            validate_id(&spec.id)?;
            validate_retry(&spec)?;
            if by_id.contains_key(&spec.id) {
                return Err(ValidationError::DuplicateId(spec.id));
            }
            by_id.insert(spec.id.clone(), Arc::new(spec));
        }

        for spec in by_id.values() {
            for dep in &spec.depends_on {
                if !by_id.contains_key(dep) {
                    return Err(ValidationError::UnknownDependency {
                        node: spec.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let mut graph: DiGraph<NodeId, ()> = DiGraph::new();
        let mut index: HashMap<&str, NodeIndex> = HashMap::new();
        for id in by_id.keys() {
            index.insert(id.as_str(), graph.add_node(id.clone()));
        }
        for spec in by_id.values() {
            for dep in &spec.depends_on {
                graph.add_edge(index[dep.as_str()], index[spec.id.as_str()], ());
            }
        }

        let has_root = by_id.values().any(|spec| spec.is_root());
        let order = match toposort(&graph, None) {
            Ok(order) => order,
            Err(cycle) => {
                let nodes = cycle_through(&graph, cycle.node_id());
                return Err(if has_root {
                    ValidationError::Cycle { nodes }
                } else {
                    ValidationError::NoRoots { cycle: nodes }
                });
            }
        };

        let order: Vec<NodeId> = order.into_iter().map(|idx| graph[idx].clone()).collect();

        let mut dependents: BTreeMap<NodeId, BTreeSet<NodeId>> =
            by_id.keys().map(|id| (id.clone(), BTreeSet::new())).collect();
        for spec in by_id.values() {
            for dep in &spec.depends_on {
                if let Some(set) = dependents.get_mut(dep) {
                    set.insert(spec.id.clone());
                }
            }
        }

        tracing::debug!(graph = %name, nodes = by_id.len(), "validated workflow graph");

        Ok(Self {
            name,
            nodes: by_id,
            order,
            dependents,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&Arc<NodeSpec>> {
        self.nodes.get(id)
    }

    /// Nodes in ascending id order.
    pub fn nodes(&self) -> impl Iterator<Item = &Arc<NodeSpec>> {
        self.nodes.values()
    }

    /// Every node appears after all of its dependencies.
    pub fn topological_order(&self) -> &[NodeId] {
        &self.order
    }

    pub fn roots(&self) -> Vec<&str> {
        self.nodes
            .values()
            .filter(|n| n.is_root())
            .map(|n| n.id.as_str())
            .collect()
    }

    /// Nodes nothing depends on.
    pub fn leaves(&self) -> Vec<&str> {
        self.dependents
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(id, _)| id.as_str())
            .collect()
    }

    pub fn dependencies_of(&self, id: &str) -> Option<&BTreeSet<NodeId>> {
        self.nodes.get(id).map(|n| &n.depends_on)
    }

    pub fn dependents_of(&self, id: &str) -> Option<&BTreeSet<NodeId>> {
        self.dependents.get(id)
    }

    /// Transitive dependents of `id`, excluding `id` itself.
    pub fn descendants_of(&self, id: &str) -> BTreeSet<NodeId> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&str> = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(children) = self.dependents.get(current) {
                for child in children {
                    if seen.insert(child.clone()) {
                        stack.push(child);
                    }
                }
            }
        }
        seen
    }

    /// Copy of the node specifications, in ascending id order.
    pub fn to_specs(&self) -> Vec<NodeSpec> {
        self.nodes.values().map(|n| NodeSpec::clone(n)).collect()
    }
}

fn validate_id(id: &str) -> Result<(), ValidationError> {
    let invalid = |reason| ValidationError::InvalidId {
        id: id.to_string(),
        reason,
    };
    if id.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if id.contains('.') {
        return Err(invalid("must not contain '.'"));
    }
    if id.chars().any(char::is_whitespace) {
        return Err(invalid("must not contain whitespace"));
    }
    if id == CONTEXT_PREFIX {
        return Err(invalid("reserved for context references"));
    }
    Ok(())
}

fn validate_retry(spec: &NodeSpec) -> Result<(), ValidationError> {
    let invalid = |reason| ValidationError::InvalidRetryPolicy {
        node: spec.id.clone(),
        reason,
    };
    if spec.retry.max_attempts == 0 {
        return Err(invalid("max_attempts must be at least 1"));
    }
    if let crate::Backoff::Exponential { multiplier, .. } = spec.retry.backoff {
        if !(multiplier.is_finite() && multiplier > 0.0) {
            return Err(invalid("multiplier must be a positive number"));
        }
    }
    Ok(())
}

/// Sorted ids of the strongly connected component containing `start`.
fn cycle_through(graph: &DiGraph<NodeId, ()>, start: NodeIndex) -> Vec<NodeId> {
    let component = tarjan_scc(graph)
        .into_iter()
        .find(|scc| scc.contains(&start))
        .unwrap_or_else(|| vec![start]);
    let mut ids: Vec<NodeId> = component.into_iter().map(|idx| graph[idx].clone()).collect();
    ids.sort();
    ids
}
