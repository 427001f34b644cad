//! Aggregation strategies for aggregator nodes.
//!
//! Every strategy sorts its inputs by node id before looking at them, so
//! the result depends only on the set of inputs, never on completion order.

use orchcore::{AggregationError, AggregationStrategy, NodeId, NodeStatus, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// One upstream contribution to an aggregator
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateInput {
    pub node_id: NodeId,
    pub value: Option<Value>,
    pub status: NodeStatus,
}

impl AggregateInput {
    pub fn succeeded(node_id: impl Into<NodeId>, value: impl Into<Value>) -> Self {
        Self {
            node_id: node_id.into(),
            value: Some(value.into()),
            status: NodeStatus::Succeeded,
        }
    }

    pub fn failed(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            value: None,
            status: NodeStatus::Failed,
        }
    }

    pub fn skipped(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            value: None,
            status: NodeStatus::Skipped,
        }
    }
}

pub type ScoreFn = Arc<dyn Fn(&Value) -> f64 + Send + Sync>;
pub type SimilarityFn = Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>;
pub type ReduceFn = Arc<dyn Fn(&[(NodeId, Value)]) -> Result<Value, String> + Send + Sync>;

/// Named scoring, similarity and reducer functions referenced by strategies
#[derive(Clone)]
pub struct AggregateFunctions {
    scorers: HashMap<String, ScoreFn>,
    similarities: HashMap<String, SimilarityFn>,
    reducers: HashMap<String, ReduceFn>,
}

impl AggregateFunctions {
    /// Registry preloaded with the built-in functions:
    ///
    /// * scorers `length` and `score`
    /// * similarities `exact` and `first_line`
    /// * reducers `collect`, `first` and `by_node`
    pub fn new() -> Self {
        let mut functions = Self::empty();

        functions.register_scorer("length", |v| v.to_text().chars().count() as f64);
        functions.register_scorer("score", |v| {
            v.as_f64()
                .or_else(|| v.get("score").and_then(Value::as_f64))
                .unwrap_or(f64::NAN)
        });

        functions.register_similarity("exact", |a, b| a == b);
        functions.register_similarity("first_line", |a, b| first_line(a) == first_line(b));

        functions.register_reducer("collect", |inputs| {
            Ok(Value::Array(inputs.iter().map(|(_, v)| v.clone()).collect()))
        });
        functions.register_reducer("first", |inputs| {
            inputs
                .first()
                .map(|(_, v)| v.clone())
                .ok_or_else(|| "no inputs".to_string())
        });
        functions.register_reducer("by_node", |inputs| {
            Ok(Value::Object(inputs.iter().cloned().collect()))
        });

        functions
    }

    pub fn empty() -> Self {
        Self {
            scorers: HashMap::new(),
            similarities: HashMap::new(),
            reducers: HashMap::new(),
        }
    }

    pub fn register_scorer<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&Value) -> f64 + Send + Sync + 'static,
    {
        self.scorers.insert(name.into(), Arc::new(f));
    }

    /// Similarity functions receive the raw outputs.
    pub fn register_similarity<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&Value, &Value) -> bool + Send + Sync + 'static,
    {
        self.similarities.insert(name.into(), Arc::new(f));
    }

    /// Reducers receive successful outputs in ascending node id order.
    pub fn register_reducer<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&[(NodeId, Value)]) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.reducers.insert(name.into(), Arc::new(f));
    }

    fn scorer(&self, name: &str) -> Result<&ScoreFn, AggregationError> {
        self.scorers.get(name).ok_or_else(|| unknown("scorer", name))
    }

    fn similarity(&self, name: &str) -> Result<&SimilarityFn, AggregationError> {
        self.similarities.get(name).ok_or_else(|| unknown("similarity", name))
    }

    fn reducer(&self, name: &str) -> Result<&ReduceFn, AggregationError> {
        self.reducers.get(name).ok_or_else(|| unknown("reducer", name))
    }
}

impl Default for AggregateFunctions {
    fn default() -> Self {
        Self::new()
    }
}

fn unknown(category: &'static str, name: &str) -> AggregationError {
    AggregationError::UnknownFunction {
        category,
        name: name.to_string(),
    }
}

fn first_line(value: &Value) -> String {
    value
        .to_text()
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default()
        .to_lowercase()
}

/// Combine upstream outputs according to `strategy`.
///
/// Failed and skipped inputs are ignored; with no successful input the
/// aggregation fails.
pub fn aggregate(
    strategy: &AggregationStrategy,
    inputs: &[AggregateInput],
    functions: &AggregateFunctions,
) -> Result<Value, AggregationError> {
    let mut successes: Vec<(NodeId, Value)> = inputs
        .iter()
        .filter(|i| i.status == NodeStatus::Succeeded)
        .filter_map(|i| i.value.clone().map(|v| (i.node_id.clone(), v)))
        .collect();
    successes.sort_by(|a, b| a.0.cmp(&b.0));

    if successes.is_empty() {
        return Err(AggregationError::NoSuccessfulInputs);
    }

    match strategy {
        AggregationStrategy::Concat { separator } => Ok(Value::String(
            successes
                .iter()
                .map(|(_, v)| v.to_text())
                .collect::<Vec<_>>()
                .join(separator),
        )),
        AggregationStrategy::Vote { similarity } => {
            let similar = similarity.as_deref().map(|name| functions.similarity(name)).transpose()?;
            Ok(vote(&successes, similar))
        }
        AggregationStrategy::RankBest { scorer } => {
            Ok(rank_best(&successes, functions.scorer(scorer)?))
        }
        AggregationStrategy::Custom { reducer } => {
            functions.reducer(reducer)?(successes.as_slice()).map_err(AggregationError::Reducer)
        }
    }
}

/// Plurality vote. `successes` must be sorted by node id and non-empty.
fn vote(successes: &[(NodeId, Value)], similar: Option<&SimilarityFn>) -> Value {
    // (group key, member indices); groups are created in ascending order
    // of their lowest member id. Keys are normalized outputs, or raw ones
    // when a similarity function decides membership.
    let mut groups: Vec<(Value, Vec<usize>)> = Vec::new();

    for (idx, (_, value)) in successes.iter().enumerate() {
        let key = match similar {
            Some(_) => value.clone(),
            None => value.normalized(),
        };
        let existing = groups.iter_mut().find(|(rep, _)| match similar {
            Some(f) => f(rep, &key),
            None => *rep == key,
        });
        match existing {
            Some((_, members)) => members.push(idx),
            None => groups.push((key, vec![idx])),
        }
    }

    let mut winner = &groups[0];
    for group in &groups[1..] {
        if group.1.len() > winner.1.len() {
            winner = group;
        }
    }

    tracing::debug!(
        groups = groups.len(),
        votes = winner.1.len(),
        winner = %successes[winner.1[0]].0,
        "vote tallied"
    );

    successes[winner.1[0]].1.clone()
}

/// Highest score wins; `successes` must be sorted by node id and non-empty.
fn rank_best(successes: &[(NodeId, Value)], scorer: &ScoreFn) -> Value {
    let mut best: Option<(f64, &Value)> = None;
    for (_, value) in successes {
        let mut score = scorer(value);
        if score.is_nan() {
            score = f64::NEG_INFINITY;
        }
        match best {
            Some((top, _)) if score <= top => {}
            _ => best = Some((score, value)),
        }
    }
    best.map(|(_, v)| v.clone()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fns() -> AggregateFunctions {
        AggregateFunctions::new()
    }

    #[test]
    fn vote_majority_wins() {
        let inputs = vec![
            AggregateInput::succeeded("n1", "x"),
            AggregateInput::succeeded("n2", "x"),
            AggregateInput::succeeded("n3", "y"),
        ];
        assert_eq!(
            aggregate(&AggregationStrategy::vote(), &inputs, &fns()).unwrap(),
            Value::from("x")
        );
    }

    #[test]
    fn vote_tie_goes_to_lowest_node_id() {
        let inputs = vec![
            AggregateInput::succeeded("n2", "y"),
            AggregateInput::succeeded("n1", "x"),
        ];
        assert_eq!(
            aggregate(&AggregationStrategy::vote(), &inputs, &fns()).unwrap(),
            Value::from("x")
        );
    }

    #[test]
    fn vote_groups_normalized_outputs() {
        let inputs = vec![
            AggregateInput::succeeded("a", "Paris"),
            AggregateInput::succeeded("b", "London"),
            AggregateInput::succeeded("c", "  paris "),
            AggregateInput::failed("d"),
        ];
        assert_eq!(
            aggregate(&AggregationStrategy::vote(), &inputs, &fns()).unwrap(),
            Value::from("Paris")
        );
    }

    #[test]
    fn exact_similarity_does_not_normalize() {
        let inputs = vec![
            AggregateInput::succeeded("a", "Paris"),
            AggregateInput::succeeded("b", "paris"),
            AggregateInput::succeeded("c", "paris"),
        ];
        let strategy = AggregationStrategy::Vote {
            similarity: Some("exact".into()),
        };
        assert_eq!(aggregate(&strategy, &inputs, &fns()).unwrap(), Value::from("paris"));
    }

    #[test]
    fn vote_with_similarity_function() {
        let inputs = vec![
            AggregateInput::succeeded("a", "41"),
            AggregateInput::succeeded("b", "42\nbecause of reasons"),
            AggregateInput::succeeded("c", "42\ndifferent reasoning"),
        ];
        let strategy = AggregationStrategy::Vote {
            similarity: Some("first_line".into()),
        };
        assert_eq!(
            aggregate(&strategy, &inputs, &fns()).unwrap(),
            Value::from("42\nbecause of reasons")
        );
    }

    #[test]
    fn vote_fails_without_successes() {
        let inputs = vec![AggregateInput::failed("a"), AggregateInput::skipped("b")];
        assert_eq!(
            aggregate(&AggregationStrategy::vote(), &inputs, &fns()),
            Err(AggregationError::NoSuccessfulInputs)
        );
    }

    #[test]
    fn concat_orders_by_id_and_omits_failures() {
        let inputs = vec![
            AggregateInput::succeeded("c", "third"),
            AggregateInput::failed("b"),
            AggregateInput::succeeded("a", "first"),
        ];
        let strategy = AggregationStrategy::Concat { separator: " | ".into() };
        assert_eq!(aggregate(&strategy, &inputs, &fns()).unwrap(), Value::from("first | third"));
    }

    #[test]
    fn rank_best_breaks_ties_by_lowest_id() {
        let inputs = vec![
            AggregateInput::succeeded("b", json!({"score": 0.9, "text": "B"})),
            AggregateInput::succeeded("a", json!({"score": 0.9, "text": "A"})),
            AggregateInput::succeeded("c", json!({"score": 0.4, "text": "C"})),
            AggregateInput::succeeded("d", json!({"text": "no score"})),
        ];
        let best = aggregate(&AggregationStrategy::rank_best("score"), &inputs, &fns()).unwrap();
        assert_eq!(best.get("text"), Some(&Value::from("A")));
    }

    #[test]
    fn custom_reducers_and_unknown_names() {
        let inputs = vec![
            AggregateInput::succeeded("b", 2i64),
            AggregateInput::succeeded("a", 1i64),
        ];
        assert_eq!(
            aggregate(&AggregationStrategy::custom("collect"), &inputs, &fns()).unwrap(),
            Value::from(vec![Value::from(1i64), Value::from(2i64)])
        );
        assert!(matches!(
            aggregate(&AggregationStrategy::rank_best("vibes"), &inputs, &fns()),
            Err(AggregationError::UnknownFunction { category: "scorer", .. })
        ));
    }

    #[test]
    fn aggregation_is_order_independent() {
        let forward = vec![
            AggregateInput::succeeded("a", "yes"),
            AggregateInput::succeeded("b", "no"),
            AggregateInput::succeeded("c", "no"),
        ];
        let mut backward = forward.clone();
        backward.reverse();
        for strategy in [AggregationStrategy::vote(), AggregationStrategy::concat()] {
            assert_eq!(
                aggregate(&strategy, &forward, &fns()),
                aggregate(&strategy, &backward, &fns())
            );
        }
    }
}
