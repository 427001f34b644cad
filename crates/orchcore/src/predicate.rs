//! Branch predicates for conditional nodes.
//!
//! Predicates read the variable store through references; comparisons
//! between numbers coerce both sides to `f64`.

use crate::{ReferenceError, Value, VariableStore};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    /// True when the reference resolves. Never fails.
    Exists { reference: String },
    Truthy { reference: String },
    Equals { reference: String, value: Value },
    NotEquals { reference: String, value: Value },
    GreaterThan { reference: String, value: f64 },
    LessThan { reference: String, value: f64 },
    /// Substring for strings, membership for arrays, key for objects.
    Contains { reference: String, value: Value },
    Not { predicate: Box<Predicate> },
    All { predicates: Vec<Predicate> },
    Any { predicates: Vec<Predicate> },
}

impl Predicate {
    pub fn exists(reference: impl Into<String>) -> Self {
        Predicate::Exists {
            reference: reference.into(),
        }
    }

    pub fn truthy(reference: impl Into<String>) -> Self {
        Predicate::Truthy {
            reference: reference.into(),
        }
    }

    pub fn equals(reference: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Equals {
            reference: reference.into(),
            value: value.into(),
        }
    }

    pub fn greater_than(reference: impl Into<String>, value: f64) -> Self {
        Predicate::GreaterThan {
            reference: reference.into(),
            value,
        }
    }

    pub fn negate(self) -> Self {
        Predicate::Not {
            predicate: Box::new(self),
        }
    }

    pub fn evaluate(&self, store: &VariableStore) -> Result<bool, ReferenceError> {
        match self {
            Predicate::Exists { reference } => Ok(store.resolve(reference).is_ok()),
            Predicate::Truthy { reference } => Ok(store.resolve(reference)?.is_truthy()),
            Predicate::Equals { reference, value } => {
                Ok(loosely_equal(&store.resolve(reference)?, value))
            }
            Predicate::NotEquals { reference, value } => {
                Ok(!loosely_equal(&store.resolve(reference)?, value))
            }
            Predicate::GreaterThan { reference, value } => {
                Ok(as_number(&store.resolve(reference)?).is_some_and(|n| n > *value))
            }
            Predicate::LessThan { reference, value } => {
                Ok(as_number(&store.resolve(reference)?).is_some_and(|n| n < *value))
            }
            Predicate::Contains { reference, value } => {
                Ok(contains(&store.resolve(reference)?, value))
            }
            Predicate::Not { predicate } => Ok(!predicate.evaluate(store)?),
            Predicate::All { predicates } => {
                for p in predicates {
                    if !p.evaluate(store)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Predicate::Any { predicates } => {
                for p in predicates {
                    if p.evaluate(store)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => Some(*n),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn loosely_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(_), _) | (_, Value::Number(_)) => match (as_number(left), as_number(right)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
        _ => left == right,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => needle.as_str().is_some_and(|n| s.contains(n)),
        Value::Array(items) => items.iter().any(|item| loosely_equal(item, needle)),
        Value::Object(map) => needle.as_str().is_some_and(|k| map.contains_key(k)),
        _ => false,
    }
}
