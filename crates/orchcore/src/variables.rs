//! Run-scoped variable store.
//!
//! Two namespaces are addressable by reference strings:
//!
//! * `ctx.<name>[.path]`: entries of the initial context
//! * `<node>.output[.path]`: the published output of a node
//!
//! Path segments select object fields or array indices.

use crate::{AlreadyPublished, NodeId, ReferenceError, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Prefix of references into the initial context. Reserved as a node id.
pub const CONTEXT_PREFIX: &str = "ctx";

const OUTPUT_SEGMENT: &str = "output";

/// A parsed reference string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Context { name: String, path: Vec<String> },
    Output { node: NodeId, path: Vec<String> },
}

impl Reference {
    pub fn parse(reference: &str) -> Result<Self, ReferenceError> {
        let malformed = |reason| ReferenceError::Malformed {
            reference: reference.to_string(),
            reason,
        };

        let trimmed = reference.trim();
        if trimmed.is_empty() {
            return Err(malformed("empty reference"));
        }

        let segments: Vec<&str> = trimmed.split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(malformed("empty path segment"));
        }

        let rest = |from: usize| segments[from..].iter().map(|s| s.to_string()).collect();

        if segments[0] == CONTEXT_PREFIX {
            if segments.len() < 2 {
                return Err(malformed("expected ctx.<name>"));
            }
            return Ok(Reference::Context {
                name: segments[1].to_string(),
                path: rest(2),
            });
        }

        if segments.len() < 2 || segments[1] != OUTPUT_SEGMENT {
            return Err(malformed("expected <node>.output or ctx.<name>"));
        }
        Ok(Reference::Output {
            node: segments[0].to_string(),
            path: rest(2),
        })
    }
}

/// Run-scoped mapping of context variables and node outputs.
///
/// Node outputs are write-once: a node publishes exactly once, after its
/// successful attempt.
#[derive(Debug, Clone, Default)]
pub struct VariableStore {
    context: BTreeMap<String, Value>,
    outputs: BTreeMap<NodeId, Value>,
}

impl VariableStore {
    pub fn new(context: BTreeMap<String, Value>) -> Self {
        Self {
            context,
            outputs: BTreeMap::new(),
        }
    }

    pub fn publish(
        &mut self,
        node: impl Into<NodeId>,
        value: Value,
    ) -> Result<(), AlreadyPublished> {
        let node = node.into();
        if self.outputs.contains_key(&node) {
            return Err(AlreadyPublished(node));
        }
        self.outputs.insert(node, value);
        Ok(())
    }

    pub fn output(&self, node: &str) -> Option<&Value> {
        self.outputs.get(node)
    }

    pub fn context(&self, name: &str) -> Option<&Value> {
        self.context.get(name)
    }

    pub fn resolve(&self, reference: &str) -> Result<Value, ReferenceError> {
        let (root, path) = match Reference::parse(reference)? {
            Reference::Context { name, path } => {
                let root = self
                    .context
                    .get(&name)
                    .ok_or(ReferenceError::UnknownVariable(name))?;
                (root, path)
            }
            Reference::Output { node, path } => {
                let root = self
                    .outputs
                    .get(&node)
                    .ok_or(ReferenceError::Unpublished(node))?;
                (root, path)
            }
        };

        root.get_path(&path)
            .cloned()
            .map_err(|segment| ReferenceError::MissingField {
                reference: reference.to_string(),
                segment: segment.to_string(),
            })
    }

    /// Replace every `{{ name }}` placeholder in `template`.
    ///
    /// A placeholder first matches a local input name (optionally followed
    /// by a path, e.g. `{{ previous.title }}`), then falls back to a store
    /// reference.
    pub fn render(
        &self,
        template: &str,
        locals: &BTreeMap<String, Value>,
    ) -> Result<String, ReferenceError> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find("}}").ok_or_else(|| ReferenceError::Malformed {
                reference: template.to_string(),
                reason: "unclosed placeholder",
            })?;
            let key = after[..end].trim();
            out.push_str(&self.lookup(key, locals)?.to_text());
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        Ok(out)
    }

    /// Like [`render`](Self::render), but a template consisting of exactly
    /// one placeholder yields the referenced value itself rather than its text.
    pub fn interpolate(
        &self,
        template: &str,
        locals: &BTreeMap<String, Value>,
    ) -> Result<Value, ReferenceError> {
        let trimmed = template.trim();
        if let Some(inner) = trimmed.strip_prefix("{{").and_then(|s| s.strip_suffix("}}")) {
            if !inner.contains("{{") && !inner.contains("}}") {
                return self.lookup(inner.trim(), locals);
            }
        }
        if !template.contains("{{") {
            return Ok(Value::String(template.to_string()));
        }
        self.render(template, locals).map(Value::String)
    }

    fn lookup(&self, key: &str, locals: &BTreeMap<String, Value>) -> Result<Value, ReferenceError> {
        let mut segments = key.split('.');
        if let Some(local) = segments.next().and_then(|head| locals.get(head)) {
            let path: Vec<&str> = segments.collect();
            return local
                .get_path(&path)
                .cloned()
                .map_err(|segment| ReferenceError::MissingField {
                    reference: key.to_string(),
                    segment: segment.to_string(),
                });
        }
        self.resolve(key)
    }

    pub fn snapshot(&self) -> VariableSnapshot {
        VariableSnapshot {
            context: self.context.clone(),
            outputs: self.outputs.clone(),
        }
    }
}

/// Serializable copy of a store at the end of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableSnapshot {
    pub context: BTreeMap<String, Value>,
    pub outputs: BTreeMap<NodeId, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> VariableStore {
        let mut ctx = BTreeMap::new();
        ctx.insert("topic".to_string(), Value::from("borrow checker"));
        let mut store = VariableStore::new(ctx);
        store
            .publish("research", Value::from(json!({"notes": ["a", "b"], "title": "Ownership"})))
            .unwrap();
        store
    }

    #[test]
    fn parses_both_namespaces() {
        assert_eq!(
            Reference::parse("ctx.topic").unwrap(),
            Reference::Context { name: "topic".into(), path: vec![] }
        );
        assert_eq!(
            Reference::parse("research.output.notes.0").unwrap(),
            Reference::Output { node: "research".into(), path: vec!["notes".into(), "0".into()] }
        );
        assert!(Reference::parse("research.result").is_err());
        assert!(Reference::parse("research..output").is_err());
        assert!(Reference::parse("ctx").is_err());
    }

    #[test]
    fn resolution_errors_are_distinguished() {
        let store = store();
        assert_eq!(store.resolve("research.output.notes.1").unwrap(), Value::from("b"));
        assert_eq!(
            store.resolve("draft.output"),
            Err(ReferenceError::Unpublished("draft".into()))
        );
        assert_eq!(
            store.resolve("ctx.audience"),
            Err(ReferenceError::UnknownVariable("audience".into()))
        );
        assert!(matches!(
            store.resolve("research.output.summary"),
            Err(ReferenceError::MissingField { segment, .. }) if segment == "summary"
        ));
    }

    #[test]
    fn outputs_are_write_once() {
        let mut store = store();
        let err = store.publish("research", Value::Null).unwrap_err();
        assert_eq!(err, AlreadyPublished("research".into()));
        assert_eq!(err.to_string(), "output of node 'research' already published");
        assert!(store.output("research").unwrap().get("title").is_some());
    }

    #[test]
    fn render_prefers_locals_then_references() {
        let store = store();
        let mut locals = BTreeMap::new();
        locals.insert("previous".to_string(), Value::from(json!({"title": "Draft 1"})));

        let text = store
            .render(
                "Revise {{ previous.title }} on {{ctx.topic}}: {{research.output.title}}",
                &locals,
            )
            .unwrap();
        assert_eq!(text, "Revise Draft 1 on borrow checker: Ownership");

        assert!(store.render("broken {{ ctx.topic", &locals).is_err());
    }

    #[test]
    fn interpolate_keeps_structure_for_whole_placeholders() {
        let store = store();
        let locals = BTreeMap::new();
        assert_eq!(
            store.interpolate("{{ research.output.notes }}", &locals).unwrap(),
            Value::from(json!(["a", "b"]))
        );
        assert_eq!(
            store.interpolate("about {{ctx.topic}}", &locals).unwrap(),
            Value::from("about borrow checker")
        );
        assert_eq!(store.interpolate("plain", &locals).unwrap(), Value::from("plain"));
    }
}
