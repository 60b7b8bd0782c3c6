//! Structural introspection of built pipelines.
//!
//! Every stage and consumer can describe itself into a [`ProbeScope`]. The
//! resulting tree is read-only diagnostics: producing it never changes what a
//! dispatch does.

use serde::Serialize;
use serde_json::{Map, Value};

/// A named node of the probe tree with key/value entries and child scopes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProbeScope {
    name: String,
    entries: Map<String, Value>,
    children: Vec<ProbeScope>,
}

impl ProbeScope {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Map::new(),
            children: Vec::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Records `key = value` on this scope, replacing any earlier value.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Appends a child scope and returns it for further description.
    pub fn create_scope(&mut self, name: impl Into<String>) -> &mut ProbeScope {
        self.children.push(ProbeScope::new(name));
        let last = self.children.len() - 1;
        &mut self.children[last]
    }

    #[must_use]
    pub fn entry(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    #[must_use]
    pub fn children(&self) -> &[ProbeScope] {
        &self.children
    }

    /// First direct child named `name`.
    #[must_use]
    pub fn child(&self, name: &str) -> Option<&ProbeScope> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Renders the tree as `{ "<name>": { entries..., "<child>": {...} } }`.
    ///
    /// Children sharing a name are collected into an array.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut object = Map::new();
        object.insert(self.name.clone(), self.body());
        Value::Object(object)
    }

    fn body(&self) -> Value {
        let mut body = self.entries.clone();
        for child in &self.children {
            let rendered = child.body();
            match body.get_mut(&child.name) {
                Some(Value::Array(items)) => items.push(rendered),
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, rendered]);
                }
                None => {
                    body.insert(child.name.clone(), rendered);
                }
            }
        }
        Value::Object(body)
    }
}
