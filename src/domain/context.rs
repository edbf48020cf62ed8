//! Evaluation context shared by the condition and formula evaluators.
//!
//! The context is a flat `field -> JSON value` map assembled completely
//! before any evaluation starts; evaluators never reach back into storage.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::entities::{AttributeNode, ManufacturingType, NodeId, NodeType, SelectionInput};

/// Flat field-name → value map used as the evaluation environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigurationContext {
    values: BTreeMap<String, Value>,
}

impl ConfigurationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(field, value);
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(field.into(), value.into());
    }

    /// Insert only if the field is not set yet.
    pub fn insert_default(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.values.entry(field.into()).or_insert_with(|| value.into());
    }

    /// Resolve a field, trying the flat key first and then walking dotted
    /// segments through nested objects.
    ///
    /// A missing intermediate key yields None ("undefined"), never an error.
    pub fn get(&self, field: &str) -> Option<&Value> {
        if let Some(value) = self.values.get(field) {
            return Some(value);
        }
        let mut segments = field.split('.');
        let head = segments.next()?;
        let mut current = self.values.get(head)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Loose numeric view of a field (numbers, numeric strings, booleans).
    pub fn number(&self, field: &str) -> Option<f64> {
        self.get(field).and_then(as_number)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// Canonical JSON text of the whole context, used as a cache key component.
    pub fn canonical(&self) -> String {
        // the map iterates in key order
        Value::Object(self.values.iter().map(|(k, v)| (k.clone(), v.clone())).collect()).to_string()
    }

    /// Assemble the context for one configuration.
    ///
    /// Keys, lowest precedence first:
    /// 1. manufacturing-type bases (`base_price`, `base_weight`)
    /// 2. free inputs (`width`, `height`, ...)
    /// 3. every selection under its node key and its full path
    /// 4. ancestor scope: a selected option publishes its own key as the
    ///    value of its parent attribute unless that attribute has its own
    ///    explicit selection
    pub fn build(
        manufacturing_type: &ManufacturingType,
        inputs: &BTreeMap<String, Value>,
        selections: &[SelectionInput],
        nodes: &HashMap<NodeId, AttributeNode>,
    ) -> Self {
        let mut ctx = Self::new()
            .with("base_price", manufacturing_type.base_price)
            .with("base_weight", manufacturing_type.base_weight);

        for (key, value) in inputs {
            ctx.insert(key.clone(), value.clone());
        }

        for selection in selections {
            if let Some(node) = nodes.get(&selection.node_id) {
                ctx.insert(node.key().to_string(), selection.value.clone());
                ctx.insert(node.materialized_path.clone(), selection.value.clone());
            }
        }

        for selection in selections {
            let Some(node) = nodes.get(&selection.node_id) else {
                continue;
            };
            if node.node_type != NodeType::Option || !is_truthy(&selection.value) {
                continue;
            }
            if let Some(parent) = node.parent_id.and_then(|id| nodes.get(&id)) {
                let explicitly_selected = selections.iter().any(|s| s.node_id == parent.id);
                if !explicitly_selected {
                    ctx.insert_default(parent.key().to_string(), node.key().to_string());
                    ctx.insert_default(parent.materialized_path.clone(), node.key().to_string());
                }
            }
        }

        ctx
    }
}

impl FromIterator<(String, Value)> for ConfigurationContext {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// Loose numeric coercion: numbers, numeric strings and booleans.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Truthiness: null, false, 0, "", [] and {} are falsy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|v| v != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}
