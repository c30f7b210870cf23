//! Diff engine for comparing declared arguments with recorded attributes.
//!
//! The same attribute-level comparison drives planning (declared vs.
//! stored or refreshed) and drift detection (stored vs. live).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::debug;

use crate::declaration::{Attributes, Lifecycle};
use crate::provider::ResourceSchema;

/// A single differing attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeChange {
    /// Attribute name.
    pub name: String,
    /// Value before the change (`null` when absent).
    pub before: Value,
    /// Value after the change; `None` when known only after apply.
    pub after: Option<Value>,
    /// The provider cannot change this attribute in place.
    #[serde(default)]
    pub forces_replacement: bool,
    /// The value is hidden in rendered output.
    #[serde(default)]
    pub sensitive: bool,
}

/// Computes attribute-level diffs for one resource type.
#[derive(Debug, Clone, Copy)]
pub struct DiffEngine<'a> {
    /// Schema of the resource type.
    schema: &'a ResourceSchema,
    /// Lifecycle policy, when the resource is declared.
    lifecycle: Option<&'a Lifecycle>,
}

impl<'a> DiffEngine<'a> {
    /// Creates a diff engine for a schema.
    #[must_use]
    pub const fn new(schema: &'a ResourceSchema) -> Self {
        Self {
            schema,
            lifecycle: None,
        }
    }

    /// Applies a lifecycle's `ignore_changes`.
    #[must_use]
    pub const fn with_lifecycle(mut self, lifecycle: &'a Lifecycle) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    fn ignores(&self, name: &str) -> bool {
        self.lifecycle.is_some_and(|l| l.ignores(name))
    }

    fn change(&self, name: &str, before: Value, after: Option<Value>) -> AttributeChange {
        let sensitive = self
            .schema
            .attributes
            .get(name)
            .is_some_and(|a| a.sensitive);
        AttributeChange {
            name: name.to_string(),
            before,
            after,
            forces_replacement: self.schema.forces_replacement(name),
            sensitive,
        }
    }

    /// Compares declared arguments with the current attributes of an
    /// existing object. `previous` are the arguments recorded at the last
    /// write; an argument declared then but not now is planned as `null`.
    #[must_use]
    pub fn arguments(
        &self,
        declared: &Attributes,
        unknown: &BTreeSet<String>,
        previous: &Attributes,
        current: &Attributes,
    ) -> Vec<AttributeChange> {
        let names: BTreeSet<&String> = declared
            .keys()
            .chain(unknown.iter())
            .chain(previous.keys())
            .collect();

        let mut changes = Vec::new();
        for name in names {
            if self.ignores(name) {
                continue;
            }
            let before = current.get(name).cloned().unwrap_or(Value::Null);

            if unknown.contains(name) {
                changes.push(self.change(name, before, None));
                continue;
            }

            let after = declared.get(name).cloned().unwrap_or(Value::Null);
            if before != after {
                debug!("Attribute {name} differs");
                changes.push(self.change(name, before, Some(after)));
            }
        }
        changes
    }

    /// Compares recorded attributes with attributes read from the live
    /// object. Every attribute is considered.
    #[must_use]
    pub fn observed(&self, stored: &Attributes, live: &Attributes) -> Vec<AttributeChange> {
        let names: BTreeSet<&String> = stored.keys().chain(live.keys()).collect();

        names
            .into_iter()
            .filter(|name| !self.ignores(name))
            .filter_map(|name| {
                let before = stored.get(name).cloned().unwrap_or(Value::Null);
                let after = live.get(name).cloned().unwrap_or(Value::Null);
                (before != after).then(|| self.change(name, before, Some(after)))
            })
            .collect()
    }

    /// The arguments to send to the provider: declared values, except
    /// that ignored attributes keep their current value.
    #[must_use]
    pub fn effective_arguments(&self, declared: &Attributes, current: &Attributes) -> Attributes {
        let mut effective = declared.clone();
        if let Some(lifecycle) = self.lifecycle {
            for (name, value) in current {
                let is_argument = self.schema.attributes.get(name).is_some_and(|a| a.is_argument());
                if is_argument && lifecycle.ignores(name) {
                    effective.insert(name.clone(), value.clone());
                }
            }
        }
        effective
    }
}

/// Returns true if any change forces replacement.
#[must_use]
pub fn requires_replacement(changes: &[AttributeChange]) -> bool {
    changes.iter().any(|c| c.forces_replacement)
}

impl std::fmt::Display for AttributeChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let render = |value: &Value| {
            if self.sensitive {
                String::from("(sensitive)")
            } else {
                value.to_string()
            }
        };
        let after = self
            .after
            .as_ref()
            .map_or_else(|| String::from("(known after apply)"), render);
        write!(f, "{}: {} -> {after}", self.name, render(&self.before))?;
        if self.forces_replacement {
            write!(f, " (forces replacement)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::AttributeSchema;

    fn schema() -> ResourceSchema {
        ResourceSchema::new(1)
            .with("id", AttributeSchema::computed())
            .with("name", AttributeSchema::required().force_new())
            .with("tags", AttributeSchema::optional())
            .with("password", AttributeSchema::optional().sensitive())
    }

    fn attrs(pairs: &[(&str, Value)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_force_new_detected() {
        let schema = schema();
        let engine = DiffEngine::new(&schema);
        let current = attrs(&[("id", Value::from("b-1")), ("name", Value::from("a"))]);
        let declared = attrs(&[("name", Value::from("b"))]);

        let changes = engine.arguments(&declared, &BTreeSet::new(), &declared, &current);
        assert_eq!(changes.len(), 1);
        assert!(requires_replacement(&changes));
    }

    #[test]
    fn test_in_place_and_removed_argument() {
        let schema = schema();
        let engine = DiffEngine::new(&schema);
        let current = attrs(&[("name", Value::from("a")), ("tags", Value::from("x"))]);
        let previous = attrs(&[("name", Value::from("a")), ("tags", Value::from("x"))]);
        let declared = attrs(&[("name", Value::from("a"))]);

        let changes = engine.arguments(&declared, &BTreeSet::new(), &previous, &current);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].name, "tags");
        assert_eq!(changes[0].after, Some(Value::Null));
        assert!(!requires_replacement(&changes));
    }

    #[test]
    fn test_unknown_is_a_change() {
        let schema = schema();
        let engine = DiffEngine::new(&schema);
        let current = attrs(&[("name", Value::from("a"))]);
        let unknown: BTreeSet<String> = [String::from("tags")].into_iter().collect();

        let changes = engine.arguments(&Attributes::new(), &unknown, &Attributes::new(), &current);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].after, None);
        assert!(changes[0].to_string().contains("known after apply"));
    }

    #[test]
    fn test_ignore_changes() {
        let schema = schema();
        let lifecycle = Lifecycle {
            ignore_changes: vec![String::from("tags")],
            ..Lifecycle::default()
        };
        let engine = DiffEngine::new(&schema).with_lifecycle(&lifecycle);
        let current = attrs(&[("name", Value::from("a")), ("tags", Value::from("live"))]);
        let declared = attrs(&[("name", Value::from("a")), ("tags", Value::from("declared"))]);

        assert!(engine.arguments(&declared, &BTreeSet::new(), &declared, &current).is_empty());
        assert!(engine.observed(&declared, &current).is_empty());
        let effective = engine.effective_arguments(&declared, &current);
        assert_eq!(effective["tags"], Value::from("live"));
    }

    #[test]
    fn test_sensitive_rendering() {
        let schema = schema();
        let engine = DiffEngine::new(&schema);
        let changes = engine.observed(
            &attrs(&[("password", Value::from("old"))]),
            &attrs(&[("password", Value::from("new"))]),
        );
        assert_eq!(changes[0].to_string(), "password: (sensitive) -> (sensitive)");
    }
}
