//! Argument expressions as they arrive from the configuration front end.
//!
//! Expressions are already normalized: the only things left to resolve are
//! references to other resources, module outputs, module inputs and the
//! repetition context (`count.index`, `each.key`, `each.value`).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::address::InstanceKey;

/// An argument expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    /// A literal JSON value.
    Literal(Value),
    /// A reference to another object's value.
    Ref(Reference),
    /// A list of expressions.
    List(Vec<Expr>),
    /// A map of expressions.
    Map(BTreeMap<String, Expr>),
    /// String concatenation of the parts' renderings.
    Template(Vec<Expr>),
    /// `count.index` of the enclosing repetition.
    CountIndex,
    /// `each.key` of the enclosing repetition.
    EachKey,
    /// `each.value` of the enclosing repetition.
    EachValue,
    /// A module input variable (root variables at the top level).
    Input(String),
}

/// A reference found inside an expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reference {
    /// A resource in the same module, optionally one instance and one
    /// attribute of it.
    Resource {
        /// Resource type.
        #[serde(rename = "type")]
        resource_type: String,
        /// Resource name.
        name: String,
        /// Instance key; absent means the whole collection for repeated
        /// resources.
        #[serde(default)]
        key: Option<InstanceKey>,
        /// Attribute name; absent means the whole object.
        #[serde(default)]
        attribute: Option<String>,
    },
    /// An output of a child module call.
    ModuleOutput {
        /// Module call name.
        module: String,
        /// Module instance key; absent means all instances for repeated
        /// calls.
        #[serde(default)]
        key: Option<InstanceKey>,
        /// Output name.
        output: String,
    },
    /// An attribute of the resource the condition is attached to. Only
    /// valid inside postconditions.
    #[serde(rename = "self")]
    SelfAttribute(String),
}

/// A boolean check over expressions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    /// Both values are equal.
    Equals(Expr, Expr),
    /// The values differ.
    NotEquals(Expr, Expr),
    /// The value is not null.
    NotNull(Expr),
    /// The value is a non-empty string, list or map.
    NotEmpty(Expr),
    /// The value is `true`.
    Truthy(Expr),
}

/// A precondition or postcondition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// The assertion.
    pub check: Predicate,
    /// Message reported when the assertion fails.
    pub message: String,
}

impl Expr {
    /// Shorthand for a string literal.
    #[must_use]
    pub fn string(value: &str) -> Self {
        Self::Literal(Value::String(value.to_string()))
    }

    /// Shorthand for a reference to one attribute of a root-scope resource.
    #[must_use]
    pub fn attr(resource_type: &str, name: &str, attribute: &str) -> Self {
        Self::Ref(Reference::Resource {
            resource_type: resource_type.to_string(),
            name: name.to_string(),
            key: None,
            attribute: Some(attribute.to_string()),
        })
    }

    /// Visits every reference inside the expression.
    pub fn for_each_reference(&self, visit: &mut impl FnMut(&Reference)) {
        match self {
            Self::Ref(reference) => visit(reference),
            Self::List(items) | Self::Template(items) => {
                for item in items {
                    item.for_each_reference(visit);
                }
            }
            Self::Map(entries) => {
                for item in entries.values() {
                    item.for_each_reference(visit);
                }
            }
            Self::Literal(_) | Self::CountIndex | Self::EachKey | Self::EachValue | Self::Input(_) => {}
        }
    }
}

impl Predicate {
    /// The operand expressions of the predicate.
    #[must_use]
    pub fn operands(&self) -> Vec<&Expr> {
        match self {
            Self::Equals(a, b) | Self::NotEquals(a, b) => vec![a, b],
            Self::NotNull(a) | Self::NotEmpty(a) | Self::Truthy(a) => vec![a],
        }
    }
}
