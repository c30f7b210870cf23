//! Bound expressions.
//!
//! Binding replaces every symbolic reference of an `Expr` with the concrete
//! resource instance addresses it points at, and substitutes module inputs,
//! module outputs and the repetition context inline. What remains can be
//! evaluated against projected attribute values at plan or apply time.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::declaration::{Attributes, InstanceKey, ResourceAddress};

/// An expression whose references have been resolved to instances.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundExpr {
    /// A value known at build time.
    Value(Value),
    /// One instance, optionally one attribute of it.
    Instance {
        /// Referenced instance.
        address: ResourceAddress,
        /// Attribute, or the whole object when absent.
        attribute: Option<String>,
    },
    /// Every instance of a repeated resource.
    Collection {
        /// Instances in key order.
        instances: Vec<(InstanceKey, ResourceAddress)>,
        /// Attribute, or the whole object when absent.
        attribute: Option<String>,
        /// Render as a map keyed by instance key (`for_each`) instead of a
        /// list (`count`).
        as_map: bool,
    },
    /// A list.
    List(Vec<BoundExpr>),
    /// A map.
    Map(BTreeMap<String, BoundExpr>),
    /// String concatenation.
    Template(Vec<BoundExpr>),
    /// An attribute of the resource a postcondition is attached to.
    SelfAttr(String),
}

/// Result of evaluating a bound expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Eval {
    /// The value is known.
    Known(Value),
    /// The value depends on something only known after apply.
    Unknown,
}

/// Attribute values projected for one instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Projected {
    /// Known attribute values.
    pub attributes: Attributes,
    /// Attributes whose value is only known after apply.
    pub unknown: BTreeSet<String>,
}

/// Projected values keyed by instance address.
pub type Projections = BTreeMap<ResourceAddress, Projected>;

/// Everything an evaluation can look at.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    projections: &'a Projections,
    self_attributes: Option<&'a Attributes>,
}

/// A predicate over bound expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundPredicate {
    /// Both values are equal.
    Equals(BoundExpr, BoundExpr),
    /// The values differ.
    NotEquals(BoundExpr, BoundExpr),
    /// The value is not null.
    NotNull(BoundExpr),
    /// The value is a non-empty string, list or map.
    NotEmpty(BoundExpr),
    /// The value is `true`.
    Truthy(BoundExpr),
}

/// A bound precondition or postcondition.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundCondition {
    /// The assertion.
    pub check: BoundPredicate,
    /// Message reported when it fails.
    pub message: String,
}

impl Eval {
    /// Returns the value if known.
    #[must_use]
    pub fn known(self) -> Option<Value> {
        match self {
            Self::Known(value) => Some(value),
            Self::Unknown => None,
        }
    }

    /// Returns true if the value is unknown.
    #[must_use]
    pub const fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }
}

impl Projected {
    /// A projection where every attribute is known.
    #[must_use]
    pub fn known(attributes: Attributes) -> Self {
        Self {
            attributes,
            unknown: BTreeSet::new(),
        }
    }
}

impl<'a> EvalContext<'a> {
    /// Creates a context over the given projections.
    #[must_use]
    pub const fn new(projections: &'a Projections) -> Self {
        Self {
            projections,
            self_attributes: None,
        }
    }

    /// Makes `self.<attr>` resolve against `attributes`.
    #[must_use]
    pub const fn with_self(mut self, attributes: &'a Attributes) -> Self {
        self.self_attributes = Some(attributes);
        self
    }

    fn lookup(&self, address: &ResourceAddress, attribute: Option<&str>) -> Eval {
        let Some(projected) = self.projections.get(address) else {
            return Eval::Unknown;
        };
        match attribute {
            Some(name) if projected.unknown.contains(name) => Eval::Unknown,
            Some(name) => Eval::Known(projected.attributes.get(name).cloned().unwrap_or(Value::Null)),
            None if !projected.unknown.is_empty() => Eval::Unknown,
            None => Eval::Known(Value::Object(
                projected
                    .attributes
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            )),
        }
    }
}

impl BoundExpr {
    /// Evaluates the expression.
    #[must_use]
    pub fn evaluate(&self, ctx: &EvalContext<'_>) -> Eval {
        match self {
            Self::Value(value) => Eval::Known(value.clone()),
            Self::Instance { address, attribute } => ctx.lookup(address, attribute.as_deref()),
            Self::Collection {
                instances,
                attribute,
                as_map,
            } => {
                let mut values = Vec::with_capacity(instances.len());
                for (key, address) in instances {
                    match ctx.lookup(address, attribute.as_deref()) {
                        Eval::Known(value) => values.push((key.to_string(), value)),
                        Eval::Unknown => return Eval::Unknown,
                    }
                }
                if *as_map {
                    Eval::Known(Value::Object(values.into_iter().collect()))
                } else {
                    Eval::Known(Value::Array(values.into_iter().map(|(_, v)| v).collect()))
                }
            }
            Self::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    match item.evaluate(ctx) {
                        Eval::Known(value) => values.push(value),
                        Eval::Unknown => return Eval::Unknown,
                    }
                }
                Eval::Known(Value::Array(values))
            }
            Self::Map(entries) => {
                let mut values = serde_json::Map::new();
                for (key, item) in entries {
                    match item.evaluate(ctx) {
                        Eval::Known(value) => {
                            values.insert(key.clone(), value);
                        }
                        Eval::Unknown => return Eval::Unknown,
                    }
                }
                Eval::Known(Value::Object(values))
            }
            Self::Template(parts) => {
                let mut rendered = String::new();
                for part in parts {
                    match part.evaluate(ctx) {
                        Eval::Known(value) => rendered.push_str(&render(&value)),
                        Eval::Unknown => return Eval::Unknown,
                    }
                }
                Eval::Known(Value::String(rendered))
            }
            Self::SelfAttr(name) => match ctx.self_attributes {
                Some(attributes) => Eval::Known(attributes.get(name).cloned().unwrap_or(Value::Null)),
                None => Eval::Unknown,
            },
        }
    }

    /// Every instance address the expression reads from.
    pub fn collect_addresses(&self, out: &mut BTreeSet<ResourceAddress>) {
        match self {
            Self::Value(_) | Self::SelfAttr(_) => {}
            Self::Instance { address, .. } => {
                out.insert(address.clone());
            }
            Self::Collection { instances, .. } => {
                out.extend(instances.iter().map(|(_, address)| address.clone()));
            }
            Self::List(items) | Self::Template(items) => {
                for item in items {
                    item.collect_addresses(out);
                }
            }
            Self::Map(entries) => {
                for item in entries.values() {
                    item.collect_addresses(out);
                }
            }
        }
    }

    /// Returns true if the expression reads no instance and no `self`.
    #[must_use]
    pub fn is_static(&self) -> bool {
        match self {
            Self::Value(_) => true,
            Self::Instance { .. } | Self::Collection { .. } | Self::SelfAttr(_) => false,
            Self::List(items) | Self::Template(items) => items.iter().all(Self::is_static),
            Self::Map(entries) => entries.values().all(Self::is_static),
        }
    }
}

impl BoundPredicate {
    fn operands(&self) -> Vec<&BoundExpr> {
        match self {
            Self::Equals(a, b) | Self::NotEquals(a, b) => vec![a, b],
            Self::NotNull(a) | Self::NotEmpty(a) | Self::Truthy(a) => vec![a],
        }
    }
}

impl BoundCondition {
    /// Evaluates the check. `None` means an operand is still unknown.
    #[must_use]
    pub fn evaluate(&self, ctx: &EvalContext<'_>) -> Option<bool> {
        let mut values = Vec::with_capacity(2);
        for operand in self.check.operands() {
            values.push(operand.evaluate(ctx).known()?);
        }

        let holds = match (&self.check, values.as_slice()) {
            (BoundPredicate::Equals(..), [a, b]) => a == b,
            (BoundPredicate::NotEquals(..), [a, b]) => a != b,
            (BoundPredicate::NotNull(_), [v]) => !v.is_null(),
            (BoundPredicate::NotEmpty(_), [v]) => match v {
                Value::Null => false,
                Value::String(s) => !s.is_empty(),
                Value::Array(a) => !a.is_empty(),
                Value::Object(o) => !o.is_empty(),
                Value::Bool(_) | Value::Number(_) => true,
            },
            (BoundPredicate::Truthy(_), [v]) => *v == Value::Bool(true),
            _ => false,
        };
        Some(holds)
    }

    /// Every instance address the check reads from.
    pub fn collect_addresses(&self, out: &mut BTreeSet<ResourceAddress>) {
        for operand in self.check.operands() {
            operand.collect_addresses(out);
        }
    }
}

/// Evaluates an argument map, splitting known values from unknown names.
#[must_use]
pub fn evaluate_arguments(
    arguments: &BTreeMap<String, BoundExpr>,
    ctx: &EvalContext<'_>,
) -> (Attributes, BTreeSet<String>) {
    let mut known = Attributes::new();
    let mut unknown = BTreeSet::new();
    for (name, expr) in arguments {
        match expr.evaluate(ctx) {
            Eval::Known(value) => {
                known.insert(name.clone(), value);
            }
            Eval::Unknown => {
                unknown.insert(name.clone());
            }
        }
    }
    (known, unknown)
}

/// Renders a value inside a string template.
fn render(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket() -> ResourceAddress {
        ResourceAddress::new("bucket", "logs")
    }

    fn projections(unknown: &[&str]) -> Projections {
        let mut attributes = Attributes::new();
        attributes.insert(String::from("name"), Value::from("logs"));
        attributes.insert(String::from("size"), Value::from(3));
        let mut projections = Projections::new();
        projections.insert(
            bucket(),
            Projected {
                attributes,
                unknown: unknown.iter().map(|s| (*s).to_string()).collect(),
            },
        );
        projections
    }

    fn attr(name: &str) -> BoundExpr {
        BoundExpr::Instance {
            address: bucket(),
            attribute: Some(name.to_string()),
        }
    }

    #[test]
    fn test_template_renders_known_parts() {
        let projections = projections(&[]);
        let expr = BoundExpr::Template(vec![
            BoundExpr::Value(Value::from("arn:")),
            attr("name"),
            BoundExpr::Value(Value::from(":")),
            attr("size"),
        ]);
        assert_eq!(
            expr.evaluate(&EvalContext::new(&projections)),
            Eval::Known(Value::from("arn:logs:3"))
        );
    }

    #[test]
    fn test_unknown_propagates() {
        let projections = projections(&["id"]);
        let ctx = EvalContext::new(&projections);
        assert!(attr("id").evaluate(&ctx).is_unknown());
        assert!(BoundExpr::List(vec![attr("name"), attr("id")]).evaluate(&ctx).is_unknown());
        assert_eq!(attr("name").evaluate(&ctx), Eval::Known(Value::from("logs")));
        assert!(BoundExpr::Instance { address: bucket(), attribute: None }.evaluate(&ctx).is_unknown());
    }

    #[test]
    fn test_collection_as_map() {
        let mut projections = Projections::new();
        let mut instances = Vec::new();
        for key in ["a", "b"] {
            let address = bucket().with_key(InstanceKey::Key(key.to_string()));
            let mut attributes = Attributes::new();
            attributes.insert(String::from("id"), Value::from(format!("id-{key}")));
            projections.insert(address.clone(), Projected::known(attributes));
            instances.push((InstanceKey::Key(key.to_string()), address));
        }
        let expr = BoundExpr::Collection {
            instances,
            attribute: Some(String::from("id")),
            as_map: true,
        };
        assert_eq!(
            expr.evaluate(&EvalContext::new(&projections)),
            Eval::Known(serde_json::json!({"a": "id-a", "b": "id-b"}))
        );
        let mut addresses = BTreeSet::new();
        expr.collect_addresses(&mut addresses);
        assert_eq!(addresses.len(), 2);
        assert!(!expr.is_static());
    }

    #[test]
    fn test_condition_with_self() {
        let projections = Projections::new();
        let mut own = Attributes::new();
        own.insert(String::from("region"), Value::from("eu"));
        let condition = BoundCondition {
            check: BoundPredicate::Equals(
                BoundExpr::SelfAttr(String::from("region")),
                BoundExpr::Value(Value::from("eu")),
            ),
            message: String::from("wrong region"),
        };
        assert_eq!(condition.evaluate(&EvalContext::new(&projections)), None);
        assert_eq!(
            condition.evaluate(&EvalContext::new(&projections).with_self(&own)),
            Some(true)
        );
    }
}
