//! The normalized declaration set handed to the engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::expr::{Condition, Expr};

/// A module body: resources, nested module calls, outputs and the inputs
/// it accepts (with defaults).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeclarationSet {
    /// Input variables with their default values.
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    /// Resource declarations.
    #[serde(default)]
    pub resources: Vec<ResourceDeclaration>,
    /// Child module calls.
    #[serde(default)]
    pub modules: Vec<ModuleCall>,
    /// Output declarations.
    #[serde(default)]
    pub outputs: Vec<OutputDeclaration>,
}

/// A declared resource, possibly repeated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDeclaration {
    /// Resource type, resolved against the provider registry.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Name, unique per type within the module.
    pub name: String,
    /// Optional repetition.
    #[serde(default)]
    pub repetition: Option<Repetition>,
    /// Declared arguments.
    #[serde(default)]
    pub arguments: BTreeMap<String, Expr>,
    /// Explicit ordering hints.
    #[serde(default)]
    pub depends_on: Vec<DependsOn>,
    /// Lifecycle policy overlays.
    #[serde(default)]
    pub lifecycle: Lifecycle,
    /// Checked before the node's change starts.
    #[serde(default)]
    pub preconditions: Vec<Condition>,
    /// Checked after the node's change completes.
    #[serde(default)]
    pub postconditions: Vec<Condition>,
}

/// `count` or `for_each` repetition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Repetition {
    /// A non-negative integer; instances are keyed `0..n`.
    Count(Expr),
    /// A map (keys, with `each.value` bound to the entry) or a list of
    /// unique strings (used as a set).
    ForEach(Expr),
}

/// An explicit ordering hint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependsOn {
    /// Every instance of a resource in the same module.
    Resource {
        /// Resource type.
        #[serde(rename = "type")]
        resource_type: String,
        /// Resource name.
        name: String,
    },
    /// Every resource inside every instance of a child module call.
    Module(String),
}

/// Per-resource lifecycle policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifecycle {
    /// Fail the plan if the resource would be destroyed.
    #[serde(default)]
    pub prevent_destroy: bool,
    /// On replacement, create the new object before destroying the old.
    #[serde(default)]
    pub create_before_destroy: bool,
    /// Attributes whose differences are ignored.
    #[serde(default)]
    pub ignore_changes: Vec<String>,
    /// Ignore differences on every attribute.
    #[serde(default)]
    pub ignore_all_changes: bool,
}

/// A child module call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleCall {
    /// Call name, unique within the calling module.
    pub name: String,
    /// Optional repetition of the whole module.
    #[serde(default)]
    pub repetition: Option<Repetition>,
    /// Input values, evaluated in the caller's scope.
    #[serde(default)]
    pub inputs: BTreeMap<String, Expr>,
    /// Explicit ordering hints applied to every resource in the module.
    #[serde(default)]
    pub depends_on: Vec<DependsOn>,
    /// The module body.
    pub body: DeclarationSet,
}

/// A named output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDeclaration {
    /// Output name.
    pub name: String,
    /// Value expression.
    pub value: Expr,
    /// Hide the value in rendered output.
    #[serde(default)]
    pub sensitive: bool,
}

impl Lifecycle {
    /// Returns true if differences on `attribute` are ignored.
    #[must_use]
    pub fn ignores(&self, attribute: &str) -> bool {
        self.ignore_all_changes || self.ignore_changes.iter().any(|a| a == attribute)
    }
}

impl DeclarationSet {
    /// Returns true if nothing is declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.modules.is_empty() && self.outputs.is_empty()
    }

    /// Counts resource declarations including those in nested modules
    /// (before repetition).
    #[must_use]
    pub fn declaration_count(&self) -> usize {
        self.resources.len()
            + self
                .modules
                .iter()
                .map(|m| m.body.declaration_count())
                .sum::<usize>()
    }
}

impl ResourceDeclaration {
    /// Creates a bare declaration with no arguments.
    #[must_use]
    pub fn new(resource_type: &str, name: &str) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            name: name.to_string(),
            repetition: None,
            arguments: BTreeMap::new(),
            depends_on: Vec::new(),
            lifecycle: Lifecycle::default(),
            preconditions: Vec::new(),
            postconditions: Vec::new(),
        }
    }

    /// Adds an argument.
    #[must_use]
    pub fn with_argument(mut self, name: &str, value: Expr) -> Self {
        self.arguments.insert(name.to_string(), value);
        self
    }

    /// Sets the repetition.
    #[must_use]
    pub fn with_repetition(mut self, repetition: Repetition) -> Self {
        self.repetition = Some(repetition);
        self
    }

    /// Sets the lifecycle policy.
    #[must_use]
    pub fn with_lifecycle(mut self, lifecycle: Lifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    /// Adds an explicit dependency on a resource in the same module.
    #[must_use]
    pub fn depends_on_resource(mut self, resource_type: &str, name: &str) -> Self {
        self.depends_on.push(DependsOn::Resource {
            resource_type: resource_type.to_string(),
            name: name.to_string(),
        });
        self
    }
}
