//! Declaration model.
//!
//! Typed, normalized representation of resources, module calls, outputs
//! and the expressions that connect them. The configuration language that
//! produces this model lives outside the engine; declarations arrive here
//! as plain data (usually YAML).

mod address;
mod expr;
mod model;

pub use address::{InstanceKey, ModuleInstance, ModulePath, ResourceAddress};
pub use expr::{Condition, Expr, Predicate, Reference};
pub use model::{
    DeclarationSet, DependsOn, Lifecycle, ModuleCall, OutputDeclaration, Repetition,
    ResourceDeclaration,
};

/// Attribute map of a resource instance.
pub type Attributes = std::collections::BTreeMap<String, serde_json::Value>;
