//! Expansion of declarations into the instance graph.
//!
//! Each module scope is expanded in three passes: repetition keys of its
//! resources are computed statically, child module calls are expanded in
//! the order their inputs require, and finally resource arguments are
//! bound. Module boundaries vanish in the result; a module's resources are
//! ordinary nodes whose addresses carry the module instance path.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::declaration::{
    Condition, DeclarationSet, DependsOn, Expr, InstanceKey, ModuleCall, ModulePath, Predicate,
    Reference, Repetition, ResourceAddress, ResourceDeclaration,
};
use crate::error::ConfigError;
use crate::provider::ProviderRegistry;

use super::bound::{BoundCondition, BoundExpr, BoundPredicate, EvalContext, Projections};
use super::dag::{BoundOutput, Graph, GraphNode, NodeId};

/// Builds graphs, validating resource types against a registry.
#[derive(Debug)]
pub struct GraphBuilder<'a> {
    registry: &'a ProviderRegistry,
}

/// Repetition context of one instance.
#[derive(Debug, Clone, Default)]
struct RepContext {
    index: Option<u64>,
    each: Option<(String, Value)>,
}

/// The instance keys a declaration expands to.
#[derive(Debug, Clone)]
enum Instances {
    Single,
    Repeated {
        keys: Vec<(InstanceKey, RepContext)>,
        as_map: bool,
    },
}

/// Bound outputs of a child module call.
#[derive(Debug, Clone)]
enum ModuleOutputs {
    Single(BTreeMap<String, BoundExpr>),
    Repeated {
        instances: Vec<(InstanceKey, BTreeMap<String, BoundExpr>)>,
        as_map: bool,
    },
}

/// Names visible inside one module instance.
#[derive(Debug)]
struct Scope {
    path: ModulePath,
    inputs: BTreeMap<String, BoundExpr>,
    resources: BTreeMap<(String, String), Instances>,
    modules: BTreeMap<String, ModuleOutputs>,
}

/// A node before dependency edges are resolved.
#[derive(Debug)]
struct PendingNode {
    node: GraphNode,
    hints: Vec<(ModulePath, DependsOn)>,
}

#[derive(Debug, Default)]
struct Expansion {
    nodes: Vec<PendingNode>,
    declared_resources: BTreeSet<(ModulePath, String, String)>,
    declared_calls: BTreeSet<(ModulePath, String)>,
}

impl<'a> GraphBuilder<'a> {
    /// Creates a builder.
    #[must_use]
    pub const fn new(registry: &'a ProviderRegistry) -> Self {
        Self { registry }
    }

    /// Expands `declarations` into a DAG.
    pub fn build(&self, declarations: &DeclarationSet) -> Result<Graph, ConfigError> {
        let mut expansion = Expansion::default();

        let inputs = declarations
            .variables
            .iter()
            .map(|(name, value)| (name.clone(), BoundExpr::Value(value.clone())))
            .collect();
        let outputs = expansion.expand_scope(ModulePath::root(), declarations, inputs, &[])?;

        let root_outputs = declarations
            .outputs
            .iter()
            .map(|output| {
                let value = outputs
                    .get(&output.name)
                    .cloned()
                    .unwrap_or(BoundExpr::Value(Value::Null));
                BoundOutput {
                    name: output.name.clone(),
                    value,
                    sensitive: output.sensitive,
                }
            })
            .collect();

        for pending in &expansion.nodes {
            self.registry.resolve(&pending.node.address)?;
        }

        let nodes = expansion.link()?;
        let graph = Graph::assemble(nodes, root_outputs)?;
        debug!("Built graph with {} node(s)", graph.len());
        Ok(graph)
    }
}

impl Expansion {
    /// Expands one module instance. Returns its bound outputs.
    fn expand_scope(
        &mut self,
        path: ModulePath,
        body: &DeclarationSet,
        inputs: BTreeMap<String, BoundExpr>,
        inherited_hints: &[(ModulePath, DependsOn)],
    ) -> Result<BTreeMap<String, BoundExpr>, ConfigError> {
        let mut scope = Scope {
            path,
            inputs,
            resources: BTreeMap::new(),
            modules: BTreeMap::new(),
        };

        for decl in &body.resources {
            let owner = scope.label(&decl.resource_type, &decl.name);
            let key = (decl.resource_type.clone(), decl.name.clone());
            if scope.resources.contains_key(&key) {
                return Err(ConfigError::DuplicateDeclaration { address: owner });
            }
            let instances = scope.instances(decl.repetition.as_ref(), &owner)?;
            scope.resources.insert(key, instances);
            self.declared_resources.insert((
                scope.path.clone(),
                decl.resource_type.clone(),
                decl.name.clone(),
            ));
        }

        for call in order_module_calls(&scope.path, &body.modules)? {
            self.expand_call(&mut scope, call, inherited_hints)?;
        }

        for decl in &body.resources {
            self.bind_resource(&scope, decl, inherited_hints)?;
        }

        let mut outputs = BTreeMap::new();
        for output in &body.outputs {
            let owner = format!("output {}", output.name);
            let value = scope.bind(&RepContext::default(), &output.value, false, &owner)?;
            outputs.insert(output.name.clone(), value);
        }

        Ok(outputs)
    }

    fn expand_call(
        &mut self,
        scope: &mut Scope,
        call: &ModuleCall,
        inherited_hints: &[(ModulePath, DependsOn)],
    ) -> Result<(), ConfigError> {
        let owner = scope.path.child(&call.name, None).to_string();
        self.declared_calls
            .insert((scope.path.clone(), call.name.clone()));

        for name in call.inputs.keys() {
            if !call.body.variables.contains_key(name) {
                return Err(ConfigError::invalid_reference(
                    &owner,
                    format!("module does not declare input '{name}'"),
                ));
            }
        }

        let mut hints = inherited_hints.to_vec();
        hints.extend(call.depends_on.iter().map(|d| (scope.path.clone(), d.clone())));

        let instances = scope.instances(call.repetition.as_ref(), &owner)?;
        let keys = match &instances {
            Instances::Single => vec![(None, RepContext::default())],
            Instances::Repeated { keys, .. } => keys
                .iter()
                .map(|(key, rep)| (Some(key.clone()), rep.clone()))
                .collect(),
        };

        let mut expanded = Vec::with_capacity(keys.len());
        for (key, rep) in keys {
            let mut inputs = BTreeMap::new();
            for (name, default) in &call.body.variables {
                let value = match call.inputs.get(name) {
                    Some(expr) => scope.bind(&rep, expr, false, &owner)?,
                    None => BoundExpr::Value(default.clone()),
                };
                inputs.insert(name.clone(), value);
            }

            let child_path = scope.path.child(&call.name, key.clone());
            debug!("Expanding module instance {child_path}");
            let outputs = self.expand_scope(child_path, &call.body, inputs, &hints)?;
            expanded.push((key, outputs));
        }

        let outputs = match instances {
            Instances::Single => ModuleOutputs::Single(
                expanded
                    .pop()
                    .map(|(_, outputs)| outputs)
                    .unwrap_or_default(),
            ),
            Instances::Repeated { as_map, .. } => ModuleOutputs::Repeated {
                instances: expanded
                    .into_iter()
                    .filter_map(|(key, outputs)| key.map(|k| (k, outputs)))
                    .collect(),
                as_map,
            },
        };
        scope.modules.insert(call.name.clone(), outputs);
        Ok(())
    }

    fn bind_resource(
        &mut self,
        scope: &Scope,
        decl: &ResourceDeclaration,
        inherited_hints: &[(ModulePath, DependsOn)],
    ) -> Result<(), ConfigError> {
        let base = ResourceAddress::new(&decl.resource_type, &decl.name).in_module(scope.path.clone());
        let keys = match scope
            .resources
            .get(&(decl.resource_type.clone(), decl.name.clone()))
        {
            Some(Instances::Repeated { keys, .. }) => keys
                .iter()
                .map(|(key, rep)| (Some(key.clone()), rep.clone()))
                .collect(),
            Some(Instances::Single) | None => vec![(None, RepContext::default())],
        };

        let mut hints = inherited_hints.to_vec();
        hints.extend(decl.depends_on.iter().map(|d| (scope.path.clone(), d.clone())));

        for (key, rep) in keys {
            let address = match key {
                Some(key) => base.clone().with_key(key),
                None => base.clone(),
            };
            let owner = address.to_string();

            let mut arguments = BTreeMap::new();
            for (name, expr) in &decl.arguments {
                arguments.insert(name.clone(), scope.bind(&rep, expr, false, &owner)?);
            }
            let preconditions = decl
                .preconditions
                .iter()
                .map(|c| scope.bind_condition(&rep, c, false, &owner))
                .collect::<Result<Vec<_>, _>>()?;
            let postconditions = decl
                .postconditions
                .iter()
                .map(|c| scope.bind_condition(&rep, c, true, &owner))
                .collect::<Result<Vec<_>, _>>()?;

            self.nodes.push(PendingNode {
                node: GraphNode {
                    address,
                    arguments,
                    lifecycle: decl.lifecycle.clone(),
                    preconditions,
                    postconditions,
                    dependencies: Vec::new(),
                    dependents: Vec::new(),
                },
                hints: hints.clone(),
            });
        }
        Ok(())
    }

    /// Resolves reference edges and explicit hints into node ids.
    fn link(self) -> Result<Vec<GraphNode>, ConfigError> {
        let index: BTreeMap<ResourceAddress, NodeId> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(id, pending)| (pending.node.address.clone(), id))
            .collect();

        let mut linked = Vec::with_capacity(self.nodes.len());
        for pending in &self.nodes {
            let node = &pending.node;
            let mut referenced = BTreeSet::new();
            for expr in node.arguments.values() {
                expr.collect_addresses(&mut referenced);
            }
            for condition in node.preconditions.iter().chain(&node.postconditions) {
                condition.collect_addresses(&mut referenced);
            }

            let mut dependencies: BTreeSet<NodeId> = BTreeSet::new();
            for address in &referenced {
                let id = index.get(address).ok_or_else(|| {
                    ConfigError::invalid_reference(
                        node.address.to_string(),
                        format!("reference to undeclared instance {address}"),
                    )
                })?;
                dependencies.insert(*id);
            }

            for (path, hint) in &pending.hints {
                dependencies.extend(self.hint_targets(&node.address, path, hint)?);
            }

            let mut node = node.clone();
            node.dependencies = dependencies.into_iter().collect();
            linked.push(node);
        }
        Ok(linked)
    }

    fn hint_targets(
        &self,
        owner: &ResourceAddress,
        path: &ModulePath,
        hint: &DependsOn,
    ) -> Result<Vec<NodeId>, ConfigError> {
        let matches: Box<dyn Fn(&ResourceAddress) -> bool> = match hint {
            DependsOn::Resource {
                resource_type,
                name,
            } => {
                let declared = (path.clone(), resource_type.clone(), name.clone());
                if !self.declared_resources.contains(&declared) {
                    return Err(ConfigError::invalid_reference(
                        owner.to_string(),
                        format!("depends_on names undeclared resource {resource_type}.{name}"),
                    ));
                }
                Box::new(move |a: &ResourceAddress| {
                    a.module == declared.0 && a.resource_type == declared.1 && a.name == declared.2
                })
            }
            DependsOn::Module(name) => {
                if !self.declared_calls.contains(&(path.clone(), name.clone())) {
                    return Err(ConfigError::invalid_reference(
                        owner.to_string(),
                        format!("depends_on names undeclared module '{name}'"),
                    ));
                }
                let path = path.clone();
                let name = name.clone();
                Box::new(move |a: &ResourceAddress| a.module.is_within_call(&path, &name))
            }
        };

        Ok(self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, pending)| matches(&pending.node.address))
            .map(|(id, _)| id)
            .collect())
    }
}

impl Scope {
    fn label(&self, resource_type: &str, name: &str) -> String {
        ResourceAddress::new(resource_type, name)
            .in_module(self.path.clone())
            .to_string()
    }

    /// Evaluates a repetition statically.
    fn instances(&self, repetition: Option<&Repetition>, owner: &str) -> Result<Instances, ConfigError> {
        let Some(repetition) = repetition else {
            return Ok(Instances::Single);
        };
        let expr = match repetition {
            Repetition::Count(expr) | Repetition::ForEach(expr) => expr,
        };

        let mut has_reference = false;
        expr.for_each_reference(&mut |_| has_reference = true);
        if has_reference {
            return Err(ConfigError::invalid_repetition(
                owner,
                "repetition may only use literals and input variables",
            ));
        }

        let bound = self.bind(&RepContext::default(), expr, false, owner)?;
        let empty = Projections::new();
        let evaluated = if bound.is_static() {
            bound.evaluate(&EvalContext::new(&empty)).known()
        } else {
            None
        };
        let value = evaluated.ok_or_else(|| {
            ConfigError::invalid_repetition(owner, "repetition depends on values only known after apply")
        })?;

        match repetition {
            Repetition::Count(_) => {
                let count = value.as_u64().ok_or_else(|| {
                    ConfigError::invalid_repetition(
                        owner,
                        format!("count must be a non-negative integer, got {value}"),
                    )
                })?;
                let keys = (0..count)
                    .map(|i| {
                        (
                            InstanceKey::Index(i),
                            RepContext {
                                index: Some(i),
                                each: None,
                            },
                        )
                    })
                    .collect();
                Ok(Instances::Repeated { keys, as_map: false })
            }
            Repetition::ForEach(_) => for_each_keys(value, owner),
        }
    }

    fn bind_condition(
        &self,
        rep: &RepContext,
        condition: &Condition,
        allow_self: bool,
        owner: &str,
    ) -> Result<BoundCondition, ConfigError> {
        let bind = |expr: &Expr| self.bind(rep, expr, allow_self, owner);
        let check = match &condition.check {
            Predicate::Equals(a, b) => BoundPredicate::Equals(bind(a)?, bind(b)?),
            Predicate::NotEquals(a, b) => BoundPredicate::NotEquals(bind(a)?, bind(b)?),
            Predicate::NotNull(a) => BoundPredicate::NotNull(bind(a)?),
            Predicate::NotEmpty(a) => BoundPredicate::NotEmpty(bind(a)?),
            Predicate::Truthy(a) => BoundPredicate::Truthy(bind(a)?),
        };
        Ok(BoundCondition {
            check,
            message: condition.message.clone(),
        })
    }

    fn bind(
        &self,
        rep: &RepContext,
        expr: &Expr,
        allow_self: bool,
        owner: &str,
    ) -> Result<BoundExpr, ConfigError> {
        let bind_all = |items: &[Expr]| {
            items
                .iter()
                .map(|item| self.bind(rep, item, allow_self, owner))
                .collect::<Result<Vec<_>, _>>()
        };

        Ok(match expr {
            Expr::Literal(value) => BoundExpr::Value(value.clone()),
            Expr::List(items) => BoundExpr::List(bind_all(items)?),
            Expr::Template(parts) => BoundExpr::Template(bind_all(parts)?),
            Expr::Map(entries) => BoundExpr::Map(
                entries
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), self.bind(rep, v, allow_self, owner)?)))
                    .collect::<Result<_, ConfigError>>()?,
            ),
            Expr::CountIndex => BoundExpr::Value(Value::from(rep.index.ok_or_else(|| {
                ConfigError::invalid_reference(owner, "count.index used outside a count repetition")
            })?)),
            Expr::EachKey => BoundExpr::Value(Value::String(
                rep.each
                    .as_ref()
                    .map(|(key, _)| key.clone())
                    .ok_or_else(|| {
                        ConfigError::invalid_reference(owner, "each.key used outside a for_each repetition")
                    })?,
            )),
            Expr::EachValue => BoundExpr::Value(
                rep.each
                    .as_ref()
                    .map(|(_, value)| value.clone())
                    .ok_or_else(|| {
                        ConfigError::invalid_reference(owner, "each.value used outside a for_each repetition")
                    })?,
            ),
            Expr::Input(name) => self.inputs.get(name).cloned().ok_or_else(|| {
                ConfigError::invalid_reference(owner, format!("undeclared input variable '{name}'"))
            })?,
            Expr::Ref(reference) => self.bind_reference(reference, allow_self, owner)?,
        })
    }

    fn bind_reference(
        &self,
        reference: &Reference,
        allow_self: bool,
        owner: &str,
    ) -> Result<BoundExpr, ConfigError> {
        match reference {
            Reference::Resource {
                resource_type,
                name,
                key,
                attribute,
            } => {
                let instances = self
                    .resources
                    .get(&(resource_type.clone(), name.clone()))
                    .ok_or_else(|| {
                        ConfigError::invalid_reference(
                            owner,
                            format!("undeclared resource {}", self.label(resource_type, name)),
                        )
                    })?;
                let base = ResourceAddress::new(resource_type, name).in_module(self.path.clone());

                match (instances, key) {
                    (Instances::Single, None) => Ok(BoundExpr::Instance {
                        address: base,
                        attribute: attribute.clone(),
                    }),
                    (Instances::Single, Some(_)) => Err(ConfigError::invalid_reference(
                        owner,
                        format!("{base} is not repeated and cannot be indexed"),
                    )),
                    (Instances::Repeated { keys, .. }, Some(key)) => {
                        if !keys.iter().any(|(k, _)| k == key) {
                            return Err(ConfigError::invalid_reference(
                                owner,
                                format!("{base} has no instance with key {key}"),
                            ));
                        }
                        Ok(BoundExpr::Instance {
                            address: base.with_key(key.clone()),
                            attribute: attribute.clone(),
                        })
                    }
                    (Instances::Repeated { keys, as_map }, None) => Ok(BoundExpr::Collection {
                        instances: keys
                            .iter()
                            .map(|(k, _)| (k.clone(), base.clone().with_key(k.clone())))
                            .collect(),
                        attribute: attribute.clone(),
                        as_map: *as_map,
                    }),
                }
            }
            Reference::ModuleOutput { module, key, output } => {
                let outputs = self.modules.get(module).ok_or_else(|| {
                    ConfigError::invalid_reference(owner, format!("undeclared module call '{module}'"))
                })?;
                let pick = |values: &BTreeMap<String, BoundExpr>| {
                    values.get(output).cloned().ok_or_else(|| {
                        ConfigError::invalid_reference(
                            owner,
                            format!("module '{module}' has no output '{output}'"),
                        )
                    })
                };

                match (outputs, key) {
                    (ModuleOutputs::Single(values), None) => pick(values),
                    (ModuleOutputs::Single(_), Some(_)) => Err(ConfigError::invalid_reference(
                        owner,
                        format!("module '{module}' is not repeated and cannot be indexed"),
                    )),
                    (ModuleOutputs::Repeated { instances, .. }, Some(key)) => instances
                        .iter()
                        .find(|(k, _)| k == key)
                        .map(|(_, values)| pick(values))
                        .ok_or_else(|| {
                            ConfigError::invalid_reference(
                                owner,
                                format!("module '{module}' has no instance with key {key}"),
                            )
                        })?,
                    (ModuleOutputs::Repeated { instances, as_map }, None) => {
                        if *as_map {
                            Ok(BoundExpr::Map(
                                instances
                                    .iter()
                                    .map(|(k, values)| Ok((k.to_string(), pick(values)?)))
                                    .collect::<Result<_, ConfigError>>()?,
                            ))
                        } else {
                            Ok(BoundExpr::List(
                                instances
                                    .iter()
                                    .map(|(_, values)| pick(values))
                                    .collect::<Result<_, ConfigError>>()?,
                            ))
                        }
                    }
                }
            }
            Reference::SelfAttribute(attribute) => {
                if allow_self {
                    Ok(BoundExpr::SelfAttr(attribute.clone()))
                } else {
                    Err(ConfigError::invalid_reference(
                        owner,
                        "self is only valid inside postconditions",
                    ))
                }
            }
        }
    }
}

/// Keys of a `for_each` value: a map, or a list of unique strings.
fn for_each_keys(value: Value, owner: &str) -> Result<Instances, ConfigError> {
    let mut entries: Vec<(String, Value)> = match value {
        Value::Object(map) => map.into_iter().collect(),
        Value::Array(items) => {
            let mut seen = BTreeSet::new();
            let mut entries = Vec::with_capacity(items.len());
            for item in items {
                let Value::String(key) = item else {
                    return Err(ConfigError::invalid_repetition(
                        owner,
                        "for_each list elements must be strings",
                    ));
                };
                if !seen.insert(key.clone()) {
                    return Err(ConfigError::invalid_repetition(
                        owner,
                        format!("for_each list contains '{key}' more than once"),
                    ));
                }
                entries.push((key.clone(), Value::String(key)));
            }
            entries
        }
        other => {
            return Err(ConfigError::invalid_repetition(
                owner,
                format!("for_each must be a map or a list of strings, got {other}"),
            ));
        }
    };
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let keys = entries
        .into_iter()
        .map(|(key, value)| {
            (
                InstanceKey::Key(key.clone()),
                RepContext {
                    index: None,
                    each: Some((key, value)),
                },
            )
        })
        .collect();
    Ok(Instances::Repeated { keys, as_map: true })
}

/// Orders sibling module calls so a call whose inputs read another call's
/// outputs is expanded after it.
fn order_module_calls<'c>(path: &ModulePath, calls: &'c [ModuleCall]) -> Result<Vec<&'c ModuleCall>, ConfigError> {
    let mut positions = BTreeMap::new();
    for (i, call) in calls.iter().enumerate() {
        if positions.insert(call.name.as_str(), i).is_some() {
            return Err(ConfigError::DuplicateDeclaration {
                address: path.child(&call.name, None).to_string(),
            });
        }
    }

    let mut dependencies = Vec::with_capacity(calls.len());
    for call in calls {
        let owner = path.child(&call.name, None).to_string();
        let mut names = BTreeSet::new();
        for expr in call.inputs.values() {
            expr.for_each_reference(&mut |reference| {
                if let Reference::ModuleOutput { module, .. } = reference {
                    names.insert(module.clone());
                }
            });
        }

        let mut deps = BTreeSet::new();
        for name in names {
            let position = positions.get(name.as_str()).ok_or_else(|| {
                ConfigError::invalid_reference(&owner, format!("undeclared module call '{name}'"))
            })?;
            deps.insert(*position);
        }
        dependencies.push(deps);
    }

    let order = super::dag::topological_sort(&dependencies).map_err(|remainder| ConfigError::Cycle {
        addresses: remainder
            .into_iter()
            .map(|i| path.child(&calls[i].name, None).to_string())
            .collect(),
    })?;
    Ok(order.into_iter().map(|i| &calls[i]).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declaration::Lifecycle;
    use crate::provider::{InMemoryCloud, ResourceSchema};

    fn registry() -> ProviderRegistry {
        let cloud = InMemoryCloud::new();
        let mut registry = ProviderRegistry::new();
        for resource_type in ["bucket", "instance", "vpc", "subnet"] {
            registry.register(cloud.provider(resource_type, ResourceSchema::new(0)));
        }
        registry
    }

    fn build(yaml: &str) -> Result<Graph, ConfigError> {
        let declarations: DeclarationSet = serde_yaml::from_str(yaml).expect("yaml");
        GraphBuilder::new(&registry()).build(&declarations)
    }

    fn address(s: &str) -> ResourceAddress {
        s.parse().expect("address")
    }

    #[test]
    fn test_reference_creates_edge() {
        let graph = build(
            r"
resources:
  - type: instance
    name: web
    arguments:
      bucket: { ref: { resource: { type: bucket, name: logs, attribute: id } } }
  - type: bucket
    name: logs
",
        )
        .expect("build");

        let web = graph.id_of(&address("instance.web")).expect("web");
        assert_eq!(graph.dependency_addresses(web), vec![address("bucket.logs")]);
        let order: Vec<String> = graph
            .topological_order()
            .iter()
            .map(|&id| graph.node(id).address.to_string())
            .collect();
        assert_eq!(order, vec!["bucket.logs", "instance.web"]);
    }

    #[test]
    fn test_count_and_for_each_expansion() {
        let graph = build(
            r#"
variables:
  zones: [b, a]
resources:
  - type: instance
    name: web
    repetition: { count: { literal: 2 } }
    arguments:
      name: { template: [ { literal: "web-" }, count_index ] }
  - type: bucket
    name: per_zone
    repetition: { for_each: { input: zones } }
    arguments:
      zone: each_value
"#,
        )
        .expect("build");

        assert_eq!(graph.len(), 4);
        let web1 = graph.get(&address("instance.web[1]")).expect("web[1]");
        assert_eq!(web1.arguments["name"], BoundExpr::Value(Value::from("web-1")));
        let zone_a = graph.get(&address(r#"bucket.per_zone["a"]"#)).expect("zone a");
        assert_eq!(zone_a.arguments["zone"], BoundExpr::Value(Value::from("a")));
    }

    #[test]
    fn test_cycle_lists_participants() {
        let err = build(
            r"
resources:
  - type: bucket
    name: a
    arguments:
      peer: { ref: { resource: { type: bucket, name: b, attribute: id } } }
  - type: bucket
    name: b
    arguments:
      peer: { ref: { resource: { type: bucket, name: a, attribute: id } } }
  - type: instance
    name: c
    arguments:
      peer: { ref: { resource: { type: bucket, name: a, attribute: id } } }
",
        )
        .expect_err("cycle");
        match err {
            ConfigError::Cycle { addresses } => assert_eq!(addresses, vec!["bucket.a", "bucket.b"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_repetition_cannot_read_resources() {
        let err = build(
            r"
resources:
  - type: bucket
    name: logs
  - type: instance
    name: web
    repetition:
      count: { ref: { resource: { type: bucket, name: logs, attribute: size } } }
",
        )
        .expect_err("invalid");
        assert!(matches!(err, ConfigError::InvalidRepetition { .. }));
    }

    #[test]
    fn test_module_inputs_and_outputs_are_transparent() {
        let graph = build(
            r"
resources:
  - type: vpc
    name: main
  - type: instance
    name: web
    arguments:
      subnet: { ref: { module_output: { module: net, key: 1, output: subnet_id } } }
modules:
  - name: net
    repetition: { count: { literal: 2 } }
    inputs:
      vpc_id: { ref: { resource: { type: vpc, name: main, attribute: id } } }
    body:
      variables:
        vpc_id: null
      resources:
        - type: subnet
          name: this
          arguments:
            vpc: { input: vpc_id }
      outputs:
        - name: subnet_id
          value: { ref: { resource: { type: subnet, name: this, attribute: id } } }
",
        )
        .expect("build");

        let subnet = graph.id_of(&address("module.net[1].subnet.this")).expect("subnet");
        assert_eq!(graph.dependency_addresses(subnet), vec![address("vpc.main")]);
        let web = graph.id_of(&address("instance.web")).expect("web");
        assert_eq!(
            graph.dependency_addresses(web),
            vec![address("module.net[1].subnet.this")]
        );
    }

    #[test]
    fn test_depends_on_module() {
        let graph = build(
            r"
resources:
  - type: instance
    name: web
    depends_on: [ { module: net } ]
modules:
  - name: net
    body:
      resources:
        - type: vpc
          name: main
",
        )
        .expect("build");
        let web = graph.id_of(&address("instance.web")).expect("web");
        assert_eq!(graph.dependency_addresses(web), vec![address("module.net.vpc.main")]);
    }

    #[test]
    fn test_unknown_type_and_bad_reference() {
        assert!(matches!(
            build("resources: [ { type: database, name: x } ]"),
            Err(ConfigError::UnknownResourceType { .. })
        ));
        assert!(matches!(
            build("resources: [ { type: bucket, name: x, arguments: { a: { ref: { self: id } } } } ]"),
            Err(ConfigError::InvalidReference { .. })
        ));
    }

    #[test]
    fn test_lifecycle_carried_to_nodes() {
        let cloud = InMemoryCloud::new();
        let mut registry = ProviderRegistry::new();
        registry.register(cloud.provider("bucket", ResourceSchema::new(0)));
        let mut declarations = DeclarationSet::default();
        declarations.resources.push(
            ResourceDeclaration::new("bucket", "logs").with_lifecycle(Lifecycle {
                prevent_destroy: true,
                ..Lifecycle::default()
            }),
        );
        let graph = GraphBuilder::new(&registry).build(&declarations).expect("build");
        assert!(graph.nodes()[0].lifecycle.prevent_destroy);
    }
}
