//! Plan construction.
//!
//! Walks the graph in dependency order, projecting each instance's
//! attributes as they will be after apply, so values that only become
//! known when an upstream change is applied propagate as unknown rather
//! than stale.

use chrono::Utc;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::declaration::{Attributes, ResourceAddress};
use crate::error::{ConfigError, Result};
use crate::graph::{EvalContext, Graph, Projected, Projections, evaluate_arguments};
use crate::provider::{ProviderRegistry, object_id};
use crate::state::{StateSnapshot, Workspace};

use super::diff::{DiffEngine, requires_replacement};
use super::plan::{Action, Change, Plan, PlanMode, PlannedOutput};

/// Planning options.
#[derive(Debug, Clone, Copy)]
pub struct PlanOptions {
    /// Plan mode.
    pub mode: PlanMode,
    /// Read live objects before diffing.
    pub refresh: bool,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            mode: PlanMode::Normal,
            refresh: true,
        }
    }
}

/// Live attributes read during refresh. `None` means the object is gone.
pub type Refreshed = BTreeMap<ResourceAddress, Option<Attributes>>;

/// Computes plans. Planning never mutates remote objects or state.
#[derive(Debug, Clone, Copy)]
pub struct Planner<'a> {
    registry: &'a ProviderRegistry,
}

impl<'a> Planner<'a> {
    /// Creates a planner over a provider registry.
    #[must_use]
    pub const fn new(registry: &'a ProviderRegistry) -> Self {
        Self { registry }
    }

    /// Reads the live attributes of every current instance.
    pub async fn refresh(&self, snapshot: &StateSnapshot) -> Result<Refreshed> {
        let mut refreshed = Refreshed::new();
        for instance in snapshot.current() {
            let address = instance.address();
            let provider = self.registry.resolve(&address)?;
            let Some(id) = object_id(&instance.attributes) else {
                warn!("{address} has no recorded id; skipping refresh");
                continue;
            };

            let live = provider.read(&id, &instance.attributes).await?;
            if live.is_none() {
                info!("{address} no longer exists remotely");
            }
            refreshed.insert(address, live);
        }
        Ok(refreshed)
    }

    /// Computes a plan for `graph` against `snapshot`.
    pub async fn plan(
        &self,
        graph: &Graph,
        snapshot: &StateSnapshot,
        workspace: &Workspace,
        fingerprint: &str,
        options: PlanOptions,
    ) -> Result<Plan> {
        let refreshed = if options.refresh && options.mode == PlanMode::Normal {
            self.refresh(snapshot).await?
        } else {
            Refreshed::new()
        };

        let (changes, outputs) = match options.mode {
            PlanMode::Normal => self.plan_normal(graph, snapshot, &refreshed).await?,
            PlanMode::Destroy => (plan_destroy(graph, snapshot)?, BTreeMap::new()),
        };

        let plan = Plan {
            workspace: workspace.clone(),
            mode: options.mode,
            base_lineage: snapshot.lineage.clone(),
            base_serial: snapshot.serial,
            fingerprint: fingerprint.to_string(),
            created_at: Utc::now(),
            refreshed: options.refresh && options.mode == PlanMode::Normal,
            changes,
            outputs,
        };

        info!("Plan for workspace {workspace}: {}", plan.summary());
        Ok(plan)
    }

    async fn plan_normal(
        &self,
        graph: &Graph,
        snapshot: &StateSnapshot,
        refreshed: &Refreshed,
    ) -> Result<(Vec<Change>, BTreeMap<String, PlannedOutput>)> {
        let mut projections = Projections::new();
        let mut changes = Vec::new();

        for &id in graph.topological_order() {
            let node = graph.node(id);
            let address = &node.address;
            let provider = self.registry.resolve(address)?;
            let schema = provider.schema();
            let engine = DiffEngine::new(&schema).with_lifecycle(&node.lifecycle);

            let (declared, mut unknown) =
                evaluate_arguments(&node.arguments, &EvalContext::new(&projections));

            let errors = if unknown.is_empty() {
                provider.validate_config(&declared).await
            } else {
                schema.check_arguments(declared.keys().chain(unknown.iter()))
            };
            if !errors.is_empty() {
                return Err(ConfigError::InvalidArguments {
                    address: address.to_string(),
                    errors,
                }
                .into());
            }

            let stored = snapshot.instance(address);
            let current = match (stored, refreshed.get(address)) {
                (None, _) | (Some(_), Some(None)) => None,
                (Some(_), Some(Some(live))) => Some(live),
                (Some(instance), None) => Some(&instance.attributes),
            };

            let mut change = Change::new(address.clone(), Action::Create);
            change.dependencies = graph.dependency_addresses(id);

            let projected = match (stored, current) {
                (None, _) | (Some(_), None) => {
                    change.reason = Some(if stored.is_some() {
                        String::from("object no longer exists")
                    } else {
                        String::from("not in state")
                    });
                    change.proposed = declared;
                    change.unknown = unknown;
                    created_projection(&change, schema.computed_attributes())
                }
                (Some(instance), Some(current)) => {
                    let changes =
                        engine.arguments(&declared, &unknown, &instance.arguments, current);
                    unknown.retain(|name| !node.lifecycle.ignores(name));

                    change.prior = Some(current.clone());
                    change.proposed = engine.effective_arguments(&declared, current);
                    change.unknown = unknown;
                    change.action = if changes.is_empty() {
                        Action::NoOp
                    } else if requires_replacement(&changes) {
                        Action::Replace
                    } else {
                        Action::UpdateInPlace
                    };
                    change.attribute_changes = changes;

                    match change.action {
                        Action::NoOp => Projected::known(current.clone()),
                        Action::UpdateInPlace => {
                            let mut attributes = current.clone();
                            attributes.extend(change.proposed.clone());
                            for name in &change.unknown {
                                attributes.remove(name);
                            }
                            Projected {
                                attributes,
                                unknown: change.unknown.clone(),
                            }
                        }
                        _ => {
                            let forced: Vec<_> = change
                                .attribute_changes
                                .iter()
                                .filter(|c| c.forces_replacement)
                                .map(|c| c.name.as_str())
                                .collect();
                            change.reason = Some(format!("{} forces replacement", forced.join(", ")));
                            if node.lifecycle.prevent_destroy {
                                return Err(ConfigError::ProtectedDestroy {
                                    address: address.to_string(),
                                }
                                .into());
                            }
                            change.create_before_destroy = node.lifecycle.create_before_destroy;
                            created_projection(&change, schema.computed_attributes())
                        }
                    }
                }
            };

            debug!("{address}: {}", change.action);
            projections.insert(address.clone(), projected);
            changes.push(change);
        }

        for instance in snapshot.current() {
            let address = instance.address();
            if graph.contains(&address) {
                continue;
            }
            let protected = graph
                .nodes()
                .iter()
                .any(|n| n.address.same_resource(&address) && n.lifecycle.prevent_destroy);
            if protected {
                return Err(ConfigError::ProtectedDestroy {
                    address: address.to_string(),
                }
                .into());
            }

            let mut change = Change::new(address.clone(), Action::Destroy)
                .with_reason("no longer declared");
            change.prior = match refreshed.get(&address) {
                Some(live) => live.clone(),
                None => Some(instance.attributes.clone()),
            };
            change.dependencies = instance.dependencies.clone();
            changes.push(change);
        }

        changes.extend(deposed_changes(snapshot));
        propagate_create_before_destroy(&mut changes);

        let ctx = EvalContext::new(&projections);
        let outputs = graph
            .outputs()
            .iter()
            .map(|output| {
                (
                    output.name.clone(),
                    PlannedOutput {
                        value: output.value.evaluate(&ctx).known(),
                        sensitive: output.sensitive,
                    },
                )
            })
            .collect();

        Ok((changes, outputs))
    }
}

/// Projection of an object that will be created: the known arguments,
/// with unknown arguments and every computed attribute unknown.
fn created_projection<'s>(change: &Change, computed: impl Iterator<Item = &'s str>) -> Projected {
    let mut unknown = change.unknown.clone();
    for name in computed {
        if !change.proposed.contains_key(name) {
            unknown.insert(name.to_string());
        }
    }
    Projected {
        attributes: change.proposed.clone(),
        unknown,
    }
}

/// A replaced object that a create-before-destroy replacement depends on
/// must itself be replaced create-before-destroy: its old copy can only go
/// after the dependent's deposed copy.
fn propagate_create_before_destroy(changes: &mut [Change]) {
    let index: BTreeMap<ResourceAddress, usize> = changes
        .iter()
        .enumerate()
        .filter(|(_, c)| c.deposed.is_none())
        .map(|(i, c)| (c.address.clone(), i))
        .collect();
    let mut pending: Vec<usize> = changes
        .iter()
        .enumerate()
        .filter(|(_, c)| c.action == Action::Replace && c.create_before_destroy)
        .map(|(i, _)| i)
        .collect();

    while let Some(i) = pending.pop() {
        let dependencies = changes[i].dependencies.clone();
        for dependency in &dependencies {
            let Some(&upstream) = index.get(dependency) else {
                continue;
            };
            let change = &changes[upstream];
            if change.action == Action::Replace && !change.create_before_destroy {
                debug!(
                    "{} replaced create-before-destroy for {}",
                    change.address, changes[i].address
                );
                changes[upstream].create_before_destroy = true;
                pending.push(upstream);
            }
        }
    }
}

fn deposed_changes(snapshot: &StateSnapshot) -> Vec<Change> {
    snapshot
        .deposed()
        .map(|instance| {
            let mut change = Change::new(instance.address(), Action::Destroy)
                .with_reason("deposed object left by an earlier replacement");
            change.deposed = instance.deposed.clone();
            change.prior = Some(instance.attributes.clone());
            change.dependencies = instance.dependencies.clone();
            change
        })
        .collect()
}

fn plan_destroy(graph: &Graph, snapshot: &StateSnapshot) -> Result<Vec<Change>> {
    let mut changes = Vec::new();
    for instance in snapshot.current() {
        let address = instance.address();
        if graph.get(&address).is_some_and(|n| n.lifecycle.prevent_destroy) {
            return Err(ConfigError::ProtectedDestroy {
                address: address.to_string(),
            }
            .into());
        }
        let mut change = Change::new(address, Action::Destroy).with_reason("destroy requested");
        change.prior = Some(instance.attributes.clone());
        change.dependencies = instance.dependencies.clone();
        changes.push(change);
    }
    changes.extend(deposed_changes(snapshot));
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declaration::{DeclarationSet, Expr, Lifecycle, ResourceDeclaration};
    use crate::graph::GraphBuilder;
    use crate::provider::{AttributeSchema, InMemoryCloud, ResourceSchema};
    use crate::state::ResourceInstanceState;
    use serde_json::Value;

    fn bucket_schema() -> ResourceSchema {
        ResourceSchema::new(1)
            .with("id", AttributeSchema::computed())
            .with("name", AttributeSchema::required().force_new())
            .with("tags", AttributeSchema::optional())
    }

    fn web_schema() -> ResourceSchema {
        ResourceSchema::new(1)
            .with("id", AttributeSchema::computed())
            .with("bucket", AttributeSchema::required())
    }

    fn setup() -> (InMemoryCloud, ProviderRegistry) {
        let cloud = InMemoryCloud::new();
        let mut registry = ProviderRegistry::new();
        registry.register(cloud.provider("bucket", bucket_schema()));
        registry.register(cloud.provider("web", web_schema()));
        (cloud, registry)
    }

    fn declarations(bucket_name: &str) -> DeclarationSet {
        DeclarationSet {
            resources: vec![
                ResourceDeclaration::new("bucket", "b")
                    .with_argument("name", Expr::string(bucket_name)),
                ResourceDeclaration::new("web", "w")
                    .with_argument("bucket", Expr::attr("bucket", "b", "id")),
            ],
            ..DeclarationSet::default()
        }
    }

    fn recorded(address: &ResourceAddress, pairs: &[(&str, &str)]) -> ResourceInstanceState {
        let attributes: Attributes = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), Value::from(*v)))
            .collect();
        let mut instance = ResourceInstanceState::new(address, 1, attributes.clone());
        instance.arguments = attributes
            .into_iter()
            .filter(|(k, _)| k != "id")
            .collect();
        instance
    }

    async fn plan_for(
        registry: &ProviderRegistry,
        declarations: &DeclarationSet,
        snapshot: &StateSnapshot,
    ) -> Result<Plan> {
        let graph = GraphBuilder::new(registry).build(declarations)?;
        Planner::new(registry)
            .plan(
                &graph,
                snapshot,
                &Workspace::default(),
                "fp",
                PlanOptions {
                    mode: PlanMode::Normal,
                    refresh: false,
                },
            )
            .await
    }

    #[tokio::test]
    async fn test_create_propagates_unknown() {
        let (_, registry) = setup();
        let plan = plan_for(&registry, &declarations("logs"), &StateSnapshot::new())
            .await
            .expect("plan");

        assert_eq!(plan.summary().create, 2);
        let web = plan
            .change(&ResourceAddress::new("web", "w"))
            .expect("web change");
        assert!(web.unknown.contains("bucket"));
        assert_eq!(web.dependencies, vec![ResourceAddress::new("bucket", "b")]);
    }

    #[tokio::test]
    async fn test_replace_makes_dependent_update() {
        let (_, registry) = setup();
        let bucket = ResourceAddress::new("bucket", "b");
        let web = ResourceAddress::new("web", "w");
        let mut snapshot = StateSnapshot::new();
        snapshot.upsert(recorded(&bucket, &[("id", "bucket-1"), ("name", "logs")]));
        snapshot.upsert(recorded(&web, &[("id", "web-1"), ("bucket", "bucket-1")]));

        let plan = plan_for(&registry, &declarations("logs"), &snapshot)
            .await
            .expect("plan");
        assert!(plan.is_empty());

        let plan = plan_for(&registry, &declarations("logs-v2"), &snapshot)
            .await
            .expect("plan");
        assert_eq!(plan.change(&bucket).map(|c| c.action), Some(Action::Replace));
        let web_change = plan.change(&web).expect("web change");
        assert_eq!(web_change.action, Action::UpdateInPlace);
        assert_eq!(web_change.attribute_changes[0].after, None);
    }

    #[tokio::test]
    async fn test_prevent_destroy_blocks_replace() {
        let (_, registry) = setup();
        let bucket = ResourceAddress::new("bucket", "b");
        let mut snapshot = StateSnapshot::new();
        snapshot.upsert(recorded(&bucket, &[("id", "bucket-1"), ("name", "logs")]));

        let declarations = DeclarationSet {
            resources: vec![
                ResourceDeclaration::new("bucket", "b")
                    .with_argument("name", Expr::string("other"))
                    .with_lifecycle(Lifecycle {
                        prevent_destroy: true,
                        ..Lifecycle::default()
                    }),
            ],
            ..DeclarationSet::default()
        };
        let err = plan_for(&registry, &declarations, &snapshot)
            .await
            .expect_err("protected");
        assert!(matches!(
            err,
            crate::error::CoreError::Config(ConfigError::ProtectedDestroy { .. })
        ));
    }

    #[tokio::test]
    async fn test_orphans_and_deposed_destroyed() {
        let (_, registry) = setup();
        let orphan = ResourceAddress::new("bucket", "old");
        let mut snapshot = StateSnapshot::new();
        snapshot.upsert(recorded(&orphan, &[("id", "bucket-9"), ("name", "old")]));
        let mut deposed = recorded(&ResourceAddress::new("bucket", "b"), &[("id", "bucket-0")]);
        deposed.deposed = Some(String::from("0badf00d"));
        snapshot.upsert(deposed);

        let plan = plan_for(&registry, &declarations("logs"), &snapshot)
            .await
            .expect("plan");
        let destroys: Vec<_> = plan
            .changes
            .iter()
            .filter(|c| c.action == Action::Destroy)
            .map(Change::display_address)
            .collect();
        assert_eq!(destroys, vec!["bucket.old", "bucket.b (deposed 0badf00d)"]);
    }

    #[tokio::test]
    async fn test_refresh_detects_remote_deletion() {
        let (cloud, registry) = setup();
        let bucket = ResourceAddress::new("bucket", "b");
        let mut attributes = Attributes::new();
        attributes.insert(String::from("name"), Value::from("logs"));
        let id = cloud.insert_object("bucket", attributes);

        let mut snapshot = StateSnapshot::new();
        snapshot.upsert(recorded(&bucket, &[("id", id.as_str()), ("name", "logs")]));

        let declarations = DeclarationSet {
            resources: vec![
                ResourceDeclaration::new("bucket", "b").with_argument("name", Expr::string("logs")),
            ],
            ..DeclarationSet::default()
        };
        let graph = GraphBuilder::new(&registry).build(&declarations).expect("graph");
        let planner = Planner::new(&registry);

        let plan = planner
            .plan(&graph, &snapshot, &Workspace::default(), "fp", PlanOptions::default())
            .await
            .expect("plan");
        assert!(plan.is_empty());

        cloud.remove_object(&id);
        let plan = planner
            .plan(&graph, &snapshot, &Workspace::default(), "fp", PlanOptions::default())
            .await
            .expect("plan");
        let change = plan.change(&bucket).expect("change");
        assert_eq!(change.action, Action::Create);
        assert_eq!(change.reason.as_deref(), Some("object no longer exists"));
    }

    #[tokio::test]
    async fn test_destroy_mode() {
        let (_, registry) = setup();
        let bucket = ResourceAddress::new("bucket", "b");
        let mut snapshot = StateSnapshot::new();
        snapshot.upsert(recorded(&bucket, &[("id", "bucket-1"), ("name", "logs")]));

        let graph = GraphBuilder::new(&registry)
            .build(&declarations("logs"))
            .expect("graph");
        let plan = Planner::new(&registry)
            .plan(
                &graph,
                &snapshot,
                &Workspace::default(),
                "fp",
                PlanOptions {
                    mode: PlanMode::Destroy,
                    refresh: true,
                },
            )
            .await
            .expect("plan");
        assert_eq!(plan.summary().destroy, 1);
        assert!(!plan.refreshed);
        assert!(plan.outputs.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_arguments() {
        let (_, registry) = setup();
        let declarations = DeclarationSet {
            resources: vec![ResourceDeclaration::new("bucket", "b")],
            ..DeclarationSet::default()
        };
        let err = plan_for(&registry, &declarations, &StateSnapshot::new())
            .await
            .expect_err("missing name");
        assert!(err.to_string().contains("missing required argument 'name'"));
    }

    #[test]
    fn test_create_before_destroy_spreads_to_replaced_dependencies() {
        let network = ResourceAddress::new("network", "n");
        let bucket = ResourceAddress::new("bucket", "b");
        let web = ResourceAddress::new("web", "w");
        let cache = ResourceAddress::new("cache", "c");

        let mut web_change = Change::new(web.clone(), Action::Replace);
        web_change.create_before_destroy = true;
        web_change.dependencies = vec![bucket.clone(), cache.clone()];
        let mut bucket_change = Change::new(bucket.clone(), Action::Replace);
        bucket_change.dependencies = vec![network.clone()];
        let mut changes = vec![
            Change::new(network.clone(), Action::Replace),
            bucket_change,
            Change::new(cache.clone(), Action::UpdateInPlace),
            web_change,
        ];

        propagate_create_before_destroy(&mut changes);

        let flagged: Vec<_> = changes
            .iter()
            .filter(|c| c.create_before_destroy)
            .map(|c| c.address.clone())
            .collect();
        assert_eq!(flagged, vec![network, bucket, web]);
        assert!(!changes[2].create_before_destroy);
    }
}
