//! Execution graph.
//!
//! Expands plan changes into provider operations and orders them: creates
//! and updates follow declared dependencies, deletes run in reverse of the
//! recorded dependencies, and an object is never deleted while something
//! that still references it has not yet been updated.

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;
use uuid::Uuid;

use crate::declaration::ResourceAddress;
use crate::error::{ConfigError, Result};
use crate::graph::topological_sort;
use crate::planner::{Action, Plan};
use crate::state::StateSnapshot;

use super::report::NodeOperation;

/// One provider operation to run.
#[derive(Debug, Clone)]
pub(crate) struct ExecNode {
    /// Target instance.
    pub address: ResourceAddress,
    /// Operation.
    pub operation: NodeOperation,
    /// Index of the plan change this node carries out.
    pub change: usize,
    /// For deletes: the deposed object to delete.
    pub deposed: Option<String>,
    /// For creates: depose the current object under this key first.
    pub depose_as: Option<String>,
    /// Nodes that must commit first.
    pub dependencies: BTreeSet<usize>,
    /// Nodes waiting on this one.
    pub dependents: Vec<usize>,
}

impl ExecNode {
    fn new(address: &ResourceAddress, operation: NodeOperation, change: usize) -> Self {
        Self {
            address: address.clone(),
            operation,
            change,
            deposed: None,
            depose_as: None,
            dependencies: BTreeSet::new(),
            dependents: Vec::new(),
        }
    }

    pub fn label(&self) -> String {
        match &self.deposed {
            Some(key) => format!("{} (deposed {key}) {}", self.address, self.operation),
            None => format!("{} {}", self.address, self.operation),
        }
    }
}

/// A fresh deposed key.
fn deposed_key() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Builds the execution graph for a plan.
pub(crate) fn build(plan: &Plan, snapshot: &StateSnapshot) -> Result<Vec<ExecNode>> {
    let mut nodes: Vec<ExecNode> = Vec::new();
    // Create or update node of each address.
    let mut apply_of: BTreeMap<ResourceAddress, usize> = BTreeMap::new();
    // Delete node of each address's current object.
    let mut delete_of: BTreeMap<ResourceAddress, usize> = BTreeMap::new();
    // Delete node of the object a create-before-destroy replacement deposes.
    let mut deposed_delete_of: BTreeMap<ResourceAddress, usize> = BTreeMap::new();
    // Pure destroys, which wait for former dependents.
    let mut destroys: Vec<usize> = Vec::new();
    // Deletes and the recorded dependencies of the object they delete.
    let mut delete_dependencies: Vec<(usize, Vec<ResourceAddress>)> = Vec::new();

    for (index, change) in plan.changes.iter().enumerate() {
        let address = &change.address;
        let recorded = || {
            snapshot
                .instance(address)
                .map(|r| r.dependencies.clone())
                .unwrap_or_default()
        };

        match change.action {
            Action::NoOp => {}
            Action::Create => {
                apply_of.insert(address.clone(), nodes.len());
                nodes.push(ExecNode::new(address, NodeOperation::Create, index));
            }
            Action::UpdateInPlace => {
                apply_of.insert(address.clone(), nodes.len());
                nodes.push(ExecNode::new(address, NodeOperation::Update, index));
            }
            Action::Replace if change.create_before_destroy => {
                let key = deposed_key();
                let create = nodes.len();
                let mut node = ExecNode::new(address, NodeOperation::Create, index);
                node.depose_as = Some(key.clone());
                nodes.push(node);

                let mut delete = ExecNode::new(address, NodeOperation::Delete, index);
                delete.deposed = Some(key);
                delete.dependencies.insert(create);
                apply_of.insert(address.clone(), create);
                deposed_delete_of.insert(address.clone(), nodes.len());
                delete_dependencies.push((nodes.len(), recorded()));
                nodes.push(delete);
            }
            Action::Replace => {
                let delete = nodes.len();
                nodes.push(ExecNode::new(address, NodeOperation::Delete, index));
                let mut create = ExecNode::new(address, NodeOperation::Create, index);
                create.dependencies.insert(delete);
                delete_of.insert(address.clone(), delete);
                delete_dependencies.push((delete, recorded()));
                apply_of.insert(address.clone(), nodes.len());
                nodes.push(create);
            }
            Action::Destroy => {
                let mut node = ExecNode::new(address, NodeOperation::Delete, index);
                node.deposed.clone_from(&change.deposed);
                if change.deposed.is_none() {
                    delete_of.insert(address.clone(), nodes.len());
                    destroys.push(nodes.len());
                }
                delete_dependencies.push((nodes.len(), change.dependencies.clone()));
                nodes.push(node);
            }
        }
    }

    let mut edges: Vec<(usize, usize)> = Vec::new();

    // Creates and updates wait for what they reference.
    for &apply in apply_of.values() {
        let change = &plan.changes[nodes[apply].change];
        for dependency in &change.dependencies {
            if let Some(&upstream) = apply_of.get(dependency) {
                edges.push((upstream, apply));
            }
            // A replaced object's old copy goes only after its dependents
            // moved to the new one.
            if let Some(&deposed_delete) = deposed_delete_of.get(dependency) {
                edges.push((apply, deposed_delete));
            }
        }
    }

    // Deletes run dependents first.
    for (delete, dependencies) in &delete_dependencies {
        for dependency in dependencies {
            if let Some(&upstream_delete) = delete_of.get(dependency)
                && upstream_delete != *delete
            {
                edges.push((*delete, upstream_delete));
            }
        }
    }

    // A destroyed object outlives the updates that stop referencing it.
    for &destroy in &destroys {
        let target = &nodes[destroy].address;
        for instance in snapshot.current() {
            if instance.dependencies.contains(target)
                && let Some(&apply) = apply_of.get(&instance.address())
            {
                edges.push((apply, destroy));
            }
        }
    }

    for (from, to) in edges {
        nodes[to].dependencies.insert(from);
    }
    for id in 0..nodes.len() {
        let dependencies: Vec<usize> = nodes[id].dependencies.iter().copied().collect();
        for dependency in dependencies {
            nodes[dependency].dependents.push(id);
        }
    }

    let dependencies: Vec<BTreeSet<usize>> = nodes.iter().map(|n| n.dependencies.clone()).collect();
    topological_sort(&dependencies).map_err(|remainder| {
        let mut addresses: Vec<String> = remainder.into_iter().map(|id| nodes[id].label()).collect();
        addresses.sort();
        ConfigError::Cycle { addresses }
    })?;

    debug!("Execution graph has {} node(s)", nodes.len());
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declaration::Attributes;
    use crate::planner::{Change, PlanMode};
    use crate::state::{ResourceInstanceState, Workspace};
    use chrono::Utc;

    fn plan(changes: Vec<Change>) -> Plan {
        Plan {
            workspace: Workspace::default(),
            mode: PlanMode::Normal,
            base_lineage: String::new(),
            base_serial: 0,
            fingerprint: String::new(),
            created_at: Utc::now(),
            refreshed: false,
            changes,
            outputs: BTreeMap::new(),
        }
    }

    fn addr(name: &str) -> ResourceAddress {
        ResourceAddress::new("res", name)
    }

    fn change(name: &str, action: Action, dependencies: &[&str]) -> Change {
        let mut change = Change::new(addr(name), action);
        change.dependencies = dependencies.iter().map(|d| addr(d)).collect();
        change
    }

    fn position(nodes: &[ExecNode], name: &str, operation: NodeOperation) -> usize {
        nodes
            .iter()
            .position(|n| n.address == addr(name) && n.operation == operation)
            .expect("node")
    }

    #[test]
    fn test_replace_deletes_before_create() {
        let nodes = build(
            &plan(vec![
                change("bucket", Action::Replace, &[]),
                change("web", Action::UpdateInPlace, &["bucket"]),
            ]),
            &StateSnapshot::new(),
        )
        .expect("graph");

        let delete = position(&nodes, "bucket", NodeOperation::Delete);
        let create = position(&nodes, "bucket", NodeOperation::Create);
        let update = position(&nodes, "web", NodeOperation::Update);
        assert!(nodes[create].dependencies.contains(&delete));
        assert!(nodes[update].dependencies.contains(&create));
    }

    #[test]
    fn test_create_before_destroy_waits_for_dependents() {
        let mut replace = change("bucket", Action::Replace, &[]);
        replace.create_before_destroy = true;
        let nodes = build(
            &plan(vec![replace, change("web", Action::UpdateInPlace, &["bucket"])]),
            &StateSnapshot::new(),
        )
        .expect("graph");

        let create = position(&nodes, "bucket", NodeOperation::Create);
        let delete = position(&nodes, "bucket", NodeOperation::Delete);
        let update = position(&nodes, "web", NodeOperation::Update);
        assert!(nodes[create].depose_as.is_some());
        assert_eq!(nodes[delete].deposed, nodes[create].depose_as);
        assert!(nodes[delete].dependencies.contains(&create));
        assert!(nodes[delete].dependencies.contains(&update));
        assert_eq!(nodes[delete].deposed.as_deref().map(str::len), Some(8));
    }

    #[test]
    fn test_destroys_run_in_reverse() {
        let mut snapshot = StateSnapshot::new();
        let mut web = ResourceInstanceState::new(&addr("web"), 1, Attributes::new());
        web.dependencies = vec![addr("bucket")];
        snapshot.upsert(web);
        snapshot.upsert(ResourceInstanceState::new(&addr("bucket"), 1, Attributes::new()));

        let nodes = build(
            &plan(vec![
                change("bucket", Action::Destroy, &[]),
                change("web", Action::Destroy, &["bucket"]),
            ]),
            &snapshot,
        )
        .expect("graph");

        let bucket = position(&nodes, "bucket", NodeOperation::Delete);
        let web = position(&nodes, "web", NodeOperation::Delete);
        assert!(nodes[bucket].dependencies.contains(&web));
        assert_eq!(nodes[web].dependents, vec![bucket]);
    }

    #[test]
    fn test_destroy_waits_for_former_dependent_update() {
        let mut snapshot = StateSnapshot::new();
        let mut web = ResourceInstanceState::new(&addr("web"), 1, Attributes::new());
        web.dependencies = vec![addr("old")];
        snapshot.upsert(web);

        let nodes = build(
            &plan(vec![
                change("web", Action::UpdateInPlace, &[]),
                change("old", Action::Destroy, &[]),
            ]),
            &snapshot,
        )
        .expect("graph");

        let update = position(&nodes, "web", NodeOperation::Update);
        let delete = position(&nodes, "old", NodeOperation::Delete);
        assert!(nodes[delete].dependencies.contains(&update));
    }
}
