//! The resource instance DAG.

use std::collections::{BTreeMap, BTreeSet};

use crate::declaration::{Lifecycle, ResourceAddress};
use crate::error::ConfigError;

use super::bound::{BoundCondition, BoundExpr};

/// Index of a node in the graph arena.
pub type NodeId = usize;

/// One resource instance in the graph.
#[derive(Debug, Clone)]
pub struct GraphNode {
    /// Instance address.
    pub address: ResourceAddress,
    /// Bound argument expressions.
    pub arguments: BTreeMap<String, BoundExpr>,
    /// Lifecycle policy of the declaration.
    pub lifecycle: Lifecycle,
    /// Checked before the node's change starts.
    pub preconditions: Vec<BoundCondition>,
    /// Checked after the node's change completes.
    pub postconditions: Vec<BoundCondition>,
    /// Nodes that must commit before this one starts.
    pub dependencies: Vec<NodeId>,
    /// Nodes waiting on this one.
    pub dependents: Vec<NodeId>,
}

/// A root module output.
#[derive(Debug, Clone)]
pub struct BoundOutput {
    /// Output name.
    pub name: String,
    /// Value expression.
    pub value: BoundExpr,
    /// Hidden in rendered output.
    pub sensitive: bool,
}

/// Expanded, acyclic graph of resource instances.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<GraphNode>,
    index: BTreeMap<ResourceAddress, NodeId>,
    order: Vec<NodeId>,
    outputs: Vec<BoundOutput>,
}

impl Graph {
    /// Links nodes by their dependencies and sorts them. Fails with every
    /// address participating in a cycle.
    pub(crate) fn assemble(
        mut nodes: Vec<GraphNode>,
        outputs: Vec<BoundOutput>,
    ) -> Result<Self, ConfigError> {
        let mut index = BTreeMap::new();
        for (id, node) in nodes.iter().enumerate() {
            if index.insert(node.address.clone(), id).is_some() {
                return Err(ConfigError::DuplicateDeclaration {
                    address: node.address.to_string(),
                });
            }
        }

        let dependencies: Vec<BTreeSet<NodeId>> = nodes
            .iter()
            .map(|node| node.dependencies.iter().copied().collect())
            .collect();

        for node in &mut nodes {
            node.dependencies = Vec::new();
            node.dependents = Vec::new();
        }
        for (id, deps) in dependencies.iter().enumerate() {
            for &dep in deps {
                nodes[id].dependencies.push(dep);
                nodes[dep].dependents.push(id);
            }
        }

        let order = topological_sort(&dependencies).map_err(|remainder| {
            let mut addresses: Vec<String> = remainder
                .into_iter()
                .map(|id| nodes[id].address.to_string())
                .collect();
            addresses.sort();
            ConfigError::Cycle { addresses }
        })?;

        Ok(Self {
            nodes,
            index,
            order,
            outputs,
        })
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes, indexed by `NodeId`.
    #[must_use]
    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    /// A node by id.
    #[must_use]
    pub fn node(&self, id: NodeId) -> &GraphNode {
        &self.nodes[id]
    }

    /// Id of the node at `address`.
    #[must_use]
    pub fn id_of(&self, address: &ResourceAddress) -> Option<NodeId> {
        self.index.get(address).copied()
    }

    /// The node at `address`.
    #[must_use]
    pub fn get(&self, address: &ResourceAddress) -> Option<&GraphNode> {
        self.id_of(address).map(|id| &self.nodes[id])
    }

    /// Returns true if `address` is declared.
    #[must_use]
    pub fn contains(&self, address: &ResourceAddress) -> bool {
        self.index.contains_key(address)
    }

    /// Node ids in dependency order.
    #[must_use]
    pub fn topological_order(&self) -> &[NodeId] {
        &self.order
    }

    /// Addresses of a node's direct dependencies.
    #[must_use]
    pub fn dependency_addresses(&self, id: NodeId) -> Vec<ResourceAddress> {
        let mut addresses: Vec<_> = self.nodes[id]
            .dependencies
            .iter()
            .map(|&dep| self.nodes[dep].address.clone())
            .collect();
        addresses.sort();
        addresses
    }

    /// Root module outputs.
    #[must_use]
    pub fn outputs(&self) -> &[BoundOutput] {
        &self.outputs
    }
}

/// Kahn's algorithm over `dependencies[n]` = nodes `n` waits on.
///
/// On a cycle returns the nodes that lie on (or between) cycles: the
/// remainder after Kahn, with nodes that merely hang off a cycle pruned.
pub(crate) fn topological_sort(dependencies: &[BTreeSet<usize>]) -> Result<Vec<usize>, Vec<usize>> {
    let count = dependencies.len();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];
    let mut in_degree = vec![0usize; count];
    for (id, deps) in dependencies.iter().enumerate() {
        in_degree[id] = deps.len();
        for &dep in deps {
            dependents[dep].push(id);
        }
    }

    let mut ready: BTreeSet<usize> = (0..count).filter(|&id| in_degree[id] == 0).collect();
    let mut order = Vec::with_capacity(count);
    while let Some(id) = ready.pop_first() {
        order.push(id);
        for &next in &dependents[id] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.insert(next);
            }
        }
    }

    if order.len() == count {
        return Ok(order);
    }

    let mut remainder: BTreeSet<usize> = (0..count).filter(|&id| in_degree[id] > 0).collect();
    loop {
        let dangling: Vec<usize> = remainder
            .iter()
            .copied()
            .filter(|&id| !dependents[id].iter().any(|d| remainder.contains(d)))
            .collect();
        if dangling.is_empty() {
            break;
        }
        for id in dangling {
            remainder.remove(&id);
        }
    }
    Err(remainder.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(edges: &[&[usize]]) -> Vec<BTreeSet<usize>> {
        edges.iter().map(|d| d.iter().copied().collect()).collect()
    }

    #[test]
    fn test_sort_respects_edges() {
        let order = topological_sort(&deps(&[&[1], &[], &[0, 1]])).expect("acyclic");
        assert_eq!(order, vec![1, 0, 2]);
    }

    #[test]
    fn test_cycle_remainder_excludes_downstream() {
        // 0 <-> 1 form a cycle, 2 hangs off it, 3 is independent.
        let remainder = topological_sort(&deps(&[&[1], &[0], &[1], &[]])).expect_err("cycle");
        assert_eq!(remainder, vec![0, 1]);
    }

    #[test]
    fn test_self_loop_is_a_cycle() {
        let remainder = topological_sort(&deps(&[&[0]])).expect_err("cycle");
        assert_eq!(remainder, vec![0]);
    }
}
