//! Apply results.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::declaration::ResourceAddress;
use crate::state::OutputState;

/// Provider operation carried out by an execution node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeOperation {
    /// Create an object.
    Create,
    /// Update an object in place.
    Update,
    /// Delete an object.
    Delete,
}

/// Lifecycle of one execution node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Waiting on dependencies.
    Pending,
    /// Dependencies committed; waiting for a worker.
    Ready,
    /// The provider call is in flight.
    Running,
    /// The result is durably recorded.
    Committed,
    /// The node or one of its dependencies failed.
    Failed,
    /// Never started because the run was cancelled.
    Cancelled,
}

/// Outcome of one execution node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    /// Target instance.
    pub address: ResourceAddress,
    /// Deposed key for deposed-object deletes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deposed: Option<String>,
    /// Operation.
    pub operation: NodeOperation,
    /// Final status.
    pub status: NodeStatus,
    /// Error message (if failed).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Whether every node committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// Every node committed.
    Complete,
    /// Some nodes failed or were cancelled; committed work is recorded.
    Partial,
}

/// Result of an apply.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    /// Per-node results in execution-graph order.
    pub nodes: Vec<NodeReport>,
    /// Serial of the last snapshot written.
    pub serial: u64,
    /// Root outputs recorded after the run.
    pub outputs: BTreeMap<String, OutputState>,
    /// Whether cancellation was requested.
    pub cancelled: bool,
}

impl ApplyReport {
    /// Overall outcome.
    #[must_use]
    pub fn outcome(&self) -> ApplyOutcome {
        if self.nodes.iter().all(|n| n.status == NodeStatus::Committed) {
            ApplyOutcome::Complete
        } else {
            ApplyOutcome::Partial
        }
    }

    fn count(&self, status: NodeStatus) -> usize {
        self.nodes.iter().filter(|n| n.status == status).count()
    }

    /// Number of committed nodes.
    #[must_use]
    pub fn committed(&self) -> usize {
        self.count(NodeStatus::Committed)
    }

    /// Number of failed nodes.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(NodeStatus::Failed)
    }

    /// Number of cancelled nodes.
    #[must_use]
    pub fn cancelled_nodes(&self) -> usize {
        self.count(NodeStatus::Cancelled)
    }

    /// Failed nodes with their errors.
    pub fn failures(&self) -> impl Iterator<Item = &NodeReport> {
        self.nodes.iter().filter(|n| n.status == NodeStatus::Failed)
    }
}

impl fmt::Display for NodeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Ready => write!(f, "ready"),
            Self::Running => write!(f, "running"),
            Self::Committed => write!(f, "committed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl fmt::Display for ApplyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete => write!(f, "complete"),
            Self::Partial => write!(f, "partial"),
        }
    }
}

impl fmt::Display for NodeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.deposed {
            Some(key) => write!(f, "{} (deposed {key})", self.address)?,
            None => write!(f, "{}", self.address)?,
        }
        write!(f, " {}: {}", self.operation, self.status)?;
        if let Some(error) = &self.error {
            write!(f, " ({error})")?;
        }
        Ok(())
    }
}
