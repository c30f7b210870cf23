//! Drift detection.
//!
//! Reads every recorded object and compares it with the stored attributes.
//! Detection only reports; accepting drift rewrites the snapshot from the
//! live values without calling any provider mutation.

use serde::Serialize;
use std::fmt;
use tracing::{debug, info, warn};

use crate::declaration::{Attributes, ResourceAddress};
use crate::error::Result;
use crate::graph::Graph;
use crate::planner::{AttributeChange, DiffEngine};
use crate::provider::{ProviderRegistry, object_id};
use crate::state::StateSnapshot;

/// Drift status of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftStatus {
    /// Live attributes match the recorded ones.
    InSync,
    /// At least one attribute differs.
    Drifted,
    /// The remote object no longer exists.
    Gone,
}

/// Drift of one recorded instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceDrift {
    /// Instance address.
    pub address: ResourceAddress,
    /// Status.
    pub status: DriftStatus,
    /// Attribute differences, stored value before live value.
    pub changes: Vec<AttributeChange>,
    /// Live attributes, when the object exists.
    #[serde(skip)]
    pub live: Option<Attributes>,
}

/// Drift of every recorded instance of a snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DriftReport {
    /// Serial of the snapshot that was checked.
    pub serial: u64,
    /// Per-instance results, in address order.
    pub instances: Vec<InstanceDrift>,
}

/// Compares recorded state with live objects.
#[derive(Debug, Clone, Copy)]
pub struct DriftDetector<'a> {
    registry: &'a ProviderRegistry,
}

impl<'a> DriftDetector<'a> {
    /// Creates a detector.
    #[must_use]
    pub const fn new(registry: &'a ProviderRegistry) -> Self {
        Self { registry }
    }

    /// Reads every current instance of `snapshot`. When `graph` is given,
    /// the declared `ignore_changes` of each instance applies.
    pub async fn detect(&self, snapshot: &StateSnapshot, graph: Option<&Graph>) -> Result<DriftReport> {
        let mut instances = Vec::new();

        for instance in snapshot.current() {
            let address = instance.address();
            let provider = self.registry.resolve(&address)?;
            let Some(id) = object_id(&instance.attributes) else {
                warn!("{address} has no recorded id; skipping");
                continue;
            };

            let drift = match provider.read(&id, &instance.attributes).await? {
                None => InstanceDrift {
                    address,
                    status: DriftStatus::Gone,
                    changes: Vec::new(),
                    live: None,
                },
                Some(live) => {
                    let schema = provider.schema();
                    let mut engine = DiffEngine::new(&schema);
                    if let Some(node) = graph.and_then(|g| g.get(&address)) {
                        engine = engine.with_lifecycle(&node.lifecycle);
                    }
                    let changes = engine.observed(&instance.attributes, &live);
                    InstanceDrift {
                        address,
                        status: if changes.is_empty() {
                            DriftStatus::InSync
                        } else {
                            DriftStatus::Drifted
                        },
                        changes,
                        live: Some(live),
                    }
                }
            };

            debug!("{}: {}", drift.address, drift.status);
            instances.push(drift);
        }

        let report = DriftReport {
            serial: snapshot.serial,
            instances,
        };
        info!(
            "Drift check: {} drifted, {} gone",
            report.count(DriftStatus::Drifted),
            report.count(DriftStatus::Gone)
        );
        Ok(report)
    }
}

impl DriftReport {
    /// Number of instances with the given status.
    #[must_use]
    pub fn count(&self, status: DriftStatus) -> usize {
        self.instances.iter().filter(|i| i.status == status).count()
    }

    /// Returns true if anything differs.
    #[must_use]
    pub fn has_drift(&self) -> bool {
        self.instances.iter().any(|i| i.status != DriftStatus::InSync)
    }

    /// Instances that are not in sync.
    pub fn drifted(&self) -> impl Iterator<Item = &InstanceDrift> {
        self.instances.iter().filter(|i| i.status != DriftStatus::InSync)
    }

    /// Merges live values into `snapshot`: drifted attributes take their
    /// live value, gone objects are forgotten. Returns the number of
    /// instances touched.
    pub fn accept(&self, snapshot: &mut StateSnapshot) -> usize {
        let mut touched = 0;
        for drift in self.drifted() {
            match (&drift.status, &drift.live) {
                (DriftStatus::Gone, _) => {
                    if snapshot.remove(&drift.address).is_some() {
                        touched += 1;
                    }
                }
                (_, Some(live)) => {
                    if let Some(instance) = snapshot.instance_mut(&drift.address) {
                        for change in &drift.changes {
                            match live.get(&change.name) {
                                Some(value) => {
                                    instance.attributes.insert(change.name.clone(), value.clone());
                                }
                                None => {
                                    instance.attributes.remove(&change.name);
                                }
                            }
                        }
                        touched += 1;
                    }
                }
                (_, None) => {}
            }
        }
        touched
    }
}

impl fmt::Display for DriftStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InSync => write!(f, "in sync"),
            Self::Drifted => write!(f, "drifted"),
            Self::Gone => write!(f, "gone"),
        }
    }
}
