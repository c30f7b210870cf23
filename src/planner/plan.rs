//! Plan types.
//!
//! A plan is the ordered list of changes the executor will carry out,
//! together with the identity of the state snapshot it was computed from.
//! Plans serialize to JSON so they can be saved and applied later.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use tracing::debug;

use crate::declaration::{Attributes, ResourceAddress};
use crate::error::{ConfigError, CoreError, Result};
use crate::state::Workspace;

use super::diff::AttributeChange;

/// What a plan is for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanMode {
    /// Converge remote objects toward the declarations.
    #[default]
    Normal,
    /// Destroy every managed instance.
    Destroy,
}

/// The action planned for one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Create a new object.
    Create,
    /// Update the existing object in place.
    UpdateInPlace,
    /// Destroy and recreate the object.
    Replace,
    /// Destroy the object.
    Destroy,
    /// Nothing to do.
    NoOp,
}

/// One planned change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// Target instance.
    pub address: ResourceAddress,
    /// Deposed key when the change targets a deposed object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deposed: Option<String>,
    /// Planned action.
    pub action: Action,
    /// Attributes before the change, `None` when no object exists.
    #[serde(default)]
    pub prior: Option<Attributes>,
    /// Known argument values after the change.
    #[serde(default)]
    pub proposed: Attributes,
    /// Arguments whose value is only known during apply.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub unknown: BTreeSet<String>,
    /// Attribute-level differences.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attribute_changes: Vec<AttributeChange>,
    /// Why the change was planned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Replacement creates the new object before destroying the old one.
    #[serde(default)]
    pub create_before_destroy: bool,
    /// Instances this one depends on: declared dependencies for creates
    /// and updates, recorded dependencies for destroys.
    #[serde(default)]
    pub dependencies: Vec<ResourceAddress>,
}

/// A planned root output value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedOutput {
    /// Value, `None` when known only after apply.
    pub value: Option<Value>,
    /// Hidden in rendered output.
    #[serde(default)]
    pub sensitive: bool,
}

/// A complete plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Workspace the plan targets.
    pub workspace: Workspace,
    /// Plan mode.
    pub mode: PlanMode,
    /// Lineage of the snapshot the plan was computed from.
    pub base_lineage: String,
    /// Serial of the snapshot the plan was computed from.
    pub base_serial: u64,
    /// Fingerprint of the declarations the plan was computed from.
    pub fingerprint: String,
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Whether live objects were read before planning.
    pub refreshed: bool,
    /// Changes: creates and updates in dependency order, then destroys.
    pub changes: Vec<Change>,
    /// Root outputs as they will be after apply.
    #[serde(default)]
    pub outputs: BTreeMap<String, PlannedOutput>,
}

/// Counts of planned actions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    /// Creates.
    pub create: usize,
    /// In-place updates.
    pub update: usize,
    /// Replacements.
    pub replace: usize,
    /// Destroys.
    pub destroy: usize,
    /// Unchanged instances.
    pub no_op: usize,
}

impl Change {
    /// A change with no attribute detail.
    #[must_use]
    pub fn new(address: ResourceAddress, action: Action) -> Self {
        Self {
            address,
            deposed: None,
            action,
            prior: None,
            proposed: Attributes::new(),
            unknown: BTreeSet::new(),
            attribute_changes: Vec::new(),
            reason: None,
            create_before_destroy: false,
            dependencies: Vec::new(),
        }
    }

    /// Sets the reason.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Address plus deposed key, unique within a plan.
    #[must_use]
    pub fn display_address(&self) -> String {
        match &self.deposed {
            Some(key) => format!("{} (deposed {key})", self.address),
            None => self.address.to_string(),
        }
    }

    /// Returns true if the change does something.
    #[must_use]
    pub fn is_actionable(&self) -> bool {
        self.action != Action::NoOp
    }
}

impl Plan {
    /// Returns true if no change does anything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.changes.iter().any(Change::is_actionable)
    }

    /// The change for a current (non-deposed) instance.
    #[must_use]
    pub fn change(&self, address: &ResourceAddress) -> Option<&Change> {
        self.changes
            .iter()
            .find(|c| c.deposed.is_none() && &c.address == address)
    }

    /// Changes that do something.
    pub fn actionable(&self) -> impl Iterator<Item = &Change> {
        self.changes.iter().filter(|c| c.is_actionable())
    }

    /// Counts planned actions.
    #[must_use]
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for change in &self.changes {
            match change.action {
                Action::Create => summary.create += 1,
                Action::UpdateInPlace => summary.update += 1,
                Action::Replace => summary.replace += 1,
                Action::Destroy => summary.destroy += 1,
                Action::NoOp => summary.no_op += 1,
            }
        }
        summary
    }

    /// Writes the plan as JSON.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_vec_pretty(self)
            .map_err(|e| ConfigError::ParseError {
                message: format!("Failed to serialize plan: {e}"),
                location: None,
            })?;
        tokio::fs::write(path, content).await?;
        debug!("Saved plan to {}", path.display());
        Ok(())
    }

    /// Reads a plan written by [`Plan::save`].
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }
            .into(),
            _ => CoreError::from(e),
        })?;
        let plan = serde_json::from_slice(&content).map_err(|e| ConfigError::ParseError {
            message: format!("Failed to parse plan: {e}"),
            location: Some(path.display().to_string()),
        })?;
        Ok(plan)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::UpdateInPlace => write!(f, "update"),
            Self::Replace => write!(f, "replace"),
            Self::Destroy => write!(f, "destroy"),
            Self::NoOp => write!(f, "no-op"),
        }
    }
}

impl fmt::Display for PlanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Destroy => write!(f, "destroy"),
        }
    }
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to replace, {} to destroy",
            self.create, self.update, self.replace, self.destroy
        )
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self.action {
            Action::Create => "+",
            Action::UpdateInPlace => "~",
            Action::Replace if self.create_before_destroy => "+/-",
            Action::Replace => "-/+",
            Action::Destroy => "-",
            Action::NoOp => " ",
        };
        write!(f, "{symbol} {} ({})", self.display_address(), self.action)?;
        if let Some(reason) = &self.reason {
            write!(f, ": {reason}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn plan() -> Plan {
        let address = ResourceAddress::new("bucket", "logs");
        Plan {
            workspace: Workspace::default(),
            mode: PlanMode::Normal,
            base_lineage: String::from("lineage"),
            base_serial: 3,
            fingerprint: String::from("abc"),
            created_at: Utc::now(),
            refreshed: true,
            changes: vec![
                Change::new(address.clone(), Action::Create).with_reason("not in state"),
                Change::new(ResourceAddress::new("bucket", "old"), Action::Destroy),
                Change::new(ResourceAddress::new("web", "main"), Action::NoOp),
            ],
            outputs: BTreeMap::new(),
        }
    }

    #[test]
    fn test_summary() {
        let plan = plan();
        let summary = plan.summary();
        assert_eq!(summary.create, 1);
        assert_eq!(summary.destroy, 1);
        assert_eq!(summary.no_op, 1);
        assert!(!plan.is_empty());
        assert_eq!(plan.actionable().count(), 2);
        assert_eq!(
            summary.to_string(),
            "1 to create, 0 to update, 0 to replace, 1 to destroy"
        );
    }

    #[test]
    fn test_change_display() {
        let plan = plan();
        assert_eq!(
            plan.changes[0].to_string(),
            "+ bucket.logs (create): not in state"
        );
        let mut deposed = Change::new(ResourceAddress::new("bucket", "logs"), Action::Destroy);
        deposed.deposed = Some(String::from("ab12cd34"));
        assert_eq!(deposed.to_string(), "- bucket.logs (deposed ab12cd34) (destroy)");
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("plan.json");
        let plan = plan();

        plan.save(&path).await.expect("save");
        let loaded = Plan::load(&path).await.expect("load");
        assert_eq!(loaded, plan);

        let missing = Plan::load(&dir.path().join("missing.json")).await;
        assert!(matches!(
            missing,
            Err(CoreError::Config(ConfigError::FileNotFound { .. }))
        ));
    }
}
