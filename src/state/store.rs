//! The state store.
//!
//! Maps workspaces to backend keys and enforces the write protocol: a
//! write must hold the workspace lock, present the stored lineage and the
//! serial it was computed from, and is itself a conditional put, so a lost
//! race surfaces as an error rather than a silent overwrite.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Result, StateError};

use super::backend::{Backend, LockAttempt, PutCondition};
use super::lock::LockInfo;
use super::types::StateSnapshot;
use super::workspace::{DEFAULT_WORKSPACE, Workspace};

/// Key of the default workspace's snapshot.
const DEFAULT_STATE_KEY: &str = "default.state.json";

/// Prefix of named workspaces' snapshots.
const WORKSPACE_PREFIX: &str = "workspaces/";

/// Snapshot file name inside a named workspace.
const STATE_FILE: &str = "state.json";

/// Lock key suffix.
const LOCK_SUFFIX: &str = ".lock";

/// Versioned, lock-protected snapshot storage.
#[derive(Clone)]
pub struct StateStore {
    backend: Arc<dyn Backend>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("backend", &self.backend.backend_type())
            .finish()
    }
}

impl StateStore {
    /// Creates a store over a backend.
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Gets the backend type name.
    #[must_use]
    pub fn backend_type(&self) -> &'static str {
        self.backend.backend_type()
    }

    /// Backend key of a workspace's snapshot.
    #[must_use]
    pub fn state_key(workspace: &Workspace) -> String {
        if workspace.is_default() {
            DEFAULT_STATE_KEY.to_string()
        } else {
            format!("{WORKSPACE_PREFIX}{workspace}/{STATE_FILE}")
        }
    }

    fn lock_key(workspace: &Workspace) -> String {
        format!("{}{LOCK_SUFFIX}", Self::state_key(workspace))
    }

    /// Reads a workspace's snapshot if one was ever written.
    pub async fn read_existing(&self, workspace: &Workspace) -> Result<Option<StateSnapshot>> {
        let key = Self::state_key(workspace);
        match self.backend.get(&key).await? {
            Some(object) => {
                let snapshot = StateSnapshot::from_bytes(&object.bytes)?;
                debug!(
                    "Loaded state for workspace {workspace}: serial {}, {} instance(s)",
                    snapshot.serial,
                    snapshot.resources.len()
                );
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    /// Reads a workspace's snapshot; a fresh, empty snapshot if none exists.
    pub async fn read(&self, workspace: &Workspace) -> Result<StateSnapshot> {
        Ok(self.read_existing(workspace).await?.unwrap_or_default())
    }

    /// Acquires the workspace lock.
    pub async fn lock(&self, workspace: &Workspace, holder: &str, operation: &str) -> Result<LockInfo> {
        let key = Self::lock_key(workspace);
        let lock = LockInfo::new(holder, operation, workspace.as_str());

        match self.backend.lock_create(&key, &lock).await? {
            LockAttempt::Acquired => {
                info!("Acquired state lock {} for workspace {workspace}", lock.id);
                Ok(lock)
            }
            LockAttempt::Held(existing) => {
                warn!(
                    "Workspace {workspace} is locked by {} since {}",
                    existing.holder, existing.created_at
                );
                Err(StateError::LockConflict {
                    workspace: workspace.to_string(),
                    lock_id: existing.id,
                    holder: existing.holder,
                    since: existing.created_at.to_rfc3339(),
                }
                .into())
            }
        }
    }

    /// Releases a lock acquired with `lock`.
    pub async fn unlock(&self, workspace: &Workspace, lock: &LockInfo) -> Result<()> {
        let key = Self::lock_key(workspace);
        if self.backend.lock_delete(&key, &lock.id).await? {
            info!("Released state lock {}", lock.id);
            Ok(())
        } else {
            Err(StateError::NotLocked {
                workspace: workspace.to_string(),
                lock_id: lock.id.clone(),
            }
            .into())
        }
    }

    /// Removes a lock without holder checks.
    pub async fn force_unlock(&self, workspace: &Workspace, lock_id: &str) -> Result<()> {
        let key = Self::lock_key(workspace);
        if self.backend.lock_delete(&key, lock_id).await? {
            warn!("Force-unlocked workspace {workspace} (lock {lock_id})");
            Ok(())
        } else {
            Err(StateError::NotLocked {
                workspace: workspace.to_string(),
                lock_id: lock_id.to_string(),
            }
            .into())
        }
    }

    /// Current lock record of a workspace.
    pub async fn lock_info(&self, workspace: &Workspace) -> Result<Option<LockInfo>> {
        self.backend.lock_read(&Self::lock_key(workspace)).await
    }

    /// Writes `snapshot` as the successor of (`base_lineage`, `base_serial`)
    /// and returns the new serial.
    pub async fn write(
        &self,
        workspace: &Workspace,
        lock: &LockInfo,
        base_serial: u64,
        base_lineage: &str,
        snapshot: &StateSnapshot,
    ) -> Result<u64> {
        let lock_key = Self::lock_key(workspace);
        match self.backend.lock_read(&lock_key).await? {
            Some(held) if held.id == lock.id => {}
            _ => {
                return Err(StateError::NotLocked {
                    workspace: workspace.to_string(),
                    lock_id: lock.id.clone(),
                }
                .into());
            }
        }

        if snapshot.lineage != base_lineage {
            return Err(StateError::LineageMismatch {
                expected: base_lineage.to_string(),
                found: snapshot.lineage.clone(),
            }
            .into());
        }

        let key = Self::state_key(workspace);
        let condition = match self.backend.get(&key).await? {
            Some(object) => {
                let current = StateSnapshot::from_bytes(&object.bytes)?;
                if current.lineage != base_lineage {
                    return Err(StateError::LineageMismatch {
                        expected: current.lineage,
                        found: base_lineage.to_string(),
                    }
                    .into());
                }
                if current.serial != base_serial {
                    return Err(StateError::StaleState {
                        workspace: workspace.to_string(),
                        base_serial,
                        current_serial: current.serial,
                    }
                    .into());
                }
                PutCondition::IfVersion(object.version)
            }
            None if base_serial == 0 => PutCondition::IfAbsent,
            None => {
                return Err(StateError::StaleState {
                    workspace: workspace.to_string(),
                    base_serial,
                    current_serial: 0,
                }
                .into());
            }
        };

        let mut next = snapshot.clone();
        next.serial = base_serial + 1;
        self.backend.put(&key, next.to_bytes()?, condition).await?;

        debug!("Wrote state for workspace {workspace} at serial {}", next.serial);
        Ok(next.serial)
    }

    /// Creates an empty snapshot for a new workspace.
    pub async fn create(&self, workspace: &Workspace) -> Result<StateSnapshot> {
        let snapshot = StateSnapshot::new();
        let key = Self::state_key(workspace);
        match self
            .backend
            .put(&key, snapshot.to_bytes()?, PutCondition::IfAbsent)
            .await
        {
            Ok(_) => Ok(snapshot),
            Err(crate::error::CoreError::State(StateError::WriteConflict { .. })) => {
                Err(StateError::WorkspaceExists {
                    name: workspace.to_string(),
                }
                .into())
            }
            Err(e) => Err(e),
        }
    }

    /// Deletes a workspace's snapshot.
    pub async fn remove(&self, workspace: &Workspace) -> Result<()> {
        self.backend.delete(&Self::state_key(workspace)).await
    }

    /// Lists workspaces that have a snapshot, plus the default.
    pub async fn workspaces(&self) -> Result<Vec<Workspace>> {
        let mut names = vec![Workspace::default()];
        for key in self.backend.list(WORKSPACE_PREFIX).await? {
            let Some(name) = key
                .strip_prefix(WORKSPACE_PREFIX)
                .and_then(|rest| rest.strip_suffix(&format!("/{STATE_FILE}")))
            else {
                continue;
            };
            if name != DEFAULT_WORKSPACE {
                if let Ok(workspace) = Workspace::new(name) {
                    names.push(workspace);
                }
            }
        }
        names.sort();
        names.dedup();
        Ok(names)
    }
}
