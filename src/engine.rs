//! The engine facade.
//!
//! Every operation a CLI or service needs: planning, applying, destroying,
//! drift checks, direct state manipulation, imports and workspace
//! management. Each call receives its workspace explicitly. Mutating calls
//! hold the workspace lock for their whole duration and release it even
//! when they fail.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::{DeclarationHasher, Settings, SettingsValidator};
use crate::declaration::{DeclarationSet, ModulePath, ResourceAddress};
use crate::drift::{DriftDetector, DriftReport};
use crate::error::{ApplyError, ConfigError, ProviderError, Result, StateError};
use crate::executor::{ApplyReport, CancelHandle, DEFAULT_PARALLELISM, Executor};
use crate::graph::{Graph, GraphBuilder};
use crate::planner::{Plan, PlanMode, PlanOptions, Planner};
use crate::provider::{AttributeSchema, ProviderRegistry};
use crate::state::{
    LockInfo, ResourceInstanceState, STATE_DIR, StateSnapshot, StateStore, Workspace,
    generate_holder_id, read_selection, write_selection,
};

/// File holding the selected workspace, inside the state directory.
pub const SELECTION_FILE: &str = "environment";

/// Reconciliation engine over one state store and provider registry.
#[derive(Debug)]
pub struct Engine {
    /// State store.
    store: StateStore,
    /// Provider registry.
    registry: ProviderRegistry,
    /// Maximum provider operations in flight.
    parallelism: usize,
    /// Refresh before planning.
    refresh: bool,
    /// Lock holder identity.
    holder: String,
    /// Where the selected workspace is persisted.
    selection: PathBuf,
    /// Cancels the apply or destroy running through `apply`/`destroy`.
    cancel: CancelHandle,
}

/// Where the plan applied by `apply` comes from.
enum PlanSource<'p> {
    Saved(&'p Plan),
    Fresh(PlanMode),
}

/// What a state address argument selects.
#[derive(Debug, Clone)]
enum Selection {
    Instance(ResourceAddress),
    Resource(ResourceAddress),
    Module(ModulePath),
}

impl Engine {
    /// Creates an engine with default settings.
    #[must_use]
    pub fn new(store: StateStore, registry: ProviderRegistry) -> Self {
        Self {
            store,
            registry,
            parallelism: DEFAULT_PARALLELISM,
            refresh: true,
            holder: generate_holder_id(),
            selection: Path::new(STATE_DIR).join(SELECTION_FILE),
            cancel: CancelHandle::new(),
        }
    }

    /// Creates an engine from validated settings. Relative paths resolve
    /// against `base_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings are invalid.
    pub async fn from_settings(settings: &Settings, base_dir: &Path, registry: ProviderRegistry) -> Result<Self> {
        let validation = SettingsValidator::new().validate(settings)?;
        for warning in &validation.warnings {
            warn!("{warning}");
        }

        let store = StateStore::new(settings.open_backend(base_dir).await);
        info!("Using {} state backend", store.backend_type());

        let mut engine = Self::new(store, registry)
            .with_parallelism(settings.parallelism)
            .with_refresh(settings.refresh)
            .with_selection_file(settings.state_dir(base_dir).join(SELECTION_FILE));
        if let Some(holder) = &settings.lock_holder {
            engine = engine.with_holder(holder);
        }
        Ok(engine)
    }

    /// Sets the maximum number of provider operations in flight.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Sets whether plans refresh live objects first.
    #[must_use]
    pub const fn with_refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }

    /// Sets the lock holder identity.
    #[must_use]
    pub fn with_holder(mut self, holder: &str) -> Self {
        self.holder = holder.to_string();
        self
    }

    /// Sets the file the selected workspace is persisted in.
    #[must_use]
    pub fn with_selection_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.selection = path.into();
        self
    }

    /// The state store.
    #[must_use]
    pub const fn store(&self) -> &StateStore {
        &self.store
    }

    /// The provider registry.
    #[must_use]
    pub const fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// The lock holder identity.
    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// A handle that cancels the apply or destroy started through `apply`
    /// or `destroy`. A request made while none runs cancels the next one;
    /// the request is cleared when that operation returns.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Default planning options for `mode`.
    #[must_use]
    pub const fn plan_options(&self, mode: PlanMode) -> PlanOptions {
        PlanOptions {
            mode,
            refresh: self.refresh,
        }
    }

    /// Validates declarations and builds their graph.
    ///
    /// # Errors
    ///
    /// Returns the first naming, reference, repetition or cycle error.
    pub fn validate(&self, declarations: &DeclarationSet) -> Result<Graph> {
        let validation = SettingsValidator::new().validate_declarations(declarations)?;
        for warning in &validation.warnings {
            warn!("{warning}");
        }
        let graph = GraphBuilder::new(&self.registry).build(declarations)?;
        debug!("Graph has {} node(s)", graph.nodes().len());
        Ok(graph)
    }

    /// Computes a plan without taking the lock or mutating anything.
    ///
    /// # Errors
    ///
    /// Returns an error if the declarations are invalid, the workspace does
    /// not exist, or a provider read fails.
    pub async fn plan(
        &self,
        workspace: &Workspace,
        declarations: &DeclarationSet,
        options: PlanOptions,
    ) -> Result<Plan> {
        let graph = self.validate(declarations)?;
        let snapshot = self.existing(workspace).await?;
        let fingerprint = DeclarationHasher::new().fingerprint(declarations)?;
        Planner::new(&self.registry)
            .plan(&graph, &snapshot, workspace, &fingerprint, options)
            .await
    }

    /// Applies `saved`, or a plan computed under the lock when `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is held elsewhere, a saved plan no
    /// longer matches, or state can no longer be written. Node failures
    /// are reported in the returned report.
    pub async fn apply(
        &self,
        workspace: &Workspace,
        declarations: &DeclarationSet,
        saved: Option<&Plan>,
    ) -> Result<ApplyReport> {
        let result = self.apply_with_cancel(workspace, declarations, saved, &self.cancel).await;
        self.cancel.reset();
        result
    }

    /// Like `apply`, stopping when `cancel` is triggered instead of the
    /// engine's handle.
    ///
    /// # Errors
    ///
    /// Same as `apply`.
    pub async fn apply_with_cancel(
        &self,
        workspace: &Workspace,
        declarations: &DeclarationSet,
        saved: Option<&Plan>,
        cancel: &CancelHandle,
    ) -> Result<ApplyReport> {
        let source = saved.map_or(PlanSource::Fresh(PlanMode::Normal), PlanSource::Saved);
        let operation = if saved.is_some_and(|p| p.mode == PlanMode::Destroy) {
            "destroy"
        } else {
            "apply"
        };
        let lock = self.store.lock(workspace, &self.holder, operation).await?;
        let result = self
            .apply_locked(workspace, &lock, declarations, source, cancel)
            .await;
        self.release(workspace, &lock, result).await
    }

    /// Destroys every recorded instance of the workspace.
    ///
    /// # Errors
    ///
    /// Same as `apply`; a `prevent_destroy` instance aborts before any
    /// provider call.
    pub async fn destroy(&self, workspace: &Workspace, declarations: &DeclarationSet) -> Result<ApplyReport> {
        let result = self.destroy_with_cancel(workspace, declarations, &self.cancel).await;
        self.cancel.reset();
        result
    }

    /// Like `destroy`, stopping when `cancel` is triggered.
    ///
    /// # Errors
    ///
    /// Same as `destroy`.
    pub async fn destroy_with_cancel(
        &self,
        workspace: &Workspace,
        declarations: &DeclarationSet,
        cancel: &CancelHandle,
    ) -> Result<ApplyReport> {
        let lock = self.store.lock(workspace, &self.holder, "destroy").await?;
        let result = self
            .apply_locked(
                workspace,
                &lock,
                declarations,
                PlanSource::Fresh(PlanMode::Destroy),
                cancel,
            )
            .await;
        self.release(workspace, &lock, result).await
    }

    async fn apply_locked(
        &self,
        workspace: &Workspace,
        lock: &LockInfo,
        declarations: &DeclarationSet,
        source: PlanSource<'_>,
        cancel: &CancelHandle,
    ) -> Result<ApplyReport> {
        let graph = self.validate(declarations)?;
        let mut snapshot = self.existing(workspace).await?;
        let fingerprint = DeclarationHasher::new().fingerprint(declarations)?;

        let fresh;
        let plan = match source {
            PlanSource::Saved(plan) => {
                check_saved(plan, workspace, &mut snapshot, &fingerprint)?;
                plan
            }
            PlanSource::Fresh(mode) => {
                fresh = Planner::new(&self.registry)
                    .plan(&graph, &snapshot, workspace, &fingerprint, self.plan_options(mode))
                    .await?;
                &fresh
            }
        };

        Executor::new(&self.registry, &self.store)
            .with_parallelism(self.parallelism)
            .with_cancel(cancel.clone())
            .apply(plan, &graph, snapshot, lock)
            .await
    }

    /// Compares recorded state with live objects. With `accept`, drifted
    /// values are written to state under the lock; no provider mutation is
    /// ever made.
    ///
    /// # Errors
    ///
    /// Returns an error if a provider read or the state write fails.
    pub async fn refresh(
        &self,
        workspace: &Workspace,
        declarations: Option<&DeclarationSet>,
        accept: bool,
    ) -> Result<DriftReport> {
        let graph = declarations.map(|d| self.validate(d)).transpose()?;

        if !accept {
            let snapshot = self.existing(workspace).await?;
            return DriftDetector::new(&self.registry)
                .detect(&snapshot, graph.as_ref())
                .await;
        }

        let lock = self.store.lock(workspace, &self.holder, "refresh").await?;
        let result = self.accept_drift(workspace, &lock, graph.as_ref()).await;
        self.release(workspace, &lock, result).await
    }

    async fn accept_drift(&self, workspace: &Workspace, lock: &LockInfo, graph: Option<&Graph>) -> Result<DriftReport> {
        let mut snapshot = self.existing(workspace).await?;
        let mut report = DriftDetector::new(&self.registry)
            .detect(&snapshot, graph)
            .await?;

        if report.has_drift() {
            let base_serial = snapshot.serial;
            let lineage = snapshot.lineage.clone();
            let touched = report.accept(&mut snapshot);
            report.serial = self
                .store
                .write(workspace, lock, base_serial, &lineage, &snapshot)
                .await?;
            info!("Accepted drift of {touched} instance(s)");
        }
        Ok(report)
    }

    /// Lists recorded instances, optionally limited to those under
    /// `prefix` (an instance, resource or module address).
    ///
    /// # Errors
    ///
    /// Returns an error if the prefix is malformed or state cannot be read.
    pub async fn state_list(&self, workspace: &Workspace, prefix: Option<&str>) -> Result<Vec<ResourceInstanceState>> {
        let selection = prefix.map(Selection::parse).transpose()?;
        let snapshot = self.existing(workspace).await?;
        Ok(snapshot
            .resources
            .into_iter()
            .filter(|r| selection.as_ref().is_none_or(|s| s.matches(&r.address())))
            .collect())
    }

    /// Shows one recorded instance.
    ///
    /// # Errors
    ///
    /// Returns `AddressNotFound` if nothing is recorded at `address`.
    pub async fn state_show(&self, workspace: &Workspace, address: &ResourceAddress) -> Result<ResourceInstanceState> {
        let snapshot = self.existing(workspace).await?;
        snapshot.instance(address).cloned().ok_or_else(|| {
            StateError::AddressNotFound {
                address: address.to_string(),
            }
            .into()
        })
    }

    /// Re-addresses recorded instances without touching remote objects.
    /// Accepts instance, whole-resource and module addresses. Returns the
    /// number of records moved.
    ///
    /// # Errors
    ///
    /// Returns `AddressNotFound` when nothing matches `from` and
    /// `AddressExists` when a target is already occupied.
    pub async fn state_mv(&self, workspace: &Workspace, from: &str, to: &str) -> Result<usize> {
        let from = Selection::parse(from)?;
        let to = Selection::parse(to)?;
        let lock = self.store.lock(workspace, &self.holder, "state mv").await?;
        let result = self
            .mutate(workspace, &lock, |snapshot| move_instances(snapshot, &from, &to))
            .await;
        self.release(workspace, &lock, result).await
    }

    /// Forgets recorded instances without deleting remote objects. Returns
    /// the number of records removed.
    ///
    /// # Errors
    ///
    /// Returns `AddressNotFound` when nothing matches.
    pub async fn state_rm(&self, workspace: &Workspace, address: &str) -> Result<usize> {
        let selection = Selection::parse(address)?;
        let lock = self.store.lock(workspace, &self.holder, "state rm").await?;
        let result = self
            .mutate(workspace, &lock, |snapshot| {
                let before = snapshot.resources.len();
                snapshot.resources.retain(|r| !selection.matches(&r.address()));
                let removed = before - snapshot.resources.len();
                if removed == 0 {
                    return Err(StateError::AddressNotFound {
                        address: selection.to_string(),
                    }
                    .into());
                }
                info!("Removed {removed} record(s) under {selection}");
                Ok(removed)
            })
            .await;
        self.release(workspace, &lock, result).await
    }

    /// Adopts an existing remote object under `address`.
    ///
    /// # Errors
    ///
    /// Returns `AddressExists` when `address` is already recorded, or the
    /// provider's error when the object cannot be imported.
    pub async fn import(&self, workspace: &Workspace, address: &ResourceAddress, id: &str) -> Result<ResourceInstanceState> {
        let lock = self.store.lock(workspace, &self.holder, "import").await?;
        let result = self.import_locked(workspace, &lock, address, id).await;
        self.release(workspace, &lock, result).await
    }

    async fn import_locked(
        &self,
        workspace: &Workspace,
        lock: &LockInfo,
        address: &ResourceAddress,
        id: &str,
    ) -> Result<ResourceInstanceState> {
        let provider = self.registry.resolve(address)?;
        let mut snapshot = self.existing(workspace).await?;
        if snapshot.instance(address).is_some() {
            return Err(StateError::AddressExists {
                address: address.to_string(),
            }
            .into());
        }

        let imported = provider.import(id).await?;
        let Some(attributes) = provider.read(id, &imported.attributes).await? else {
            return Err(ProviderError::not_found(&address.resource_type, id).into());
        };

        let schema = provider.schema();
        let mut instance = ResourceInstanceState::new(address, schema.version, attributes);
        instance.arguments = instance
            .attributes
            .iter()
            .filter(|(name, _)| schema.attributes.get(*name).is_some_and(AttributeSchema::is_argument))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        instance.sensitive_attributes = schema.sensitive_attributes();
        instance.private = imported.private;

        let base_serial = snapshot.serial;
        let lineage = snapshot.lineage.clone();
        snapshot.upsert(instance.clone());
        self.store
            .write(workspace, lock, base_serial, &lineage, &snapshot)
            .await?;
        info!("Imported {address} from {id}");
        Ok(instance)
    }

    /// Removes a lock without holder checks.
    ///
    /// # Errors
    ///
    /// Returns `NotLocked` when `lock_id` is not the current lock.
    pub async fn force_unlock(&self, workspace: &Workspace, lock_id: &str) -> Result<()> {
        self.store.force_unlock(workspace, lock_id).await
    }

    /// Creates a workspace with empty state.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or the workspace exists.
    pub async fn workspace_new(&self, name: &str) -> Result<Workspace> {
        let workspace = Workspace::new(name)?;
        if workspace.is_default() {
            return Err(StateError::WorkspaceExists {
                name: workspace.to_string(),
            }
            .into());
        }
        self.store.create(&workspace).await?;
        info!("Created workspace {workspace}");
        Ok(workspace)
    }

    /// Persists `name` as the selected workspace.
    ///
    /// # Errors
    ///
    /// Returns `WorkspaceNotFound` if it does not exist.
    pub async fn workspace_select(&self, name: &str) -> Result<Workspace> {
        let workspace = Workspace::new(name)?;
        self.existing(&workspace).await?;
        write_selection(&self.selection, &workspace).await?;
        info!("Switched to workspace {workspace}");
        Ok(workspace)
    }

    /// The persisted workspace selection.
    ///
    /// # Errors
    ///
    /// Returns an error if the selection file is unreadable.
    pub async fn workspace_current(&self) -> Result<Workspace> {
        read_selection(&self.selection).await
    }

    /// Deletes an empty, unselected, non-default workspace.
    ///
    /// # Errors
    ///
    /// Returns an error if the workspace is the default, is selected,
    /// does not exist, still manages instances, or is locked.
    pub async fn workspace_delete(&self, name: &str) -> Result<()> {
        let workspace = Workspace::new(name)?;
        if workspace.is_default() {
            return Err(StateError::DefaultWorkspace.into());
        }
        if self.workspace_current().await? == workspace {
            return Err(StateError::WorkspaceActive {
                name: workspace.to_string(),
            }
            .into());
        }

        self.existing(&workspace).await?;

        let lock = self.store.lock(&workspace, &self.holder, "workspace delete").await?;
        let result = self.remove_if_empty(&workspace).await;
        self.release(&workspace, &lock, result).await?;
        info!("Deleted workspace {workspace}");
        Ok(())
    }

    /// Removes the workspace's snapshot unless it records instances. The
    /// caller holds the lock.
    async fn remove_if_empty(&self, workspace: &Workspace) -> Result<()> {
        let snapshot = self.existing(workspace).await?;
        if !snapshot.resources.is_empty() {
            return Err(StateError::WorkspaceNotEmpty {
                name: workspace.to_string(),
                resources: snapshot.resources.len(),
            }
            .into());
        }
        self.store.remove(workspace).await
    }

    /// Lists workspaces, the default included.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be listed.
    pub async fn workspace_list(&self) -> Result<Vec<Workspace>> {
        self.store.workspaces().await
    }

    /// Reads a workspace's snapshot. The default workspace always exists;
    /// named ones must have been created.
    async fn existing(&self, workspace: &Workspace) -> Result<StateSnapshot> {
        match self.store.read_existing(workspace).await? {
            Some(snapshot) => Ok(snapshot),
            None if workspace.is_default() => Ok(StateSnapshot::new()),
            None => Err(StateError::WorkspaceNotFound {
                name: workspace.to_string(),
            }
            .into()),
        }
    }

    /// Applies a synchronous edit to the snapshot and writes it.
    async fn mutate<T>(
        &self,
        workspace: &Workspace,
        lock: &LockInfo,
        edit: impl FnOnce(&mut StateSnapshot) -> Result<T>,
    ) -> Result<T> {
        let mut snapshot = self.existing(workspace).await?;
        let base_serial = snapshot.serial;
        let lineage = snapshot.lineage.clone();
        let value = edit(&mut snapshot)?;
        self.store
            .write(workspace, lock, base_serial, &lineage, &snapshot)
            .await?;
        Ok(value)
    }

    /// Releases the lock, keeping the operation's error if both fail.
    async fn release<T>(&self, workspace: &Workspace, lock: &LockInfo, result: Result<T>) -> Result<T> {
        let released = self.store.unlock(workspace, lock).await;
        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(unlock_error)) => {
                warn!("Failed to release lock {}: {unlock_error}", lock.id);
                Err(e)
            }
        }
    }
}

/// Checks that a saved plan still applies to the current snapshot.
fn check_saved(plan: &Plan, workspace: &Workspace, snapshot: &mut StateSnapshot, fingerprint: &str) -> Result<()> {
    if plan.workspace != *workspace {
        return Err(ApplyError::PlanMismatch {
            message: format!("plan was created for workspace {}", plan.workspace),
        }
        .into());
    }

    // State that was never written has no lineage yet; adopt the plan's.
    if snapshot.serial == 0 && plan.base_serial == 0 {
        snapshot.lineage.clone_from(&plan.base_lineage);
    }

    if plan.base_lineage != snapshot.lineage {
        return Err(StateError::LineageMismatch {
            expected: snapshot.lineage.clone(),
            found: plan.base_lineage.clone(),
        }
        .into());
    }
    if plan.base_serial != snapshot.serial {
        return Err(StateError::StaleState {
            workspace: workspace.to_string(),
            base_serial: plan.base_serial,
            current_serial: snapshot.serial,
        }
        .into());
    }
    if !DeclarationHasher::hashes_match(&plan.fingerprint, fingerprint) {
        return Err(ApplyError::PlanMismatch {
            message: String::from("declarations changed since the plan was created"),
        }
        .into());
    }
    Ok(())
}

/// Moves every record selected by `from` to its place under `to`.
fn move_instances(snapshot: &mut StateSnapshot, from: &Selection, to: &Selection) -> Result<usize> {
    let mut moves = Vec::new();
    for (i, record) in snapshot.resources.iter().enumerate() {
        let address = record.address();
        if from.matches(&address) {
            moves.push((i, address.clone(), from.retarget(to, &address)?));
        }
    }
    if moves.is_empty() {
        return Err(StateError::AddressNotFound {
            address: from.to_string(),
        }
        .into());
    }

    let moved: BTreeSet<usize> = moves.iter().map(|(i, _, _)| *i).collect();
    for (_, _, target) in &moves {
        let occupied = snapshot
            .resources
            .iter()
            .enumerate()
            .any(|(i, r)| !moved.contains(&i) && r.deposed.is_none() && r.address() == *target);
        if occupied {
            return Err(StateError::AddressExists {
                address: target.to_string(),
            }
            .into());
        }
    }

    for (i, source, target) in &moves {
        snapshot.resources[*i].set_address(target);
        for record in &mut snapshot.resources {
            for dependency in &mut record.dependencies {
                if dependency == source {
                    dependency.clone_from(target);
                }
            }
        }
        debug!("Moved {source} to {target}");
    }

    info!("Moved {} record(s) from {from} to {to}", moves.len());
    Ok(moves.len())
}

impl Selection {
    fn parse(input: &str) -> Result<Self> {
        if let Ok(address) = input.parse::<ResourceAddress>() {
            return Ok(if address.key.is_some() {
                Self::Instance(address)
            } else {
                Self::Resource(address)
            });
        }
        let module: ModulePath = input.parse()?;
        if module.is_root() {
            return Err(ConfigError::InvalidAddress {
                input: input.to_string(),
                message: String::from("empty address"),
            }
            .into());
        }
        Ok(Self::Module(module))
    }

    fn matches(&self, address: &ResourceAddress) -> bool {
        match self {
            Self::Instance(selected) => selected == address,
            Self::Resource(selected) => selected.same_resource(address),
            Self::Module(module) => address.module.starts_with(module),
        }
    }

    /// Where `address` (selected by `self`) lands under `to`.
    fn retarget(&self, to: &Self, address: &ResourceAddress) -> Result<ResourceAddress> {
        let target = match (self, to) {
            (Self::Instance(_) | Self::Resource(_), Self::Instance(target)) => target.clone(),
            (Self::Instance(_), Self::Resource(target)) => target.clone(),
            (Self::Resource(_), Self::Resource(target)) => ResourceAddress {
                key: address.key.clone(),
                ..target.clone()
            },
            (Self::Module(from), Self::Module(target)) => ResourceAddress {
                module: address.module.rebase(from, target).unwrap_or_else(|| address.module.clone()),
                ..address.clone()
            },
            _ => {
                return Err(ConfigError::InvalidAddress {
                    input: to.to_string(),
                    message: format!("cannot move {self} to a different kind of address"),
                }
                .into());
            }
        };

        if target.resource_type != address.resource_type {
            return Err(ConfigError::InvalidAddress {
                input: to.to_string(),
                message: format!("cannot change resource type {} to {}", address.resource_type, target.resource_type),
            }
            .into());
        }
        Ok(target)
    }
}

impl std::fmt::Display for Selection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Instance(address) | Self::Resource(address) => write!(f, "{address}"),
            Self::Module(module) => write!(f, "{module}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declaration::{Condition, Expr, Lifecycle, Predicate, Reference, ResourceDeclaration};
    use crate::error::CoreError;
    use crate::executor::{ApplyOutcome, NodeStatus};
    use crate::planner::Action;
    use crate::provider::{InMemoryCloud, Operation, ResourceSchema};
    use crate::state::{Backend, InMemoryBackend, LockAttempt, PutCondition, StoredObject};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        cloud: InMemoryCloud,
        engine: Engine,
        _dir: TempDir,
    }

    fn harness_with(cloud: InMemoryCloud) -> Harness {
        let mut registry = ProviderRegistry::new();
        registry.register(cloud.provider(
            "bucket",
            ResourceSchema::new(1)
                .with("id", AttributeSchema::computed())
                .with("arn", AttributeSchema::computed())
                .with("name", AttributeSchema::required())
                .with("region", AttributeSchema::optional().force_new()),
        ));
        registry.register(cloud.provider(
            "instance",
            ResourceSchema::new(1)
                .with("id", AttributeSchema::computed())
                .with("bucket_id", AttributeSchema::required())
                .with("size", AttributeSchema::optional()),
        ));
        registry.register(cloud.provider(
            "volume",
            ResourceSchema::new(1)
                .with("id", AttributeSchema::computed())
                .with("bucket_id", AttributeSchema::required().force_new()),
        ));

        let dir = tempfile::tempdir().expect("tempdir");
        let engine = Engine::new(StateStore::new(Arc::new(InMemoryBackend::new())), registry)
            .with_holder("test")
            .with_selection_file(dir.path().join(SELECTION_FILE));
        Harness {
            cloud,
            engine,
            _dir: dir,
        }
    }

    fn harness() -> Harness {
        harness_with(InMemoryCloud::new())
    }

    fn bucket(name: &str, value: &str) -> ResourceDeclaration {
        ResourceDeclaration::new("bucket", name).with_argument("name", Expr::string(value))
    }

    fn stack(bucket_name: &str, region: &str) -> DeclarationSet {
        DeclarationSet {
            resources: vec![
                bucket("logs", bucket_name).with_argument("region", Expr::string(region)),
                ResourceDeclaration::new("instance", "web")
                    .with_argument("bucket_id", Expr::attr("bucket", "logs", "id")),
            ],
            ..DeclarationSet::default()
        }
    }

    fn ws() -> Workspace {
        Workspace::default()
    }

    fn address(input: &str) -> ResourceAddress {
        input.parse().expect("address")
    }

    #[tokio::test]
    async fn test_apply_then_replan_is_noop() {
        let h = harness();
        let declarations = stack("logs", "eu");

        let report = h.engine.apply(&ws(), &declarations, None).await.expect("apply");
        assert_eq!(report.outcome(), ApplyOutcome::Complete);
        assert_eq!(report.committed(), 2);

        let creates: Vec<_> = h
            .cloud
            .mutations()
            .into_iter()
            .map(|c| c.resource_type)
            .collect();
        assert_eq!(creates, vec![String::from("bucket"), String::from("instance")]);

        let web = h.engine.state_show(&ws(), &address("instance.web")).await.expect("web");
        let logs = h.engine.state_show(&ws(), &address("bucket.logs")).await.expect("logs");
        assert_eq!(web.attributes["bucket_id"], logs.attributes["id"]);
        assert_eq!(web.dependencies, vec![address("bucket.logs")]);

        let plan = h
            .engine
            .plan(&ws(), &declarations, PlanOptions::default())
            .await
            .expect("plan");
        assert!(plan.is_empty());
        assert!(plan.changes.iter().all(|c| c.action == Action::NoOp));
    }

    #[tokio::test]
    async fn test_update_in_place_versus_replace() {
        let h = harness();
        h.engine.apply(&ws(), &stack("logs", "eu"), None).await.expect("apply");

        let plan = h
            .engine
            .plan(&ws(), &stack("logs-2", "eu"), PlanOptions::default())
            .await
            .expect("plan");
        assert_eq!(plan.change(&address("bucket.logs")).expect("logs").action, Action::UpdateInPlace);
        assert_eq!(plan.change(&address("instance.web")).expect("web").action, Action::NoOp);

        let plan = h
            .engine
            .plan(&ws(), &stack("logs", "us"), PlanOptions::default())
            .await
            .expect("plan");
        assert_eq!(plan.change(&address("bucket.logs")).expect("logs").action, Action::Replace);
        assert_eq!(plan.change(&address("instance.web")).expect("web").action, Action::UpdateInPlace);

        let old_id = h
            .engine
            .state_show(&ws(), &address("bucket.logs"))
            .await
            .expect("logs")
            .attributes["id"]
            .clone();
        let report = h.engine.apply(&ws(), &stack("logs", "us"), None).await.expect("apply");
        assert_eq!(report.outcome(), ApplyOutcome::Complete);

        let logs = h.engine.state_show(&ws(), &address("bucket.logs")).await.expect("logs");
        let web = h.engine.state_show(&ws(), &address("instance.web")).await.expect("web");
        assert_ne!(logs.attributes["id"], old_id);
        assert_eq!(web.attributes["bucket_id"], logs.attributes["id"]);
    }

    #[tokio::test]
    async fn test_partial_failure_then_resume() {
        let h = harness();
        let declarations = DeclarationSet {
            resources: vec![bucket("a", "good"), bucket("b", "bad")],
            ..DeclarationSet::default()
        };
        h.cloud
            .fail_when(Operation::Create, "bucket", "name", Value::from("bad"));

        let report = h.engine.apply(&ws(), &declarations, None).await.expect("apply");
        assert_eq!(report.outcome(), ApplyOutcome::Partial);
        assert_eq!(report.committed(), 1);
        assert_eq!(report.failed(), 1);

        let recorded = h.engine.state_list(&ws(), None).await.expect("list");
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].address(), address("bucket.a"));

        h.cloud.clear_failures();
        h.cloud.clear_calls();
        let report = h.engine.apply(&ws(), &declarations, None).await.expect("apply");
        assert_eq!(report.outcome(), ApplyOutcome::Complete);

        let mutations = h.cloud.mutations();
        assert_eq!(mutations.len(), 1);
        assert_eq!(
            mutations[0].arguments.as_ref().and_then(|a| a.get("name")),
            Some(&Value::from("bad"))
        );
    }

    #[tokio::test]
    async fn test_failure_skips_dependents() {
        let h = harness();
        h.cloud
            .fail_when(Operation::Create, "bucket", "name", Value::from("logs"));

        let report = h.engine.apply(&ws(), &stack("logs", "eu"), None).await.expect("apply");
        assert_eq!(report.failed(), 2);
        assert!(report.nodes.iter().all(|n| n.status == NodeStatus::Failed));
        assert!(h.cloud.objects_of("instance").is_empty());
        assert!(h.engine.state_list(&ws(), None).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn test_create_before_destroy_order() {
        let h = harness();
        let declarations = |region: &str| DeclarationSet {
            resources: vec![
                bucket("logs", "logs")
                    .with_argument("region", Expr::string(region))
                    .with_lifecycle(Lifecycle {
                        create_before_destroy: true,
                        ..Lifecycle::default()
                    }),
            ],
            ..DeclarationSet::default()
        };
        h.engine.apply(&ws(), &declarations("eu"), None).await.expect("apply");
        h.cloud.clear_calls();

        let report = h.engine.apply(&ws(), &declarations("us"), None).await.expect("apply");
        assert_eq!(report.outcome(), ApplyOutcome::Complete);

        let operations: Vec<_> = h.cloud.mutations().into_iter().map(|c| c.operation).collect();
        assert_eq!(operations, vec![Operation::Create, Operation::Delete]);

        let recorded = h.engine.state_list(&ws(), None).await.expect("list");
        assert_eq!(recorded.len(), 1);
        assert!(recorded[0].deposed.is_none());
        assert_eq!(h.cloud.objects_of("bucket").len(), 1);
    }

    #[tokio::test]
    async fn test_parallelism_bound() {
        let h = harness_with(InMemoryCloud::new().with_latency(Duration::from_millis(20)));
        let engine = h.engine.with_parallelism(2);
        let declarations = DeclarationSet {
            resources: (0..6).map(|i| bucket(&format!("b{i}"), &format!("bucket-{i}"))).collect(),
            ..DeclarationSet::default()
        };

        let report = engine.apply(&ws(), &declarations, None).await.expect("apply");
        assert_eq!(report.committed(), 6);
        assert!(h.cloud.max_in_flight() <= 2);
        assert!(h.cloud.max_in_flight() >= 1);
    }

    #[tokio::test]
    async fn test_saved_plan_revalidated() {
        let h = harness();
        let declarations = stack("logs", "eu");
        let plan = h
            .engine
            .plan(&ws(), &declarations, PlanOptions::default())
            .await
            .expect("plan");

        let err = h
            .engine
            .apply(&ws(), &stack("other", "eu"), Some(&plan))
            .await
            .expect_err("fingerprint");
        assert!(err.requires_replan());

        let report = h
            .engine
            .apply(&ws(), &declarations, Some(&plan))
            .await
            .expect("apply");
        assert_eq!(report.committed(), 2);

        let err = h
            .engine
            .apply(&ws(), &declarations, Some(&plan))
            .await
            .expect_err("stale");
        assert!(matches!(err, CoreError::State(StateError::StaleState { .. })));
    }

    #[tokio::test]
    async fn test_lock_conflict_and_force_unlock() {
        let h = harness();
        let held = h
            .engine
            .store()
            .lock(&ws(), "someone-else", "apply")
            .await
            .expect("lock");

        let err = h
            .engine
            .apply(&ws(), &stack("logs", "eu"), None)
            .await
            .expect_err("locked");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("someone-else"));
        assert!(h.cloud.calls().is_empty());

        h.engine.force_unlock(&ws(), &held.id).await.expect("force unlock");
        h.engine
            .apply(&ws(), &stack("logs", "eu"), None)
            .await
            .expect("apply");
        assert!(h.engine.store().lock_info(&ws()).await.expect("info").is_none());
    }

    #[tokio::test]
    async fn test_refresh_accepts_drift_only_on_request() {
        let h = harness();
        h.engine.apply(&ws(), &stack("logs", "eu"), None).await.expect("apply");
        let logs = h.engine.state_show(&ws(), &address("bucket.logs")).await.expect("logs");
        let id = logs.attributes["id"].as_str().expect("id").to_string();
        h.cloud.set_attribute(&id, "name", Value::from("renamed"));

        let report = h.engine.refresh(&ws(), None, false).await.expect("refresh");
        assert!(report.has_drift());
        let logs = h.engine.state_show(&ws(), &address("bucket.logs")).await.expect("logs");
        assert_eq!(logs.attributes["name"], Value::from("logs"));

        h.cloud.clear_calls();
        let report = h.engine.refresh(&ws(), None, true).await.expect("accept");
        assert!(report.has_drift());
        let logs = h.engine.state_show(&ws(), &address("bucket.logs")).await.expect("logs");
        assert_eq!(logs.attributes["name"], Value::from("renamed"));
        assert!(h.cloud.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_removes_everything() {
        let h = harness();
        h.engine.apply(&ws(), &stack("logs", "eu"), None).await.expect("apply");
        h.cloud.clear_calls();

        let report = h.engine.destroy(&ws(), &stack("logs", "eu")).await.expect("destroy");
        assert_eq!(report.outcome(), ApplyOutcome::Complete);
        assert!(h.engine.state_list(&ws(), None).await.expect("list").is_empty());

        let deleted: Vec<_> = h.cloud.mutations().into_iter().map(|c| c.resource_type).collect();
        assert_eq!(deleted, vec![String::from("instance"), String::from("bucket")]);
    }

    #[tokio::test]
    async fn test_state_mv_and_rm() {
        let h = harness();
        h.engine.apply(&ws(), &stack("logs", "eu"), None).await.expect("apply");
        h.cloud.clear_calls();

        let moved = h
            .engine
            .state_mv(&ws(), "bucket.logs", "bucket.archive")
            .await
            .expect("mv");
        assert_eq!(moved, 1);
        let web = h.engine.state_show(&ws(), &address("instance.web")).await.expect("web");
        assert_eq!(web.dependencies, vec![address("bucket.archive")]);

        let err = h
            .engine
            .state_mv(&ws(), "bucket.archive", "instance.web")
            .await
            .expect_err("type change");
        assert!(matches!(err, CoreError::Config(ConfigError::InvalidAddress { .. })));

        let err = h
            .engine
            .state_mv(&ws(), "bucket.missing", "bucket.other")
            .await
            .expect_err("missing");
        assert!(matches!(err, CoreError::State(StateError::AddressNotFound { .. })));

        let removed = h.engine.state_rm(&ws(), "instance.web").await.expect("rm");
        assert_eq!(removed, 1);
        let listed = h.engine.state_list(&ws(), None).await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].address(), address("bucket.archive"));
        assert!(h.cloud.calls().is_empty());
        assert_eq!(h.cloud.objects_of("instance").len(), 1);
    }

    #[tokio::test]
    async fn test_state_mv_rejects_occupied_target() {
        let h = harness();
        let declarations = DeclarationSet {
            resources: vec![bucket("a", "a"), bucket("b", "b")],
            ..DeclarationSet::default()
        };
        h.engine.apply(&ws(), &declarations, None).await.expect("apply");

        let err = h
            .engine
            .state_mv(&ws(), "bucket.a", "bucket.b")
            .await
            .expect_err("occupied");
        assert!(matches!(err, CoreError::State(StateError::AddressExists { .. })));

        let moved = h
            .engine
            .state_mv(&ws(), "bucket.a", "module.storage.bucket.a")
            .await
            .expect("into module");
        assert_eq!(moved, 1);
        let listed = h
            .engine
            .state_list(&ws(), Some("module.storage"))
            .await
            .expect("list");
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn test_import_adopts_object() {
        let h = harness();
        let mut attributes = crate::declaration::Attributes::new();
        attributes.insert(String::from("name"), Value::from("legacy"));
        let id = h.cloud.insert_object("bucket", attributes);

        let instance = h
            .engine
            .import(&ws(), &address("bucket.legacy"), &id)
            .await
            .expect("import");
        assert_eq!(instance.arguments.get("name"), Some(&Value::from("legacy")));
        assert!(!instance.arguments.contains_key("id"));

        let err = h
            .engine
            .import(&ws(), &address("bucket.legacy"), &id)
            .await
            .expect_err("exists");
        assert!(matches!(err, CoreError::State(StateError::AddressExists { .. })));

        let declarations = DeclarationSet {
            resources: vec![bucket("legacy", "legacy")],
            ..DeclarationSet::default()
        };
        let plan = h
            .engine
            .plan(&ws(), &declarations, PlanOptions::default())
            .await
            .expect("plan");
        assert!(plan.is_empty());
    }

    #[tokio::test]
    async fn test_workspaces() {
        let h = harness();
        assert_eq!(h.engine.workspace_current().await.expect("current"), ws());

        let staging = h.engine.workspace_new("staging").await.expect("new");
        let err = h.engine.workspace_new("staging").await.expect_err("exists");
        assert!(matches!(err, CoreError::State(StateError::WorkspaceExists { .. })));

        let names: Vec<_> = h
            .engine
            .workspace_list()
            .await
            .expect("list")
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(names, vec![String::from("default"), String::from("staging")]);

        h.engine.workspace_select("staging").await.expect("select");
        assert_eq!(h.engine.workspace_current().await.expect("current"), staging);

        h.engine.apply(&staging, &stack("logs", "eu"), None).await.expect("apply");
        assert!(h.engine.state_list(&ws(), None).await.expect("default").is_empty());

        h.engine.workspace_select("default").await.expect("select");
        let err = h.engine.workspace_delete("staging").await.expect_err("not empty");
        assert!(matches!(err, CoreError::State(StateError::WorkspaceNotEmpty { .. })));

        h.engine.destroy(&staging, &stack("logs", "eu")).await.expect("destroy");
        h.engine.workspace_delete("staging").await.expect("delete");

        let err = h.engine.workspace_select("staging").await.expect_err("gone");
        assert!(matches!(err, CoreError::State(StateError::WorkspaceNotFound { .. })));
        let err = h.engine.workspace_delete("default").await.expect_err("default");
        assert!(matches!(err, CoreError::State(StateError::DefaultWorkspace)));
    }

    #[tokio::test]
    async fn test_active_workspace_cannot_be_deleted() {
        let h = harness();
        h.engine.workspace_new("prod").await.expect("new");
        h.engine.workspace_select("prod").await.expect("select");
        let err = h.engine.workspace_delete("prod").await.expect_err("active");
        assert!(matches!(err, CoreError::State(StateError::WorkspaceActive { .. })));
    }

    #[tokio::test]
    async fn test_replace_under_create_before_destroy_dependent() {
        let h = harness();
        let declarations = |region: &str| DeclarationSet {
            resources: vec![
                bucket("logs", "logs").with_argument("region", Expr::string(region)),
                ResourceDeclaration::new("volume", "data")
                    .with_argument("bucket_id", Expr::attr("bucket", "logs", "id"))
                    .with_lifecycle(Lifecycle {
                        create_before_destroy: true,
                        ..Lifecycle::default()
                    }),
            ],
            ..DeclarationSet::default()
        };
        h.engine.apply(&ws(), &declarations("eu"), None).await.expect("apply");
        h.cloud.clear_calls();

        let plan = h
            .engine
            .plan(&ws(), &declarations("us"), PlanOptions::default())
            .await
            .expect("plan");
        for name in ["bucket.logs", "volume.data"] {
            let change = plan.change(&address(name)).expect("change");
            assert_eq!(change.action, Action::Replace, "{name}");
            assert!(change.create_before_destroy, "{name}");
        }

        let report = h
            .engine
            .apply(&ws(), &declarations("us"), Some(&plan))
            .await
            .expect("apply");
        assert_eq!(report.outcome(), ApplyOutcome::Complete);

        let mutations = h.cloud.mutations();
        let operations: Vec<_> = mutations
            .iter()
            .map(|c| (c.operation, c.resource_type.as_str()))
            .collect();
        assert_eq!(&operations[..2], &[(Operation::Create, "bucket"), (Operation::Create, "volume")]);
        assert!(operations[2..].iter().all(|(op, _)| *op == Operation::Delete));
        assert_eq!(operations.len(), 4);

        let recorded = h.engine.state_list(&ws(), None).await.expect("list");
        assert_eq!(recorded.len(), 2);
        assert!(recorded.iter().all(|r| r.deposed.is_none()));
        let logs = h.engine.state_show(&ws(), &address("bucket.logs")).await.expect("logs");
        let data = h.engine.state_show(&ws(), &address("volume.data")).await.expect("data");
        assert_eq!(data.attributes["bucket_id"], logs.attributes["id"]);
        assert_eq!(h.cloud.objects_of("bucket").len(), 1);
        assert_eq!(h.cloud.objects_of("volume").len(), 1);
    }

    #[tokio::test]
    async fn test_precondition_failure_skips_subtree() {
        let h = harness();
        let mut declarations = stack("logs", "eu");
        declarations.resources[0].preconditions.push(Condition {
            check: Predicate::Equals(Expr::string("eu"), Expr::string("us")),
            message: String::from("region must be us"),
        });

        let report = h.engine.apply(&ws(), &declarations, None).await.expect("apply");
        assert_eq!(report.outcome(), ApplyOutcome::Partial);
        assert_eq!(report.failed(), 2);

        let logs = report
            .nodes
            .iter()
            .find(|n| n.address == address("bucket.logs"))
            .expect("logs node");
        assert_eq!(logs.status, NodeStatus::Failed);
        assert!(logs.error.as_deref().is_some_and(|e| e.contains("region must be us")));
        assert!(report.nodes.iter().all(|n| n.status == NodeStatus::Failed));

        assert!(h.cloud.mutations().is_empty());
        assert!(h.engine.state_list(&ws(), None).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn test_postcondition_failure_keeps_object_and_skips_subtree() {
        let h = harness();
        let mut declarations = stack("logs", "eu");
        declarations.resources[0].postconditions.push(Condition {
            check: Predicate::Equals(
                Expr::Ref(Reference::SelfAttribute(String::from("name"))),
                Expr::string("archive"),
            ),
            message: String::from("bucket must be the archive"),
        });

        let report = h.engine.apply(&ws(), &declarations, None).await.expect("apply");
        assert_eq!(report.outcome(), ApplyOutcome::Partial);
        assert!(
            report
                .failures()
                .any(|n| n.error.as_deref().is_some_and(|e| e.contains("bucket must be the archive")))
        );
        let web = report
            .nodes
            .iter()
            .find(|n| n.address == address("instance.web"))
            .expect("web node");
        assert_eq!(web.status, NodeStatus::Failed);

        let recorded = h.engine.state_list(&ws(), None).await.expect("list");
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].address(), address("bucket.logs"));
        assert_eq!(h.cloud.objects_of("bucket").len(), 1);
        assert!(h.cloud.objects_of("instance").is_empty());
    }

    #[tokio::test]
    async fn test_cancel_lets_running_node_commit() {
        let h = harness_with(InMemoryCloud::new().with_latency(Duration::from_millis(100)));
        let engine = h.engine.with_parallelism(1);
        let declarations = DeclarationSet {
            resources: (0..3).map(|i| bucket(&format!("b{i}"), &format!("bucket-{i}"))).collect(),
            ..DeclarationSet::default()
        };
        let cancel = CancelHandle::new();
        let workspace = ws();

        let (report, ()) = tokio::join!(
            engine.apply_with_cancel(&workspace, &declarations, None, &cancel),
            async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                cancel.cancel();
            }
        );
        let report = report.expect("apply");

        assert!(report.cancelled);
        assert_eq!(report.outcome(), ApplyOutcome::Partial);
        assert_eq!(report.committed(), 1);
        assert_eq!(report.cancelled_nodes(), 2);
        assert_eq!(engine.state_list(&ws(), None).await.expect("list").len(), 1);
        assert!(engine.store().lock_info(&ws()).await.expect("info").is_none());
        assert!(!engine.cancel_handle().is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_engine_recovers_for_next_apply() {
        let h = harness();
        let declarations = stack("logs", "eu");

        h.engine.cancel_handle().cancel();
        let report = h.engine.apply(&ws(), &declarations, None).await.expect("apply");
        assert_eq!(report.outcome(), ApplyOutcome::Partial);
        assert_eq!(report.committed(), 0);
        assert!(h.cloud.mutations().is_empty());

        let report = h.engine.apply(&ws(), &declarations, None).await.expect("apply");
        assert_eq!(report.outcome(), ApplyOutcome::Complete);
        assert_eq!(report.committed(), 2);
    }

    /// Commits a record into a workspace just before the next lock is taken.
    struct CommitBeforeLock {
        inner: InMemoryBackend,
        pending: std::sync::Mutex<Option<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl Backend for CommitBeforeLock {
        async fn get(&self, key: &str) -> Result<Option<StoredObject>> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, bytes: Vec<u8>, condition: PutCondition) -> Result<String> {
            self.inner.put(key, bytes, condition).await
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>> {
            self.inner.list(prefix).await
        }

        async fn lock_create(&self, key: &str, lock: &LockInfo) -> Result<LockAttempt> {
            let pending = self.pending.lock().expect("pending").take();
            if let Some((state_key, bytes)) = pending {
                self.inner.put(&state_key, bytes, PutCondition::Unconditional).await?;
            }
            self.inner.lock_create(key, lock).await
        }

        async fn lock_read(&self, key: &str) -> Result<Option<LockInfo>> {
            self.inner.lock_read(key).await
        }

        async fn lock_delete(&self, key: &str, lock_id: &str) -> Result<bool> {
            self.inner.lock_delete(key, lock_id).await
        }

        fn backend_type(&self) -> &'static str {
            "racing"
        }
    }

    #[tokio::test]
    async fn test_workspace_delete_checks_emptiness_under_lock() {
        let backend = Arc::new(CommitBeforeLock {
            inner: InMemoryBackend::new(),
            pending: std::sync::Mutex::new(None),
        });
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = Engine::new(StateStore::new(backend.clone()), ProviderRegistry::new())
            .with_holder("test")
            .with_selection_file(dir.path().join(SELECTION_FILE));

        let staging = engine.workspace_new("staging").await.expect("new");
        let mut committed = StateSnapshot::new();
        committed.upsert(ResourceInstanceState::new(
            &address("bucket.logs"),
            1,
            crate::declaration::Attributes::new(),
        ));
        *backend.pending.lock().expect("pending") =
            Some((StateStore::state_key(&staging), committed.to_bytes().expect("encode")));

        let err = engine.workspace_delete("staging").await.expect_err("not empty");
        assert!(matches!(err, CoreError::State(StateError::WorkspaceNotEmpty { .. })));
        assert_eq!(engine.state_list(&staging, None).await.expect("list").len(), 1);
        assert!(engine.store().lock_info(&staging).await.expect("info").is_none());
    }
}
