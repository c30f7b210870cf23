//! Plan execution.
//!
//! Walks the execution graph with bounded concurrency. A node starts once
//! every node it depends on has committed; each provider result is written
//! to state before the node counts as committed, so a crash never loses
//! work that already happened remotely. A failure stops the failed node's
//! dependents while independent branches keep going.

mod cancel;
mod graph;
mod report;

pub use cancel::CancelHandle;
pub use report::{ApplyOutcome, ApplyReport, NodeOperation, NodeReport, NodeStatus};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::declaration::{Attributes, ResourceAddress};
use crate::error::{ApplyError, CoreError, ProviderResult, Result};
use crate::graph::{EvalContext, Graph, GraphNode, Projected, Projections, evaluate_arguments};
use crate::planner::{DiffEngine, Plan, PlanMode, requires_replacement};
use crate::provider::{Provider, ProviderRegistry, RemoteObject, object_id};
use crate::state::{LockInfo, OutputState, ResourceInstanceState, StateSnapshot, StateStore};

use graph::ExecNode;

/// Default number of provider operations in flight.
pub const DEFAULT_PARALLELISM: usize = 10;

/// Applies plans.
#[derive(Debug)]
pub struct Executor<'a> {
    /// Provider registry.
    registry: &'a ProviderRegistry,
    /// State store.
    store: &'a StateStore,
    /// Maximum provider operations in flight.
    parallelism: usize,
    /// Cancellation signal.
    cancel: CancelHandle,
}

/// Provider work for one node.
enum Task {
    Create(Attributes),
    Update { id: String, arguments: Attributes },
    Delete(Option<String>),
}

/// Result of a provider call.
enum Outcome {
    Object(RemoteObject),
    Deleted,
}

/// What `prepare` decided for a node.
enum Prepared {
    Run(Task),
    /// Nothing left to change once values are resolved.
    Unchanged,
}

/// Mutable bookkeeping of one run.
struct Run<'p> {
    plan: &'p Plan,
    nodes: Vec<ExecNode>,
    status: Vec<NodeStatus>,
    errors: Vec<Option<String>>,
    remaining: Vec<usize>,
    ready: BTreeSet<usize>,
    arguments: Vec<Attributes>,
    snapshot: StateSnapshot,
    projections: Projections,
}

impl<'a> Executor<'a> {
    /// Creates an executor.
    #[must_use]
    pub fn new(registry: &'a ProviderRegistry, store: &'a StateStore) -> Self {
        Self {
            registry,
            store,
            parallelism: DEFAULT_PARALLELISM,
            cancel: CancelHandle::new(),
        }
    }

    /// Sets the maximum number of provider operations in flight.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Uses an externally controlled cancellation handle.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    /// Applies `plan`. `snapshot` must be the snapshot the plan was computed
    /// from and `lock` the workspace lock held by the caller.
    ///
    /// # Errors
    ///
    /// Node failures are reported in the returned report. An error is
    /// returned only when state can no longer be written; everything
    /// committed before that point is durable.
    pub async fn apply(
        &self,
        plan: &Plan,
        graph: &Graph,
        snapshot: StateSnapshot,
        lock: &LockInfo,
    ) -> Result<ApplyReport> {
        let nodes = graph::build(plan, &snapshot)?;
        info!(
            "Applying {} change(s) as {} operation(s), parallelism {}",
            plan.actionable().count(),
            nodes.len(),
            self.parallelism
        );

        let mut run = Run::new(plan, graph, nodes, snapshot);
        let mut running: JoinSet<(usize, ProviderResult<Outcome>)> = JoinSet::new();
        let mut fatal: Option<CoreError> = None;

        loop {
            while running.len() < self.parallelism
                && fatal.is_none()
                && !self.cancel.is_cancelled()
            {
                let Some(id) = run.ready.pop_first() else {
                    break;
                };
                match self.prepare(&run, graph, id) {
                    Ok((provider, Prepared::Run(task))) => {
                        match &task {
                            Task::Create(arguments) | Task::Update { arguments, .. } => {
                                run.arguments[id].clone_from(arguments);
                            }
                            Task::Delete(_) => {}
                        }
                        run.status[id] = NodeStatus::Running;
                        debug!("Starting {}", run.nodes[id].label());
                        running.spawn(async move { (id, execute(provider, task).await) });
                    }
                    Ok((_, Prepared::Unchanged)) => {
                        debug!("{} has nothing left to change", run.nodes[id].label());
                        run.complete(id);
                    }
                    Err(e) => run.fail(id, &e.to_string()),
                }
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            let (id, result) = match joined {
                Ok(result) => result,
                Err(e) => {
                    error!("Apply task aborted: {e}");
                    fatal = fatal.or_else(|| Some(CoreError::internal(format!("apply task aborted: {e}"))));
                    continue;
                }
            };

            match result {
                Ok(outcome) => {
                    if let Err(e) = self.commit(&mut run, graph, id, outcome, lock).await {
                        error!("Failed to record {}: {e}", run.nodes[id].label());
                        run.fail(id, &e.to_string());
                        fatal = fatal.or(Some(e));
                    }
                }
                Err(e) => {
                    // A delete of an object that is already gone succeeds.
                    if run.nodes[id].operation == NodeOperation::Delete && e.is_not_found() {
                        warn!("{} was already gone", run.nodes[id].address);
                        if let Err(write_error) =
                            self.commit(&mut run, graph, id, Outcome::Deleted, lock).await
                        {
                            run.fail(id, &write_error.to_string());
                            fatal = fatal.or(Some(write_error));
                        }
                    } else {
                        error!("{} failed: {e}", run.nodes[id].label());
                        run.fail(id, &e.to_string());
                    }
                }
            }
        }

        if let Some(e) = fatal {
            return Err(e);
        }

        let cancelled = self.cancel.is_cancelled();
        for id in 0..run.nodes.len() {
            if matches!(run.status[id], NodeStatus::Pending | NodeStatus::Ready) {
                run.status[id] = NodeStatus::Cancelled;
                run.errors[id] = Some(ApplyError::Cancelled.to_string());
            }
        }

        if !cancelled {
            self.commit_outputs(&mut run, graph, lock).await?;
        }

        let report = run.report(cancelled);
        info!(
            "Apply {}: {} committed, {} failed, {} cancelled",
            report.outcome(),
            report.committed(),
            report.failed(),
            report.cancelled_nodes()
        );
        Ok(report)
    }

    /// Resolves a ready node's arguments and checks its preconditions.
    fn prepare(&self, run: &Run<'_>, graph: &Graph, id: usize) -> Result<(Arc<dyn Provider>, Prepared)> {
        let node = &run.nodes[id];
        let provider = self.registry.resolve(&node.address)?;

        let task = match node.operation {
            NodeOperation::Delete => {
                let record = match &node.deposed {
                    Some(key) => run
                        .snapshot
                        .deposed()
                        .find(|r| r.deposed.as_deref() == Some(key.as_str()) && r.address() == node.address),
                    None => run.snapshot.instance(&node.address),
                };
                Task::Delete(record.and_then(|r| object_id(&r.attributes)))
            }
            NodeOperation::Create | NodeOperation::Update => {
                let declared = declared_node(graph, &node.address)?;
                let ctx = EvalContext::new(&run.projections);

                for condition in &declared.preconditions {
                    match condition.evaluate(&ctx) {
                        Some(true) => {}
                        Some(false) => {
                            return Err(ApplyError::PreconditionFailed {
                                address: node.address.to_string(),
                                message: condition.message.clone(),
                            }
                            .into());
                        }
                        None => {
                            return Err(ApplyError::Unresolved {
                                address: node.address.to_string(),
                                message: format!("precondition '{}' is not known", condition.message),
                            }
                            .into());
                        }
                    }
                }

                let (arguments, unknown) = evaluate_arguments(&declared.arguments, &ctx);
                if !unknown.is_empty() {
                    return Err(ApplyError::Unresolved {
                        address: node.address.to_string(),
                        message: format!(
                            "unknown after dependencies applied: {}",
                            unknown.into_iter().collect::<Vec<_>>().join(", ")
                        ),
                    }
                    .into());
                }

                if node.operation == NodeOperation::Create {
                    Task::Create(arguments)
                } else {
                    let Some(instance) = run.snapshot.instance(&node.address) else {
                        return Err(ApplyError::PlanMismatch {
                            message: format!("{} is no longer recorded", node.address),
                        }
                        .into());
                    };
                    let current = run.plan.changes[node.change]
                        .prior
                        .as_ref()
                        .unwrap_or(&instance.attributes);
                    let schema = provider.schema();
                    let engine = DiffEngine::new(&schema).with_lifecycle(&declared.lifecycle);
                    let changes =
                        engine.arguments(&arguments, &BTreeSet::new(), &instance.arguments, current);
                    if changes.is_empty() {
                        return Ok((provider, Prepared::Unchanged));
                    }
                    if requires_replacement(&changes) {
                        return Err(ApplyError::PlanMismatch {
                            message: format!("{} now requires replacement; plan again", node.address),
                        }
                        .into());
                    }
                    let Some(id) = object_id(&instance.attributes) else {
                        return Err(ApplyError::Unresolved {
                            address: node.address.to_string(),
                            message: String::from("no recorded id"),
                        }
                        .into());
                    };
                    Task::Update {
                        id,
                        arguments: engine.effective_arguments(&arguments, current),
                    }
                }
            }
        };

        Ok((provider, Prepared::Run(task)))
    }

    /// Records a node's result and writes state.
    async fn commit(
        &self,
        run: &mut Run<'_>,
        graph: &Graph,
        id: usize,
        outcome: Outcome,
        lock: &LockInfo,
    ) -> Result<()> {
        let node = run.nodes[id].clone();
        let mut postcondition_failure = None;

        match outcome {
            Outcome::Object(object) => {
                let provider = self.registry.resolve(&node.address)?;
                let schema = provider.schema();
                let declared = declared_node(graph, &node.address)?;

                if let Some(key) = &node.depose_as {
                    run.snapshot.depose(&node.address, key);
                }

                let mut instance =
                    ResourceInstanceState::new(&node.address, schema.version, object.attributes.clone());
                instance.arguments = std::mem::take(&mut run.arguments[id]);
                instance.sensitive_attributes = schema.sensitive_attributes();
                instance.private = object.private;
                instance.dependencies = run.plan.changes[node.change].dependencies.clone();
                run.snapshot.upsert(instance);
                run.projections
                    .insert(node.address.clone(), Projected::known(object.attributes.clone()));

                let ctx = EvalContext::new(&run.projections).with_self(&object.attributes);
                postcondition_failure = declared
                    .postconditions
                    .iter()
                    .find(|c| c.evaluate(&ctx) != Some(true))
                    .map(|c| ApplyError::PostconditionFailed {
                        address: node.address.to_string(),
                        message: c.message.clone(),
                    });
            }
            Outcome::Deleted => {
                match &node.deposed {
                    Some(key) => {
                        run.snapshot.remove_deposed(&node.address, key);
                    }
                    None => {
                        run.snapshot.remove(&node.address);
                    }
                }
                run.projections.remove(&node.address);
            }
        }

        self.write(run, lock).await?;

        match postcondition_failure {
            Some(failure) => {
                error!("{failure}");
                run.fail(id, &failure.to_string());
            }
            None => {
                info!("Committed {}", node.label());
                run.complete(id);
            }
        }
        Ok(())
    }

    /// Records root outputs when they changed.
    async fn commit_outputs(&self, run: &mut Run<'_>, graph: &Graph, lock: &LockInfo) -> Result<()> {
        let outputs: BTreeMap<String, OutputState> = match run.plan.mode {
            PlanMode::Destroy => BTreeMap::new(),
            PlanMode::Normal => {
                let ctx = EvalContext::new(&run.projections);
                graph
                    .outputs()
                    .iter()
                    .filter_map(|output| {
                        let value = output.value.evaluate(&ctx).known()?;
                        Some((
                            output.name.clone(),
                            OutputState {
                                value,
                                sensitive: output.sensitive,
                            },
                        ))
                    })
                    .collect()
            }
        };

        if outputs != run.snapshot.outputs {
            run.snapshot.outputs = outputs;
            self.write(run, lock).await?;
        }
        Ok(())
    }

    async fn write(&self, run: &mut Run<'_>, lock: &LockInfo) -> Result<()> {
        let serial = self
            .store
            .write(
                &run.plan.workspace,
                lock,
                run.snapshot.serial,
                &run.snapshot.lineage,
                &run.snapshot,
            )
            .await?;
        run.snapshot.serial = serial;
        Ok(())
    }
}

/// The declaration behind a create or update.
fn declared_node<'g>(graph: &'g Graph, address: &ResourceAddress) -> Result<&'g GraphNode> {
    graph.get(address).ok_or_else(|| {
        ApplyError::PlanMismatch {
            message: format!("{address} is not declared"),
        }
        .into()
    })
}

async fn execute(provider: Arc<dyn Provider>, task: Task) -> ProviderResult<Outcome> {
    match task {
        Task::Create(arguments) => provider.create(&arguments).await.map(Outcome::Object),
        Task::Update { id, arguments } => provider.update(&id, &arguments).await.map(Outcome::Object),
        Task::Delete(Some(id)) => provider.delete(&id).await.map(|()| Outcome::Deleted),
        Task::Delete(None) => Ok(Outcome::Deleted),
    }
}

impl<'p> Run<'p> {
    fn new(plan: &'p Plan, graph: &Graph, nodes: Vec<ExecNode>, snapshot: StateSnapshot) -> Self {
        let mut projections = Projections::new();
        for node in graph.nodes() {
            let prior = plan.change(&node.address).and_then(|c| c.prior.clone());
            let recorded = snapshot.instance(&node.address).map(|r| r.attributes.clone());
            if let Some(attributes) = prior.or(recorded) {
                projections.insert(node.address.clone(), Projected::known(attributes));
            }
        }

        let count = nodes.len();
        let remaining: Vec<usize> = nodes.iter().map(|n| n.dependencies.len()).collect();
        let ready = (0..count).filter(|&id| remaining[id] == 0).collect::<BTreeSet<_>>();
        let mut status = vec![NodeStatus::Pending; count];
        for &id in &ready {
            status[id] = NodeStatus::Ready;
        }

        Self {
            plan,
            nodes,
            status,
            errors: vec![None; count],
            remaining,
            ready,
            arguments: vec![Attributes::new(); count],
            snapshot,
            projections,
        }
    }

    fn complete(&mut self, id: usize) {
        self.status[id] = NodeStatus::Committed;
        for next in self.nodes[id].dependents.clone() {
            self.remaining[next] -= 1;
            if self.remaining[next] == 0 && self.status[next] == NodeStatus::Pending {
                self.status[next] = NodeStatus::Ready;
                self.ready.insert(next);
            }
        }
    }

    /// Marks a node failed along with everything downstream of it.
    fn fail(&mut self, id: usize, message: &str) {
        self.status[id] = NodeStatus::Failed;
        self.errors[id] = Some(message.to_string());

        let label = self.nodes[id].label();
        let mut stack = self.nodes[id].dependents.clone();
        while let Some(next) = stack.pop() {
            if matches!(self.status[next], NodeStatus::Pending | NodeStatus::Ready) {
                self.ready.remove(&next);
                self.status[next] = NodeStatus::Failed;
                self.errors[next] = Some(format!("dependency {label} failed"));
                stack.extend(self.nodes[next].dependents.iter().copied());
            }
        }
    }

    fn report(self, cancelled: bool) -> ApplyReport {
        let nodes = self
            .nodes
            .iter()
            .zip(self.status)
            .zip(self.errors)
            .map(|((node, status), error)| NodeReport {
                address: node.address.clone(),
                deposed: node.deposed.clone(),
                operation: node.operation,
                status,
                error,
            })
            .collect();

        ApplyReport {
            nodes,
            serial: self.snapshot.serial,
            outputs: self.snapshot.outputs,
            cancelled,
        }
    }
}
