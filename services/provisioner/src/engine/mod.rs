//! Plan, apply and destroy runs.
//!
//! A run takes the state lock, loads the recorded state, refreshes it against
//! the cloud, plans, and then hands the realized graph to the [`Scheduler`].
//! Every state change goes through one [`StateWriter`] task.

mod executor;
#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::declaration::{Address, Attributes, Declaration, VariableSources, Variables};
use crate::error::ConfigError;
use crate::eval::EvalScope;
use crate::graph::{RealizedGraph, ResourceGraph};
use crate::plan::{Action, DriftWarning, Plan};
use crate::provider::{ApiError, CloudApi};
use crate::reconcile::{self, recorded_graph, Refreshed};
use crate::report::{Outcome, ResourceOutcome, RunReport};
use crate::scheduler::{NodeRecord, NodeResult, Schedule, Scheduler};
use crate::schema;
use crate::state::{
    OutputState, StateDocument, StateError, StateLock, StateStore, StateUpdate, StateWriter,
};

use executor::{ApplyExecutor, TeardownExecutor};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("refreshing {address} failed: {source}")]
    Refresh {
        address: Address,
        #[source]
        source: ApiError,
    },

    #[error("{} drift conflict(s) must be confirmed before they are overwritten", .conflicts.len())]
    DriftUnconfirmed { conflicts: Vec<DriftWarning> },
}

/// A validated declaration with resolved variables and its realized graph.
///
/// Building one performs every configuration check, so a `Prepared` never
/// causes a configuration error once remote calls have started.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub declaration: Arc<Declaration>,
    pub variables: Arc<Variables>,
    pub realized: Arc<RealizedGraph>,
}

impl Prepared {
    pub fn new(declaration: Declaration, sources: &VariableSources) -> Result<Self, ConfigError> {
        let variables = declaration.resolve_variables(sources)?;
        let realized = ResourceGraph::realize(&declaration, &variables)?;

        // Evaluate what can be evaluated without attributes.
        let scope = EvalScope::new(&variables).with_pruned(&realized.pruned);
        for address in realized.graph.nodes() {
            if let Some(resource) = declaration.resource(address) {
                scope.plan_fields(resource)?;
            }
        }

        info!(
            resources = realized.graph.len(),
            pruned = realized.pruned.len(),
            edges = realized.graph.edge_count(),
            "Declaration prepared"
        );
        Ok(Self {
            declaration: Arc::new(declaration),
            variables: Arc::new(variables),
            realized: Arc::new(realized),
        })
    }

    pub fn load(path: impl AsRef<Path>, sources: &VariableSources) -> Result<Self, ConfigError> {
        Self::new(Declaration::load(path)?, sources)
    }

    /// Realized resources in apply order.
    pub fn order(&self) -> Result<Vec<Address>, ConfigError> {
        self.realized.graph.topo_order()
    }
}

pub struct Engine {
    api: Arc<dyn CloudApi>,
    store: Arc<dyn StateStore>,
    lock: Arc<dyn StateLock>,
    config: EngineConfig,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new(
        api: Arc<dyn CloudApi>,
        store: Arc<dyn StateStore>,
        lock: Arc<dyn StateLock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            api,
            store,
            lock,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Cancelling this token stops dispatching new nodes.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Refresh and diff without mutating anything.
    pub async fn plan(&self, prepared: &Prepared) -> Result<Plan, EngineError> {
        let _guard = self.lock.acquire("plan")?;
        let recorded = self.store.load()?;
        let (_, plan) = self.reconcile(prepared, &recorded).await?;
        Ok(plan)
    }

    async fn reconcile(
        &self,
        prepared: &Prepared,
        recorded: &StateDocument,
    ) -> Result<(Refreshed, Plan), EngineError> {
        let refreshed = reconcile::refresh(
            self.api.as_ref(),
            recorded,
            &prepared.realized.graph,
            self.config.refresh_concurrency,
        )
        .await?;
        let plan = reconcile::plan(
            &prepared.declaration,
            &prepared.realized,
            &prepared.variables,
            recorded,
            &refreshed,
        )?;
        Ok((refreshed, plan))
    }

    /// Converge the cloud on the declaration.
    pub async fn apply(&self, prepared: &Prepared) -> Result<RunReport, EngineError> {
        let mut report = RunReport::new("apply");
        let guard = self.lock.acquire("apply")?;
        info!(lock_id = %guard.info().id, run_id = %report.run_id, "Starting apply");

        let recorded = self.store.load()?;
        let (refreshed, plan) = self.reconcile(prepared, &recorded).await?;
        report.drift = plan.drift.clone();
        let conflicts: Vec<DriftWarning> = plan.conflicts().cloned().collect();
        if !conflicts.is_empty() {
            if !self.config.accept_drift {
                return Err(EngineError::DriftUnconfirmed { conflicts });
            }
            warn!(conflicts = conflicts.len(), "Overwriting drifted resources");
        }

        let recorded = Arc::new(recorded);
        let writer = StateWriter::spawn(self.store.clone(), recorded.as_ref().clone());
        let scheduler = Scheduler::from_config(&self.config, self.cancel.clone());

        let view = observed_records(&recorded, &refreshed);
        let mut converged = true;

        let early = orphans_blocking_replacements(&plan, &recorded);
        if !early.is_empty() {
            info!(orphans = early.len(), "Destroying removed dependents of replaced resources first");
            let graph = recorded_graph(&recorded, |a| early.contains(a));
            let teardown = self.teardown(&scheduler, &graph, &view, &writer).await;
            let order: Vec<Address> = plan
                .deletes
                .iter()
                .map(|c| c.address.clone())
                .filter(|a| early.contains(a))
                .collect();
            record_schedule(&mut report, &order, teardown.nodes.iter());
            report.cancelled |= teardown.cancelled;
            converged = teardown.all_succeeded();
        }

        let mut attributes = BTreeMap::new();
        if converged {
            let executor = Arc::new(ApplyExecutor {
                api: self.api.clone(),
                declaration: prepared.declaration.clone(),
                variables: prepared.variables.clone(),
                realized: prepared.realized.clone(),
                changes: plan
                    .changes
                    .iter()
                    .map(|c| (c.address.clone(), c.clone()))
                    .collect(),
                recorded: recorded.clone(),
                state: writer.handle(),
                attributes: Mutex::new(refreshed.state.attribute_map()),
            });
            let applied = scheduler.run(&prepared.realized.graph, executor.clone()).await;
            attributes = executor
                .attributes
                .lock()
                .map(|a| a.clone())
                .unwrap_or_default();
            drop(executor);

            let order: Vec<Address> = plan.changes.iter().map(|c| c.address.clone()).collect();
            record_schedule(&mut report, &order, applied.nodes.iter());
            report.cancelled |= applied.cancelled;
            converged = applied.all_succeeded();
        } else {
            warn!(changes = plan.changes.len(), "Skipping changes after failed teardown");
            for change in &plan.changes {
                report.record(skipped(change.address.clone()));
            }
        }

        let deletes: Vec<Address> = plan
            .deletes
            .iter()
            .map(|c| c.address.clone())
            .filter(|a| !early.contains(a))
            .collect();
        if !deletes.is_empty() {
            if converged {
                let orphans = recorded_graph(&recorded, |a| {
                    !prepared.realized.graph.contains(a) && !early.contains(a)
                });
                let teardown = self.teardown(&scheduler, &orphans, &view, &writer).await;
                converged = teardown.all_succeeded();
                report.cancelled |= teardown.cancelled;
                record_schedule(&mut report, &deletes, teardown.nodes.iter());
            } else {
                warn!(orphans = deletes.len(), "Skipping orphan teardown after failures");
                for address in deletes {
                    report.record(skipped(address));
                }
            }
        }

        if converged {
            match evaluate_outputs(prepared, &attributes) {
                Ok(outputs) if outputs != recorded.outputs => {
                    writer.handle().send(StateUpdate::Outputs(outputs)).await?;
                }
                Ok(_) => {}
                Err(e) => report.errors.push(e.to_string()),
            }
        }

        let doc = writer.finish().await?;
        report.serial = doc.serial;
        report.outputs = doc.outputs;
        report.finished_at = Utc::now();
        info!(
            run_id = %report.run_id,
            succeeded = report.succeeded(),
            serial = report.serial,
            "Apply finished"
        );
        Ok(report)
    }

    /// Destroy every recorded resource in reverse dependency order.
    pub async fn destroy(&self) -> Result<RunReport, EngineError> {
        let mut report = RunReport::new("destroy");
        let guard = self.lock.acquire("destroy")?;
        info!(lock_id = %guard.info().id, run_id = %report.run_id, "Starting destroy");

        let recorded = self.store.load()?;
        let graph = recorded_graph(&recorded, |_| true);
        let order = graph.reversed().topo_order()?;
        let writer = StateWriter::spawn(self.store.clone(), recorded.clone());
        let scheduler = Scheduler::from_config(&self.config, self.cancel.clone());

        let schedule = self.teardown(&scheduler, &graph, &recorded, &writer).await;
        record_schedule(&mut report, &order, schedule.nodes.iter());
        report.cancelled = schedule.cancelled;
        if schedule.all_succeeded() && !recorded.outputs.is_empty() {
            writer
                .handle()
                .send(StateUpdate::Outputs(BTreeMap::new()))
                .await?;
        }

        let doc = writer.finish().await?;
        report.serial = doc.serial;
        report.outputs = doc.outputs;
        report.finished_at = Utc::now();
        info!(
            run_id = %report.run_id,
            succeeded = report.succeeded(),
            remaining = doc.resources.len(),
            "Destroy finished"
        );
        Ok(report)
    }

    async fn teardown(
        &self,
        scheduler: &Scheduler,
        graph: &ResourceGraph,
        recorded: &StateDocument,
        writer: &StateWriter,
    ) -> Schedule<Outcome> {
        let executor = Arc::new(TeardownExecutor {
            api: self.api.clone(),
            recorded: Arc::new(recorded.clone()),
            state: writer.handle(),
        });
        scheduler.teardown(graph, executor).await
    }

    /// Outputs recorded by the last successful apply.
    pub fn outputs(&self) -> Result<BTreeMap<String, OutputState>, EngineError> {
        Ok(self.store.load()?.outputs)
    }
}

/// Orphans that depend, directly or through other orphans, on a resource
/// about to be replaced. They have to be gone before the replacement starts.
fn orphans_blocking_replacements(plan: &Plan, recorded: &StateDocument) -> BTreeSet<Address> {
    let mut blocking: BTreeSet<&Address> = plan
        .changes
        .iter()
        .filter(|c| c.action == Action::Replace)
        .map(|c| &c.address)
        .collect();
    let mut early = BTreeSet::new();
    loop {
        let found: Vec<&Address> = plan
            .deletes
            .iter()
            .map(|c| &c.address)
            .filter(|a| !early.contains(*a))
            .filter(|a| {
                recorded
                    .resource(a)
                    .is_some_and(|r| r.depends_on.iter().any(|p| blocking.contains(p)))
            })
            .collect();
        if found.is_empty() {
            return early;
        }
        for address in found {
            blocking.insert(address);
            early.insert(address.clone());
        }
    }
}

/// Recorded state with the ids refresh observed. Records whose resource is
/// already gone lose their attributes, so teardown only forgets them.
fn observed_records(recorded: &StateDocument, refreshed: &Refreshed) -> StateDocument {
    let mut view = recorded.clone();
    for (address, record) in view.resources.iter_mut() {
        match refreshed.state.resource(address) {
            Some(observed) => record.attributes = observed.attributes.clone(),
            None => record.attributes.clear(),
        }
    }
    view
}

fn skipped(address: Address) -> ResourceOutcome {
    ResourceOutcome {
        address,
        outcome: Outcome::Skipped,
        error: None,
        dispatched_at: None,
        completed_at: None,
    }
}

fn record_schedule<'a>(
    report: &mut RunReport,
    order: &[Address],
    nodes: impl Iterator<Item = (&'a Address, &'a NodeRecord<Outcome>)>,
) {
    let mut nodes: BTreeMap<&Address, _> = nodes.collect();
    for address in order {
        let Some(node) = nodes.remove(address) else {
            continue;
        };
        let (outcome, error) = match &node.result {
            NodeResult::Succeeded(outcome) => (*outcome, None),
            NodeResult::Failed(message) => (Outcome::Failed, Some(message.clone())),
            NodeResult::Skipped => (Outcome::Skipped, None),
        };
        report.record(ResourceOutcome {
            address: address.clone(),
            outcome,
            error,
            dispatched_at: node.dispatched_at,
            completed_at: node.completed_at,
        });
    }
}

/// Evaluate declared outputs against final attributes. An output is
/// sensitive when declared so or when it reads a sensitive attribute.
fn evaluate_outputs(
    prepared: &Prepared,
    attributes: &BTreeMap<Address, Attributes>,
) -> Result<BTreeMap<String, OutputState>, ConfigError> {
    let scope = EvalScope::new(&prepared.variables)
        .with_attributes(attributes)
        .with_pruned(&prepared.realized.pruned);
    let mut outputs = BTreeMap::new();
    for (name, output) in &prepared.declaration.outputs {
        let value = scope
            .evaluate_known(&output.value)
            .map_err(|e| ConfigError::eval(format!("outputs.{name}"), e))?;
        let sensitive = output.sensitive
            || output.value.references().iter().any(|r| {
                schema::lookup(r.target.kind()).is_some_and(|s| s.is_sensitive_output(&r.attribute))
            });
        outputs.insert(name.clone(), OutputState { value, sensitive });
    }
    Ok(outputs)
}
