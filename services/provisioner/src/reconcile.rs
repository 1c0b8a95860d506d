//! Refresh recorded state against the cloud and diff it into a [`Plan`].

use std::collections::{BTreeMap, BTreeSet};

use futures::stream::{self, StreamExt};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::declaration::{Address, Attributes, Declaration, ResourceDecl, Variables};
use crate::engine::EngineError;
use crate::error::ConfigError;
use crate::eval::{EvalScope, PlanValue};
use crate::graph::{EdgeReason, RealizedGraph, ResourceGraph};
use crate::plan::{Action, DriftKind, DriftWarning, Plan, PlannedChange};
use crate::provider::{ApiError, CloudApi};
use crate::schema::{self, KindSchema};
use crate::state::{ResourceStatus, StateDocument};

/// Recorded state with remote observations folded in.
#[derive(Debug, Clone)]
pub struct Refreshed {
    /// Remote attributes replace recorded ones. Records whose resource is
    /// gone are removed.
    pub state: StateDocument,
    pub drift: Vec<DriftWarning>,
}

/// Read every recorded resource back from the cloud.
///
/// Local managed kinds are trusted as recorded. Data sources are always
/// re-read. Drift is only reported for addresses in `declared`.
pub async fn refresh(
    api: &dyn CloudApi,
    state: &StateDocument,
    declared: &ResourceGraph,
    concurrency: usize,
) -> Result<Refreshed, EngineError> {
    let mut refreshed = state.clone();
    let mut drift = Vec::new();
    let mut reads = Vec::new();

    for (address, record) in &state.resources {
        let Some(schema) = schema::lookup(&record.kind) else {
            warn!(address = %address, kind = %record.kind, "Recorded resource has an unknown kind, not refreshing");
            continue;
        };
        if schema.local && !schema.data_source {
            continue;
        }
        let id = match record.id() {
            Some(id) => id.to_string(),
            None if schema.data_source => address.to_string(),
            None => {
                // Never got as far as an id; treat as absent.
                refreshed.resources.remove(address);
                if declared.contains(address) {
                    drift.push(missing_or_interrupted(address, record.status));
                }
                continue;
            }
        };
        reads.push((address.clone(), schema, id));
    }

    debug!(reads = reads.len(), concurrency, "Refreshing recorded resources");
    let mut results: Vec<(Address, Result<Option<Attributes>, ApiError>)> = stream::iter(reads)
        .map(|(address, schema, id)| async move {
            let result = api.read(schema, &id).await;
            (address, result)
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;
    results.sort_by(|a, b| a.0.cmp(&b.0));

    for (address, result) in results {
        let remote = result.map_err(|source| EngineError::Refresh {
            address: address.clone(),
            source,
        })?;
        let Some(record) = state.resource(&address) else {
            continue;
        };
        let is_declared = declared.contains(&address);
        let data_source = schema::lookup(&record.kind).is_some_and(|s| s.data_source);

        match remote {
            None => {
                refreshed.resources.remove(&address);
                if is_declared {
                    drift.push(missing_or_interrupted(&address, record.status));
                }
            }
            Some(attributes) => {
                if is_declared && !data_source {
                    if record.status == ResourceStatus::InProgress {
                        drift.push(DriftWarning {
                            address: address.clone(),
                            kind: DriftKind::Interrupted,
                        });
                    } else {
                        let changed = changed_keys(&record.attributes, &attributes);
                        if !changed.is_empty() {
                            drift.push(DriftWarning {
                                address: address.clone(),
                                kind: DriftKind::Modified {
                                    attributes: changed,
                                },
                            });
                        }
                    }
                }
                if let Some(entry) = refreshed.resources.get_mut(&address) {
                    entry.attributes = attributes;
                }
            }
        }
    }

    for warning in &drift {
        warn!(address = %warning.address, "Drift: {warning}");
    }
    Ok(Refreshed {
        state: refreshed,
        drift,
    })
}

fn missing_or_interrupted(address: &Address, status: ResourceStatus) -> DriftWarning {
    let kind = match status {
        ResourceStatus::InProgress => DriftKind::Interrupted,
        ResourceStatus::Applied => DriftKind::Missing,
    };
    DriftWarning {
        address: address.clone(),
        kind,
    }
}

fn changed_keys(recorded: &Attributes, remote: &Attributes) -> Vec<String> {
    recorded
        .keys()
        .chain(remote.keys())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .filter(|key| recorded.get(*key) != remote.get(*key))
        .cloned()
        .collect()
}

/// Diff the realized declaration against refreshed state.
pub fn plan(
    declaration: &Declaration,
    realized: &RealizedGraph,
    variables: &Variables,
    recorded: &StateDocument,
    refreshed: &Refreshed,
) -> Result<Plan, ConfigError> {
    let attributes = refreshed.state.attribute_map();
    let conflicted: BTreeSet<&Address> = refreshed
        .drift
        .iter()
        .filter(|d| d.is_conflict())
        .map(|d| &d.address)
        .collect();
    let mut pending = BTreeSet::new();
    let mut changes = Vec::with_capacity(realized.graph.len());

    for address in realized.graph.topo_order()? {
        let Some(resource) = declaration.resource(&address) else {
            continue;
        };
        let scope = EvalScope::new(variables)
            .with_attributes(&attributes)
            .with_pending(&pending)
            .with_pruned(&realized.pruned);
        let planned = scope.plan_fields(resource)?;

        let change = match refreshed.state.resource(&address) {
            None if resource.schema.data_source => PlannedChange::new(address.clone(), Action::Read),
            None => PlannedChange::new(address.clone(), Action::Create),
            Some(_) if resource.schema.data_source => {
                PlannedChange::new(address.clone(), Action::NoOp)
            }
            Some(record) => {
                let (changed, replace) = diff_inputs(resource, &planned, &record.inputs);
                let action = if !replace.is_empty() {
                    Action::Replace
                } else if !changed.is_empty() || conflicted.contains(&address) {
                    Action::Update
                } else {
                    Action::NoOp
                };
                PlannedChange {
                    address: address.clone(),
                    action,
                    changed_fields: changed,
                    replace_fields: replace,
                    id: record.id().map(str::to_string),
                }
            }
        };
        if matches!(change.action, Action::Create | Action::Replace | Action::Read) {
            pending.insert(address.clone());
        }
        changes.push(change);
    }

    let orphans = recorded_graph(recorded, |address| !realized.graph.contains(address));
    let deletes = orphans
        .reversed()
        .topo_order()?
        .into_iter()
        .map(|address| {
            let id = refreshed
                .state
                .resource(&address)
                .and_then(|r| r.id())
                .map(str::to_string);
            PlannedChange {
                id,
                ..PlannedChange::new(address, Action::Delete)
            }
        })
        .collect();

    let plan = Plan {
        changes,
        deletes,
        drift: refreshed.drift.clone(),
    };
    info!(
        changes = plan.changes.iter().filter(|c| c.action != Action::NoOp).count(),
        deletes = plan.deletes.len(),
        drift = plan.drift.len(),
        "Planned"
    );
    Ok(plan)
}

/// Changed fields, and the force-new subset of them.
fn diff_inputs(
    resource: &ResourceDecl,
    planned: &BTreeMap<String, PlanValue>,
    recorded: &Attributes,
) -> (Vec<String>, Vec<String>) {
    let keys: BTreeSet<&String> = planned.keys().chain(recorded.keys()).collect();
    let mut changed = Vec::new();
    let mut replace = Vec::new();
    for key in keys {
        let was = recorded.get(key).unwrap_or(&Value::Null);
        let differs = match planned.get(key) {
            Some(PlanValue::Known(now)) => now != was,
            Some(_) => true,
            None => !was.is_null(),
        };
        if !differs {
            continue;
        }
        changed.push(key.clone());
        if resource.schema.field(key).is_some_and(|f| f.force_new) {
            replace.push(key.clone());
        }
    }
    (changed, replace)
}

/// Graph over recorded resources using the dependency lists stored with
/// each record.
pub fn recorded_graph(state: &StateDocument, include: impl Fn(&Address) -> bool) -> ResourceGraph {
    let mut graph = ResourceGraph::new();
    for (address, record) in &state.resources {
        if !include(address) {
            continue;
        }
        graph.add_node(address.clone());
        for producer in &record.depends_on {
            if producer != address && state.resources.contains_key(producer) && include(producer) {
                graph.add_edge(producer, address, EdgeReason::Ordering, format!("{address}.depends_on"));
            }
        }
    }
    graph
}

/// Schema of a recorded resource, if its kind is still known.
pub fn recorded_schema(state: &StateDocument, address: &Address) -> Option<&'static KindSchema> {
    state
        .resource(address)
        .and_then(|record| schema::lookup(&record.kind))
        .or_else(|| schema::lookup(address.kind()))
}
