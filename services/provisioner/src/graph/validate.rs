//! Conditional pruning and cycle detection.

use std::collections::BTreeSet;

use serde_json::Value;
use tracing::{debug, info};

use super::{EdgeReason, ResourceGraph};
use crate::declaration::{field_of_path, Address, Declaration, Variables};
use crate::error::{ConfigError, EvalError};
use crate::eval::{EvalScope, PlanValue};

/// The graph over resources whose condition holds.
#[derive(Debug, Clone, Default)]
pub struct RealizedGraph {
    pub graph: ResourceGraph,
    /// Declared resources left out because their condition is false.
    pub pruned: BTreeSet<Address>,
}

/// Evaluate conditions, prune disabled resources and reject cycles.
pub fn realize(
    declaration: &Declaration,
    mut graph: ResourceGraph,
    variables: &Variables,
) -> Result<RealizedGraph, ConfigError> {
    let scope = EvalScope::new(variables);

    let mut pruned = BTreeSet::new();
    for resource in declaration.resources.values() {
        let Some(condition) = &resource.condition else {
            continue;
        };
        let path = resource.condition_path();
        match scope.evaluate(condition) {
            Ok(PlanValue::Known(Value::Bool(true))) => {}
            Ok(PlanValue::Known(Value::Bool(false))) => {
                pruned.insert(resource.address.clone());
            }
            Ok(_) => return Err(ConfigError::InvalidCondition { path }),
            Err(err) => return Err(ConfigError::eval(path, err)),
        }
    }

    // Re-check every realized consumer of a pruned producer with that
    // producer's attributes absent.
    let absent_scope = EvalScope::new(variables).with_pruned(&pruned);
    for (producer, consumer, info) in graph.edges() {
        if !pruned.contains(producer) || pruned.contains(consumer) || !info.has(EdgeReason::Data) {
            continue;
        }
        let Some(resource) = declaration.resource(consumer) else {
            continue;
        };
        for path in &info.paths {
            let Some(field) = field_of_path(path) else {
                if path.ends_with(".condition") {
                    return Err(ConfigError::RequiredDependencyDisabled {
                        path: path.clone(),
                        producer: producer.clone(),
                    });
                }
                continue;
            };
            let Some(expr) = resource.fields.get(field) else {
                continue;
            };
            let nullable = resource
                .schema
                .field(field)
                .map(|spec| spec.nullable)
                .unwrap_or(false);
            let consumed = match absent_scope.evaluate(expr) {
                Ok(PlanValue::Absent(_)) => !nullable,
                Err(EvalError::AbsentValue { .. }) => true,
                _ => false,
            };
            if consumed {
                return Err(ConfigError::RequiredDependencyDisabled {
                    path: path.clone(),
                    producer: producer.clone(),
                });
            }
            debug!(producer = %producer, consumer = %consumer, path, "Consumer tolerates disabled producer");
        }
    }

    for address in &pruned {
        info!(address = %address, "Resource disabled by its condition");
        graph.remove_node(address);
    }

    if let Some(cycle) = graph.find_cycle() {
        return Err(ConfigError::Cycle { cycle });
    }

    Ok(RealizedGraph { graph, pruned })
}
