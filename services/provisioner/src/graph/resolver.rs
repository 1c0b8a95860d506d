//! Data edges from references in the expression IR.

use tracing::trace;

use super::{EdgeReason, ResourceGraph};
use crate::declaration::{Address, Declaration, Reference};
use crate::error::ConfigError;

/// Emit one `data` edge per reference occurrence in every field and
/// condition, taken or not. Output expressions are checked for dangling
/// references but add no edges.
pub fn resolve_references(declaration: &Declaration) -> Result<ResourceGraph, ConfigError> {
    let mut graph = ResourceGraph::new();
    for address in declaration.addresses() {
        graph.add_node(address.clone());
    }

    for resource in declaration.resources.values() {
        let consumer = &resource.address;
        let mut failure = None;
        let mut visit = |reference: &Reference, path: &str| {
            if failure.is_some() {
                return;
            }
            if let Err(err) = check_target(declaration, consumer, reference, path) {
                failure = Some(err);
                return;
            }
            trace!(producer = %reference.target, consumer = %consumer, path, "Data edge");
            graph.add_edge(&reference.target, consumer, EdgeReason::Data, path);
        };

        if let Some(condition) = &resource.condition {
            condition.walk_references(&resource.condition_path(), &mut visit);
        }
        for (field, expr) in &resource.fields {
            expr.walk_references(&resource.field_path(field), &mut visit);
        }
        if let Some(err) = failure {
            return Err(err);
        }
    }

    for (name, output) in &declaration.outputs {
        let mut failure = None;
        output
            .value
            .walk_references(&format!("outputs.{name}"), &mut |reference: &Reference,
                                                               path: &str| {
                if failure.is_none() && declaration.resource(&reference.target).is_none() {
                    failure = Some(ConfigError::DanglingReference {
                        path: path.to_string(),
                        target: reference.target.clone(),
                    });
                }
            });
        if let Some(err) = failure {
            return Err(err);
        }
    }

    Ok(graph)
}

fn check_target(
    declaration: &Declaration,
    consumer: &Address,
    reference: &Reference,
    path: &str,
) -> Result<(), ConfigError> {
    if &reference.target == consumer {
        return Err(ConfigError::SelfReference {
            path: path.to_string(),
        });
    }
    if declaration.resource(&reference.target).is_none() {
        return Err(ConfigError::DanglingReference {
            path: path.to_string(),
            target: reference.target.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::addr;
    use serde_json::json;

    fn declaration(resources: serde_json::Value) -> Declaration {
        Declaration::from_json_str(
            &json!({
                "variables": { "on": { "type": "bool", "default": true } },
                "resources": resources
            })
            .to_string(),
        )
        .unwrap()
    }

    fn rg(name: &str) -> serde_json::Value {
        json!({ "kind": "resource_group", "name": name,
                "fields": { "name": name, "location": "westeurope" } })
    }

    #[test]
    fn test_edge_for_every_reference_occurrence() {
        let declaration = declaration(json!([
            rg("a"),
            rg("b"),
            rg("c"),
            {
                "kind": "virtual_network", "name": "net",
                "fields": {
                    "name": "${var.on ? resource_group.a.name : resource_group.b.name}",
                    "resource_group": "${resource_group.c.name ?? \"fallback\"}",
                    "location": "${resource_group.a.location}",
                    "address_space": ["${resource_group.c.id}"]
                }
            }
        ]));
        let graph = resolve_references(&declaration).unwrap();
        let net = addr("virtual_network.net");

        assert_eq!(
            graph.producers(&net),
            [addr("resource_group.a"), addr("resource_group.b"), addr("resource_group.c")]
                .into_iter()
                .collect()
        );
        let from_a = graph.edge(&addr("resource_group.a"), &net).unwrap();
        assert!(from_a.paths.contains("virtual_network.net.fields.name"));
        assert!(from_a.paths.contains("virtual_network.net.fields.location"));
        let from_c = graph.edge(&addr("resource_group.c"), &net).unwrap();
        assert!(from_c.paths.contains("virtual_network.net.fields.address_space[0]"));
        assert!(graph.edges().all(|(_, _, info)| info.has(EdgeReason::Data)));
    }

    #[test]
    fn test_dangling_reference_reports_path() {
        let declaration = declaration(json!([{
            "kind": "virtual_network", "name": "net",
            "fields": {
                "name": "net", "resource_group": "${resource_group.gone.name}",
                "location": "westeurope", "address_space": ["10.0.0.0/16"]
            }
        }]));
        let err = resolve_references(&declaration).unwrap_err();
        assert_eq!(
            err.to_string(),
            "virtual_network.net.fields.resource_group: reference to undeclared resource `resource_group.gone`"
        );
    }

    #[test]
    fn test_self_reference_rejected() {
        let declaration = declaration(json!([{
            "kind": "resource_group", "name": "a",
            "fields": { "name": "x", "location": "${resource_group.a.location}" }
        }]));
        assert!(matches!(
            resolve_references(&declaration).unwrap_err(),
            ConfigError::SelfReference { .. }
        ));
    }

    #[test]
    fn test_dangling_output_reference() {
        let declaration = Declaration::from_json_str(
            &json!({ "outputs": { "id": { "value": "${resource_group.gone.id}" } } }).to_string(),
        )
        .unwrap();
        assert!(matches!(
            resolve_references(&declaration).unwrap_err(),
            ConfigError::DanglingReference { ref path, .. } if path == "outputs.id"
        ));
    }
}
