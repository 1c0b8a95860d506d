//! Explicit `depends_on` constraints.

use super::{EdgeReason, ResourceGraph};
use crate::declaration::Declaration;
use crate::error::ConfigError;

/// `depends_on: [B]` on `A` adds `B -> A`. Every constraint is kept, even
/// when a data reference already implies it.
pub fn merge_ordering(graph: &mut ResourceGraph, declaration: &Declaration) -> Result<(), ConfigError> {
    for resource in declaration.resources.values() {
        for constraint in &resource.depends_on {
            if constraint.target == resource.address {
                return Err(ConfigError::SelfReference {
                    path: constraint.path.clone(),
                });
            }
            if declaration.resource(&constraint.target).is_none() {
                return Err(ConfigError::DanglingReference {
                    path: constraint.path.clone(),
                    target: constraint.target.clone(),
                });
            }
            graph.add_edge(
                &constraint.target,
                &resource.address,
                EdgeReason::Ordering,
                constraint.path.clone(),
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::addr;
    use serde_json::json;

    fn declaration(depends_on: serde_json::Value) -> Declaration {
        Declaration::from_json_str(
            &json!({ "resources": [
                { "kind": "resource_group", "name": "rg",
                  "fields": { "name": "rg", "location": "westeurope" } },
                { "kind": "private_dns_zone", "name": "db",
                  "depends_on": depends_on,
                  "fields": { "name": "db.internal", "resource_group": "${resource_group.rg.name}" } }
            ]})
            .to_string(),
        )
        .unwrap()
    }

    #[test]
    fn test_redundant_constraint_is_kept_and_idempotent() {
        let declaration = declaration(json!(["resource_group.rg", "resource_group.rg"]));
        let graph = ResourceGraph::build(&declaration).unwrap();

        assert_eq!(graph.edge_count(), 1);
        let info = graph
            .edge(&addr("resource_group.rg"), &addr("private_dns_zone.db"))
            .unwrap();
        assert!(info.has(EdgeReason::Data));
        assert!(info.has(EdgeReason::Ordering));
        assert!(info.paths.contains("private_dns_zone.db.depends_on[1]"));
    }

    #[test]
    fn test_unknown_target_is_an_error() {
        let declaration = declaration(json!(["key_vault.missing"]));
        let err = ResourceGraph::build(&declaration).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::DanglingReference { ref path, .. } if path == "private_dns_zone.db.depends_on[0]"
        ));
    }

    #[test]
    fn test_self_constraint_is_an_error() {
        let declaration = declaration(json!(["private_dns_zone.db"]));
        assert!(matches!(
            ResourceGraph::build(&declaration).unwrap_err(),
            ConfigError::SelfReference { .. }
        ));
    }
}
