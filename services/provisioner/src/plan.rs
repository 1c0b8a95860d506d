//! Planned actions and drift warnings.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::declaration::Address;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    Update,
    /// Destroy and recreate; a force-new field changed.
    Replace,
    /// First read of a data source.
    Read,
    NoOp,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Replace => "replace",
            Action::Read => "read",
            Action::NoOp => "no-op",
            Action::Delete => "delete",
        };
        f.write_str(label)
    }
}

impl Action {
    fn symbol(&self) -> &'static str {
        match self {
            Action::Create => "+",
            Action::Update => "~",
            Action::Replace => "-/+",
            Action::Read => "<=",
            Action::NoOp => " ",
            Action::Delete => "-",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriftKind {
    /// Remote attributes differ from the recorded ones.
    Modified { attributes: Vec<String> },
    /// The recorded resource no longer exists remotely.
    Missing,
    /// A previous run started a mutation and never recorded its result.
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftWarning {
    pub address: Address,
    #[serde(flatten)]
    pub kind: DriftKind,
}

impl DriftWarning {
    /// Conflicts block apply until the operator confirms them.
    pub fn is_conflict(&self) -> bool {
        !matches!(self.kind, DriftKind::Missing)
    }
}

impl fmt::Display for DriftWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            DriftKind::Modified { attributes } => write!(
                f,
                "{} changed outside of provisioning ({})",
                self.address,
                attributes.join(", ")
            ),
            DriftKind::Missing => write!(f, "{} no longer exists and will be recreated", self.address),
            DriftKind::Interrupted => write!(
                f,
                "{} was left in progress by an interrupted run",
                self.address
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedChange {
    pub address: Address,
    pub action: Action,
    /// Declared fields whose value differs from the recorded inputs.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub changed_fields: Vec<String>,
    /// Subset of `changed_fields` that forces replacement.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub replace_fields: Vec<String>,
    /// Remote id of the existing resource, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl PlannedChange {
    pub fn new(address: Address, action: Action) -> Self {
        Self {
            address,
            action,
            changed_fields: Vec::new(),
            replace_fields: Vec::new(),
            id: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Plan {
    /// Declared resources in apply order.
    pub changes: Vec<PlannedChange>,
    /// Orphaned state records in teardown order.
    pub deletes: Vec<PlannedChange>,
    pub drift: Vec<DriftWarning>,
}

impl Plan {
    pub fn change(&self, address: &Address) -> Option<&PlannedChange> {
        self.changes
            .iter()
            .chain(self.deletes.iter())
            .find(|c| &c.address == address)
    }

    pub fn action(&self, address: &Address) -> Option<Action> {
        self.change(address).map(|c| c.action)
    }

    pub fn conflicts(&self) -> impl Iterator<Item = &DriftWarning> {
        self.drift.iter().filter(|d| d.is_conflict())
    }

    pub fn has_changes(&self) -> bool {
        !self.deletes.is_empty() || self.changes.iter().any(|c| c.action != Action::NoOp)
    }

    pub fn counts(&self) -> BTreeMap<Action, usize> {
        let mut counts = BTreeMap::new();
        for change in self.changes.iter().chain(self.deletes.iter()) {
            *counts.entry(change.action).or_insert(0) += 1;
        }
        counts
    }

    /// Human-readable plan summary.
    pub fn display(&self) -> String {
        let mut out = String::new();
        for warning in &self.drift {
            let marker = if warning.is_conflict() { "!" } else { "?" };
            out.push_str(&format!("{marker} drift: {warning}\n"));
        }
        for change in self.changes.iter().chain(self.deletes.iter()) {
            if change.action == Action::NoOp {
                continue;
            }
            out.push_str(&format!(
                "{:>3} {} ({})",
                change.action.symbol(),
                change.address,
                change.action
            ));
            if !change.changed_fields.is_empty() {
                out.push_str(&format!(": {}", change.changed_fields.join(", ")));
            }
            if !change.replace_fields.is_empty() {
                out.push_str(&format!(" [forces replacement: {}]", change.replace_fields.join(", ")));
            }
            out.push('\n');
        }
        let counts = self.counts();
        let count = |a: Action| counts.get(&a).copied().unwrap_or(0);
        out.push_str(&format!(
            "Plan: {} to create, {} to update, {} to replace, {} to delete, {} to read, {} unchanged.\n",
            count(Action::Create),
            count(Action::Update),
            count(Action::Replace),
            count(Action::Delete),
            count(Action::Read),
            count(Action::NoOp)
        ));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_counts() {
        let mut update = PlannedChange::new(Address::new("key_vault", "main"), Action::Replace);
        update.changed_fields = vec!["sku_name".into(), "tenant_id".into()];
        update.replace_fields = vec!["tenant_id".into()];
        let plan = Plan {
            changes: vec![
                PlannedChange::new(Address::new("resource_group", "main"), Action::NoOp),
                update,
            ],
            deletes: vec![PlannedChange::new(Address::new("subnet", "old"), Action::Delete)],
            drift: vec![DriftWarning {
                address: Address::new("resource_group", "main"),
                kind: DriftKind::Missing,
            }],
        };

        assert!(plan.has_changes());
        assert_eq!(plan.conflicts().count(), 0);
        assert_eq!(plan.action(&Address::new("subnet", "old")), Some(Action::Delete));
        let text = plan.display();
        assert!(text.contains("-/+ key_vault.main (replace): sku_name, tenant_id [forces replacement: tenant_id]"));
        assert!(text.contains("  - subnet.old (delete)"));
        assert!(!text.contains("resource_group.main (no-op)"));
        assert!(text.ends_with(
            "Plan: 0 to create, 0 to update, 1 to replace, 1 to delete, 0 to read, 1 unchanged.\n"
        ));
    }

    #[test]
    fn test_drift_serializes_flat() {
        let warning = DriftWarning {
            address: Address::new("key_vault", "main"),
            kind: DriftKind::Modified {
                attributes: vec!["vault_uri".into()],
            },
        };
        assert!(warning.is_conflict());
        assert_eq!(
            serde_json::to_value(&warning).unwrap(),
            serde_json::json!({ "address": "key_vault.main", "kind": "modified", "attributes": ["vault_uri"] })
        );
    }
}
