//! Itemised run report.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::declaration::Address;
use crate::plan::DriftWarning;
use crate::state::OutputState;

const REDACTED: &str = "(sensitive)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Created,
    Updated,
    Replaced,
    Destroyed,
    NoOp,
    Read,
    Failed,
    Skipped,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Outcome::Created => "created",
            Outcome::Updated => "updated",
            Outcome::Replaced => "replaced",
            Outcome::Destroyed => "destroyed",
            Outcome::NoOp => "no-op",
            Outcome::Read => "read",
            Outcome::Failed => "failed",
            Outcome::Skipped => "skipped",
        };
        f.pad(label)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceOutcome {
    pub address: Address,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatched_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub operation: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub resources: Vec<ResourceOutcome>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub drift: Vec<DriftWarning>,
    /// Run-level failures not attributable to one resource.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(serialize_with = "serialize_redacted")]
    pub outputs: BTreeMap<String, OutputState>,
    pub cancelled: bool,
    /// State serial after the run.
    pub serial: u64,
}

impl RunReport {
    pub fn new(operation: &str) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            operation: operation.to_string(),
            started_at: now,
            finished_at: now,
            resources: Vec::new(),
            drift: Vec::new(),
            errors: Vec::new(),
            outputs: BTreeMap::new(),
            cancelled: false,
            serial: 0,
        }
    }

    pub fn record(&mut self, outcome: ResourceOutcome) {
        self.resources.push(outcome);
    }

    pub fn outcome(&self, address: &Address) -> Option<Outcome> {
        self.resources
            .iter()
            .find(|r| &r.address == address)
            .map(|r| r.outcome)
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.resources.iter().filter(|r| r.outcome == outcome).count()
    }

    pub fn counts(&self) -> BTreeMap<Outcome, usize> {
        let mut counts = BTreeMap::new();
        for resource in &self.resources {
            *counts.entry(resource.outcome).or_insert(0) += 1;
        }
        counts
    }

    pub fn succeeded(&self) -> bool {
        !self.cancelled
            && self.errors.is_empty()
            && self
                .resources
                .iter()
                .all(|r| !matches!(r.outcome, Outcome::Failed | Outcome::Skipped))
    }

    /// Format the report for the terminal. Sensitive outputs are redacted.
    pub fn display(&self) -> String {
        let mut out = format!("{} run {}\n", self.operation, self.run_id);
        for resource in &self.resources {
            out.push_str(&format!("  {:<10} {}", resource.outcome, resource.address));
            if let Some(error) = &resource.error {
                out.push_str(&format!(": {error}"));
            }
            out.push('\n');
        }
        for error in &self.errors {
            out.push_str(&format!("  error: {error}\n"));
        }
        if !self.outputs.is_empty() {
            out.push_str("Outputs:\n");
            for (name, output) in &self.outputs {
                out.push_str(&format!("  {name} = {}\n", display_output(output)));
            }
        }
        let summary: Vec<String> = self
            .counts()
            .into_iter()
            .map(|(outcome, n)| format!("{n} {outcome}"))
            .collect();
        let status = if self.cancelled {
            "cancelled"
        } else if self.succeeded() {
            "succeeded"
        } else {
            "failed"
        };
        out.push_str(&format!(
            "Result: {status} ({})\n",
            if summary.is_empty() {
                "nothing to do".to_string()
            } else {
                summary.join(", ")
            }
        ));
        out
    }
}

/// Terminal rendering of an output value.
pub fn display_output(output: &OutputState) -> String {
    if output.sensitive {
        return REDACTED.to_string();
    }
    match &output.value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replace sensitive values before they leave the process.
pub fn redacted(outputs: &BTreeMap<String, OutputState>) -> BTreeMap<String, OutputState> {
    outputs
        .iter()
        .map(|(name, output)| {
            let value = if output.sensitive {
                Value::String(REDACTED.to_string())
            } else {
                output.value.clone()
            };
            (
                name.clone(),
                OutputState {
                    value,
                    sensitive: output.sensitive,
                },
            )
        })
        .collect()
}

fn serialize_redacted<S: serde::Serializer>(
    outputs: &BTreeMap<String, OutputState>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serde::Serialize::serialize(&redacted(outputs), serializer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outcome(address: &str, outcome: Outcome, completed_at: Option<u64>) -> ResourceOutcome {
        ResourceOutcome {
            address: address.parse().unwrap(),
            outcome,
            error: None,
            dispatched_at: completed_at.map(|c| c - 1),
            completed_at,
        }
    }

    #[test]
    fn test_counts_and_status() {
        let mut report = RunReport::new("apply");
        report.record(outcome("subnet.private", Outcome::Created, Some(4)));
        report.record(outcome("virtual_network.main", Outcome::NoOp, Some(2)));
        assert!(report.succeeded());
        assert_eq!(report.counts().get(&Outcome::Created), Some(&1));

        report.record(ResourceOutcome {
            error: Some("rejected: quota".into()),
            ..outcome("postgresql_server.main", Outcome::Failed, Some(6))
        });
        report.record(outcome("key_vault_secret.db", Outcome::Skipped, None));
        assert!(!report.succeeded());
        assert_eq!(report.count(Outcome::Skipped), 1);

        let text = report.display();
        assert!(text.contains("failed     postgresql_server.main: rejected: quota"));
        assert!(text.ends_with("Result: failed (1 created, 1 no-op, 1 failed, 1 skipped)\n"));
    }

    #[test]
    fn test_sensitive_outputs_are_redacted() {
        let mut report = RunReport::new("apply");
        report.outputs.insert(
            "db_password".into(),
            OutputState {
                value: json!("hunter2"),
                sensitive: true,
            },
        );
        report.outputs.insert(
            "gateway_ip".into(),
            OutputState {
                value: json!("20.50.0.7"),
                sensitive: false,
            },
        );

        let text = report.display();
        assert!(text.contains("db_password = (sensitive)"));
        assert!(text.contains("gateway_ip = 20.50.0.7"));
        assert!(!text.contains("hunter2"));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outputs"]["db_password"]["value"], json!("(sensitive)"));
        assert!(!json.to_string().contains("hunter2"));
    }
}
