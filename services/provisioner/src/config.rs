//! Engine configuration.

use std::time::Duration;

use clap::ValueEnum;
use serde::Serialize;

use crate::provider::RetryPolicy;

/// What happens to in-flight nodes when a run is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AbortPolicy {
    /// Wait for in-flight mutations to reach a terminal state.
    #[default]
    Drain,
    /// Abort in-flight mutations. Their state records stay `in_progress`.
    Abandon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ProviderKind {
    /// Azure Resource Manager.
    #[default]
    Arm,
    /// In-process simulated cloud.
    Simulated,
}

/// Azure Resource Manager client settings.
#[derive(Debug, Clone)]
pub struct ArmSettings {
    pub endpoint: String,
    /// Falls back to the caller identity's subscription.
    pub subscription_id: Option<String>,
    pub poll_interval: Duration,
    pub poll_attempts: u32,
    pub request_timeout: Duration,
}

impl Default for ArmSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://management.azure.com".to_string(),
            subscription_id: None,
            poll_interval: Duration::from_secs(5),
            poll_attempts: 120,
            request_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on concurrently dispatched nodes.
    pub max_concurrency: usize,
    /// Concurrent remote reads during refresh.
    pub refresh_concurrency: usize,
    pub abort_policy: AbortPolicy,
    /// Proceed even when drift conflicts were detected.
    pub accept_drift: bool,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            refresh_concurrency: 8,
            abort_policy: AbortPolicy::Drain,
            accept_drift: false,
            retry: RetryPolicy::default(),
        }
    }
}
