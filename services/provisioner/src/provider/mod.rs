//! Cloud API adapters.
//!
//! Every remote call goes through [`CloudApi`]. "Provisioned" means the API
//! reported terminal success; nothing here waits for global visibility.

mod arm;
mod identity;
mod local;
mod retry;
mod simulated;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::declaration::{Address, Attributes};
use crate::schema::KindSchema;

pub use arm::{resource_path, ArmCloud};
pub use identity::{AzureCliCredentials, CredentialProvider, Identity, StaticCredentials};
pub use local::LocalResources;
pub use retry::{with_retry, RetryPolicy};
pub use simulated::{ApiCall, ApiOp, SimulatedCloud};

/// Everything a create or update call needs.
#[derive(Debug, Clone)]
pub struct ResourceRequest {
    pub address: Address,
    pub schema: &'static KindSchema,
    pub inputs: Attributes,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApiError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("timed out: {0}")]
    Timeout(String),

    /// The request was accepted but never reached a terminal state. Sending
    /// it again would only start another wait.
    #[error("still provisioning: {0}")]
    StillProvisioning(String),
}

impl ApiError {
    /// Transient, rate-limited and timed-out calls are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::Transient(_) | ApiError::RateLimited { .. } | ApiError::Timeout(_)
        )
    }
}

#[async_trait]
pub trait CloudApi: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create(&self, request: &ResourceRequest) -> Result<Attributes, ApiError>;

    /// `None` when the resource no longer exists.
    async fn read(
        &self,
        schema: &'static KindSchema,
        id: &str,
    ) -> Result<Option<Attributes>, ApiError>;

    async fn update(&self, id: &str, request: &ResourceRequest) -> Result<Attributes, ApiError>;

    async fn delete(&self, schema: &'static KindSchema, id: &str) -> Result<(), ApiError>;
}

/// Routes local kinds to [`LocalResources`] and everything else to the remote
/// API, retrying retryable failures.
pub struct ProviderRegistry {
    remote: Arc<dyn CloudApi>,
    local: Arc<dyn CloudApi>,
    retry: RetryPolicy,
}

impl ProviderRegistry {
    pub fn new(remote: Arc<dyn CloudApi>, local: Arc<dyn CloudApi>) -> Self {
        Self {
            remote,
            local,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn route(&self, schema: &KindSchema) -> &dyn CloudApi {
        if schema.local {
            self.local.as_ref()
        } else {
            self.remote.as_ref()
        }
    }
}

#[async_trait]
impl CloudApi for ProviderRegistry {
    fn name(&self) -> &'static str {
        self.remote.name()
    }

    async fn create(&self, request: &ResourceRequest) -> Result<Attributes, ApiError> {
        let api = self.route(request.schema);
        let target = request.address.to_string();
        with_retry(&self.retry, "create", &target, || api.create(request)).await
    }

    async fn read(
        &self,
        schema: &'static KindSchema,
        id: &str,
    ) -> Result<Option<Attributes>, ApiError> {
        let api = self.route(schema);
        with_retry(&self.retry, "read", id, || api.read(schema, id)).await
    }

    async fn update(&self, id: &str, request: &ResourceRequest) -> Result<Attributes, ApiError> {
        let api = self.route(request.schema);
        let target = request.address.to_string();
        with_retry(&self.retry, "update", &target, || api.update(id, request)).await
    }

    async fn delete(&self, schema: &'static KindSchema, id: &str) -> Result<(), ApiError> {
        let api = self.route(schema);
        match with_retry(&self.retry, "delete", id, || api.delete(schema, id)).await {
            Err(ApiError::NotFound(_)) => Ok(()),
            other => other,
        }
    }
}
