//! Caller identity and access tokens.

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::ApiError;

/// Authorization context of the caller, exposed as `client_config`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub tenant_id: String,
    pub object_id: String,
    pub subscription_id: String,
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Bearer token for the Resource Manager API.
    async fn token(&self) -> Result<String, ApiError>;

    async fn identity(&self) -> Result<Identity, ApiError>;
}

/// `AZURE_*` environment variables first, then the `az` CLI.
#[derive(Debug, Default)]
pub struct AzureCliCredentials {
    token: Mutex<Option<String>>,
    subscription_id: Option<String>,
}

impl AzureCliCredentials {
    pub fn new(subscription_id: Option<String>) -> Self {
        Self {
            token: Mutex::new(None),
            subscription_id,
        }
    }

    async fn az(args: &[&str]) -> Result<String, ApiError> {
        let output = Command::new("az")
            .args(args)
            .args(["--output", "tsv"])
            .output()
            .await
            .map_err(|e| ApiError::Unauthorized(format!("failed to run az CLI: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ApiError::Unauthorized(format!(
                "az {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn env_or_az(var: &str, args: &[&str]) -> Result<String, ApiError> {
        match std::env::var(var) {
            Ok(value) if !value.is_empty() => Ok(value),
            _ => Self::az(args).await,
        }
    }
}

#[async_trait]
impl CredentialProvider for AzureCliCredentials {
    async fn token(&self) -> Result<String, ApiError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }

        let token = match std::env::var("AZURE_ACCESS_TOKEN") {
            Ok(token) if !token.is_empty() => {
                debug!("Using access token from AZURE_ACCESS_TOKEN");
                token
            }
            _ => {
                info!("Fetching access token from az CLI");
                Self::az(&[
                    "account",
                    "get-access-token",
                    "--resource",
                    "https://management.azure.com/",
                    "--query",
                    "accessToken",
                ])
                .await?
            }
        };
        *cached = Some(token.clone());
        Ok(token)
    }

    async fn identity(&self) -> Result<Identity, ApiError> {
        let tenant_id =
            Self::env_or_az("AZURE_TENANT_ID", &["account", "show", "--query", "tenantId"]).await?;
        let object_id = Self::env_or_az(
            "AZURE_OBJECT_ID",
            &["ad", "signed-in-user", "show", "--query", "id"],
        )
        .await?;
        let subscription_id = match &self.subscription_id {
            Some(id) => id.clone(),
            None => {
                Self::env_or_az("AZURE_SUBSCRIPTION_ID", &["account", "show", "--query", "id"])
                    .await?
            }
        };
        Ok(Identity {
            tenant_id,
            object_id,
            subscription_id,
        })
    }
}

/// Fixed token and identity, for the simulated cloud and tests.
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    token: String,
    identity: Identity,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>, identity: Identity) -> Self {
        Self {
            token: token.into(),
            identity,
        }
    }

    /// Placeholder identity used with the simulated cloud.
    pub fn simulated() -> Self {
        Self::new(
            "simulated",
            Identity {
                tenant_id: "00000000-0000-0000-0000-00000000a11c".to_string(),
                object_id: "00000000-0000-0000-0000-0000000000b0".to_string(),
                subscription_id: "00000000-0000-0000-0000-000000000000".to_string(),
            },
        )
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn token(&self) -> Result<String, ApiError> {
        Ok(self.token.clone())
    }

    async fn identity(&self) -> Result<Identity, ApiError> {
        Ok(self.identity.clone())
    }
}
