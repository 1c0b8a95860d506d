//! Kinds resolved in-process: `random_password` and `client_config`.

use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use super::{ApiError, CloudApi, CredentialProvider, ResourceRequest};
use crate::declaration::Attributes;
use crate::schema::KindSchema;

const ALPHANUMERIC: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const SPECIAL: &[u8] = b"!#$%&*()-_=+[]{}<>:?";
const DEFAULT_LENGTH: usize = 16;
const MAX_LENGTH: usize = 256;

pub struct LocalResources {
    credentials: Arc<dyn CredentialProvider>,
}

impl LocalResources {
    pub fn new(credentials: Arc<dyn CredentialProvider>) -> Self {
        Self { credentials }
    }

    async fn client_config(&self) -> Result<Attributes, ApiError> {
        let identity = self.credentials.identity().await?;
        Ok([
            (
                "id".to_string(),
                json!(format!("client_config/{}/{}", identity.tenant_id, identity.object_id)),
            ),
            ("tenant_id".to_string(), json!(identity.tenant_id)),
            ("object_id".to_string(), json!(identity.object_id)),
            ("subscription_id".to_string(), json!(identity.subscription_id)),
        ]
        .into_iter()
        .collect())
    }
}

fn random_password(inputs: &Attributes) -> Result<Attributes, ApiError> {
    let length = match inputs.get("length") {
        None | Some(Value::Null) => DEFAULT_LENGTH,
        Some(value) => value
            .as_u64()
            .map(|n| n as usize)
            .filter(|n| (1..=MAX_LENGTH).contains(n))
            .ok_or_else(|| ApiError::Rejected(format!("invalid password length {value}")))?,
    };
    let special = inputs
        .get("special")
        .and_then(Value::as_bool)
        .unwrap_or(true);

    let mut charset = ALPHANUMERIC.to_vec();
    if special {
        charset.extend_from_slice(SPECIAL);
    }
    let mut rng = rand::thread_rng();
    let result: String = (0..length)
        .map(|_| charset[rng.gen_range(0..charset.len())] as char)
        .collect();

    Ok([
        ("id".to_string(), json!(Uuid::new_v4().to_string())),
        ("result".to_string(), json!(result)),
    ]
    .into_iter()
    .collect())
}

#[async_trait]
impl CloudApi for LocalResources {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn create(&self, request: &ResourceRequest) -> Result<Attributes, ApiError> {
        debug!(address = %request.address, "Resolving local resource");
        match request.schema.kind {
            "random_password" => random_password(&request.inputs),
            "client_config" => self.client_config().await,
            other => Err(ApiError::Rejected(format!("`{other}` is not a local kind"))),
        }
    }

    async fn read(
        &self,
        schema: &'static KindSchema,
        _id: &str,
    ) -> Result<Option<Attributes>, ApiError> {
        match schema.kind {
            "client_config" => self.client_config().await.map(Some),
            other => Err(ApiError::Rejected(format!("`{other}` cannot be read back"))),
        }
    }

    async fn update(&self, _id: &str, request: &ResourceRequest) -> Result<Attributes, ApiError> {
        match request.schema.kind {
            "client_config" => self.client_config().await,
            other => Err(ApiError::Rejected(format!(
                "`{other}` has no mutable fields"
            ))),
        }
    }

    async fn delete(&self, _schema: &'static KindSchema, _id: &str) -> Result<(), ApiError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declaration::Address;
    use crate::provider::StaticCredentials;
    use crate::schema;

    fn local() -> LocalResources {
        LocalResources::new(Arc::new(StaticCredentials::simulated()))
    }

    #[tokio::test]
    async fn test_random_password_respects_inputs() {
        let request = ResourceRequest {
            address: Address::new("random_password", "db"),
            schema: &schema::RANDOM_PASSWORD,
            inputs: [
                ("length".to_string(), json!(32)),
                ("special".to_string(), json!(false)),
            ]
            .into_iter()
            .collect(),
        };
        let attributes = local().create(&request).await.unwrap();
        let result = attributes["result"].as_str().unwrap();
        assert_eq!(result.len(), 32);
        assert!(result.bytes().all(|b| ALPHANUMERIC.contains(&b)));

        let mut bad = request.clone();
        bad.inputs.insert("length".into(), json!(0));
        assert!(matches!(local().create(&bad).await, Err(ApiError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_client_config_reads_identity() {
        let attributes = local()
            .read(&schema::CLIENT_CONFIG, "client_config")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            attributes["tenant_id"],
            json!("00000000-0000-0000-0000-00000000a11c")
        );
        assert!(attributes["id"].as_str().unwrap().starts_with("client_config/"));
    }
}
