//! Azure Resource Manager REST client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header::RETRY_AFTER, Client, Method, Response, StatusCode};
use serde_json::{json, Map, Value};
use tokio::time::sleep;
use tracing::{debug, info};

use super::{ApiError, CloudApi, CredentialProvider, ResourceRequest};
use crate::config::ArmSettings;
use crate::declaration::Attributes;
use crate::schema::{ArmBinding, KindSchema};

/// Fields that are part of the resource envelope rather than `properties`.
const ENVELOPE_FIELDS: &[&str] = &["name", "resource_group", "location", "tags", "sku", "sku_name"];

pub struct ArmCloud {
    http: Client,
    settings: ArmSettings,
    credentials: Arc<dyn CredentialProvider>,
}

impl ArmCloud {
    pub fn new(
        settings: ArmSettings,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, ApiError> {
        let http = Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| ApiError::Rejected(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            settings,
            credentials,
        })
    }

    async fn subscription(&self) -> Result<String, ApiError> {
        match &self.settings.subscription_id {
            Some(id) => Ok(id.clone()),
            None => Ok(self.credentials.identity().await?.subscription_id),
        }
    }

    fn binding(schema: &KindSchema) -> Result<&ArmBinding, ApiError> {
        schema
            .arm
            .as_ref()
            .ok_or_else(|| ApiError::Rejected(format!("`{}` has no Resource Manager binding", schema.kind)))
    }

    fn url(&self, id: &str, api_version: &str) -> String {
        format!(
            "{}{}?api-version={}",
            self.settings.endpoint.trim_end_matches('/'),
            id,
            api_version
        )
    }

    async fn send(
        &self,
        method: Method,
        id: &str,
        api_version: &str,
        body: Option<&Value>,
    ) -> Result<Response, ApiError> {
        let token = self.credentials.token().await?;
        let mut request = self
            .http
            .request(method.clone(), self.url(id, api_version))
            .bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }
        debug!(%method, id, "ARM request");
        request.send().await.map_err(transport_error)
    }

    /// PUT then poll until `provisioningState` is terminal.
    async fn put(&self, request: &ResourceRequest, id: &str) -> Result<Attributes, ApiError> {
        let binding = Self::binding(request.schema)?;
        let body = request_body(request, binding);
        let response = self
            .send(Method::PUT, id, binding.api_version, Some(&body))
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify(response).await);
        }
        info!(address = %request.address, id, %status, "Resource Manager accepted PUT");
        let body = self.wait_for_terminal(request.schema, id).await?;
        Ok(extract_attributes(request.schema, &body))
    }

    /// Poll until the resource reports `Succeeded` or `Failed`.
    async fn wait_for_terminal(&self, schema: &KindSchema, id: &str) -> Result<Value, ApiError> {
        let binding = Self::binding(schema)?;
        for attempt in 0..self.settings.poll_attempts {
            let response = self.send(Method::GET, id, binding.api_version, None).await?;
            if !response.status().is_success() {
                return Err(classify(response).await);
            }
            let body: Value = response.json().await.map_err(transport_error)?;
            match provisioning_state(&body) {
                None | Some("Succeeded") => return Ok(body),
                Some("Failed") | Some("Canceled") => {
                    return Err(ApiError::Rejected(format!(
                        "{id} finished provisioning in state {}",
                        provisioning_state(&body).unwrap_or("Failed")
                    )))
                }
                Some(state) => {
                    if attempt % 10 == 0 {
                        info!(id, state, attempt, "Waiting for provisioning to finish");
                    }
                }
            }
            sleep(self.settings.poll_interval).await;
        }
        Err(ApiError::StillProvisioning(format!(
            "{id} did not finish provisioning after {} polls",
            self.settings.poll_attempts
        )))
    }
}

#[async_trait]
impl CloudApi for ArmCloud {
    fn name(&self) -> &'static str {
        "arm"
    }

    async fn create(&self, request: &ResourceRequest) -> Result<Attributes, ApiError> {
        let binding = Self::binding(request.schema)?;
        let id = resource_path(binding, &request.inputs, &self.subscription().await?)?;
        self.put(request, &id).await
    }

    async fn read(
        &self,
        schema: &'static KindSchema,
        id: &str,
    ) -> Result<Option<Attributes>, ApiError> {
        let binding = Self::binding(schema)?;
        let response = self.send(Method::GET, id, binding.api_version, None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(classify(response).await);
        }
        let body: Value = response.json().await.map_err(transport_error)?;
        Ok(Some(extract_attributes(schema, &body)))
    }

    async fn update(&self, id: &str, request: &ResourceRequest) -> Result<Attributes, ApiError> {
        self.put(request, id).await
    }

    async fn delete(&self, schema: &'static KindSchema, id: &str) -> Result<(), ApiError> {
        let binding = Self::binding(schema)?;
        let response = self
            .send(Method::DELETE, id, binding.api_version, None)
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::NO_CONTENT | StatusCode::OK => return Ok(()),
            StatusCode::ACCEPTED => {}
            _ => return Err(classify(response).await),
        }

        for _ in 0..self.settings.poll_attempts {
            sleep(self.settings.poll_interval).await;
            let response = self.send(Method::GET, id, binding.api_version, None).await?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(());
            }
        }
        Err(ApiError::StillProvisioning(format!(
            "{id} still exists after {} polls",
            self.settings.poll_attempts
        )))
    }
}

/// Build the Resource Manager id for a kind from its inputs.
pub fn resource_path(
    binding: &ArmBinding,
    inputs: &Attributes,
    subscription: &str,
) -> Result<String, ApiError> {
    let input = |field: &str| -> Result<String, ApiError> {
        inputs
            .get(field)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ApiError::Rejected(format!("missing `{field}` for resource path")))
    };

    if binding.path.is_empty() {
        return Ok(format!(
            "/subscriptions/{subscription}/resourceGroups/{}",
            input("name")?
        ));
    }

    let mut path = String::new();
    let mut rest = binding.path;
    while let Some(start) = rest.find('{') {
        path.push_str(&rest[..start]);
        let Some(end) = rest[start..].find('}') else {
            return Err(ApiError::Rejected(format!("bad path template `{}`", binding.path)));
        };
        path.push_str(&input(&rest[start + 1..start + end])?);
        rest = &rest[start + end + 1..];
    }
    path.push_str(rest);

    if path.starts_with('/') {
        return Ok(path);
    }
    Ok(format!(
        "/subscriptions/{subscription}/resourceGroups/{}/providers/{path}",
        input("resource_group")?
    ))
}

fn request_body(request: &ResourceRequest, binding: &ArmBinding) -> Value {
    let mut properties = Map::new();
    for (field, value) in &request.inputs {
        if value.is_null()
            || ENVELOPE_FIELDS.contains(&field.as_str())
            || binding.path.contains(&format!("{{{field}}}"))
        {
            continue;
        }
        properties.insert(camel_case(field), value.clone());
    }

    let mut body = Map::new();
    if let Some(location) = request.inputs.get("location").filter(|v| !v.is_null()) {
        body.insert("location".into(), location.clone());
    }
    if let Some(tags) = request.inputs.get("tags").filter(|v| !v.is_null()) {
        body.insert("tags".into(), tags.clone());
    }
    if let Some(sku) = request
        .inputs
        .get("sku_name")
        .or_else(|| request.inputs.get("sku"))
        .filter(|v| !v.is_null())
    {
        body.insert("sku".into(), json!({ "name": sku }));
    }
    if binding.system_identity {
        body.insert("identity".into(), json!({ "type": "SystemAssigned" }));
    }
    body.insert("properties".into(), Value::Object(properties));
    Value::Object(body)
}

fn provisioning_state(body: &Value) -> Option<&str> {
    body.pointer("/properties/provisioningState")
        .and_then(Value::as_str)
}

/// Pull the declared output attributes out of a response body.
fn extract_attributes(schema: &KindSchema, body: &Value) -> Attributes {
    schema
        .outputs
        .iter()
        .map(|output| {
            let pointer = if output.pointer.is_empty() {
                format!("/properties/{}", camel_case(output.name))
            } else {
                output.pointer.to_string()
            };
            let value = body.pointer(&pointer).cloned().unwrap_or(Value::Null);
            (output.name.to_string(), value)
        })
        .collect()
}

fn camel_case(snake: &str) -> String {
    let mut out = String::with_capacity(snake.len());
    let mut upper = false;
    for c in snake.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

fn transport_error(e: reqwest::Error) -> ApiError {
    if e.is_timeout() {
        ApiError::Timeout(e.to_string())
    } else {
        ApiError::Transient(e.to_string())
    }
}

async fn classify(response: Response) -> ApiError {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();
    classify_status(status, retry_after, &body)
}

fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> ApiError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.pointer("/error/message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| format!("HTTP {status}"));
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApiError::Unauthorized(message),
        StatusCode::NOT_FOUND => ApiError::NotFound(message),
        StatusCode::TOO_MANY_REQUESTS => ApiError::RateLimited { retry_after },
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ApiError::Timeout(message),
        s if s.is_server_error() => ApiError::Transient(message),
        _ => ApiError::Rejected(message),
    }
}
