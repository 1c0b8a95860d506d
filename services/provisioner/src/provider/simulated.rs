//! In-process cloud for dry runs, sandboxes and tests.
//!
//! Attributes are generated deterministically per kind. Failures can be
//! injected per address, and the "remote" can be persisted to a JSON file so
//! repeated CLI runs see the same resources.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tempfile::NamedTempFile;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::{resource_path, ApiError, CloudApi, ResourceRequest};
use crate::declaration::{Address, Attributes};
use crate::schema::KindSchema;

const SUBSCRIPTION: &str = "00000000-0000-0000-0000-000000000000";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiOp {
    Create,
    Read,
    Update,
    Delete,
}

/// One recorded call against the simulated cloud.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiCall {
    pub op: ApiOp,
    pub address: Option<Address>,
    pub id: String,
}

impl ApiCall {
    pub fn is_mutation(&self) -> bool {
        self.op != ApiOp::Read
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimResource {
    address: Address,
    serial: u64,
    /// Bumped by every update that changes the inputs.
    #[serde(default)]
    revision: u64,
    inputs: Attributes,
    attributes: Attributes,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SimState {
    next_serial: u64,
    resources: BTreeMap<String, SimResource>,
}

#[derive(Debug, Clone)]
struct Failure {
    error: ApiError,
    /// `None` fails forever.
    remaining: Option<u32>,
    /// Reads still succeed.
    mutations_only: bool,
}

#[derive(Default)]
pub struct SimulatedCloud {
    state: Mutex<SimState>,
    failures: Mutex<BTreeMap<Address, Failure>>,
    calls: Mutex<Vec<ApiCall>>,
    path: Option<PathBuf>,
    latency: Duration,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimulatedCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load (or start) a simulated cloud persisted at `path`.
    pub fn persistent(path: impl Into<PathBuf>) -> Result<Self, ApiError> {
        let path = path.into();
        let state = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                ApiError::Rejected(format!("malformed simulated state {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SimState::default(),
            Err(e) => {
                return Err(ApiError::Rejected(format!(
                    "cannot read simulated state {}: {e}",
                    path.display()
                )))
            }
        };
        Ok(Self {
            state: Mutex::new(state),
            path: Some(path),
            ..Self::default()
        })
    }

    /// Sleep this long inside every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Every call for `address` fails with `error`.
    pub fn fail(&self, address: &Address, error: ApiError) {
        locked(&self.failures).insert(
            address.clone(),
            Failure {
                error,
                remaining: None,
                mutations_only: false,
            },
        );
    }

    /// Every create, update and delete for `address` fails with `error`.
    pub fn fail_mutations(&self, address: &Address, error: ApiError) {
        locked(&self.failures).insert(
            address.clone(),
            Failure {
                error,
                remaining: None,
                mutations_only: true,
            },
        );
    }

    /// The next `times` calls for `address` fail with `error`.
    pub fn fail_times(&self, address: &Address, error: ApiError, times: u32) {
        locked(&self.failures).insert(
            address.clone(),
            Failure {
                error,
                remaining: Some(times),
                mutations_only: false,
            },
        );
    }

    pub fn clear_failures(&self) {
        locked(&self.failures).clear();
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        locked(&self.calls).clone()
    }

    pub fn mutations(&self) -> Vec<ApiCall> {
        self.calls().into_iter().filter(ApiCall::is_mutation).collect()
    }

    pub fn clear_calls(&self) {
        locked(&self.calls).clear();
    }

    /// Highest number of calls observed in flight at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Remote id currently held for `address`, if any.
    pub fn id_of(&self, address: &Address) -> Option<String> {
        locked(&self.state)
            .resources
            .iter()
            .find(|(_, r)| &r.address == address)
            .map(|(id, _)| id.clone())
    }

    pub fn resource_count(&self) -> usize {
        locked(&self.state).resources.len()
    }

    /// Change an attribute out of band, to simulate drift.
    pub fn tamper(&self, address: &Address, attribute: &str, value: Value) -> bool {
        let mut state = locked(&self.state);
        match state.resources.values_mut().find(|r| &r.address == address) {
            Some(resource) => {
                resource.attributes.insert(attribute.to_string(), value);
                true
            }
            None => false,
        }
    }

    /// Delete a resource out of band.
    pub fn remove(&self, address: &Address) -> bool {
        let mut state = locked(&self.state);
        let before = state.resources.len();
        state.resources.retain(|_, r| &r.address != address);
        before != state.resources.len()
    }

    fn record(&self, op: ApiOp, address: Option<&Address>, id: &str) {
        locked(&self.calls).push(ApiCall {
            op,
            address: address.cloned(),
            id: id.to_string(),
        });
    }

    fn injected_failure(&self, op: ApiOp, address: Option<&Address>) -> Result<(), ApiError> {
        let Some(address) = address else {
            return Ok(());
        };
        let mut failures = locked(&self.failures);
        let Some(failure) = failures.get_mut(address) else {
            return Ok(());
        };
        if failure.mutations_only && op == ApiOp::Read {
            return Ok(());
        }
        let error = failure.error.clone();
        match &mut failure.remaining {
            None => {}
            Some(0) => {
                failures.remove(address);
                return Ok(());
            }
            Some(n) => {
                *n -= 1;
                if *n == 0 {
                    failures.remove(address);
                }
            }
        }
        debug!(address = %address, error = %error, "Injected failure");
        Err(error)
    }

    fn address_of(&self, id: &str) -> Option<Address> {
        locked(&self.state)
            .resources
            .get(id)
            .map(|r| r.address.clone())
    }

    async fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
        InFlight(&self.in_flight)
    }

    fn persist(&self, state: &SimState) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = write_atomic(path, state) {
            warn!(path = ?path, error = %e, "Failed to persist simulated cloud");
        }
    }

    fn upsert(&self, id: &str, request: &ResourceRequest, serial: Option<u64>) -> Attributes {
        let mut state = locked(&self.state);
        let serial = serial.unwrap_or_else(|| {
            state.next_serial += 1;
            state.next_serial
        });
        let revision = match state.resources.get(id) {
            Some(existing) if existing.inputs == request.inputs => existing.revision,
            Some(existing) => existing.revision + 1,
            None => 0,
        };
        let attributes = generate_attributes(request, id, serial, revision);
        state.resources.insert(
            id.to_string(),
            SimResource {
                address: request.address.clone(),
                serial,
                revision,
                inputs: request.inputs.clone(),
                attributes: attributes.clone(),
            },
        );
        self.persist(&state);
        attributes
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn write_atomic(path: &Path, state: &SimState) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, state)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn generate_attributes(
    request: &ResourceRequest,
    id: &str,
    serial: u64,
    revision: u64,
) -> Attributes {
    let input = |name: &str| request.inputs.get(name).cloned().unwrap_or(Value::Null);
    let name = request
        .inputs
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or(request.address.name())
        .to_string();
    let octets = format!("{}.{}", (serial / 250) % 250, serial % 250 + 4);

    request
        .schema
        .outputs
        .iter()
        .map(|output| {
            let value = match output.name {
                "id" => json!(id),
                "name" => json!(name),
                "fqdn" => json!(format!("{name}.{}.simulated.example", request.address.kind())),
                "vault_uri" => json!(format!("https://{name}.vault.azure.net/")),
                "ip_address" => json!(format!("20.50.{octets}")),
                "private_ip_address" => match input("private_ip_address") {
                    Value::Null => json!(format!("10.20.{octets}")),
                    given => given,
                },
                "backend_pool_id" => json!(format!("{id}/backendAddressPools/default")),
                "guid" | "principal_id" => json!(format!("00000000-0000-4000-8000-{serial:012x}")),
                "version" => json!(format!("{id}/{serial:016x}{revision:016x}")),
                "address_prefix" => input("address_prefixes")
                    .get(0)
                    .cloned()
                    .unwrap_or(Value::Null),
                other => input(other),
            };
            (output.name.to_string(), value)
        })
        .collect()
}

#[async_trait]
impl CloudApi for SimulatedCloud {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn create(&self, request: &ResourceRequest) -> Result<Attributes, ApiError> {
        let _guard = self.enter().await;
        let binding = request
            .schema
            .arm
            .as_ref()
            .ok_or_else(|| ApiError::Rejected(format!("`{}` is not a remote kind", request.schema.kind)))?;
        let id = resource_path(binding, &request.inputs, SUBSCRIPTION)?;
        self.record(ApiOp::Create, Some(&request.address), &id);
        self.injected_failure(ApiOp::Create, Some(&request.address))?;
        Ok(self.upsert(&id, request, None))
    }

    async fn read(
        &self,
        _schema: &'static KindSchema,
        id: &str,
    ) -> Result<Option<Attributes>, ApiError> {
        let _guard = self.enter().await;
        let address = self.address_of(id);
        self.record(ApiOp::Read, address.as_ref(), id);
        self.injected_failure(ApiOp::Read, address.as_ref())?;
        Ok(locked(&self.state)
            .resources
            .get(id)
            .map(|r| r.attributes.clone()))
    }

    async fn update(&self, id: &str, request: &ResourceRequest) -> Result<Attributes, ApiError> {
        let _guard = self.enter().await;
        self.record(ApiOp::Update, Some(&request.address), id);
        self.injected_failure(ApiOp::Update, Some(&request.address))?;
        let serial = locked(&self.state)
            .resources
            .get(id)
            .map(|r| r.serial)
            .ok_or_else(|| ApiError::NotFound(id.to_string()))?;
        Ok(self.upsert(id, request, Some(serial)))
    }

    async fn delete(&self, _schema: &'static KindSchema, id: &str) -> Result<(), ApiError> {
        let _guard = self.enter().await;
        let address = self.address_of(id);
        self.record(ApiOp::Delete, address.as_ref(), id);
        self.injected_failure(ApiOp::Delete, address.as_ref())?;
        let mut state = locked(&self.state);
        if state.resources.remove(id).is_some() {
            self.persist(&state);
        }
        Ok(())
    }
}
