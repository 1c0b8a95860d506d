//! Per-node work for apply and teardown.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::declaration::{Address, Attributes, Declaration, ResourceDecl, Variables};
use crate::eval::EvalScope;
use crate::graph::RealizedGraph;
use crate::plan::{Action, PlannedChange};
use crate::provider::{CloudApi, ResourceRequest};
use crate::reconcile::recorded_schema;
use crate::report::Outcome;
use crate::scheduler::NodeExecutor;
use crate::state::{ResourceState, StateDocument, StateHandle};

/// Carries out the planned action of each declared resource.
pub(crate) struct ApplyExecutor {
    pub api: Arc<dyn CloudApi>,
    pub declaration: Arc<Declaration>,
    pub variables: Arc<Variables>,
    pub realized: Arc<RealizedGraph>,
    pub changes: BTreeMap<Address, PlannedChange>,
    pub recorded: Arc<StateDocument>,
    pub state: StateHandle,
    /// Attributes of every provisioned producer, updated as nodes commit.
    pub attributes: Mutex<BTreeMap<Address, Attributes>>,
}

impl ApplyExecutor {
    fn resolve(&self, resource: &ResourceDecl) -> Result<Attributes> {
        let attributes = self
            .attributes
            .lock()
            .map_err(|_| anyhow!("attribute map poisoned"))?;
        let inputs = EvalScope::new(&self.variables)
            .with_attributes(&attributes)
            .with_pruned(&self.realized.pruned)
            .resolve_inputs(resource)?;
        Ok(inputs)
    }

    fn publish(&self, address: &Address, attributes: Attributes) -> Result<()> {
        self.attributes
            .lock()
            .map_err(|_| anyhow!("attribute map poisoned"))?
            .insert(address.clone(), attributes);
        Ok(())
    }

    async fn commit(
        &self,
        address: &Address,
        inputs: Attributes,
        attributes: Attributes,
        depends_on: Vec<Address>,
    ) -> Result<()> {
        self.state
            .commit(address, inputs, attributes.clone(), depends_on)
            .await?;
        self.publish(address, attributes)
    }

    async fn update(
        &self,
        address: &Address,
        resource: &ResourceDecl,
        id: &str,
        inputs: Attributes,
        depends_on: Vec<Address>,
    ) -> Result<()> {
        let request = ResourceRequest {
            address: address.clone(),
            schema: resource.schema,
            inputs: inputs.clone(),
        };
        self.state
            .begin(address, inputs.clone(), depends_on.clone())
            .await?;
        let attributes = self
            .api
            .update(id, &request)
            .await
            .with_context(|| format!("updating {address}"))?;
        self.commit(address, inputs, attributes, depends_on).await
    }

    async fn replace(
        &self,
        address: &Address,
        resource: &ResourceDecl,
        id: Option<&str>,
        inputs: Attributes,
        depends_on: Vec<Address>,
    ) -> Result<()> {
        let request = ResourceRequest {
            address: address.clone(),
            schema: resource.schema,
            inputs: inputs.clone(),
        };
        self.state
            .begin(address, inputs.clone(), depends_on.clone())
            .await?;
        if let Some(id) = id {
            debug!(address = %address, id, "Destroying before recreate");
            self.api
                .delete(resource.schema, id)
                .await
                .with_context(|| format!("destroying {address} for replacement"))?;
        }
        let attributes = self
            .api
            .create(&request)
            .await
            .with_context(|| format!("recreating {address}"))?;
        self.commit(address, inputs, attributes, depends_on).await
    }

    /// Inputs of a planned no-op can still move when a producer updated
    /// earlier in this run changed a computed output.
    async fn converge_unchanged(
        &self,
        address: &Address,
        resource: &ResourceDecl,
        record: &ResourceState,
        depends_on: Vec<Address>,
    ) -> Result<Outcome> {
        let inputs = self.resolve(resource)?;
        if inputs == record.inputs {
            // Keep the recorded dependency list current for teardown.
            if record.depends_on != depends_on {
                self.state
                    .commit(
                        address,
                        record.inputs.clone(),
                        record.attributes.clone(),
                        depends_on,
                    )
                    .await?;
            }
            return Ok(Outcome::NoOp);
        }

        let changed: Vec<String> = inputs
            .keys()
            .chain(record.inputs.keys())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter(|key| inputs.get(*key) != record.inputs.get(*key))
            .cloned()
            .collect();
        let force_new = changed
            .iter()
            .any(|key| resource.schema.field(key).is_some_and(|f| f.force_new));
        if force_new {
            self.replace(address, resource, record.id(), inputs, depends_on)
                .await?;
            info!(address = %address, fields = ?changed, "Replaced after upstream change");
            Ok(Outcome::Replaced)
        } else {
            let id = record
                .id()
                .with_context(|| format!("{address} has no recorded id to update"))?;
            self.update(address, resource, id, inputs, depends_on)
                .await?;
            info!(address = %address, fields = ?changed, "Updated after upstream change");
            Ok(Outcome::Updated)
        }
    }
}

#[async_trait]
impl NodeExecutor for ApplyExecutor {
    type Output = Outcome;

    async fn execute(&self, address: &Address) -> Result<Outcome> {
        let change = self
            .changes
            .get(address)
            .with_context(|| format!("no planned change for {address}"))?;
        let resource = self
            .declaration
            .resource(address)
            .with_context(|| format!("{address} is not declared"))?;
        let schema = resource.schema;
        let depends_on: Vec<Address> = self.realized.graph.producers(address).into_iter().collect();

        match change.action {
            Action::NoOp => {
                // A re-read data source records what refresh observed.
                if schema.data_source {
                    let observed = self
                        .attributes
                        .lock()
                        .map_err(|_| anyhow!("attribute map poisoned"))?
                        .get(address)
                        .cloned();
                    let recorded = self.recorded.resource(address).map(|r| &r.attributes);
                    if let Some(observed) = observed {
                        if recorded != Some(&observed) {
                            self.commit(address, Attributes::new(), observed, depends_on)
                                .await?;
                        }
                    }
                } else if let Some(record) = self.recorded.resource(address) {
                    return self
                        .converge_unchanged(address, resource, record, depends_on)
                        .await;
                }
                Ok(Outcome::NoOp)
            }
            Action::Read => {
                let attributes = self
                    .api
                    .read(schema, &address.to_string())
                    .await
                    .with_context(|| format!("reading {address}"))?
                    .with_context(|| format!("data source {address} returned nothing"))?;
                self.commit(address, Attributes::new(), attributes, depends_on)
                    .await?;
                info!(address = %address, "Read data source");
                Ok(Outcome::Read)
            }
            Action::Create => {
                let inputs = self.resolve(resource)?;
                let request = ResourceRequest {
                    address: address.clone(),
                    schema,
                    inputs: inputs.clone(),
                };
                self.state
                    .begin(address, inputs.clone(), depends_on.clone())
                    .await?;
                match self.api.create(&request).await {
                    Ok(attributes) => {
                        self.commit(address, inputs, attributes, depends_on).await?;
                        info!(address = %address, "Created");
                        Ok(Outcome::Created)
                    }
                    Err(e) => {
                        self.state.forget(address).await?;
                        Err(e).with_context(|| format!("creating {address}"))
                    }
                }
            }
            Action::Update => {
                let id = change
                    .id
                    .as_deref()
                    .with_context(|| format!("{address} has no recorded id to update"))?;
                let inputs = self.resolve(resource)?;
                self.update(address, resource, id, inputs, depends_on)
                    .await?;
                info!(address = %address, fields = ?change.changed_fields, "Updated");
                Ok(Outcome::Updated)
            }
            Action::Replace => {
                let inputs = self.resolve(resource)?;
                self.replace(address, resource, change.id.as_deref(), inputs, depends_on)
                    .await?;
                info!(address = %address, fields = ?change.replace_fields, "Replaced");
                Ok(Outcome::Replaced)
            }
            Action::Delete => bail!("{address} is scheduled for teardown, not apply"),
        }
    }
}

/// Deletes recorded resources and forgets them.
pub(crate) struct TeardownExecutor {
    pub api: Arc<dyn CloudApi>,
    pub recorded: Arc<StateDocument>,
    pub state: StateHandle,
}

#[async_trait]
impl NodeExecutor for TeardownExecutor {
    type Output = Outcome;

    async fn execute(&self, address: &Address) -> Result<Outcome> {
        let record = self
            .recorded
            .resource(address)
            .with_context(|| format!("{address} has no state record"))?;
        let schema = recorded_schema(&self.recorded, address)
            .with_context(|| format!("{address} has unknown kind `{}`", record.kind))?;

        if let (Some(id), false) = (record.id(), schema.data_source) {
            self.state
                .begin(address, record.inputs.clone(), record.depends_on.clone())
                .await?;
            self.api
                .delete(schema, id)
                .await
                .with_context(|| format!("destroying {address}"))?;
        }
        self.state.forget(address).await?;
        info!(address = %address, "Destroyed");
        Ok(Outcome::Destroyed)
    }
}
