//! Single writer task for the state document.
//!
//! Node executors never touch the document directly. They send updates over
//! a channel; the writer applies each one, persists the whole document and
//! only then acknowledges.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};
use uuid::Uuid;

use super::{OutputState, ResourceState, ResourceStatus, StateDocument, StateError, StateStore};
use crate::declaration::{Address, Attributes};

#[derive(Debug, Clone)]
pub enum StateUpdate {
    /// A mutation is about to start. Existing inputs and attributes are kept
    /// as the last-known state.
    Begin {
        address: Address,
        inputs: Attributes,
        depends_on: Vec<Address>,
    },
    /// The mutation reached terminal success.
    Commit {
        address: Address,
        inputs: Attributes,
        attributes: Attributes,
        depends_on: Vec<Address>,
    },
    /// The resource no longer exists remotely.
    Forget { address: Address },
    Outputs(BTreeMap<String, OutputState>),
}

struct Envelope {
    update: StateUpdate,
    ack: oneshot::Sender<Result<u64, StateError>>,
}

/// Cloneable sender side of the writer.
#[derive(Clone)]
pub struct StateHandle {
    tx: mpsc::Sender<Envelope>,
}

impl StateHandle {
    /// Send an update and wait until it is persisted. Returns the new serial.
    pub async fn send(&self, update: StateUpdate) -> Result<u64, StateError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Envelope { update, ack })
            .await
            .map_err(|_| StateError::WriterClosed)?;
        done.await.map_err(|_| StateError::WriterClosed)?
    }

    pub async fn begin(
        &self,
        address: &Address,
        inputs: Attributes,
        depends_on: Vec<Address>,
    ) -> Result<u64, StateError> {
        self.send(StateUpdate::Begin {
            address: address.clone(),
            inputs,
            depends_on,
        })
        .await
    }

    pub async fn commit(
        &self,
        address: &Address,
        inputs: Attributes,
        attributes: Attributes,
        depends_on: Vec<Address>,
    ) -> Result<u64, StateError> {
        self.send(StateUpdate::Commit {
            address: address.clone(),
            inputs,
            attributes,
            depends_on,
        })
        .await
    }

    pub async fn forget(&self, address: &Address) -> Result<u64, StateError> {
        self.send(StateUpdate::Forget {
            address: address.clone(),
        })
        .await
    }
}

pub struct StateWriter {
    handle: StateHandle,
    task: JoinHandle<StateDocument>,
}

impl StateWriter {
    pub fn spawn(store: Arc<dyn StateStore>, doc: StateDocument) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let task = tokio::spawn(run(store, doc, rx));
        Self {
            handle: StateHandle { tx },
            task,
        }
    }

    pub fn handle(&self) -> StateHandle {
        self.handle.clone()
    }

    /// Stop accepting updates and return the final document. Every other
    /// handle must be dropped first.
    pub async fn finish(self) -> Result<StateDocument, StateError> {
        drop(self.handle);
        self.task.await.map_err(|e| {
            error!(error = %e, "State writer task panicked");
            StateError::WriterClosed
        })
    }
}

async fn run(
    store: Arc<dyn StateStore>,
    mut doc: StateDocument,
    mut rx: mpsc::Receiver<Envelope>,
) -> StateDocument {
    while let Some(Envelope { update, ack }) = rx.recv().await {
        // The held document only moves forward once the store has it.
        let mut next = doc.clone();
        apply(&mut next, update);
        next.serial += 1;
        next.lineage.get_or_insert_with(Uuid::new_v4);
        let result = match store.persist(&next) {
            Ok(()) => {
                doc = next;
                Ok(doc.serial)
            }
            Err(e) => {
                error!(error = %e, serial = next.serial, "Failed to persist state");
                Err(e)
            }
        };
        let _ = ack.send(result);
    }
    doc
}

fn apply(doc: &mut StateDocument, update: StateUpdate) {
    let now = Utc::now();
    match update {
        StateUpdate::Begin {
            address,
            inputs,
            depends_on,
        } => {
            debug!(address = %address, "State: begin");
            match doc.resources.get_mut(&address) {
                Some(record) => {
                    record.status = ResourceStatus::InProgress;
                    record.depends_on = depends_on;
                    record.updated_at = now;
                }
                None => {
                    doc.resources.insert(
                        address.clone(),
                        ResourceState {
                            kind: address.kind().to_string(),
                            status: ResourceStatus::InProgress,
                            inputs,
                            attributes: Attributes::new(),
                            depends_on,
                            updated_at: now,
                        },
                    );
                }
            }
        }
        StateUpdate::Commit {
            address,
            inputs,
            attributes,
            depends_on,
        } => {
            debug!(address = %address, "State: commit");
            doc.resources.insert(
                address.clone(),
                ResourceState {
                    kind: address.kind().to_string(),
                    status: ResourceStatus::Applied,
                    inputs,
                    attributes,
                    depends_on,
                    updated_at: now,
                },
            );
        }
        StateUpdate::Forget { address } => {
            debug!(address = %address, "State: forget");
            doc.resources.remove(&address);
        }
        StateUpdate::Outputs(outputs) => {
            doc.outputs = outputs;
        }
    }
}
