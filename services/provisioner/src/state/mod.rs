//! Observed-state record.
//!
//! The state document maps each address to its last-known inputs and remote
//! attributes. It is owned by a single [`writer::StateWriter`] task during a
//! run and persisted atomically after every change.

mod lock;
mod store;
mod writer;

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::declaration::{Address, Attributes};

pub use lock::{FileLock, LockGuard, LockInfo, NoopLock, StateLock};
pub use store::{FileStateStore, MemoryStateStore, StateStore};
pub use writer::{StateHandle, StateUpdate, StateWriter};

pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed state file {path:?}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unsupported state version {found}")]
    UnsupportedVersion { found: u32 },

    #[error("state is locked by {holder} for {operation} since {created_at} (lock id {id})")]
    Locked {
        id: Uuid,
        holder: String,
        operation: String,
        created_at: DateTime<Utc>,
    },

    #[error("no lock is held on {path:?}")]
    NotLocked { path: PathBuf },

    #[error("lock id {given} does not match the held lock {held}")]
    LockMismatch { given: String, held: Uuid },

    #[error("state writer stopped before the update was persisted")]
    WriterClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Applied,
    /// A mutation started and did not report back. Inputs and attributes are
    /// the last known ones.
    InProgress,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    pub kind: String,
    pub status: ResourceStatus,
    #[serde(default)]
    pub inputs: Attributes,
    #[serde(default)]
    pub attributes: Attributes,
    /// Producers at the time of the last write, used to order orphan teardown.
    #[serde(default)]
    pub depends_on: Vec<Address>,
    pub updated_at: DateTime<Utc>,
}

impl ResourceState {
    /// Remote identifier, if the resource was ever provisioned.
    pub fn id(&self) -> Option<&str> {
        self.attributes.get("id").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputState {
    pub value: Value,
    #[serde(default)]
    pub sensitive: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    pub version: u32,
    pub serial: u64,
    #[serde(default)]
    pub lineage: Option<Uuid>,
    #[serde(default)]
    pub resources: BTreeMap<Address, ResourceState>,
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputState>,
}

impl Default for StateDocument {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            serial: 0,
            lineage: None,
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }
}

impl StateDocument {
    pub fn resource(&self, address: &Address) -> Option<&ResourceState> {
        self.resources.get(address)
    }

    /// Attributes of every recorded resource, as seen by expressions.
    pub fn attribute_map(&self) -> BTreeMap<Address, Attributes> {
        self.resources
            .iter()
            .map(|(address, record)| (address.clone(), record.attributes.clone()))
            .collect()
    }
}
