use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use tempfile::NamedTempFile;
use tracing::debug;

use super::{StateDocument, StateError, STATE_VERSION};

/// Where the state document lives.
pub trait StateStore: Send + Sync {
    /// Load the document, or an empty one if none was ever written.
    fn load(&self) -> Result<StateDocument, StateError>;

    /// Replace the stored document. Readers never observe a partial write.
    fn persist(&self, doc: &StateDocument) -> Result<(), StateError>;
}

/// JSON file store. Writes go to a temp file in the same directory which is
/// then renamed over the target.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> StateError {
        StateError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<StateDocument, StateError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = ?self.path, "No state file yet, starting empty");
                return Ok(StateDocument::default());
            }
            Err(e) => return Err(self.io_error(e)),
        };
        let doc: StateDocument =
            serde_json::from_str(&text).map_err(|source| StateError::Malformed {
                path: self.path.clone(),
                source,
            })?;
        if doc.version != STATE_VERSION {
            return Err(StateError::UnsupportedVersion { found: doc.version });
        }
        Ok(doc)
    }

    fn persist(&self, doc: &StateDocument) -> Result<(), StateError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| self.io_error(e))?;
        let body = serde_json::to_vec_pretty(doc).map_err(|source| StateError::Malformed {
            path: self.path.clone(),
            source,
        })?;
        tmp.write_all(&body).map_err(|e| self.io_error(e))?;
        tmp.as_file().sync_all().map_err(|e| self.io_error(e))?;
        tmp.persist(&self.path).map_err(|e| self.io_error(e.error))?;
        debug!(path = ?self.path, serial = doc.serial, "Persisted state");
        Ok(())
    }
}

/// In-memory store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    doc: Mutex<StateDocument>,
    writes: AtomicUsize,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StateDocument {
        self.doc
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of persisted writes.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<StateDocument, StateError> {
        Ok(self.snapshot())
    }

    fn persist(&self, doc: &StateDocument) -> Result<(), StateError> {
        *self.doc.lock().unwrap_or_else(PoisonError::into_inner) = doc.clone();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::OutputState;
    use serde_json::json;

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("state.json"));
        assert_eq!(store.load().unwrap(), StateDocument::default());
    }

    #[test]
    fn test_persist_replaces_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = FileStateStore::new(&path);

        let mut doc = StateDocument::default();
        doc.serial = 3;
        doc.outputs.insert(
            "gateway_ip".into(),
            OutputState {
                value: json!("20.1.2.3"),
                sensitive: false,
            },
        );
        store.persist(&doc).unwrap();
        assert_eq!(store.load().unwrap(), doc);

        doc.serial = 4;
        doc.outputs.clear();
        store.persist(&doc).unwrap();
        assert_eq!(store.load().unwrap().serial, 4);

        // Only the state file remains; the temp file was renamed over it.
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_rejects_garbage_and_future_versions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ nope").unwrap();
        assert!(matches!(
            FileStateStore::new(&path).load(),
            Err(StateError::Malformed { .. })
        ));

        std::fs::write(&path, r#"{"version": 9, "serial": 1}"#).unwrap();
        assert!(matches!(
            FileStateStore::new(&path).load(),
            Err(StateError::UnsupportedVersion { found: 9 })
        ));
    }

    #[test]
    fn test_memory_store_counts_writes() {
        let store = MemoryStateStore::new();
        store.persist(&StateDocument::default()).unwrap();
        store.persist(&StateDocument::default()).unwrap();
        assert_eq!(store.writes(), 2);
    }
}
