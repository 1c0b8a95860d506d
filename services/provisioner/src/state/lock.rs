use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::StateError;

/// Contents of a held lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    pub id: Uuid,
    pub holder: String,
    pub operation: String,
    pub created_at: DateTime<Utc>,
}

impl LockInfo {
    fn new(operation: &str) -> Self {
        let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        Self {
            id: Uuid::new_v4(),
            holder: format!("{user}@{host} (pid {})", std::process::id()),
            operation: operation.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Exclusive access to a state document across invocations.
pub trait StateLock: Send + Sync {
    fn acquire(&self, operation: &str) -> Result<LockGuard, StateError>;
}

/// Releases the lock when dropped.
#[derive(Debug)]
pub struct LockGuard {
    info: LockInfo,
    path: Option<PathBuf>,
}

impl LockGuard {
    pub fn info(&self) -> &LockInfo {
        &self.info
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(path) = &self.path else {
            return;
        };
        match fs::remove_file(path) {
            Ok(()) => info!(lock_id = %self.info.id, path = ?path, "Released state lock"),
            Err(e) => warn!(
                lock_id = %self.info.id,
                path = ?path,
                error = %e,
                "Failed to release state lock"
            ),
        }
    }
}

/// `<state>.lock`, created exclusively.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Lock file next to a state file.
    pub fn for_state(state_path: &Path) -> Self {
        let mut name = state_path.as_os_str().to_os_string();
        name.push(".lock");
        Self::new(PathBuf::from(name))
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

    /// The current holder, if any.
    pub fn current(&self) -> Result<Option<LockInfo>, StateError> {
        match fs::read_to_string(&self.path) {
            Ok(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|source| StateError::Malformed {
                    path: self.path.clone(),
                    source,
                }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_error(e)),
        }
    }

    /// Remove a stale lock. The id must match the held lock.
    pub fn force_unlock(&self, id: &str) -> Result<LockInfo, StateError> {
        let held = self.current()?.ok_or_else(|| StateError::NotLocked {
            path: self.path.clone(),
        })?;
        if held.id.to_string() != id {
            return Err(StateError::LockMismatch {
                given: id.to_string(),
                held: held.id,
            });
        }
        fs::remove_file(&self.path).map_err(|e| self.io_error(e))?;
        warn!(lock_id = %held.id, holder = %held.holder, "Force-unlocked state");
        Ok(held)
    }
}

impl StateLock for FileLock {
    fn acquire(&self, operation: &str) -> Result<LockGuard, StateError> {
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(match self.current()? {
                    Some(held) => StateError::Locked {
                        id: held.id,
                        holder: held.holder,
                        operation: held.operation,
                        created_at: held.created_at,
                    },
                    None => self.io_error(e),
                });
            }
            Err(e) => return Err(self.io_error(e)),
        };

        let info = LockInfo::new(operation);
        let guard = LockGuard {
            info,
            path: Some(self.path.clone()),
        };
        let body = serde_json::to_vec(&guard.info).map_err(|source| StateError::Malformed {
            path: self.path.clone(),
            source,
        })?;
        file.write_all(&body).map_err(|e| self.io_error(e))?;
        info!(lock_id = %guard.info.id, path = ?self.path, operation, "Acquired state lock");
        Ok(guard)
    }
}

/// Used with `--no-lock`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLock;

impl StateLock for NoopLock {
    fn acquire(&self, operation: &str) -> Result<LockGuard, StateError> {
        Ok(LockGuard {
            info: LockInfo::new(operation),
            path: None,
        })
    }
}
