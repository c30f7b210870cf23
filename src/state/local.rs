//! Local file-based state backend.
//!
//! Objects are files below a base directory; keys are relative paths.
//! Writes go to a temporary file that is synced and renamed into place.
//! Lock records are written to a temporary file and published with a hard
//! link, which fails if a lock already exists.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{Result, StateError};

use super::backend::{Backend, LockAttempt, PutCondition, StoredObject};
use super::lock::LockInfo;

/// Default state directory name.
pub const STATE_DIR: &str = ".converge";

const BACKEND: &str = "local";

const LOCK_ATTEMPTS: u32 = 3;

/// Local file-based state backend.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    /// Base directory for state files.
    base_dir: PathBuf,
}

impl LocalBackend {
    /// Creates a backend rooted at `base_dir`.
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.base_dir.join(key)
    }

    fn version_of(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    fn io_error(action: &str, key: &str, err: &std::io::Error) -> StateError {
        StateError::backend(BACKEND, format!("Failed to {action} {key}: {err}"))
    }

    /// Ensures the parent directory of `key` exists.
    async fn ensure_parent(&self, key: &str) -> Result<()> {
        if let Some(parent) = self.path(key).parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::io_error("create directory for", key, &e))?;
        }
        Ok(())
    }

    async fn read_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::io_error("read", key, &e).into()),
        }
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn get(&self, key: &str) -> Result<Option<StoredObject>> {
        let Some(bytes) = self.read_bytes(key).await? else {
            debug!("State object does not exist: {key}");
            return Ok(None);
        };
        let version = Self::version_of(&bytes);
        Ok(Some(StoredObject { bytes, version }))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, condition: PutCondition) -> Result<String> {
        self.ensure_parent(key).await?;

        let current = self.read_bytes(key).await?;
        let satisfied = match (&condition, &current) {
            (PutCondition::Unconditional, _) | (PutCondition::IfAbsent, None) => true,
            (PutCondition::IfAbsent, Some(_)) | (PutCondition::IfVersion(_), None) => false,
            (PutCondition::IfVersion(expected), Some(existing)) => {
                *expected == Self::version_of(existing)
            }
        };
        if !satisfied {
            return Err(StateError::WriteConflict {
                key: key.to_string(),
            }
            .into());
        }

        let path = self.path(key);
        let temp_path = path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| Self::io_error("create temp file for", key, &e))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| Self::io_error("write", key, &e))?;
        file.sync_all()
            .await
            .map_err(|e| Self::io_error("sync", key, &e))?;

        fs::rename(&temp_path, &path)
            .await
            .map_err(|e| Self::io_error("rename", key, &e))?;

        debug!("Wrote {}", path.display());
        Ok(Self::version_of(&bytes))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path(key)).await {
            Ok(()) => {
                info!("Deleted state object: {key}");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_error("delete", key, &e).into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![self.base_dir.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(Self::io_error("list", prefix, &e).into()),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Self::io_error("list", prefix, &e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| Self::io_error("list", prefix, &e))?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.base_dir) {
                    let key = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn lock_create(&self, key: &str, lock: &LockInfo) -> Result<LockAttempt> {
        self.ensure_parent(key).await?;

        let content = serde_json::to_vec_pretty(lock)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        // The record is complete on disk before the lock path can be seen.
        let path = self.path(key);
        let temp_path = path.with_extension(format!("{}.tmp", lock.id));
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| Self::io_error("create temp file for", key, &e))?;
        file.write_all(&content)
            .await
            .map_err(|e| Self::io_error("write lock file", key, &e))?;
        file.sync_all()
            .await
            .map_err(|e| Self::io_error("sync lock file", key, &e))?;
        drop(file);

        let mut attempts = 0;
        let outcome: Result<LockAttempt> = loop {
            attempts += 1;
            match fs::hard_link(&temp_path, &path).await {
                Ok(()) => break Ok(LockAttempt::Acquired),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => match self.lock_read(key).await {
                    Ok(Some(existing)) => break Ok(LockAttempt::Held(existing)),
                    // Released between the link and the read.
                    Ok(None) if attempts < LOCK_ATTEMPTS => {}
                    Ok(None) => {
                        break Err(StateError::backend(BACKEND, format!("Lock file {key} vanished while contended")).into());
                    }
                    Err(e) => break Err(e),
                },
                Err(e) => break Err(Self::io_error("create lock file", key, &e).into()),
            }
        };

        if let Err(e) = fs::remove_file(&temp_path).await {
            debug!("Failed to remove {}: {e}", temp_path.display());
        }
        outcome
    }

    async fn lock_read(&self, key: &str) -> Result<Option<LockInfo>> {
        let Some(bytes) = self.read_bytes(key).await? else {
            return Ok(None);
        };
        let lock = serde_json::from_slice(&bytes)
            .map_err(|e| StateError::corrupted(format!("Failed to parse lock file: {e}")))?;
        Ok(Some(lock))
    }

    async fn lock_delete(&self, key: &str, lock_id: &str) -> Result<bool> {
        match self.lock_read(key).await? {
            Some(existing) if existing.id == lock_id => {
                self.delete(key).await?;
                Ok(true)
            }
            Some(existing) => {
                debug!("Lock ID mismatch: expected {lock_id}, found {}", existing.id);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    fn backend_type(&self) -> &'static str {
        BACKEND
    }
}
