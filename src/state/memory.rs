//! In-memory state backend.
//!
//! Shares its content across clones, so several engines in one process can
//! contend for the same workspace. Used by tests and dry runs.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{Result, StateError};

use super::backend::{Backend, LockAttempt, PutCondition, StoredObject};
use super::lock::LockInfo;

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<String, (Vec<u8>, u64)>,
    locks: BTreeMap<String, LockInfo>,
    next_version: u64,
}

/// Backend keeping everything in process memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw object content, for inspection in tests.
    #[must_use]
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().objects.get(key).map(|(bytes, _)| bytes.clone())
    }

    /// Number of successful puts so far.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.lock().next_version
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<StoredObject>> {
        Ok(self.lock().objects.get(key).map(|(bytes, version)| StoredObject {
            bytes: bytes.clone(),
            version: version.to_string(),
        }))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, condition: PutCondition) -> Result<String> {
        let mut inner = self.lock();
        let current = inner.objects.get(key).map(|(_, version)| version.to_string());
        let satisfied = match (&condition, &current) {
            (PutCondition::Unconditional, _) | (PutCondition::IfAbsent, None) => true,
            (PutCondition::IfAbsent, Some(_)) | (PutCondition::IfVersion(_), None) => false,
            (PutCondition::IfVersion(expected), Some(version)) => expected == version,
        };
        if !satisfied {
            return Err(StateError::WriteConflict {
                key: key.to_string(),
            }
            .into());
        }

        inner.next_version += 1;
        let version = inner.next_version;
        inner.objects.insert(key.to_string(), (bytes, version));
        Ok(version.to_string())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.lock().objects.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .objects
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn lock_create(&self, key: &str, lock: &LockInfo) -> Result<LockAttempt> {
        let mut inner = self.lock();
        if let Some(existing) = inner.locks.get(key) {
            return Ok(LockAttempt::Held(existing.clone()));
        }
        inner.locks.insert(key.to_string(), lock.clone());
        Ok(LockAttempt::Acquired)
    }

    async fn lock_read(&self, key: &str) -> Result<Option<LockInfo>> {
        Ok(self.lock().locks.get(key).cloned())
    }

    async fn lock_delete(&self, key: &str, lock_id: &str) -> Result<bool> {
        let mut inner = self.lock();
        if inner.locks.get(key).is_some_and(|l| l.id == lock_id) {
            inner.locks.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
