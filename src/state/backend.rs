//! Backend collaborator contract.
//!
//! Backends store opaque byte objects under string keys. Writes can be
//! made conditional on the object's absence or on its current version,
//! and lock records are created only if none exists.

use async_trait::async_trait;

use crate::error::Result;

use super::lock::LockInfo;

/// A stored object and its version token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Object content.
    pub bytes: Vec<u8>,
    /// Opaque version (content hash, `ETag`, counter).
    pub version: String,
}

/// Precondition for a put.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutCondition {
    /// Always write.
    Unconditional,
    /// Write only if no object exists.
    IfAbsent,
    /// Write only if the object's version matches.
    IfVersion(String),
}

/// Outcome of a conditional lock creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAttempt {
    /// The record was created.
    Acquired,
    /// Another record exists.
    Held(LockInfo),
}

/// Storage backend for snapshots and lock records.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Backend: Send + Sync {
    /// Reads an object.
    async fn get(&self, key: &str) -> Result<Option<StoredObject>>;

    /// Writes an object; a failed condition is a `WriteConflict`.
    /// Returns the new version.
    async fn put(&self, key: &str, bytes: Vec<u8>, condition: PutCondition) -> Result<String>;

    /// Deletes an object. Deleting a missing object succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Lists object keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Creates a lock record unless one exists.
    async fn lock_create(&self, key: &str, lock: &LockInfo) -> Result<LockAttempt>;

    /// Reads the lock record, if any.
    async fn lock_read(&self, key: &str) -> Result<Option<LockInfo>>;

    /// Deletes the lock record if its id matches. Returns false if there
    /// was no matching record.
    async fn lock_delete(&self, key: &str, lock_id: &str) -> Result<bool>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}
