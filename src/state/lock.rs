//! State locking for concurrent access protection.
//!
//! A lock record is created with conditional-create semantics on the
//! backend, so two acquirers can never both succeed. Locks never expire;
//! a stuck lock is removed with an explicit force-unlock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Information about a held state lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub id: String,
    /// Who holds the lock.
    pub holder: String,
    /// Operation the holder is running (apply, destroy, ...).
    pub operation: String,
    /// Workspace the lock belongs to.
    pub workspace: String,
    /// When the lock was acquired.
    pub created_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates a new lock record.
    #[must_use]
    pub fn new(holder: &str, operation: &str, workspace: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            operation: operation.to_string(),
            workspace: workspace.to_string(),
            created_at: Utc::now(),
        }
    }

    /// Seconds since the lock was acquired.
    #[must_use]
    pub fn held_secs(&self) -> i64 {
        (Utc::now() - self.created_at).num_seconds().max(0)
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get().map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());

    let pid = std::process::id();
    let uuid = &Uuid::new_v4().to_string()[..8];

    format!("{hostname}-{pid}-{uuid}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_creation() {
        let lock = LockInfo::new("ci", "apply", "default");
        let other = LockInfo::new("ci", "apply", "default");
        assert_eq!(lock.holder, "ci");
        assert_ne!(lock.id, other.id);
        assert!(lock.held_secs() >= 0);
    }

    #[test]
    fn test_holder_id_generation() {
        let id1 = generate_holder_id();
        let id2 = generate_holder_id();

        assert_ne!(id1, id2);

        let pid = std::process::id().to_string();
        assert!(id1.contains(&pid));
    }
}
