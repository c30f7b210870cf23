//! Error types for the reconciliation engine.
//!
//! This module provides the error hierarchy for every stage of a run:
//! declaration and graph problems, state storage and locking, provider
//! failures, and per-node apply failures.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the engine.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Declaration, graph or settings errors. Always raised before any
    /// provider mutation.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// State storage, locking and workspace errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Failures reported by a provider.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Apply-time failures that are not provider errors.
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Declaration, graph and settings errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// A configuration or declaration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// The declarations contain a dependency cycle.
    #[error("Dependency cycle between: {}", addresses.join(", "))]
    Cycle {
        /// Every address participating in the cycle, sorted.
        addresses: Vec<String>,
    },

    /// A `count` or `for_each` expression is invalid or not known statically.
    #[error("Invalid repetition for {address}: {message}")]
    InvalidRepetition {
        /// Declaration the repetition belongs to.
        address: String,
        /// What is wrong with it.
        message: String,
    },

    /// A reference points at something that does not exist or is used
    /// where it is not allowed.
    #[error("Invalid reference in {address}: {message}")]
    InvalidReference {
        /// Declaration containing the reference.
        address: String,
        /// What is wrong with it.
        message: String,
    },

    /// No provider is registered for a resource type.
    #[error("No provider registered for resource type '{resource_type}' ({address})")]
    UnknownResourceType {
        /// Address of the offending resource.
        address: String,
        /// The unregistered type.
        resource_type: String,
    },

    /// Two declarations expand to the same address.
    #[error("Duplicate declaration: {address}")]
    DuplicateDeclaration {
        /// The duplicated address.
        address: String,
    },

    /// A plan would delete a resource marked `prevent_destroy`.
    #[error("Resource {address} has prevent_destroy set but the plan would destroy it")]
    ProtectedDestroy {
        /// Address of the protected resource.
        address: String,
    },

    /// A resource address string could not be parsed.
    #[error("Invalid address '{input}': {message}")]
    InvalidAddress {
        /// The text that failed to parse.
        input: String,
        /// Description of the problem.
        message: String,
    },

    /// A provider rejected the arguments of a resource.
    #[error("Invalid arguments for {address}: {}", errors.join("; "))]
    InvalidArguments {
        /// Address of the resource.
        address: String,
        /// Errors reported by the provider.
        errors: Vec<String>,
    },

    /// An environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },
}

/// State storage, locking and workspace errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// The state lock is held by someone else.
    #[error("State for workspace '{workspace}' is locked (lock id: {lock_id}, holder: {holder}, since: {since})")]
    LockConflict {
        /// Workspace whose lock is held.
        workspace: String,
        /// Identifier of the existing lock.
        lock_id: String,
        /// Identity of the current holder.
        holder: String,
        /// When the existing lock was acquired (RFC 3339).
        since: String,
    },

    /// A write was computed against a serial that is no longer current.
    #[error("Stale state for workspace '{workspace}': based on serial {base_serial}, current serial is {current_serial}")]
    StaleState {
        /// Workspace being written.
        workspace: String,
        /// Serial the write was computed from.
        base_serial: u64,
        /// Serial currently stored.
        current_serial: u64,
    },

    /// A write belongs to a different state history.
    #[error("Lineage mismatch: expected {expected}, found {found}")]
    LineageMismatch {
        /// Lineage currently stored.
        expected: String,
        /// Lineage presented by the writer.
        found: String,
    },

    /// A write was attempted without holding the lock.
    #[error("Workspace '{workspace}' is not locked by lock {lock_id}")]
    NotLocked {
        /// Workspace being written.
        workspace: String,
        /// Lock id presented by the writer.
        lock_id: String,
    },

    /// A conditional backend write lost a race.
    #[error("Conditional write to '{key}' failed: object changed concurrently")]
    WriteConflict {
        /// Backend key.
        key: String,
    },

    /// Stored state could not be decoded.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Stored state has an unsupported format version.
    #[error("Unsupported state format version {found} (supported: {supported})")]
    UnsupportedVersion {
        /// Version found in the snapshot.
        found: u32,
        /// Version this build reads and writes.
        supported: u32,
    },

    /// State could not be serialized.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// Backend I/O failure.
    #[error("{backend} state backend error: {message}")]
    Backend {
        /// Backend type name.
        backend: &'static str,
        /// Description of the failure.
        message: String,
    },

    /// The named workspace does not exist.
    #[error("Workspace '{name}' does not exist")]
    WorkspaceNotFound {
        /// Workspace name.
        name: String,
    },

    /// The named workspace already exists.
    #[error("Workspace '{name}' already exists")]
    WorkspaceExists {
        /// Workspace name.
        name: String,
    },

    /// The workspace still manages resources.
    #[error("Workspace '{name}' still manages {resources} resource instance(s); destroy them first")]
    WorkspaceNotEmpty {
        /// Workspace name.
        name: String,
        /// Number of remaining instances.
        resources: usize,
    },

    /// The workspace is currently selected.
    #[error("Workspace '{name}' is the active workspace; select another one first")]
    WorkspaceActive {
        /// Workspace name.
        name: String,
    },

    /// The default workspace cannot be deleted.
    #[error("The default workspace cannot be deleted")]
    DefaultWorkspace,

    /// A workspace name is malformed.
    #[error("Invalid workspace name '{name}'")]
    InvalidWorkspaceName {
        /// The rejected name.
        name: String,
    },

    /// No instance is recorded at the address.
    #[error("No resource instance recorded at {address}")]
    AddressNotFound {
        /// The missing address.
        address: String,
    },

    /// An instance is already recorded at the address.
    #[error("A resource instance is already recorded at {address}")]
    AddressExists {
        /// The occupied address.
        address: String,
    },
}

/// Errors reported by a provider operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The remote object does not exist.
    #[error("{resource_type} '{id}' not found")]
    NotFound {
        /// Resource type.
        resource_type: String,
        /// Remote object identifier.
        id: String,
    },

    /// The remote system rejected or failed an operation.
    #[error("{resource_type} {operation} failed: {message}")]
    Failed {
        /// Resource type.
        resource_type: String,
        /// Operation that failed.
        operation: String,
        /// Message from the remote system.
        message: String,
    },

    /// The operation exceeded the provider's own deadline.
    #[error("{resource_type} {operation} timed out")]
    Timeout {
        /// Resource type.
        resource_type: String,
        /// Operation that timed out.
        operation: String,
    },

    /// The provider does not support an operation.
    #[error("{resource_type} does not support {operation}")]
    Unsupported {
        /// Resource type.
        resource_type: String,
        /// The unsupported operation.
        operation: String,
    },
}

/// Apply-time failures that are not provider errors.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// A precondition evaluated to false before the node started.
    #[error("Precondition failed for {address}: {message}")]
    PreconditionFailed {
        /// Node address.
        address: String,
        /// The assertion's message.
        message: String,
    },

    /// A postcondition evaluated to false after the node's change.
    #[error("Postcondition failed for {address}: {message}")]
    PostconditionFailed {
        /// Node address.
        address: String,
        /// The assertion's message.
        message: String,
    },

    /// The run was cancelled before the node was scheduled.
    #[error("Apply cancelled")]
    Cancelled,

    /// A value needed by a node could not be resolved after its
    /// dependencies committed.
    #[error("Cannot resolve arguments of {address}: {message}")]
    Unresolved {
        /// Node address.
        address: String,
        /// What could not be resolved.
        message: String,
    },

    /// A saved plan no longer matches the declarations or workspace.
    #[error("Saved plan does not match: {message}")]
    PlanMismatch {
        /// Why the plan was rejected.
        message: String,
    },
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Result type alias for provider operations.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

impl CoreError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if the caller may retry the same operation later
    /// without re-planning (another run holds the lock).
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::State(StateError::LockConflict { .. }))
    }

    /// Returns true if the caller must re-plan against the current
    /// snapshot before retrying.
    #[must_use]
    pub const fn requires_replan(&self) -> bool {
        matches!(
            self,
            Self::State(
                StateError::StaleState { .. }
                    | StateError::LineageMismatch { .. }
                    | StateError::WriteConflict { .. }
            ) | Self::Apply(ApplyError::PlanMismatch { .. })
        )
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }

    /// Creates an invalid reference error.
    #[must_use]
    pub fn invalid_reference(address: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidReference {
            address: address.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid repetition error.
    #[must_use]
    pub fn invalid_repetition(address: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidRepetition {
            address: address.into(),
            message: message.into(),
        }
    }
}

impl StateError {
    /// Creates a backend error.
    #[must_use]
    pub fn backend(backend: &'static str, message: impl Into<String>) -> Self {
        Self::Backend {
            backend,
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates an operation failure.
    #[must_use]
    pub fn failed(
        resource_type: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Failed {
            resource_type: resource_type.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }

    /// Returns true if this is a not-found error.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_conflict_is_retryable() {
        let err = CoreError::State(StateError::LockConflict {
            workspace: String::from("default"),
            lock_id: String::from("abc"),
            holder: String::from("ci"),
            since: String::from("2026-01-01T00:00:00Z"),
        });
        assert!(err.is_retryable());
        assert!(!err.requires_replan());
        assert!(err.to_string().contains("holder: ci"));
    }

    #[test]
    fn test_stale_state_requires_replan() {
        let err = CoreError::State(StateError::StaleState {
            workspace: String::from("default"),
            base_serial: 3,
            current_serial: 4,
        });
        assert!(err.requires_replan());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_cycle_lists_addresses() {
        let err = ConfigError::Cycle {
            addresses: vec![String::from("a.x"), String::from("b.y")],
        };
        assert_eq!(err.to_string(), "Dependency cycle between: a.x, b.y");
    }
}
