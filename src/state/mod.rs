//! State management module.
//!
//! This module provides persistent, versioned snapshots of managed
//! resource instances per workspace, protected by backend-side locks and
//! serial/lineage checks.

mod backend;
mod local;
mod lock;
mod memory;
mod s3;
mod store;
mod types;
mod workspace;

pub use backend::{Backend, LockAttempt, PutCondition, StoredObject};
pub use local::{LocalBackend, STATE_DIR};
pub use lock::{LockInfo, generate_holder_id};
pub use memory::InMemoryBackend;
pub use s3::S3Backend;
pub use store::StateStore;
pub use types::{FORMAT_VERSION, OutputState, ResourceInstanceState, StateSnapshot};
pub use workspace::{
    DEFAULT_WORKSPACE, Workspace, is_valid_workspace_name, read_selection, write_selection,
};
