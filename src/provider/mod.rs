//! Provider collaborators.
//!
//! Each resource type is managed by a provider implementing a fixed
//! contract. Providers are resolved through a registry when the graph is
//! built, never looked up dynamically during apply.

mod contract;
mod local_file;
mod memory;
mod registry;
mod schema;

pub use contract::{ID_ATTRIBUTE, Provider, RemoteObject, object_id};
pub use local_file::LocalFileProvider;
pub use memory::{InMemoryCloud, Operation, ProviderCall};
pub use registry::ProviderRegistry;
pub use schema::{AttributeSchema, ResourceSchema};
