//! Registry resolving resource types to providers.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::declaration::ResourceAddress;
use crate::error::ConfigError;

use super::contract::Provider;
use super::local_file::LocalFileProvider;

/// Maps each resource type to the provider that manages it.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    /// Providers keyed by resource type.
    providers: BTreeMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the providers shipped in this crate.
    /// File-backed providers resolve paths relative to `base_dir`.
    #[must_use]
    pub fn with_builtin(base_dir: &Path) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(LocalFileProvider::new(base_dir)));
        registry
    }

    /// Registers a provider under its resource type, replacing any
    /// previous registration.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers
            .insert(provider.resource_type().to_string(), provider);
    }

    /// Returns the provider for a resource type.
    #[must_use]
    pub fn get(&self, resource_type: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(resource_type).cloned()
    }

    /// Returns the provider for the address's type, or a configuration
    /// error naming the address.
    pub fn resolve(&self, address: &ResourceAddress) -> Result<Arc<dyn Provider>, ConfigError> {
        self.get(&address.resource_type)
            .ok_or_else(|| ConfigError::UnknownResourceType {
                address: address.to_string(),
                resource_type: address.resource_type.clone(),
            })
    }

    /// Registered resource types, sorted.
    pub fn resource_types(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("resource_types", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{InMemoryCloud, ResourceSchema};

    #[test]
    fn test_resolve_unknown_type() {
        let registry = ProviderRegistry::new();
        let err = registry
            .resolve(&ResourceAddress::new("bucket", "logs"))
            .err()
            .expect("should fail");
        assert!(matches!(err, ConfigError::UnknownResourceType { .. }));
    }

    #[test]
    fn test_register_and_list() {
        let cloud = InMemoryCloud::new();
        let mut registry = ProviderRegistry::with_builtin(Path::new("."));
        registry.register(cloud.provider("bucket", ResourceSchema::new(0)));
        let types: Vec<_> = registry.resource_types().collect();
        assert_eq!(types, vec!["bucket", "local_file"]);
        assert!(registry.get("bucket").is_some());
    }
}
