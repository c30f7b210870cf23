//! The provider contract.
//!
//! A provider translates abstract create/read/update/delete requests for one
//! resource type into operations against a concrete remote system. The
//! engine never retries a provider mutation; retries and timeouts belong to
//! the provider.

use async_trait::async_trait;
use serde_json::Value;

use crate::declaration::Attributes;
use crate::error::ProviderResult;

use super::schema::ResourceSchema;

/// Attribute that carries the remote object identifier.
pub const ID_ATTRIBUTE: &str = "id";

/// An object as returned by a provider mutation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteObject {
    /// Observed attributes, including `id`.
    pub attributes: Attributes,
    /// Opaque provider-private data persisted with the instance.
    pub private: Option<String>,
}

/// Operations every resource-type provider implements.
#[async_trait]
pub trait Provider: Send + Sync {
    /// The resource type this provider manages.
    fn resource_type(&self) -> &str;

    /// The resource type's schema.
    fn schema(&self) -> ResourceSchema;

    /// Validates fully-known arguments. Returns human-readable errors.
    async fn validate_config(&self, arguments: &Attributes) -> Vec<String> {
        self.schema().check_arguments(arguments.keys())
    }

    /// Reads the live attributes of an object. `Ok(None)` means the object
    /// no longer exists.
    async fn read(&self, id: &str, prior: &Attributes) -> ProviderResult<Option<Attributes>>;

    /// Creates an object from the given arguments.
    async fn create(&self, arguments: &Attributes) -> ProviderResult<RemoteObject>;

    /// Updates an existing object in place.
    async fn update(&self, id: &str, arguments: &Attributes) -> ProviderResult<RemoteObject>;

    /// Deletes an object.
    async fn delete(&self, id: &str) -> ProviderResult<()>;

    /// Adopts an existing object by identifier.
    async fn import(&self, id: &str) -> ProviderResult<RemoteObject>;
}

/// Extracts the remote identifier from an attribute map.
#[must_use]
pub fn object_id(attributes: &Attributes) -> Option<String> {
    match attributes.get(ID_ATTRIBUTE)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl RemoteObject {
    /// Wraps attributes without private data.
    #[must_use]
    pub const fn new(attributes: Attributes) -> Self {
        Self {
            attributes,
            private: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id() {
        let mut attrs = Attributes::new();
        assert_eq!(object_id(&attrs), None);
        attrs.insert(String::from("id"), Value::from("b-1"));
        assert_eq!(object_id(&attrs).as_deref(), Some("b-1"));
        attrs.insert(String::from("id"), Value::from(42));
        assert_eq!(object_id(&attrs).as_deref(), Some("42"));
    }
}
