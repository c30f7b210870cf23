//! In-memory simulated remote system.
//!
//! `InMemoryCloud` stores objects for any number of resource types and
//! hands out one `Provider` per type. It records every call, can inject
//! failures and latency, and supports out-of-band edits so drift can be
//! simulated. Scenario tests and dry runs use it in place of a real
//! remote system.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use crate::declaration::Attributes;
use crate::error::{ProviderError, ProviderResult};

use super::contract::{ID_ATTRIBUTE, Provider, RemoteObject};
use super::schema::ResourceSchema;

/// Provider operations, as recorded in the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Read.
    Read,
    /// Create.
    Create,
    /// Update.
    Update,
    /// Delete.
    Delete,
    /// Import.
    Import,
}

/// One recorded provider call.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderCall {
    /// Resource type the call was made for.
    pub resource_type: String,
    /// Operation.
    pub operation: Operation,
    /// Object id (for read/update/delete/import).
    pub id: Option<String>,
    /// Arguments (for create/update).
    pub arguments: Option<Attributes>,
}

/// Makes an operation fail when an attribute has a given value.
#[derive(Debug, Clone)]
struct FailureRule {
    operation: Operation,
    resource_type: String,
    attribute: String,
    value: Value,
}

#[derive(Debug, Default)]
struct CloudInner {
    objects: HashMap<String, (String, Attributes)>,
    next_id: u64,
    calls: Vec<ProviderCall>,
    failures: Vec<FailureRule>,
}

/// Shared in-memory remote system.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCloud {
    inner: Arc<Mutex<CloudInner>>,
    latency: Option<Duration>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

/// Provider for one resource type backed by an `InMemoryCloud`.
#[derive(Debug)]
struct InMemoryProvider {
    cloud: InMemoryCloud,
    resource_type: String,
    schema: ResourceSchema,
}

/// Tracks concurrent mutations for `max_in_flight`.
struct InFlight<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize, max: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(now, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl InMemoryCloud {
    /// Creates an empty cloud.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds artificial latency to every mutation.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Returns a provider for `resource_type` with the given schema.
    #[must_use]
    pub fn provider(&self, resource_type: &str, schema: ResourceSchema) -> Arc<dyn Provider> {
        Arc::new(InMemoryProvider {
            cloud: self.clone(),
            resource_type: resource_type.to_string(),
            schema,
        })
    }

    /// Makes `operation` on `resource_type` fail whenever `attribute`
    /// equals `value` (in the arguments for create/update, in the stored
    /// object otherwise).
    pub fn fail_when(&self, operation: Operation, resource_type: &str, attribute: &str, value: Value) {
        self.lock().failures.push(FailureRule {
            operation,
            resource_type: resource_type.to_string(),
            attribute: attribute.to_string(),
            value,
        });
    }

    /// Removes every failure rule.
    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Returns the call log.
    #[must_use]
    pub fn calls(&self) -> Vec<ProviderCall> {
        self.lock().calls.clone()
    }

    /// Returns mutating calls only (create, update, delete).
    #[must_use]
    pub fn mutations(&self) -> Vec<ProviderCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c.operation, Operation::Create | Operation::Update | Operation::Delete))
            .collect()
    }

    /// Clears the call log.
    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Returns a stored object's attributes.
    #[must_use]
    pub fn object(&self, id: &str) -> Option<Attributes> {
        self.lock().objects.get(id).map(|(_, attrs)| attrs.clone())
    }

    /// Returns every stored object of a resource type.
    #[must_use]
    pub fn objects_of(&self, resource_type: &str) -> Vec<Attributes> {
        let inner = self.lock();
        let mut objects: Vec<_> = inner
            .objects
            .values()
            .filter(|(t, _)| t == resource_type)
            .map(|(_, attrs)| attrs.clone())
            .collect();
        objects.sort_by_key(|attrs| attrs.get(ID_ATTRIBUTE).map(ToString::to_string));
        objects
    }

    /// Changes an attribute behind the engine's back.
    pub fn set_attribute(&self, id: &str, attribute: &str, value: Value) -> bool {
        let mut inner = self.lock();
        match inner.objects.get_mut(id) {
            Some((_, attrs)) => {
                attrs.insert(attribute.to_string(), value);
                true
            }
            None => false,
        }
    }

    /// Deletes an object behind the engine's back.
    pub fn remove_object(&self, id: &str) -> bool {
        self.lock().objects.remove(id).is_some()
    }

    /// Inserts a pre-existing object (for import) and returns its id.
    pub fn insert_object(&self, resource_type: &str, mut attributes: Attributes) -> String {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = format!("{resource_type}-{}", inner.next_id);
        attributes.insert(ID_ATTRIBUTE.to_string(), Value::String(id.clone()));
        inner
            .objects
            .insert(id.clone(), (resource_type.to_string(), attributes));
        id
    }

    /// Highest number of mutations observed running at the same time.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, CloudInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl CloudInner {
    fn record(&mut self, resource_type: &str, operation: Operation, id: Option<&str>, arguments: Option<&Attributes>) {
        self.calls.push(ProviderCall {
            resource_type: resource_type.to_string(),
            operation,
            id: id.map(String::from),
            arguments: arguments.cloned(),
        });
    }

    fn check_failure(&self, resource_type: &str, operation: Operation, attributes: &Attributes) -> ProviderResult<()> {
        let triggered = self.failures.iter().find(|rule| {
            rule.operation == operation
                && rule.resource_type == resource_type
                && attributes.get(&rule.attribute) == Some(&rule.value)
        });

        match triggered {
            Some(rule) => Err(ProviderError::failed(
                resource_type,
                format!("{operation:?}").to_lowercase(),
                format!("injected failure ({} = {})", rule.attribute, rule.value),
            )),
            None => Ok(()),
        }
    }
}

impl InMemoryProvider {
    /// Fills computed attributes that were not declared.
    fn computed_defaults(&self, id: &str, attributes: &mut Attributes) {
        for name in self.schema.computed_attributes() {
            if name != ID_ATTRIBUTE && !attributes.contains_key(name) {
                attributes.insert(name.to_string(), Value::String(format!("{id}:{name}")));
            }
        }
    }
}

#[async_trait]
impl Provider for InMemoryProvider {
    fn resource_type(&self) -> &str {
        &self.resource_type
    }

    fn schema(&self) -> ResourceSchema {
        self.schema.clone()
    }

    async fn read(&self, id: &str, _prior: &Attributes) -> ProviderResult<Option<Attributes>> {
        let mut inner = self.cloud.lock();
        inner.record(&self.resource_type, Operation::Read, Some(id), None);
        match inner.objects.get(id) {
            Some((_, attrs)) => {
                inner.check_failure(&self.resource_type, Operation::Read, attrs)?;
                Ok(Some(attrs.clone()))
            }
            None => Ok(None),
        }
    }

    async fn create(&self, arguments: &Attributes) -> ProviderResult<RemoteObject> {
        let _guard = InFlight::enter(&self.cloud.in_flight, &self.cloud.max_in_flight);
        {
            let mut inner = self.cloud.lock();
            inner.record(&self.resource_type, Operation::Create, None, Some(arguments));
            inner.check_failure(&self.resource_type, Operation::Create, arguments)?;
        }
        self.cloud.simulate_latency().await;

        let mut inner = self.cloud.lock();
        inner.next_id += 1;
        let id = format!("{}-{}", self.resource_type, inner.next_id);

        let mut attributes = arguments.clone();
        attributes.insert(ID_ATTRIBUTE.to_string(), Value::String(id.clone()));
        self.computed_defaults(&id, &mut attributes);

        inner
            .objects
            .insert(id.clone(), (self.resource_type.clone(), attributes.clone()));
        debug!("Created {} {id}", self.resource_type);

        Ok(RemoteObject {
            attributes,
            private: Some(format!("created-by:{}", self.resource_type)),
        })
    }

    async fn update(&self, id: &str, arguments: &Attributes) -> ProviderResult<RemoteObject> {
        let _guard = InFlight::enter(&self.cloud.in_flight, &self.cloud.max_in_flight);
        {
            let mut inner = self.cloud.lock();
            inner.record(&self.resource_type, Operation::Update, Some(id), Some(arguments));
            inner.check_failure(&self.resource_type, Operation::Update, arguments)?;
        }
        self.cloud.simulate_latency().await;

        let mut inner = self.cloud.lock();
        let Some((_, existing)) = inner.objects.get_mut(id) else {
            return Err(ProviderError::not_found(&self.resource_type, id));
        };

        let mut attributes: Attributes = existing
            .iter()
            .filter(|(name, _)| self.schema.is_computed_only(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        attributes.extend(arguments.iter().map(|(k, v)| (k.clone(), v.clone())));
        attributes.insert(ID_ATTRIBUTE.to_string(), Value::String(id.to_string()));
        existing.clone_from(&attributes);

        Ok(RemoteObject::new(attributes))
    }

    async fn delete(&self, id: &str) -> ProviderResult<()> {
        let _guard = InFlight::enter(&self.cloud.in_flight, &self.cloud.max_in_flight);
        {
            let mut inner = self.cloud.lock();
            inner.record(&self.resource_type, Operation::Delete, Some(id), None);
            if let Some((_, attrs)) = inner.objects.get(id) {
                inner.check_failure(&self.resource_type, Operation::Delete, attrs)?;
            }
        }
        self.cloud.simulate_latency().await;

        if self.cloud.lock().objects.remove(id).is_some() {
            Ok(())
        } else {
            Err(ProviderError::not_found(&self.resource_type, id))
        }
    }

    async fn import(&self, id: &str) -> ProviderResult<RemoteObject> {
        let mut inner = self.cloud.lock();
        inner.record(&self.resource_type, Operation::Import, Some(id), None);
        match inner.objects.get(id) {
            Some((resource_type, attrs)) if *resource_type == self.resource_type => {
                Ok(RemoteObject::new(attrs.clone()))
            }
            _ => Err(ProviderError::not_found(&self.resource_type, id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::AttributeSchema;

    fn bucket_schema() -> ResourceSchema {
        ResourceSchema::new(1)
            .with("id", AttributeSchema::computed())
            .with("arn", AttributeSchema::computed())
            .with("name", AttributeSchema::required())
    }

    fn args(name: &str) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert(String::from("name"), Value::from(name));
        attrs
    }

    #[tokio::test]
    async fn test_create_read_update_delete() {
        let cloud = InMemoryCloud::new();
        let provider = cloud.provider("bucket", bucket_schema());

        let created = provider.create(&args("logs")).await.expect("create");
        let id = created.attributes["id"].as_str().expect("id").to_string();
        assert_eq!(created.attributes["arn"], Value::from(format!("{id}:arn")));

        let updated = provider.update(&id, &args("logs-2")).await.expect("update");
        assert_eq!(updated.attributes["name"], Value::from("logs-2"));
        assert_eq!(updated.attributes["arn"], created.attributes["arn"]);

        let read = provider.read(&id, &Attributes::new()).await.expect("read");
        assert_eq!(read, Some(updated.attributes));

        provider.delete(&id).await.expect("delete");
        assert_eq!(provider.read(&id, &Attributes::new()).await.expect("read"), None);
        assert!(provider.delete(&id).await.expect_err("gone").is_not_found());
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let cloud = InMemoryCloud::new();
        let provider = cloud.provider("bucket", bucket_schema());
        cloud.fail_when(Operation::Create, "bucket", "name", Value::from("bad"));

        assert!(provider.create(&args("bad")).await.is_err());
        assert!(provider.create(&args("good")).await.is_ok());
        assert_eq!(cloud.objects_of("bucket").len(), 1);
        assert_eq!(cloud.mutations().len(), 2);
    }

    #[tokio::test]
    async fn test_import_existing_object() {
        let cloud = InMemoryCloud::new();
        let provider = cloud.provider("bucket", bucket_schema());
        let id = cloud.insert_object("bucket", args("legacy"));

        let imported = provider.import(&id).await.expect("import");
        assert_eq!(imported.attributes["name"], Value::from("legacy"));
        assert!(provider.import("bucket-999").await.is_err());
    }
}
