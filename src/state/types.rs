//! Persisted state types.
//!
//! A snapshot records every resource instance the engine manages in one
//! workspace, plus root outputs. The JSON encoding of these types is the
//! stable on-disk format.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::declaration::{Attributes, InstanceKey, ModulePath, ResourceAddress};
use crate::error::StateError;

/// Current version of the snapshot format.
pub const FORMAT_VERSION: u32 = 1;

/// The persisted record of one workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Snapshot format version.
    pub version: u32,
    /// Identity of this state history. Set once, never changed.
    pub lineage: String,
    /// Incremented on every successful write.
    pub serial: u64,
    /// Resource instances, sorted by address.
    #[serde(default)]
    pub resources: Vec<ResourceInstanceState>,
    /// Root module outputs.
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputState>,
}

/// A recorded root output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputState {
    /// Output value.
    pub value: Value,
    /// Hidden in rendered output.
    #[serde(default)]
    pub sensitive: bool,
}

/// One managed remote object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceInstanceState {
    /// Module instance path.
    #[serde(default, skip_serializing_if = "ModulePath::is_root")]
    pub module: ModulePath,
    /// Resource type.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Resource name.
    pub name: String,
    /// Instance key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_key: Option<InstanceKey>,
    /// Set while the object is an old copy awaiting deletion after a
    /// create-before-destroy replacement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deposed: Option<String>,
    /// Provider schema version the attributes were written with.
    pub schema_version: u64,
    /// Arguments as declared when the object was last written.
    #[serde(default)]
    pub arguments: Attributes,
    /// Attributes as last observed from the provider.
    pub attributes: Attributes,
    /// Names of sensitive attributes.
    #[serde(default)]
    pub sensitive_attributes: BTreeSet<String>,
    /// Opaque provider-private data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<String>,
    /// Instances this one depended on when last written.
    #[serde(default)]
    pub dependencies: Vec<ResourceAddress>,
}

impl StateSnapshot {
    /// Creates an empty snapshot with a fresh lineage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: FORMAT_VERSION,
            lineage: Uuid::new_v4().to_string(),
            serial: 0,
            resources: Vec::new(),
            outputs: BTreeMap::new(),
        }
    }

    /// Decodes a snapshot.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StateError> {
        let version: VersionProbe = serde_json::from_slice(bytes)
            .map_err(|e| StateError::corrupted(format!("Failed to parse state: {e}")))?;
        if version.version > FORMAT_VERSION {
            return Err(StateError::UnsupportedVersion {
                found: version.version,
                supported: FORMAT_VERSION,
            });
        }

        let mut snapshot: Self = serde_json::from_slice(bytes)
            .map_err(|e| StateError::corrupted(format!("Failed to parse state: {e}")))?;
        snapshot.sort();
        Ok(snapshot)
    }

    /// Encodes the snapshot as pretty JSON.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StateError> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))
    }

    /// Current (non-deposed) instances.
    pub fn current(&self) -> impl Iterator<Item = &ResourceInstanceState> {
        self.resources.iter().filter(|r| r.deposed.is_none())
    }

    /// Deposed instances.
    pub fn deposed(&self) -> impl Iterator<Item = &ResourceInstanceState> {
        self.resources.iter().filter(|r| r.deposed.is_some())
    }

    /// The current instance at `address`.
    #[must_use]
    pub fn instance(&self, address: &ResourceAddress) -> Option<&ResourceInstanceState> {
        self.current().find(|r| r.is_at(address))
    }

    /// Mutable access to the current instance at `address`.
    pub fn instance_mut(&mut self, address: &ResourceAddress) -> Option<&mut ResourceInstanceState> {
        self.resources
            .iter_mut()
            .find(|r| r.deposed.is_none() && r.is_at(address))
    }

    /// Inserts or replaces the instance with the same address and deposed
    /// key.
    pub fn upsert(&mut self, instance: ResourceInstanceState) {
        let address = instance.address();
        match self
            .resources
            .iter_mut()
            .find(|r| r.deposed == instance.deposed && r.is_at(&address))
        {
            Some(existing) => *existing = instance,
            None => {
                self.resources.push(instance);
                self.sort();
            }
        }
    }

    /// Removes the current instance at `address`.
    pub fn remove(&mut self, address: &ResourceAddress) -> Option<ResourceInstanceState> {
        let position = self
            .resources
            .iter()
            .position(|r| r.deposed.is_none() && r.is_at(address))?;
        Some(self.resources.remove(position))
    }

    /// Marks the current instance at `address` as deposed under `key`.
    pub fn depose(&mut self, address: &ResourceAddress, key: &str) -> bool {
        match self.instance_mut(address) {
            Some(instance) => {
                instance.deposed = Some(key.to_string());
                self.sort();
                true
            }
            None => false,
        }
    }

    /// Removes a deposed instance.
    pub fn remove_deposed(&mut self, address: &ResourceAddress, key: &str) -> Option<ResourceInstanceState> {
        let position = self
            .resources
            .iter()
            .position(|r| r.deposed.as_deref() == Some(key) && r.is_at(address))?;
        Some(self.resources.remove(position))
    }

    fn sort(&mut self) {
        self.resources
            .sort_by(|a, b| (a.address(), &a.deposed).cmp(&(b.address(), &b.deposed)));
    }
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads only the format version, so newer snapshots are rejected with a
/// clear error instead of a parse failure.
#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}

impl ResourceInstanceState {
    /// Creates a record for `address`.
    #[must_use]
    pub fn new(address: &ResourceAddress, schema_version: u64, attributes: Attributes) -> Self {
        Self {
            module: address.module.clone(),
            resource_type: address.resource_type.clone(),
            name: address.name.clone(),
            index_key: address.key.clone(),
            deposed: None,
            schema_version,
            arguments: Attributes::new(),
            attributes,
            sensitive_attributes: BTreeSet::new(),
            private: None,
            dependencies: Vec::new(),
        }
    }

    /// The instance's address.
    #[must_use]
    pub fn address(&self) -> ResourceAddress {
        ResourceAddress {
            module: self.module.clone(),
            resource_type: self.resource_type.clone(),
            name: self.name.clone(),
            key: self.index_key.clone(),
        }
    }

    /// Moves the record to a new address.
    pub fn set_address(&mut self, address: &ResourceAddress) {
        self.module = address.module.clone();
        self.resource_type = address.resource_type.clone();
        self.name = address.name.clone();
        self.index_key = address.key.clone();
    }

    /// Address with the deposed key appended, unique across the snapshot.
    #[must_use]
    pub fn display_address(&self) -> String {
        match &self.deposed {
            Some(key) => format!("{} (deposed {key})", self.address()),
            None => self.address().to_string(),
        }
    }

    fn is_at(&self, address: &ResourceAddress) -> bool {
        self.module == address.module
            && self.resource_type == address.resource_type
            && self.name == address.name
            && self.index_key == address.key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(address: &str) -> ResourceInstanceState {
        let address: ResourceAddress = address.parse().expect("address");
        let mut attributes = Attributes::new();
        attributes.insert(String::from("id"), Value::from(address.to_string()));
        ResourceInstanceState::new(&address, 1, attributes)
    }

    #[test]
    fn test_upsert_keeps_sorted() {
        let mut snapshot = StateSnapshot::new();
        snapshot.upsert(instance("instance.web"));
        snapshot.upsert(instance("bucket.logs"));
        snapshot.upsert(instance("bucket.logs"));
        let addresses: Vec<String> = snapshot.current().map(|r| r.address().to_string()).collect();
        assert_eq!(addresses, vec!["bucket.logs", "instance.web"]);
    }

    #[test]
    fn test_depose_and_remove() {
        let mut snapshot = StateSnapshot::new();
        let address: ResourceAddress = "bucket.logs".parse().expect("address");
        snapshot.upsert(instance("bucket.logs"));
        assert!(snapshot.depose(&address, "abcd1234"));
        assert!(snapshot.instance(&address).is_none());
        snapshot.upsert(instance("bucket.logs"));
        assert_eq!(snapshot.resources.len(), 2);
        assert!(snapshot.remove_deposed(&address, "abcd1234").is_some());
        assert!(snapshot.remove(&address).is_some());
        assert!(snapshot.resources.is_empty());
    }

    #[test]
    fn test_format_round_trip_and_version_check() {
        let mut snapshot = StateSnapshot::new();
        snapshot.upsert(instance(r#"module.net[0].bucket.logs["eu"]"#));
        let bytes = snapshot.to_bytes().expect("encode");
        let decoded = StateSnapshot::from_bytes(&bytes).expect("decode");
        assert_eq!(decoded, snapshot);

        let future = br#"{"version": 99, "lineage": "x", "serial": 1}"#;
        assert!(matches!(
            StateSnapshot::from_bytes(future),
            Err(StateError::UnsupportedVersion { found: 99, .. })
        ));
        assert!(matches!(
            StateSnapshot::from_bytes(b"not json"),
            Err(StateError::Corrupted { .. })
        ));
    }
}
