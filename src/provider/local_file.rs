//! Built-in `local_file` resource type.
//!
//! Manages plain files below a base directory. Useful for smoke-testing a
//! configuration without any remote system.

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use crate::declaration::Attributes;
use crate::error::{ProviderError, ProviderResult};

use super::contract::{ID_ATTRIBUTE, Provider, RemoteObject};
use super::schema::{AttributeSchema, ResourceSchema};

const RESOURCE_TYPE: &str = "local_file";

/// Provider writing files relative to a base directory.
#[derive(Debug, Clone)]
pub struct LocalFileProvider {
    /// Directory file names are resolved against.
    base_dir: PathBuf,
}

impl LocalFileProvider {
    /// Creates a provider rooted at `base_dir`.
    #[must_use]
    pub fn new(base_dir: &Path) -> Self {
        Self {
            base_dir: base_dir.to_path_buf(),
        }
    }

    fn path_of(&self, filename: &str) -> PathBuf {
        self.base_dir.join(filename)
    }

    fn failed(operation: &str, err: impl std::fmt::Display) -> ProviderError {
        ProviderError::failed(RESOURCE_TYPE, operation, err.to_string())
    }

    fn observed(filename: &str, content: &str) -> Attributes {
        let mut attributes = Attributes::new();
        attributes.insert(ID_ATTRIBUTE.to_string(), Value::from(filename));
        attributes.insert(String::from("filename"), Value::from(filename));
        attributes.insert(String::from("content"), Value::from(content));
        attributes.insert(
            String::from("content_sha256"),
            Value::from(hex::encode(Sha256::digest(content.as_bytes()))),
        );
        attributes
    }

    async fn write(&self, operation: &str, arguments: &Attributes) -> ProviderResult<RemoteObject> {
        let filename = string_argument(arguments, "filename")
            .ok_or_else(|| Self::failed(operation, "filename must be a string"))?;
        let content = string_argument(arguments, "content")
            .ok_or_else(|| Self::failed(operation, "content must be a string"))?;

        let path = self.path_of(filename);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::failed(operation, e))?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| Self::failed(operation, e))?;

        debug!("Wrote {}", path.display());
        Ok(RemoteObject::new(Self::observed(filename, content)))
    }
}

fn string_argument<'a>(arguments: &'a Attributes, name: &str) -> Option<&'a str> {
    arguments.get(name).and_then(Value::as_str)
}

#[async_trait]
impl Provider for LocalFileProvider {
    fn resource_type(&self) -> &str {
        RESOURCE_TYPE
    }

    fn schema(&self) -> ResourceSchema {
        ResourceSchema::new(1)
            .with(ID_ATTRIBUTE, AttributeSchema::computed())
            .with("filename", AttributeSchema::required().force_new())
            .with("content", AttributeSchema::required())
            .with("content_sha256", AttributeSchema::computed())
    }

    async fn validate_config(&self, arguments: &Attributes) -> Vec<String> {
        let mut errors = self.schema().check_arguments(arguments.keys());

        match arguments.get("filename") {
            Some(Value::String(filename)) => {
                let path = Path::new(filename);
                if path.is_absolute() {
                    errors.push(format!("filename '{filename}' must be relative"));
                }
                if path.components().any(|c| matches!(c, Component::ParentDir)) {
                    errors.push(format!("filename '{filename}' must not contain '..'"));
                }
            }
            Some(_) => errors.push(String::from("filename must be a string")),
            None => {}
        }

        if arguments.get("content").is_some_and(|v| !v.is_string()) {
            errors.push(String::from("content must be a string"));
        }

        errors
    }

    async fn read(&self, id: &str, _prior: &Attributes) -> ProviderResult<Option<Attributes>> {
        match tokio::fs::read_to_string(self.path_of(id)).await {
            Ok(content) => Ok(Some(Self::observed(id, &content))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::failed("read", e)),
        }
    }

    async fn create(&self, arguments: &Attributes) -> ProviderResult<RemoteObject> {
        self.write("create", arguments).await
    }

    async fn update(&self, id: &str, arguments: &Attributes) -> ProviderResult<RemoteObject> {
        if string_argument(arguments, "filename") != Some(id) {
            return Err(Self::failed("update", "filename cannot change in place"));
        }
        self.write("update", arguments).await
    }

    async fn delete(&self, id: &str) -> ProviderResult<()> {
        match tokio::fs::remove_file(self.path_of(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ProviderError::not_found(RESOURCE_TYPE, id))
            }
            Err(e) => Err(Self::failed("delete", e)),
        }
    }

    async fn import(&self, id: &str) -> ProviderResult<RemoteObject> {
        self.read(id, &Attributes::new())
            .await?
            .map(RemoteObject::new)
            .ok_or_else(|| ProviderError::not_found(RESOURCE_TYPE, id))
    }
}
