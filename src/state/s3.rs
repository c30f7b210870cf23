//! S3-based state backend.
//!
//! Remote state in AWS S3 (or a compatible service) for team use. Lock
//! records are written with `If-None-Match: *` and snapshots with
//! `If-Match: <etag>`, so contention is resolved by the service.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use tracing::{debug, info};

use crate::error::{Result, StateError};

use super::backend::{Backend, LockAttempt, PutCondition, StoredObject};
use super::lock::LockInfo;

const BACKEND: &str = "s3";

/// HTTP statuses S3 returns when a conditional write loses.
const PRECONDITION_FAILED: u16 = 412;
const CONDITIONAL_CONFLICT: u16 = 409;

/// S3-based state backend.
#[derive(Debug, Clone)]
pub struct S3Backend {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix.
    prefix: String,
}

fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| {
            let p = p.trim_matches('/');
            if p.is_empty() {
                String::new()
            } else {
                format!("{p}/")
            }
        })
        .unwrap_or_default()
}

impl S3Backend {
    /// Creates a new S3 backend from the ambient AWS configuration.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Self {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Self::with_client(Client::new(&config), bucket, prefix)
    }

    /// Creates a new S3 backend with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
        }
    }

    /// Gets the full S3 key for a backend key.
    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    fn error(message: String) -> StateError {
        StateError::backend(BACKEND, message)
    }

    async fn put_raw(&self, key: &str, bytes: Vec<u8>, condition: &PutCondition) -> Result<std::result::Result<String, u16>> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(self.key(key))
            .body(bytes.into())
            .content_type("application/json");

        request = match condition {
            PutCondition::Unconditional => request,
            PutCondition::IfAbsent => request.if_none_match("*"),
            PutCondition::IfVersion(etag) => request.if_match(etag),
        };

        match request.send().await {
            Ok(output) => Ok(Ok(output.e_tag().unwrap_or_default().to_string())),
            Err(sdk_err) => {
                let status = sdk_err.raw_response().map(|r| r.status().as_u16());
                match status {
                    Some(code @ (PRECONDITION_FAILED | CONDITIONAL_CONFLICT)) => Ok(Err(code)),
                    _ => Err(Self::error(format!("S3 put error: {sdk_err}")).into()),
                }
            }
        }
    }
}

#[async_trait]
impl Backend for S3Backend {
    async fn get(&self, key: &str) -> Result<Option<StoredObject>> {
        debug!("Reading s3://{}/{}", self.bucket, self.key(key));

        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.key(key))
            .send()
            .await;

        match result {
            Ok(response) => {
                let version = response.e_tag().unwrap_or_default().to_string();
                let bytes = response
                    .body
                    .collect()
                    .await
                    .map_err(|e| Self::error(format!("Failed to read S3 object: {e}")))?;
                Ok(Some(StoredObject {
                    bytes: bytes.to_vec(),
                    version,
                }))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(Self::error(format!("S3 get error: {service_err}")).into())
                }
            }
        }
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, condition: PutCondition) -> Result<String> {
        info!("Writing s3://{}/{}", self.bucket, self.key(key));
        match self.put_raw(key, bytes, &condition).await? {
            Ok(version) => Ok(version),
            Err(status) => {
                debug!("Conditional put on {key} rejected with HTTP {status}");
                Err(StateError::WriteConflict {
                    key: key.to_string(),
                }
                .into())
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.key(key))
            .send()
            .await
            .map_err(|e| Self::error(format!("S3 delete error: {e}")))?;

        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(self.key(prefix))
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| Self::error(format!("S3 list error: {e}")))?;

            for object in response.contents() {
                if let Some(key) = object.key().and_then(|k| k.strip_prefix(&self.prefix)) {
                    keys.push(key.to_string());
                }
            }

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn lock_create(&self, key: &str, lock: &LockInfo) -> Result<LockAttempt> {
        let content = serde_json::to_vec_pretty(lock)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        // A lock released between our failed create and the read is retried.
        for _ in 0..3 {
            if self.put_raw(key, content.clone(), &PutCondition::IfAbsent).await?.is_ok() {
                return Ok(LockAttempt::Acquired);
            }
            if let Some(existing) = self.lock_read(key).await? {
                return Ok(LockAttempt::Held(existing));
            }
        }

        Err(Self::error(format!("Lock {key} is contended")).into())
    }

    async fn lock_read(&self, key: &str) -> Result<Option<LockInfo>> {
        let Some(object) = self.get(key).await? else {
            return Ok(None);
        };
        let lock = serde_json::from_slice(&object.bytes)
            .map_err(|e| StateError::corrupted(format!("Failed to parse lock: {e}")))?;
        Ok(Some(lock))
    }

    async fn lock_delete(&self, key: &str, lock_id: &str) -> Result<bool> {
        match self.lock_read(key).await? {
            Some(existing) if existing.id == lock_id => {
                self.delete(key).await?;
                Ok(true)
            }
            Some(existing) => {
                debug!("Lock ID mismatch: expected {lock_id}, found {}", existing.id);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    fn backend_type(&self) -> &'static str {
        BACKEND
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_normalization() {
        assert_eq!(normalize_prefix(None), "");
        assert_eq!(normalize_prefix(Some("/")), "");
        assert_eq!(normalize_prefix(Some("/team/state/")), "team/state/");
    }
}
