//! Object store contract used by the pipeline.
//!
//! The pipeline never talks to S3 directly; it goes through [`ObjectStore`]
//! so that jobs can run against in-memory doubles in tests.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by an object store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Object store request failed: {0}")]
    Request(String),

    #[error("{object} returned more than the {limit} bytes allowed")]
    LimitExceeded { object: String, limit: u64 },

    #[error("Local I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A `{container, key}` pair addressing one blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectLocator {
    /// Bucket / container name
    pub container: String,
    /// Object key within the container
    pub key: String,
}

impl ObjectLocator {
    pub fn new(container: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            key: key.into(),
        }
    }

    /// File name component of the key (`raw/clip.mp4` -> `clip.mp4`)
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }

    /// File name without its extension (`raw/clip.mp4` -> `clip`)
    pub fn file_stem(&self) -> &str {
        let name = self.file_name();
        match name.rfind('.') {
            Some(pos) if pos > 0 => &name[..pos],
            _ => name,
        }
    }
}

impl fmt::Display for ObjectLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.container, self.key)
    }
}

/// Per-key result of a batch delete. Keys not listed in `failed` were deleted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeleteOutcome {
    /// `(key, reason)` for every key the backend refused to delete
    pub failed: Vec<(String, String)>,
}

impl DeleteOutcome {
    pub fn failed_keys(&self) -> impl Iterator<Item = &str> {
        self.failed.iter().map(|(key, _)| key.as_str())
    }
}

/// Keyed blob storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Size in bytes, without transferring the body.
    async fn head(&self, object: &ObjectLocator) -> Result<u64, StoreError>;

    /// Full object body.
    async fn get(&self, object: &ObjectLocator) -> Result<Bytes, StoreError>;

    /// Write at most `limit` bytes of the object body to `dest`, returning the
    /// bytes written. A longer body fails with [`StoreError::LimitExceeded`]
    /// and leaves no file behind.
    async fn download_to(
        &self,
        object: &ObjectLocator,
        dest: &Path,
        limit: u64,
    ) -> Result<u64, StoreError> {
        let body = self.get(object).await?;
        if body.len() as u64 > limit {
            return Err(StoreError::LimitExceeded {
                object: object.to_string(),
                limit,
            });
        }
        tokio::fs::write(dest, &body).await?;
        Ok(body.len() as u64)
    }

    /// Store `body` under `object`.
    async fn put(
        &self,
        object: &ObjectLocator,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), StoreError>;

    /// Delete up to one backend batch of keys from `container`.
    ///
    /// `Err` means the whole request failed; per-key refusals are reported
    /// in the [`DeleteOutcome`].
    async fn delete_batch(
        &self,
        container: &str,
        keys: &[String],
    ) -> Result<DeleteOutcome, StoreError>;

    /// Time-limited GET URL for `object`.
    async fn presign(&self, object: &ObjectLocator, ttl: Duration) -> Result<String, StoreError>;
}
