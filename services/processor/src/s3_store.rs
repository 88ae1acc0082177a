use crate::config::{StorageConfig, MAX_DELETE_BATCH};
use crate::object_store::{DeleteOutcome, ObjectLocator, ObjectStore, StoreError};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Shared AWS configuration for every client the service builds.
pub async fn load_sdk_config(config: &StorageConfig) -> SdkConfig {
    aws_config::defaults(BehaviorVersion::latest())
        .region(aws_config::Region::new(config.region.clone()))
        .load()
        .await
}

/// S3-backed object store
pub struct S3Store {
    client: S3Client,
}

impl S3Store {
    pub fn new(sdk_config: &SdkConfig, config: &StorageConfig) -> Self {
        let mut s3_config_builder = S3ConfigBuilder::from(sdk_config);

        // MinIO / LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            region = %config.region,
            endpoint = ?config.endpoint_url,
            "S3 store initialized"
        );

        Self { client }
    }
}

fn request_error<E: std::error::Error>(err: E) -> StoreError {
    StoreError::Request(DisplayErrorContext(err).to_string())
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn head(&self, object: &ObjectLocator) -> Result<u64, StoreError> {
        match self
            .client
            .head_object()
            .bucket(&object.container)
            .key(&object.key)
            .send()
            .await
        {
            Ok(resp) => Ok(resp.content_length().unwrap_or_default().max(0) as u64),
            Err(e) => {
                if e.as_service_error().map(|e| e.is_not_found()).unwrap_or(false) {
                    Err(StoreError::NotFound(object.to_string()))
                } else {
                    Err(request_error(e))
                }
            }
        }
    }

    async fn get(&self, object: &ObjectLocator) -> Result<Bytes, StoreError> {
        let resp = self
            .client
            .get_object()
            .bucket(&object.container)
            .key(&object.key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map(|e| e.is_no_such_key()).unwrap_or(false) {
                    StoreError::NotFound(object.to_string())
                } else {
                    request_error(e)
                }
            })?;

        let body = resp.body.collect().await.map_err(request_error)?;
        Ok(body.into_bytes())
    }

    #[instrument(skip(self), fields(object = %object))]
    async fn download_to(
        &self,
        object: &ObjectLocator,
        dest: &Path,
        limit: u64,
    ) -> Result<u64, StoreError> {
        let resp = self
            .client
            .get_object()
            .bucket(&object.container)
            .key(&object.key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map(|e| e.is_no_such_key()).unwrap_or(false) {
                    StoreError::NotFound(object.to_string())
                } else {
                    request_error(e)
                }
            })?;

        let mut body = resp.body;
        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = body.try_next().await.map_err(request_error)? {
            written += chunk.len() as u64;
            if written > limit {
                drop(file);
                if let Err(e) = tokio::fs::remove_file(dest).await {
                    warn!(dest = %dest.display(), error = %e, "Failed to remove partial download");
                }
                return Err(StoreError::LimitExceeded {
                    object: object.to_string(),
                    limit,
                });
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        debug!(bytes = written, dest = %dest.display(), "Downloaded object");
        Ok(written)
    }

    async fn put(&self, object: &ObjectLocator, body: Bytes, content_type: &str) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(&object.container)
            .key(&object.key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .map_err(request_error)?;
        Ok(())
    }

    async fn delete_batch(&self, container: &str, keys: &[String]) -> Result<DeleteOutcome, StoreError> {
        if keys.is_empty() {
            return Ok(DeleteOutcome::default());
        }
        if keys.len() > MAX_DELETE_BATCH {
            return Err(StoreError::Request(format!(
                "{} keys exceeds the {} key batch limit",
                keys.len(),
                MAX_DELETE_BATCH
            )));
        }

        let objects = keys
            .iter()
            .map(|key| ObjectIdentifier::builder().key(key).build())
            .collect::<Result<Vec<_>, _>>()
            .map_err(request_error)?;
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(true)
            .build()
            .map_err(request_error)?;

        let resp = self
            .client
            .delete_objects()
            .bucket(container)
            .delete(delete)
            .send()
            .await
            .map_err(request_error)?;

        let failed = resp
            .errors()
            .iter()
            .map(|e| {
                let reason = e.message().or(e.code()).unwrap_or("unknown error");
                (e.key().unwrap_or_default().to_string(), reason.to_string())
            })
            .collect();

        Ok(DeleteOutcome { failed })
    }

    async fn presign(&self, object: &ObjectLocator, ttl: Duration) -> Result<String, StoreError> {
        let presigning = PresigningConfig::expires_in(ttl).map_err(request_error)?;
        let request = self
            .client
            .get_object()
            .bucket(&object.container)
            .key(&object.key)
            .presigned(presigning)
            .await
            .map_err(request_error)?;
        Ok(request.uri().to_string())
    }
}

/// Key for frame `index` of a job: `{prefix}/{job_id}/{stem}_frame_{index:05}.jpg`.
pub fn frame_key(prefix: &str, job_id: Uuid, video_stem: &str, index: u64) -> String {
    let prefix = prefix.trim_matches('/');
    let name = format!("{}_frame_{:05}.jpg", sanitize_path_component(video_stem), index);
    if prefix.is_empty() {
        format!("{}/{}", job_id, name)
    } else {
        format!("{}/{}/{}", prefix, job_id, name)
    }
}

/// Sanitize a path component to prevent path traversal
fn sanitize_path_component(component: &str) -> String {
    let cleaned: String = component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect();
    if cleaned.is_empty() {
        "video".to_string()
    } else {
        cleaned
    }
}

/// Content type for an image format name
pub fn content_type(format: &str) -> &'static str {
    match format.to_lowercase().as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        _ => "application/octet-stream",
    }
}
