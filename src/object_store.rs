//! Object storage for original uploads, viewport sources, and variants.
//!
//! The engine depends on the [`ObjectStore`] trait only; [`S3ObjectStore`]
//! is the production backend and [`MemoryObjectStore`] backs tests. Deletes
//! are idempotent on not-found when asked to be, which is what every cleanup
//! path in the service relies on.

use crate::config::S3Config;
use crate::error::{Result, StackError};
use anyhow::Context;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use chrono::Utc;
use std::collections::HashMap;
use std::collections::HashSet;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Handle to an object persisted in storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Storage path (object key).
    pub path: String,
    /// Object size in bytes.
    pub bytes: i64,
}

/// Content-addressable blob storage keyed by path strings.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload bytes under the given key.
    async fn upload(&self, key: &str, content_type: &str, bytes: Vec<u8>) -> Result<StoredObject>;

    /// Download the object at `path`.
    async fn download(&self, path: &str) -> Result<Vec<u8>>;

    /// Delete the object at `path`. With `ignore_not_found`, a missing
    /// object is not an error.
    async fn delete(&self, path: &str, ignore_not_found: bool) -> Result<()>;

    /// Whether an object exists at `path`.
    async fn exists(&self, path: &str) -> Result<bool>;
}

/// Generate a storage key for a fresh upload.
/// Format: {prefix}/{date}/{uuid}_{name}
///
/// The date level keeps listings and lifecycle policies cheap; the uuid keeps
/// keys unique across same-named uploads.
pub fn generate_object_key(prefix: &str, name: &str) -> String {
    let date = Utc::now().format("%Y-%m-%d").to_string();
    format!(
        "{prefix}/{date}/{uuid}_{name}",
        uuid = Uuid::new_v4(),
        name = sanitize_path_component(name)
    )
}

/// Sanitize a path component to prevent path traversal.
pub fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect()
}

/// S3-backed object store.
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    config: S3Config,
}

impl S3ObjectStore {
    /// Create a new S3 object store.
    pub async fn new(config: &S3Config) -> anyhow::Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let s3_config = s3_config_builder.build();
        let client = S3Client::from_conf(s3_config);

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 object store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            config: config.clone(),
        })
    }

    /// Simple single-part upload for small objects.
    async fn simple_upload(&self, key: &str, content_type: &str, bytes: Vec<u8>) -> Result<()> {
        let body = ByteStream::from(bytes);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StackError::upstream("s3_put", e.to_string()))?;

        Ok(())
    }

    /// Multipart upload for large objects.
    async fn multipart_upload(&self, key: &str, content_type: &str, bytes: Vec<u8>) -> Result<()> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StackError::upstream("s3_multipart_create", e.to_string()))?;

        let upload_id = create_response.upload_id().ok_or_else(|| {
            StackError::upstream("s3_multipart_create", "no upload ID in response")
        })?;

        let mut completed_parts = Vec::new();
        let part_size = self.config.part_size_bytes;
        let mut part_number = 1;

        for chunk in bytes.chunks(part_size) {
            let body = ByteStream::from(chunk.to_vec());

            let upload_part_response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(body)
                .send()
                .await
                .map_err(|e| StackError::upstream("s3_upload_part", e.to_string()))?;

            let completed_part = aws_sdk_s3::types::CompletedPart::builder()
                .part_number(part_number)
                .e_tag(upload_part_response.e_tag().unwrap_or_default())
                .build();

            completed_parts.push(completed_part);
            part_number += 1;
        }

        let completed_upload = aws_sdk_s3::types::CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(|e| StackError::upstream("s3_multipart_complete", e.to_string()))?;

        Ok(())
    }

    /// Get the bucket name.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, bytes), fields(key = %key, size_bytes = bytes.len()))]
    async fn upload(&self, key: &str, content_type: &str, bytes: Vec<u8>) -> Result<StoredObject> {
        let size = bytes.len() as i64;

        debug!(key = %key, size_bytes = size, "Uploading object");

        if bytes.len() > self.config.multipart_threshold_bytes {
            self.multipart_upload(key, content_type, bytes).await?;
        } else {
            self.simple_upload(key, content_type, bytes).await?;
        }

        Ok(StoredObject {
            path: key.to_string(),
            bytes: size,
        })
    }

    #[instrument(skip(self), fields(path = %path))]
    async fn download(&self, path: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    StackError::not_found("object_missing", format!("no object at {path}"))
                } else {
                    StackError::upstream("s3_get", e.to_string())
                }
            })?;

        let data = response
            .body
            .collect()
            .await
            .context("Failed to read object body")
            .map_err(|e| StackError::upstream("s3_get", e.to_string()))?;

        Ok(data.into_bytes().to_vec())
    }

    #[instrument(skip(self), fields(path = %path))]
    async fn delete(&self, path: &str, ignore_not_found: bool) -> Result<()> {
        let result = self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await;

        match result {
            Ok(_) => {
                debug!(path = %path, "Object deleted");
                Ok(())
            }
            // DeleteObject succeeds for missing keys on S3 proper, but some
            // gateways surface a not-found service error instead.
            Err(e) if ignore_not_found && e.to_string().contains("NoSuchKey") => Ok(()),
            Err(e) => Err(StackError::upstream("s3_delete", e.to_string())),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(StackError::upstream("s3_head", e.to_string()))
                }
            }
        }
    }
}

/// In-memory object store for tests.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
    fail_delete_for: RwLock<HashSet<String>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make deletes of the given path fail; exercises best-effort cleanup.
    pub async fn fail_delete_for(&self, path: impl Into<String>) {
        self.fail_delete_for.write().await.insert(path.into());
    }

    pub async fn put(&self, path: impl Into<String>, bytes: Vec<u8>) {
        self.objects.write().await.insert(path.into(), bytes);
    }

    pub async fn contains(&self, path: &str) -> bool {
        self.objects.read().await.contains_key(path)
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn upload(&self, key: &str, _content_type: &str, bytes: Vec<u8>) -> Result<StoredObject> {
        let size = bytes.len() as i64;
        self.objects.write().await.insert(key.to_string(), bytes);
        Ok(StoredObject {
            path: key.to_string(),
            bytes: size,
        })
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>> {
        self.objects
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| StackError::not_found("object_missing", format!("no object at {path}")))
    }

    async fn delete(&self, path: &str, ignore_not_found: bool) -> Result<()> {
        if self.fail_delete_for.read().await.contains(path) {
            return Err(StackError::upstream(
                "object_delete",
                "simulated delete failure",
            ));
        }
        let removed = self.objects.write().await.remove(path).is_some();
        if !removed && !ignore_not_found {
            return Err(StackError::not_found(
                "object_missing",
                format!("no object at {path}"),
            ));
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.objects.read().await.contains_key(path))
    }
}
