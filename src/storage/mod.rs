// pgphase/src/storage/mod.rs
//! Remote object store access. Every call here is idempotent and goes through
//! the retry controller; the byte streams themselves are never retried.
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use chrono::{DateTime, Utc};
use s3::config::Region;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::AsyncRead;

use crate::backup::s3_upload::{self, UploadSink};
use crate::config::StorageConfig;
use crate::errors::{AppError, Result};
use crate::restore::s3_download;
use crate::utils::retry::{retry, RetryPolicy};

/// A readable archive stream handed to an engine.
pub type ArchiveSource = Box<dyn AsyncRead + Send + Unpin>;

/// Sidecar written next to a committed archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorRecord {
    pub database: String,
    pub label: String,
    pub key: String,
    pub size_bytes: u64,
    pub compression_level: u8,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Reachability check used by the connectivity pre-flight.
    async fn check_bucket(&self) -> Result<()>;

    /// Size of the object at `key`, or `None` when it does not exist.
    async fn object_size(&self, key: &str) -> Result<Option<u64>>;

    /// Opens a single-writer sink for `key`. Refuses an existing key unless `overwrite`.
    async fn upload(&self, key: &str, overwrite: bool) -> Result<UploadSink>;

    /// Opens a single-reader stream over the object at `key`.
    async fn download(&self, key: &str) -> Result<ArchiveSource>;

    async fn put_descriptor(&self, key: &str, record: &DescriptorRecord) -> Result<()>;

    async fn get_descriptor(&self, key: &str) -> Result<Option<DescriptorRecord>>;
}

/// Failure of one S3 call, pre-classified for the retry controller.
#[derive(Debug)]
pub(crate) struct S3Fault {
    pub transient: bool,
    pub message: String,
}

impl S3Fault {
    pub fn from_sdk<E>(err: SdkError<E, HttpResponse>) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        S3Fault {
            transient: is_transient(&err),
            message: DisplayErrorContext(&err).to_string(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }
}

impl fmt::Display for S3Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Network-level failures, throttling and 5xx are worth another attempt.
fn is_transient<E>(err: &SdkError<E, HttpResponse>) -> bool {
    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            true
        }
        SdkError::ServiceError(service) => {
            let status = service.raw().status().as_u16();
            status == 429 || status >= 500
        }
        _ => false,
    }
}

/// S3-compatible object store (AWS, DigitalOcean Spaces, MinIO, ...).
pub struct S3Store {
    pub(crate) client: s3::Client,
    pub(crate) bucket: String,
    pub(crate) policy: RetryPolicy,
    pub(crate) chunk_size: usize,
}

impl S3Store {
    pub async fn connect(
        storage: &StorageConfig,
        policy: RetryPolicy,
        chunk_size: usize,
    ) -> Result<Self> {
        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .region(Region::new(storage.region.clone()));
        if let Some(endpoint) = &storage.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        if let (Some(key_id), Some(secret)) = (&storage.access_key_id, &storage.secret_access_key) {
            loader = loader.credentials_provider(s3::config::Credentials::new(
                key_id,
                secret.expose(),
                None,     // session_token
                None,     // expiry
                "Static", // provider_name
            ));
        }
        if !storage.verify_tls {
            tracing::warn!(
                "⚠️ S3_VERIFY_TLS=false: certificate verification cannot be disabled \
                 for the SDK connector; use an http:// endpoint for endpoints \
                 without valid certificates"
            );
        }
        let sdk_config = loader.load().await;
        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(storage.force_path_style)
            .build();

        tracing::debug!(
            bucket = %storage.bucket,
            endpoint = ?storage.endpoint_url,
            path_style = storage.force_path_style,
            "S3 client configured"
        );
        Ok(S3Store {
            client: s3::Client::from_conf(s3_config),
            bucket: storage.bucket.clone(),
            policy,
            chunk_size,
        })
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn check_bucket(&self) -> Result<()> {
        let request = format!("HEAD bucket {}", self.bucket);
        retry(&self.policy, &request, S3Fault::is_transient, || async move {
            self.client
                .head_bucket()
                .bucket(&self.bucket)
                .send()
                .await
                .map_err(S3Fault::from_sdk)
        })
        .await
        .map_err(|e| {
            AppError::Connectivity(format!("bucket '{}' is not reachable: {}", self.bucket, e))
        })?;
        tracing::info!("✅ Bucket {} is accessible", self.bucket);
        Ok(())
    }

    async fn object_size(&self, key: &str) -> Result<Option<u64>> {
        retry(&self.policy, &format!("HEAD {}", key), S3Fault::is_transient, || async move {
            match self.client.head_object().bucket(&self.bucket).key(key).send().await {
                Ok(head) => Ok(Some(head.content_length().unwrap_or(0).max(0) as u64)),
                Err(e) if e.as_service_error().is_some_and(|s| s.is_not_found()) => Ok(None),
                Err(e) => Err(S3Fault::from_sdk(e)),
            }
        })
        .await
    }

    async fn upload(&self, key: &str, overwrite: bool) -> Result<UploadSink> {
        if !overwrite && self.object_size(key).await?.is_some() {
            return Err(AppError::Storage(format!(
                "refusing to overwrite existing object s3://{}/{}",
                self.bucket, key
            )));
        }
        Ok(s3_upload::start_upload(self, key))
    }

    async fn download(&self, key: &str) -> Result<ArchiveSource> {
        s3_download::open_download(self, key).await
    }

    async fn put_descriptor(&self, key: &str, record: &DescriptorRecord) -> Result<()> {
        let body = serde_json::to_vec_pretty(record).map_err(|e| {
            AppError::Storage(format!("failed to encode descriptor for {}: {}", key, e))
        })?;
        retry(&self.policy, &format!("PUT {}", key), S3Fault::is_transient, || {
            let body = body.clone();
            async move {
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .content_type("application/json")
                    .body(ByteStream::from(body))
                    .send()
                    .await
                    .map_err(S3Fault::from_sdk)
            }
        })
        .await?;
        Ok(())
    }

    async fn get_descriptor(&self, key: &str) -> Result<Option<DescriptorRecord>> {
        let request = format!("GET {}", key);
        let body = retry(&self.policy, &request, S3Fault::is_transient, || async move {
            let output = match self.client.get_object().bucket(&self.bucket).key(key).send().await {
                Ok(output) => output,
                Err(e) if e.as_service_error().is_some_and(|s| s.is_no_such_key()) => {
                    return Ok(None);
                }
                Err(e) => return Err(S3Fault::from_sdk(e)),
            };
            let bytes = output.body.collect().await.map_err(|e| S3Fault {
                transient: true,
                message: format!("reading body failed: {}", e),
            })?;
            Ok(Some(bytes.into_bytes()))
        })
        .await?;

        match body {
            Some(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                AppError::Storage(format!("descriptor {} is not valid JSON: {}", key, e))
            }),
            None => Ok(None),
        }
    }
}
