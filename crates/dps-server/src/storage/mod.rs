//! Byte sources for packaging and the S3 client shared with the object-store transport
//!
//! Submission files live in a storage collaborator. Packaging only ever reads
//! them, through [`ByteSource`]: once to digest (resource building) and once
//! to copy into the archive (assembly).

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    operation::{get_object::GetObjectError, head_object::HeadObjectError},
    primitives::ByteStream,
    Client,
};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use thiserror::Error;
use tokio::io::AsyncRead;
use tracing::{debug, info, instrument};

pub mod config;

/// Streaming reader handed out by a byte source
pub type ByteReader = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Byte source not found: {0}")]
    NotFound(String),
    #[error("Invalid byte source location: {0}")]
    InvalidLocation(String),
    #[error("IO error reading {location}: {source}")]
    Io {
        location: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Read-only access to submission files
#[async_trait]
pub trait ByteSource: Send + Sync {
    /// Open `location` for a streaming read
    async fn open(&self, location: &str) -> Result<ByteReader, SourceError>;
}

// ============================================================================
// Local filesystem
// ============================================================================

/// Files under a root directory; locations are relative paths
#[derive(Debug, Clone)]
pub struct LocalFileSource {
    root: PathBuf,
}

impl LocalFileSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, location: &str) -> Result<PathBuf, SourceError> {
        let relative = Path::new(location);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if location.is_empty() || escapes {
            return Err(SourceError::InvalidLocation(location.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ByteSource for LocalFileSource {
    async fn open(&self, location: &str) -> Result<ByteReader, SourceError> {
        let path = self.resolve(location)?;
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Box::pin(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SourceError::NotFound(location.to_string()))
            },
            Err(source) => Err(SourceError::Io {
                location: location.to_string(),
                source,
            }),
        }
    }
}

// ============================================================================
// In-memory (tests, fixtures)
// ============================================================================

/// Fixed set of named blobs
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    blobs: HashMap<String, Vec<u8>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, location: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.blobs.insert(location.into(), data.into());
        self
    }
}

#[async_trait]
impl ByteSource for MemorySource {
    async fn open(&self, location: &str) -> Result<ByteReader, SourceError> {
        let data = self
            .blobs
            .get(location)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(location.to_string()))?;
        Ok(Box::pin(std::io::Cursor::new(data)))
    }
}

// ============================================================================
// S3-compatible storage
// ============================================================================

#[derive(Clone)]
pub struct Storage {
    client: Client,
    bucket: String,
}

impl Storage {
    pub fn new(config: config::StorageConfig) -> Self {
        debug!(
            bucket = %config.bucket,
            endpoint = ?config.endpoint,
            "Initializing storage client"
        );

        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "dps-storage",
        );

        let mut s3_config_builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());

        info!("Storage client initialized for bucket: {}", config.bucket);

        Self {
            client,
            bucket: config.bucket,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    #[instrument(skip(self, body, metadata))]
    pub async fn upload(
        &self,
        key: &str,
        body: ByteStream,
        content_type: &str,
        content_length: u64,
        metadata: &[(&str, &str)],
    ) -> Result<()> {
        debug!("Uploading {} bytes to s3://{}/{}", content_length, self.bucket, key);

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .content_length(content_length as i64)
            .body(body);

        for (name, value) in metadata {
            request = request.metadata(*name, *value);
        }

        request.send().await.context("Failed to upload to S3")?;

        info!("Successfully uploaded to s3://{}/{}", self.bucket, key);
        Ok(())
    }

    /// HEAD an object; `None` when it does not exist
    #[instrument(skip(self))]
    pub async fn head(&self, key: &str) -> Result<Option<ObjectMetadata>> {
        let response = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match response {
            Ok(head) => Ok(Some(ObjectMetadata {
                key: key.to_string(),
                size: head.content_length().unwrap_or(0),
                content_type: head.content_type().map(str::to_string),
                metadata: head.metadata().cloned().unwrap_or_default(),
            })),
            Err(err) => match err.into_service_error() {
                HeadObjectError::NotFound(_) => Ok(None),
                other => Err(anyhow::anyhow!("Failed to HEAD s3://{}/{}: {}", self.bucket, key, other)),
            },
        }
    }

    /// Download a small object into memory; `None` when it does not exist
    #[instrument(skip(self))]
    pub async fn download_optional(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        let output = match response {
            Ok(output) => output,
            Err(err) => {
                return match err.into_service_error() {
                    GetObjectError::NoSuchKey(_) => Ok(None),
                    other => Err(anyhow::anyhow!(
                        "Failed to download s3://{}/{}: {}",
                        self.bucket,
                        key,
                        other
                    )),
                }
            },
        };

        let data = output
            .body
            .collect()
            .await
            .context("Failed to read S3 response body")?
            .into_bytes()
            .to_vec();

        debug!("Downloaded {} bytes from s3://{}/{}", data.len(), self.bucket, key);
        Ok(Some(data))
    }
}

#[async_trait]
impl ByteSource for Storage {
    async fn open(&self, location: &str) -> Result<ByteReader, SourceError> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(location)
            .send()
            .await;

        match response {
            Ok(output) => Ok(Box::pin(output.body.into_async_read())),
            Err(err) => match err.into_service_error() {
                GetObjectError::NoSuchKey(_) => Err(SourceError::NotFound(location.to_string())),
                other => Err(SourceError::Backend(other.to_string())),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct ObjectMetadata {
    pub key: String,
    pub size: i64,
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
}
