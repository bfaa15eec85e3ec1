//! Object-storage transport (S3-compatible)
//!
//! The package is PUT under `<prefix>/<submission>/<file>` with its SHA-256
//! in object metadata, then HEADed back; a length mismatch is a partial write
//! and fails the send. The object key is the reference.
//!
//! The repository publishes its verdict as a sibling object
//! `<key><status_suffix>` containing `{"status": "...", "message": "..."}`.

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use dps_common::{RepositoryConfig, TransportKind};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info, instrument};

use super::{fold_remote_state, Credentials, RemoteStatus, Transport, TransportError};
use crate::packaging::{Package, PackagePayload};
use crate::storage::config::StorageConfig;
use crate::storage::Storage;

pub const DEFAULT_STATUS_SUFFIX: &str = ".status.json";
pub const DEFAULT_REGION: &str = "us-east-1";

/// Verdict document written by the repository
#[derive(Debug, Deserialize)]
pub struct StatusDocument {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    endpoint: Option<String>,
    region: String,
    bucket: String,
    path_style: bool,
    credentials_ref: Option<String>,
}

/// Bucket layout of one repository
#[derive(Debug, Clone)]
pub struct ObjectTarget {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub path_style: bool,
    pub prefix: String,
    pub status_suffix: String,
}

impl ObjectTarget {
    /// The endpoint is either `s3://<bucket>` (AWS) or a service URL with
    /// the bucket in hint `bucket`
    pub fn from_config(config: &RepositoryConfig) -> Result<Self, TransportError> {
        let (endpoint, bucket) = match config.endpoint.strip_prefix("s3://") {
            Some(bucket) => (None, bucket.trim_end_matches('/').to_string()),
            None => {
                let bucket = config.hint("bucket").ok_or_else(|| {
                    TransportError::Config(format!("repository {} needs a bucket hint", config.id))
                })?;
                (Some(config.endpoint.clone()), bucket.to_string())
            },
        };

        if bucket.is_empty() {
            return Err(TransportError::Config(format!("repository {} has an empty bucket", config.id)));
        }

        Ok(Self {
            path_style: config.hint_bool("path_style").unwrap_or(endpoint.is_some()),
            endpoint,
            region: config.hint("region").unwrap_or(DEFAULT_REGION).to_string(),
            bucket,
            prefix: config.hint("prefix").unwrap_or_default().trim_matches('/').to_string(),
            status_suffix: config
                .hint("status_suffix")
                .unwrap_or(DEFAULT_STATUS_SUFFIX)
                .to_string(),
        })
    }

    pub fn package_key(&self, package: &Package) -> String {
        let tail = format!("{}/{}", package.submission_id, package.file_name);
        if self.prefix.is_empty() {
            tail
        } else {
            format!("{}/{}", self.prefix, tail)
        }
    }

    pub fn status_key(&self, reference: &str) -> String {
        format!("{}{}", reference, self.status_suffix)
    }
}

fn backend(e: anyhow::Error) -> TransportError {
    TransportError::Network(format!("{:#}", e))
}

/// S3 clients are cached per endpoint/region/bucket/credentials
#[derive(Default)]
pub struct ObjectStoreTransport {
    clients: Mutex<HashMap<ClientKey, Storage>>,
}

impl ObjectStoreTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn storage(&self, target: &ObjectTarget, config: &RepositoryConfig) -> Result<Storage, TransportError> {
        let key = ClientKey {
            endpoint: target.endpoint.clone(),
            region: target.region.clone(),
            bucket: target.bucket.clone(),
            path_style: target.path_style,
            credentials_ref: config.credentials_ref.clone(),
        };

        let mut clients = self
            .clients
            .lock()
            .map_err(|_| TransportError::Config("S3 client cache poisoned".into()))?;

        if let Some(storage) = clients.get(&key) {
            return Ok(storage.clone());
        }

        let credentials = Credentials::resolve(config)?.ok_or_else(|| {
            TransportError::Config(format!("repository {} needs a credentials reference", config.id))
        })?;

        let storage = Storage::new(StorageConfig {
            endpoint: target.endpoint.clone(),
            region: target.region.clone(),
            bucket: target.bucket.clone(),
            access_key: credentials.username,
            secret_key: credentials.secret,
            path_style: target.path_style,
        });
        clients.insert(key, storage.clone());

        Ok(storage)
    }
}

#[async_trait]
impl Transport for ObjectStoreTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::ObjectStore
    }

    #[instrument(skip(self, package, config), fields(repository_id = %config.id, file = %package.file_name))]
    async fn send(&self, package: &Package, config: &RepositoryConfig) -> Result<String, TransportError> {
        let target = ObjectTarget::from_config(config)?;
        let storage = self.storage(&target, config)?;
        let key = target.package_key(package);

        let body = match package.payload() {
            PackagePayload::InMemory(bytes) => ByteStream::from(bytes.to_vec()),
            PackagePayload::Spooled(file) => ByteStream::from_path(file.path())
                .await
                .map_err(|e| TransportError::Protocol(format!("cannot read package: {}", e)))?,
        };

        storage
            .upload(
                &key,
                body,
                package.media_type(),
                package.size,
                &[("sha256", package.sha256.as_str()), ("md5", package.md5.as_str())],
            )
            .await
            .map_err(backend)?;

        let head = storage
            .head(&key)
            .await
            .map_err(backend)?
            .ok_or_else(|| TransportError::Protocol(format!("{} missing right after upload", key)))?;

        if head.size < 0 || head.size as u64 != package.size {
            return Err(TransportError::Protocol(format!(
                "partial write of {}: stored {} of {} bytes",
                key, head.size, package.size
            )));
        }

        info!("Stored package at s3://{}/{}", target.bucket, key);
        Ok(key)
    }

    #[instrument(skip(self, config), fields(repository_id = %config.id))]
    async fn query_status(
        &self,
        reference: &str,
        config: &RepositoryConfig,
    ) -> Result<RemoteStatus, TransportError> {
        let target = ObjectTarget::from_config(config)?;
        let storage = self.storage(&target, config)?;

        match storage
            .download_optional(&target.status_key(reference))
            .await
            .map_err(backend)?
        {
            Some(bytes) => {
                let document: StatusDocument = serde_json::from_slice(&bytes)
                    .map_err(|e| TransportError::Protocol(format!("malformed status object: {}", e)))?;
                debug!(status = %document.status, message = ?document.message, "Status object found");
                Ok(RemoteStatus::Visible(fold_remote_state(&document.status)))
            },
            None => match storage.head(reference).await.map_err(backend)? {
                Some(_) => Ok(RemoteStatus::NotYetVisible),
                None => Ok(RemoteStatus::NotFound),
            },
        }
    }
}
