//! Resource builders
//!
//! A [`ResourceBuilderFactory`] hands out one fresh [`ResourceBuilder`] per
//! package. The builder reads each submission file exactly once, computing
//! SHA-256, MD5 and size in the same pass, and yields immutable
//! [`Resource`] descriptors. Bytes are never copied; a resource only records
//! where its bytes live.

use async_trait::async_trait;
use dps_common::checksum::DigestWriter;
use dps_common::ResourceRole;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::packaging::PackageFormat;
use crate::storage::{ByteSource, SourceError};

const READ_CHUNK_SIZE: usize = 64 * 1024;

pub const DEFAULT_MEDIA_TYPE: &str = "application/octet-stream";

/// BagIt payload directory
pub const BAGIT_PAYLOAD_DIR: &str = "data";

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("Invalid target path: {0:?}")]
    InvalidPath(String),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("Failed to read {location}: {source}")]
    Read {
        location: String,
        #[source]
        source: std::io::Error,
    },
}

/// One file of a submission as listed by the submission catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionFile {
    /// Byte-source location
    pub location: String,
    pub role: ResourceRole,
    /// Path relative to the package root
    pub target_path: String,
    pub media_type: Option<String>,
}

impl SubmissionFile {
    pub fn new(
        location: impl Into<String>,
        role: ResourceRole,
        target_path: impl Into<String>,
    ) -> Self {
        Self {
            location: location.into(),
            role,
            target_path: target_path.into(),
            media_type: None,
        }
    }

    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }
}

/// Immutable descriptor of one packaged file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub location: String,
    pub target_path: String,
    pub role: ResourceRole,
    pub media_type: String,
    pub sha256: String,
    pub md5: String,
    pub size: u64,
}

#[async_trait]
pub trait ResourceBuilder: Send {
    /// Digest `file` from `source` and stage it. On error nothing is staged.
    async fn add(&mut self, source: &dyn ByteSource, file: &SubmissionFile) -> Result<(), ResourceError>;

    /// Resources in the order they were added
    fn build(self: Box<Self>) -> Vec<Resource>;
}

pub trait ResourceBuilderFactory: Send + Sync {
    fn format(&self) -> PackageFormat;

    fn new_instance(&self) -> Box<dyn ResourceBuilder>;
}

/// Factory for a package format
pub fn factory_for(format: PackageFormat) -> Arc<dyn ResourceBuilderFactory> {
    match format {
        PackageFormat::SimpleZip => Arc::new(SimpleZipResourceFactory),
        PackageFormat::BagIt => Arc::new(BagItResourceFactory),
    }
}

// ============================================================================
// Factories
// ============================================================================

/// Target paths used as given
#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleZipResourceFactory;

impl ResourceBuilderFactory for SimpleZipResourceFactory {
    fn format(&self) -> PackageFormat {
        PackageFormat::SimpleZip
    }

    fn new_instance(&self) -> Box<dyn ResourceBuilder> {
        Box::new(DigestingBuilder::new(None))
    }
}

/// Payload placed under `data/`
#[derive(Debug, Default, Clone, Copy)]
pub struct BagItResourceFactory;

impl ResourceBuilderFactory for BagItResourceFactory {
    fn format(&self) -> PackageFormat {
        PackageFormat::BagIt
    }

    fn new_instance(&self) -> Box<dyn ResourceBuilder> {
        Box::new(DigestingBuilder::new(Some(BAGIT_PAYLOAD_DIR)))
    }
}

struct DigestingBuilder {
    prefix: Option<&'static str>,
    resources: Vec<Resource>,
}

impl DigestingBuilder {
    fn new(prefix: Option<&'static str>) -> Self {
        Self {
            prefix,
            resources: Vec::new(),
        }
    }
}

#[async_trait]
impl ResourceBuilder for DigestingBuilder {
    async fn add(&mut self, source: &dyn ByteSource, file: &SubmissionFile) -> Result<(), ResourceError> {
        let relative = normalize_target_path(&file.target_path)?;
        let target_path = match self.prefix {
            Some(prefix) => format!("{}/{}", prefix, relative),
            None => relative,
        };

        let mut reader = source.open(&file.location).await?;
        let mut digest = DigestWriter::new();
        let mut buffer = vec![0u8; READ_CHUNK_SIZE];

        loop {
            let n = reader
                .read(&mut buffer)
                .await
                .map_err(|source| ResourceError::Read {
                    location: file.location.clone(),
                    source,
                })?;
            if n == 0 {
                break;
            }
            digest.update(&buffer[..n]);
        }

        let digests = digest.finish();
        let media_type = file
            .media_type
            .clone()
            .unwrap_or_else(|| guess_media_type(&target_path));

        debug!(
            location = %file.location,
            target_path = %target_path,
            size = digests.size,
            "Built resource"
        );

        self.resources.push(Resource {
            location: file.location.clone(),
            target_path,
            role: file.role,
            media_type,
            sha256: digests.sha256,
            md5: digests.md5,
            size: digests.size,
        });

        Ok(())
    }

    fn build(self: Box<Self>) -> Vec<Resource> {
        self.resources
    }
}

/// Normalize to a forward-slash relative path with no `.`/`..` segments
pub fn normalize_target_path(raw: &str) -> Result<String, ResourceError> {
    let unified = raw.replace('\\', "/");
    let path = Path::new(&unified);
    let mut segments = Vec::new();

    for component in path.components() {
        match component {
            Component::Normal(segment) => match segment.to_str() {
                Some(s) => segments.push(s),
                None => return Err(ResourceError::InvalidPath(raw.to_string())),
            },
            Component::CurDir => {},
            _ => return Err(ResourceError::InvalidPath(raw.to_string())),
        }
    }

    if segments.is_empty() {
        return Err(ResourceError::InvalidPath(raw.to_string()));
    }

    Ok(segments.join("/"))
}

fn guess_media_type(path: &str) -> String {
    mime_guess::from_path(path)
        .first_raw()
        .unwrap_or(DEFAULT_MEDIA_TYPE)
        .to_string()
}
