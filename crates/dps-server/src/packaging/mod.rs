//! Package assembler
//!
//! Turns an ordered resource set into one archive in the packaging convention
//! of the target repository. Assembly is deterministic: the same resources and
//! repository config always produce a byte-identical payload.
//!
//! Archives larger than the in-memory threshold are spooled to a
//! [`NamedTempFile`]; the file is removed when the [`Package`] (or a failed
//! assembly) is dropped.

use dps_common::checksum::{compute_file_digests, digest_bytes, Digests};
use dps_common::{DpsError, RepositoryConfig, ResourceRole, TransportKind};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio_util::io::SyncIoBridge;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::resources::Resource;
use crate::storage::{ByteSource, SourceError};

mod archive;
pub mod manifest;

use archive::ArchiveSink;
pub use manifest::{ManifestEntry, PackageManifest};

pub const SIMPLE_ZIP_PACKAGING: &str = "http://purl.org/net/sword/package/SimpleZip";
pub const BAGIT_PACKAGING: &str = "http://purl.org/net/sword/package/BagIt";

pub const DEFAULT_MEMORY_THRESHOLD_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum PackagingError {
    #[error("Package has no resources")]
    Empty,
    #[error("Required resource role missing: {0}")]
    MissingRole(ResourceRole),
    #[error("Duplicate target path in package: {0}")]
    DuplicatePath(String),
    #[error("Unsupported package format: {0}")]
    UnsupportedFormat(String),
    #[error("Invalid repository hint {key}={value}")]
    InvalidHint { key: String, value: String },
    #[error("Resource {path} changed since it was built (expected sha256 {expected}, got {actual})")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Archive error: {0}")]
    Archive(String),
    #[error("Manifest error: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error("Digest error: {0}")]
    Digest(#[from] DpsError),
    #[error("Packaging task failed: {0}")]
    Task(String),
}

// ============================================================================
// Format
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PackageFormat {
    SimpleZip,
    BagIt,
}

impl PackageFormat {
    pub const HINT: &'static str = "package_format";

    /// Format named by the `package_format` hint, else the transport default
    pub fn for_config(config: &RepositoryConfig) -> Result<Self, PackagingError> {
        match config.hint(Self::HINT) {
            Some(value) => value.parse(),
            None => Ok(match config.kind {
                TransportKind::SwordV2 => PackageFormat::SimpleZip,
                TransportKind::Ftp | TransportKind::ObjectStore => PackageFormat::BagIt,
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PackageFormat::SimpleZip => "simple-zip",
            PackageFormat::BagIt => "bagit",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            PackageFormat::SimpleZip => "zip",
            PackageFormat::BagIt => "tar.gz",
        }
    }

    pub fn media_type(&self) -> &'static str {
        match self {
            PackageFormat::SimpleZip => "application/zip",
            PackageFormat::BagIt => "application/gzip",
        }
    }

    pub fn packaging_uri(&self) -> &'static str {
        match self {
            PackageFormat::SimpleZip => SIMPLE_ZIP_PACKAGING,
            PackageFormat::BagIt => BAGIT_PACKAGING,
        }
    }

    /// Archive paths the assembler writes itself; no resource may use them
    pub fn reserved_paths(&self) -> &'static [&'static str] {
        match self {
            PackageFormat::SimpleZip => &[manifest::MANIFEST_FILE],
            PackageFormat::BagIt => &[
                manifest::BAGIT_TXT,
                manifest::BAG_INFO_TXT,
                manifest::MANIFEST_SHA256_TXT,
                manifest::MANIFEST_FILE,
                manifest::TAGMANIFEST_SHA256_TXT,
            ],
        }
    }
}

impl std::fmt::Display for PackageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PackageFormat {
    type Err = PackagingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "simple-zip" | "simplezip" | "zip" => Ok(PackageFormat::SimpleZip),
            "bagit" | "bag-it" => Ok(PackageFormat::BagIt),
            other => Err(PackagingError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Roles that must be present, from hint `required_roles` (default manuscript)
pub fn required_roles(config: &RepositoryConfig) -> Result<Vec<ResourceRole>, PackagingError> {
    match config.hint_list("required_roles") {
        None => Ok(vec![ResourceRole::Manuscript]),
        Some(values) => values
            .iter()
            .map(|v| {
                v.parse().map_err(|_| PackagingError::InvalidHint {
                    key: "required_roles".to_string(),
                    value: v.clone(),
                })
            })
            .collect(),
    }
}

fn validate_resources(
    format: PackageFormat,
    resources: &[Resource],
    required: &[ResourceRole],
) -> Result<(), PackagingError> {
    if resources.is_empty() {
        return Err(PackagingError::Empty);
    }

    let mut seen: HashSet<&str> = format.reserved_paths().iter().copied().collect();
    for resource in resources {
        if !seen.insert(resource.target_path.as_str()) {
            return Err(PackagingError::DuplicatePath(resource.target_path.clone()));
        }
    }

    for role in required {
        if !resources.iter().any(|r| r.role == *role) {
            return Err(PackagingError::MissingRole(*role));
        }
    }

    Ok(())
}

// ============================================================================
// Package
// ============================================================================

/// Archive bytes, held in memory or in a self-deleting temp file
#[derive(Debug)]
pub enum PackagePayload {
    InMemory(Arc<[u8]>),
    Spooled(NamedTempFile),
}

#[derive(Debug, Clone)]
pub enum PayloadHandle {
    Memory(Arc<[u8]>),
    File(PathBuf),
}

impl PayloadHandle {
    pub fn open(&self) -> std::io::Result<Box<dyn Read + Send>> {
        match self {
            PayloadHandle::Memory(bytes) => Ok(Box::new(Cursor::new(bytes.clone()))),
            PayloadHandle::File(path) => Ok(Box::new(std::fs::File::open(path)?)),
        }
    }
}

/// Assembled, transmittable package
#[derive(Debug)]
pub struct Package {
    pub submission_id: Uuid,
    pub format: PackageFormat,
    pub file_name: String,
    pub sha256: String,
    pub md5: String,
    pub size: u64,
    pub manifest: PackageManifest,
    payload: PackagePayload,
}

impl Package {
    pub fn media_type(&self) -> &'static str {
        self.format.media_type()
    }

    pub fn packaging_uri(&self) -> &'static str {
        self.format.packaging_uri()
    }

    pub fn payload(&self) -> &PackagePayload {
        &self.payload
    }

    pub fn spool_path(&self) -> Option<&Path> {
        match &self.payload {
            PackagePayload::InMemory(_) => None,
            PackagePayload::Spooled(file) => Some(file.path()),
        }
    }

    /// Reopenable handle for blocking readers; valid while the package lives
    pub fn payload_handle(&self) -> PayloadHandle {
        match &self.payload {
            PackagePayload::InMemory(bytes) => PayloadHandle::Memory(bytes.clone()),
            PackagePayload::Spooled(file) => PayloadHandle::File(file.path().to_path_buf()),
        }
    }

    /// Whole payload in memory
    pub async fn to_bytes(&self) -> std::io::Result<Vec<u8>> {
        match &self.payload {
            PackagePayload::InMemory(bytes) => Ok(bytes.to_vec()),
            PackagePayload::Spooled(file) => tokio::fs::read(file.path()).await,
        }
    }
}

// ============================================================================
// Assembler
// ============================================================================

#[derive(Debug, Clone)]
pub struct AssemblerConfig {
    pub memory_threshold_bytes: u64,
    pub spool_dir: PathBuf,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            memory_threshold_bytes: DEFAULT_MEMORY_THRESHOLD_BYTES,
            spool_dir: std::env::temp_dir(),
        }
    }
}

#[derive(Clone)]
pub struct PackageAssembler {
    source: Arc<dyn ByteSource>,
    config: AssemblerConfig,
}

impl PackageAssembler {
    pub fn new(source: Arc<dyn ByteSource>, config: AssemblerConfig) -> Self {
        Self { source, config }
    }

    #[instrument(skip(self, resources, repository), fields(repository_id = %repository.id))]
    pub async fn assemble(
        &self,
        submission_id: Uuid,
        resources: &[Resource],
        repository: &RepositoryConfig,
    ) -> Result<Package, PackagingError> {
        let format = PackageFormat::for_config(repository)?;
        validate_resources(format, resources, &required_roles(repository)?)?;

        let manifest = PackageManifest::new(submission_id, &repository.id, format, resources);
        let spool = manifest.total_size() > self.config.memory_threshold_bytes;

        debug!(
            %submission_id,
            %format,
            resources = resources.len(),
            total_size = manifest.total_size(),
            spool,
            "Assembling package"
        );

        let job = ArchiveJob {
            submission_id,
            format,
            manifest,
            resources: resources.to_vec(),
            spool_dir: spool.then(|| self.config.spool_dir.clone()),
            source: self.source.clone(),
            handle: Handle::current(),
        };

        let package = tokio::task::spawn_blocking(move || job.run())
            .await
            .map_err(|e| PackagingError::Task(e.to_string()))??;

        info!(
            %submission_id,
            file_name = %package.file_name,
            size = package.size,
            sha256 = %package.sha256,
            "Package assembled"
        );

        Ok(package)
    }
}

/// Blocking half of assembly; runs on the blocking pool
struct ArchiveJob {
    submission_id: Uuid,
    format: PackageFormat,
    manifest: PackageManifest,
    resources: Vec<Resource>,
    spool_dir: Option<PathBuf>,
    source: Arc<dyn ByteSource>,
    handle: Handle,
}

impl ArchiveJob {
    fn run(self) -> Result<Package, PackagingError> {
        let manifest_json = self.manifest.to_json_bytes()?;

        let sink = match &self.spool_dir {
            Some(dir) => ArchiveSink::Spool(
                tempfile::Builder::new()
                    .prefix("dps-package-")
                    .tempfile_in(dir)?,
            ),
            None => ArchiveSink::Memory(Cursor::new(Vec::new())),
        };

        let source = self.source.clone();
        let handle = self.handle.clone();
        let mut open = move |resource: &Resource| -> Result<Box<dyn Read>, PackagingError> {
            let reader = handle.block_on(source.open(&resource.location))?;
            Ok(Box::new(SyncIoBridge::new_with_handle(reader, handle.clone())))
        };

        let sink = match self.format {
            PackageFormat::SimpleZip => {
                archive::write_simple_zip(sink, &manifest_json, &self.resources, &mut open)?
            },
            PackageFormat::BagIt => {
                let tags = manifest::BagTagFiles::render(&self.manifest, &manifest_json);
                let bag_name = self.submission_id.to_string();
                archive::write_bagit(sink, &bag_name, &tags, &self.resources, &mut open)?
            },
        };

        let (payload, digests): (PackagePayload, Digests) = match sink {
            ArchiveSink::Memory(cursor) => {
                let bytes = cursor.into_inner();
                let digests = digest_bytes(&bytes);
                (PackagePayload::InMemory(Arc::from(bytes)), digests)
            },
            ArchiveSink::Spool(mut file) => {
                file.flush()?;
                let digests = compute_file_digests(file.path())?;
                (PackagePayload::Spooled(file), digests)
            },
        };

        Ok(Package {
            submission_id: self.submission_id,
            format: self.format,
            file_name: format!("{}.{}", self.submission_id, self.format.extension()),
            sha256: digests.sha256,
            md5: digests.md5,
            size: digests.size,
            manifest: self.manifest,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{factory_for, SubmissionFile};
    use crate::storage::MemorySource;

    fn source() -> Arc<MemorySource> {
        Arc::new(
            MemorySource::new()
                .with("s/paper.pdf", b"%PDF-1.7 the manuscript".to_vec())
                .with("s/meta.xml", b"<article/>".to_vec()),
        )
    }

    async fn build(source: &MemorySource, format: PackageFormat, files: &[SubmissionFile]) -> Vec<Resource> {
        let mut builder = factory_for(format).new_instance();
        for file in files {
            builder.add(source, file).await.unwrap();
        }
        builder.build()
    }

    fn files() -> Vec<SubmissionFile> {
        vec![
            SubmissionFile::new("s/paper.pdf", ResourceRole::Manuscript, "paper.pdf"),
            SubmissionFile::new("s/meta.xml", ResourceRole::Metadata, "meta.xml"),
        ]
    }

    #[test]
    fn test_format_defaults_per_transport() {
        let sword = RepositoryConfig::new("a", TransportKind::SwordV2, "https://x");
        let ftp = RepositoryConfig::new("b", TransportKind::Ftp, "ftp.x");
        assert_eq!(PackageFormat::for_config(&sword).unwrap(), PackageFormat::SimpleZip);
        assert_eq!(PackageFormat::for_config(&ftp).unwrap(), PackageFormat::BagIt);

        let overridden = ftp.with_hint("package_format", "simple-zip");
        assert_eq!(PackageFormat::for_config(&overridden).unwrap(), PackageFormat::SimpleZip);

        let bogus = RepositoryConfig::new("c", TransportKind::Ftp, "x").with_hint("package_format", "rar");
        assert!(matches!(
            PackageFormat::for_config(&bogus),
            Err(PackagingError::UnsupportedFormat(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_manuscript_is_rejected() {
        let source = source();
        let resources = build(
            &source,
            PackageFormat::SimpleZip,
            &[SubmissionFile::new("s/meta.xml", ResourceRole::Metadata, "meta.xml")],
        )
        .await;

        let assembler = PackageAssembler::new(source, AssemblerConfig::default());
        let repo = RepositoryConfig::new("repo", TransportKind::SwordV2, "https://x");
        let err = assembler.assemble(Uuid::new_v4(), &resources, &repo).await.unwrap_err();
        assert!(matches!(err, PackagingError::MissingRole(ResourceRole::Manuscript)));
    }

    #[tokio::test]
    async fn test_required_roles_hint() {
        let source = source();
        let resources = build(&source, PackageFormat::SimpleZip, &files()[..1]).await;
        let assembler = PackageAssembler::new(source, AssemblerConfig::default());

        let repo = RepositoryConfig::new("repo", TransportKind::SwordV2, "https://x")
            .with_hint("required_roles", "manuscript,metadata");
        let err = assembler.assemble(Uuid::new_v4(), &resources, &repo).await.unwrap_err();
        assert!(matches!(err, PackagingError::MissingRole(ResourceRole::Metadata)));
    }

    #[tokio::test]
    async fn test_empty_and_duplicate_resources() {
        let source = source();
        let assembler = PackageAssembler::new(source.clone(), AssemblerConfig::default());
        let repo = RepositoryConfig::new("repo", TransportKind::SwordV2, "https://x");

        let err = assembler.assemble(Uuid::new_v4(), &[], &repo).await.unwrap_err();
        assert!(matches!(err, PackagingError::Empty));

        let mut resources = build(&source, PackageFormat::SimpleZip, &files()).await;
        resources[1].target_path = resources[0].target_path.clone();
        let err = assembler.assemble(Uuid::new_v4(), &resources, &repo).await.unwrap_err();
        assert!(matches!(err, PackagingError::DuplicatePath(_)));
    }

    #[tokio::test]
    async fn test_resource_cannot_shadow_embedded_manifest() {
        let source = source();
        let assembler = PackageAssembler::new(source.clone(), AssemblerConfig::default());
        let repo = RepositoryConfig::new("repo", TransportKind::SwordV2, "https://x");

        let mut resources = build(&source, PackageFormat::SimpleZip, &files()).await;
        resources[1].target_path = manifest::MANIFEST_FILE.to_string();
        let err = assembler.assemble(Uuid::new_v4(), &resources, &repo).await.unwrap_err();
        assert!(matches!(err, PackagingError::DuplicatePath(ref path) if path == "manifest.json"));
    }

    #[tokio::test]
    async fn test_in_memory_package_metadata() {
        let source = source();
        let resources = build(&source, PackageFormat::SimpleZip, &files()).await;
        let assembler = PackageAssembler::new(source, AssemblerConfig::default());
        let submission = Uuid::new_v4();
        let repo = RepositoryConfig::new("repo", TransportKind::SwordV2, "https://x");

        let package = assembler.assemble(submission, &resources, &repo).await.unwrap();
        assert_eq!(package.file_name, format!("{}.zip", submission));
        assert_eq!(package.packaging_uri(), SIMPLE_ZIP_PACKAGING);
        assert!(package.spool_path().is_none());

        let bytes = package.to_bytes().await.unwrap();
        assert_eq!(bytes.len() as u64, package.size);
        assert_eq!(digest_bytes(&bytes).sha256, package.sha256);
        assert_eq!(package.manifest.files.len(), 2);
    }

    #[tokio::test]
    async fn test_spooled_package_is_removed_on_drop() {
        let source = source();
        let resources = build(&source, PackageFormat::BagIt, &files()).await;
        let spool = tempfile::tempdir().unwrap();
        let assembler = PackageAssembler::new(
            source,
            AssemblerConfig {
                memory_threshold_bytes: 1,
                spool_dir: spool.path().to_path_buf(),
            },
        );
        let repo = RepositoryConfig::new("repo", TransportKind::Ftp, "ftp.x");

        let package = assembler.assemble(Uuid::new_v4(), &resources, &repo).await.unwrap();
        let path = package.spool_path().unwrap().to_path_buf();
        assert!(path.starts_with(spool.path()));
        assert!(path.exists());

        drop(package);
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(spool.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_failed_assembly_leaves_no_spool_file() {
        let source = source();
        let mut resources = build(&source, PackageFormat::BagIt, &files()).await;
        resources[1].sha256 = "0".repeat(64);

        let spool = tempfile::tempdir().unwrap();
        let assembler = PackageAssembler::new(
            source,
            AssemblerConfig {
                memory_threshold_bytes: 1,
                spool_dir: spool.path().to_path_buf(),
            },
        );
        let repo = RepositoryConfig::new("repo", TransportKind::Ftp, "ftp.x");

        let err = assembler.assemble(Uuid::new_v4(), &resources, &repo).await.unwrap_err();
        assert!(matches!(err, PackagingError::ChecksumMismatch { .. }));
        assert_eq!(std::fs::read_dir(spool.path()).unwrap().count(), 0);
    }
}
