//! Package manifest and BagIt tag files
//!
//! Everything rendered here must be a pure function of its inputs; no
//! timestamps, no hash-map iteration order.

use dps_common::checksum::digest_bytes;
use dps_common::ResourceRole;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::PackageFormat;
use crate::resources::Resource;

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub role: ResourceRole,
    pub media_type: String,
    pub size: u64,
    pub sha256: String,
    pub md5: String,
}

/// `manifest.json` carried inside every package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageManifest {
    pub submission_id: Uuid,
    pub repository_id: String,
    pub format: PackageFormat,
    pub files: Vec<ManifestEntry>,
}

impl PackageManifest {
    pub fn new(
        submission_id: Uuid,
        repository_id: impl Into<String>,
        format: PackageFormat,
        resources: &[Resource],
    ) -> Self {
        let files = resources
            .iter()
            .map(|r| ManifestEntry {
                path: r.target_path.clone(),
                role: r.role,
                media_type: r.media_type.clone(),
                size: r.size,
                sha256: r.sha256.clone(),
                md5: r.md5.clone(),
            })
            .collect();

        Self {
            submission_id,
            repository_id: repository_id.into(),
            format,
            files,
        }
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    pub fn to_json_bytes(&self) -> serde_json::Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

// ============================================================================
// BagIt 1.0
// ============================================================================

pub const BAGIT_TXT: &str = "bagit.txt";
pub const BAG_INFO_TXT: &str = "bag-info.txt";
pub const MANIFEST_SHA256_TXT: &str = "manifest-sha256.txt";
pub const TAGMANIFEST_SHA256_TXT: &str = "tagmanifest-sha256.txt";

/// Tag files of a bag, in archive order
pub struct BagTagFiles {
    pub files: Vec<(&'static str, Vec<u8>)>,
}

impl BagTagFiles {
    pub fn render(manifest: &PackageManifest, manifest_json: &[u8]) -> Self {
        let bagit = b"BagIt-Version: 1.0\nTag-File-Character-Encoding: UTF-8\n".to_vec();

        let bag_info = format!(
            "External-Identifier: {}\nPayload-Oxum: {}.{}\n",
            manifest.submission_id,
            manifest.total_size(),
            manifest.files.len()
        )
        .into_bytes();

        let mut payload_manifest = String::new();
        for file in &manifest.files {
            payload_manifest.push_str(&format!("{}  {}\n", file.sha256, file.path));
        }
        let payload_manifest = payload_manifest.into_bytes();

        let mut files: Vec<(&'static str, Vec<u8>)> = vec![
            (BAGIT_TXT, bagit),
            (BAG_INFO_TXT, bag_info),
            (MANIFEST_SHA256_TXT, payload_manifest),
            (MANIFEST_FILE, manifest_json.to_vec()),
        ];

        let mut tag_manifest = String::new();
        for (name, content) in &files {
            tag_manifest.push_str(&format!("{}  {}\n", digest_bytes(content).sha256, name));
        }
        files.push((TAGMANIFEST_SHA256_TXT, tag_manifest.into_bytes()));

        Self { files }
    }
}
