//! Checksum utilities for package resources
//!
//! Resources are digested in a single pass: SHA-256 (manifests, BagIt) and
//! MD5 (SWORD `Content-MD5`) are computed from the same read, together with
//! the byte count.

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Digests computed over one byte stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Digests {
    pub sha256: String,
    pub md5: String,
    pub size: u64,
}

/// Incremental hasher feeding SHA-256 and MD5 at once
pub struct DigestWriter {
    sha256: Sha256,
    md5: md5::Context,
    size: u64,
}

impl Default for DigestWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl DigestWriter {
    pub fn new() -> Self {
        Self {
            sha256: Sha256::new(),
            md5: md5::Context::new(),
            size: 0,
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.sha256.update(chunk);
        self.md5.consume(chunk);
        self.size += chunk.len() as u64;
    }

    pub fn finish(self) -> Digests {
        Digests {
            sha256: hex::encode(self.sha256.finalize()),
            md5: format!("{:x}", self.md5.compute()),
            size: self.size,
        }
    }
}

/// Compute digests for any readable source
pub fn compute_digests<R: Read>(reader: &mut R) -> Result<Digests> {
    let mut writer = DigestWriter::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        writer.update(&buffer[..bytes_read]);
    }

    Ok(writer.finish())
}

/// Compute digests for a byte slice
pub fn digest_bytes(data: &[u8]) -> Digests {
    let mut writer = DigestWriter::new();
    writer.update(data);
    writer.finish()
}

/// Compute digests for a file
pub fn compute_file_digests(path: impl AsRef<Path>) -> Result<Digests> {
    let mut file = std::fs::File::open(path)?;
    compute_digests(&mut file)
}
