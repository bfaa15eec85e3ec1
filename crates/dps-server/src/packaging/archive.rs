//! Deterministic archive writers
//!
//! Entry metadata is pinned: mtime 0 (1980-01-01 in ZIP), mode 0644, uid/gid
//! 0, entries in manifest order, gzip header without name or timestamp.

use dps_common::checksum::{DigestWriter, Digests};
use flate2::{Compression, GzBuilder};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use tempfile::NamedTempFile;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::manifest::{BagTagFiles, MANIFEST_FILE};
use super::PackagingError;
use crate::resources::Resource;

const FILE_MODE: u32 = 0o644;

/// Opens the bytes of a resource for copying into the archive
pub(crate) type OpenResource<'a> = dyn FnMut(&Resource) -> Result<Box<dyn Read>, PackagingError> + 'a;

/// Archive destination: memory below the spool threshold, a temp file above it
pub(crate) enum ArchiveSink {
    Memory(Cursor<Vec<u8>>),
    Spool(NamedTempFile),
}

impl Write for ArchiveSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            ArchiveSink::Memory(cursor) => cursor.write(buf),
            ArchiveSink::Spool(file) => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            ArchiveSink::Memory(cursor) => cursor.flush(),
            ArchiveSink::Spool(file) => file.flush(),
        }
    }
}

impl Seek for ArchiveSink {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            ArchiveSink::Memory(cursor) => cursor.seek(pos),
            ArchiveSink::Spool(file) => file.seek(pos),
        }
    }
}

/// Reader that digests everything passing through it
struct HashingReader<R> {
    inner: R,
    digest: DigestWriter,
}

impl<R: Read> HashingReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            digest: DigestWriter::new(),
        }
    }

    fn finish(self) -> Digests {
        self.digest.finish()
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digest.update(&buf[..n]);
        Ok(n)
    }
}

fn verify(resource: &Resource, digests: Digests) -> Result<(), PackagingError> {
    if digests.size != resource.size || !digests.sha256.eq_ignore_ascii_case(&resource.sha256) {
        return Err(PackagingError::ChecksumMismatch {
            path: resource.target_path.clone(),
            expected: resource.sha256.clone(),
            actual: digests.sha256,
        });
    }
    Ok(())
}

fn zip_error(e: zip::result::ZipError) -> PackagingError {
    PackagingError::Archive(e.to_string())
}

/// SWORD SimpleZip: `manifest.json` followed by the payload
pub(crate) fn write_simple_zip<W: Write + Seek>(
    sink: W,
    manifest_json: &[u8],
    resources: &[Resource],
    open: &mut OpenResource<'_>,
) -> Result<W, PackagingError> {
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(FILE_MODE);

    let mut zip = ZipWriter::new(sink);

    zip.start_file(MANIFEST_FILE, options).map_err(zip_error)?;
    zip.write_all(manifest_json)?;

    for resource in resources {
        zip.start_file(resource.target_path.as_str(), options)
            .map_err(zip_error)?;
        let mut reader = HashingReader::new(open(resource)?);
        io::copy(&mut reader, &mut zip)?;
        verify(resource, reader.finish())?;
    }

    zip.finish().map_err(zip_error)
}

fn tar_header(size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(size);
    header.set_mode(FILE_MODE);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header
}

/// BagIt bag as `.tar.gz`, rooted at `<bag_name>/`
pub(crate) fn write_bagit<W: Write>(
    sink: W,
    bag_name: &str,
    tags: &BagTagFiles,
    resources: &[Resource],
    open: &mut OpenResource<'_>,
) -> Result<W, PackagingError> {
    let encoder = GzBuilder::new().mtime(0).write(sink, Compression::default());
    let mut tar = tar::Builder::new(encoder);
    tar.mode(tar::HeaderMode::Deterministic);

    for (name, content) in &tags.files {
        let mut header = tar_header(content.len() as u64);
        tar.append_data(&mut header, format!("{}/{}", bag_name, name), content.as_slice())?;
    }

    for resource in resources {
        let mut header = tar_header(resource.size);
        let mut reader = HashingReader::new(open(resource)?);
        tar.append_data(
            &mut header,
            format!("{}/{}", bag_name, resource.target_path),
            &mut reader,
        )?;
        verify(resource, reader.finish())?;
    }

    let encoder = tar.into_inner()?;
    Ok(encoder.finish()?)
}
