//! Content-addressed blob store for oversized invocation payloads.
//!
//! Blobs are gzip-compressed and immutable. Identity is `{type}-{hex}`
//! (blake3 of the uncompressed payload); the on-disk path nests the two
//! leading hex-character pairs as directories to bound directory fan-out:
//! `root/ab/cd/{type}-abcd....gz`.

use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use lmtrace_core::id::BlobId;

use crate::error::StorageError;

/// Filesystem-backed, content-addressed blob store.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        BlobStore { root: root.into() }
    }

    /// Stores a payload under its content identity.
    ///
    /// Idempotent: if the blob already exists the write is skipped and the
    /// existing identity is returned -- content-addressed blobs never
    /// change after creation.
    pub fn store(&self, kind: &str, payload: &[u8]) -> Result<BlobId, StorageError> {
        let id = BlobId::derive(kind, payload);
        let path = self.path_for(&id)?;
        if path.exists() {
            return Ok(id);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::File::create(&path)?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(payload)?;
        encoder.finish()?;
        Ok(id)
    }

    /// Reads back and decompresses a stored blob.
    pub fn retrieve(&self, id: &BlobId) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(id)?;
        if !path.exists() {
            return Err(StorageError::BlobNotFound(id.0.clone()));
        }
        let file = fs::File::open(&path)?;
        let mut decoder = GzDecoder::new(file);
        let mut payload = Vec::new();
        decoder.read_to_end(&mut payload)?;
        Ok(payload)
    }

    /// On-disk path for a blob id, nesting leading hex pairs as directories.
    fn path_for(&self, id: &BlobId) -> Result<PathBuf, StorageError> {
        let (_, hex) = id.parts()?;
        Ok(self
            .root
            .join(&hex[0..2])
            .join(&hex[2..4])
            .join(format!("{}.gz", id.0)))
    }
}
