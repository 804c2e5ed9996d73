//! File sharing side-channel.
//!
//! Large payloads are stored out of band and referenced from events by a
//! [`FileHandle`]. Content is addressed by its SHA-256 digest, so storing
//! the same bytes twice returns the same handle and writes nothing new.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::event::FileHandle;

/// Blob store errors.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(String),
    #[error("blob {digest} is corrupt (stored content hashes differently)")]
    DigestMismatch { digest: String },
    #[error("invalid blob digest: {0}")]
    InvalidDigest(String),
    #[error("blob I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Put/Get contract of the side-channel.
pub trait FileSharing: Send + Sync {
    /// Store `bytes`; idempotent for identical content.
    fn put_blob(&self, bytes: &[u8]) -> Result<FileHandle, BlobError>;

    /// Fetch the bytes behind `handle`.
    fn get_blob(&self, handle: &FileHandle) -> Result<Vec<u8>, BlobError>;
}

/// Lowercase hex SHA-256.
pub fn content_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Blobs stored as files under a local directory.
///
/// Layout: `<root>/<first 2 hex chars>/<digest>`.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, BlobError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        log::info!("Blob store at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, digest: &str) -> Result<PathBuf, BlobError> {
        if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(BlobError::InvalidDigest(digest.to_string()));
        }
        Ok(self.root.join(&digest[..2]).join(digest))
    }

    pub fn contains(&self, handle: &FileHandle) -> bool {
        self.blob_path(&handle.digest).is_ok_and(|path| path.is_file())
    }

    /// Remove a blob; returns whether it existed.
    pub fn evict(&self, handle: &FileHandle) -> Result<bool, BlobError> {
        let path = self.blob_path(&handle.digest)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl FileSharing for LocalBlobStore {
    fn put_blob(&self, bytes: &[u8]) -> Result<FileHandle, BlobError> {
        let handle = FileHandle {
            digest: content_digest(bytes),
            size: bytes.len() as u64,
        };
        let path = self.blob_path(&handle.digest)?;
        if path.is_file() {
            log::debug!("Blob {} already stored", handle.digest);
            return Ok(handle);
        }

        let Some(parent) = path.parent() else {
            return Err(BlobError::InvalidDigest(handle.digest));
        };
        fs::create_dir_all(parent)?;

        // Write aside then rename so readers never see a partial blob
        let staging = parent.join(format!(".{}.{}", handle.digest, Uuid::new_v4()));
        let mut file = fs::File::create(&staging)?;
        let written = file.write_all(bytes).and_then(|_| file.sync_all());
        if let Err(e) = written.and_then(|_| fs::rename(&staging, &path)) {
            let _ = fs::remove_file(&staging);
            return Err(e.into());
        }

        log::debug!("Stored blob {} ({} bytes)", handle.digest, handle.size);
        Ok(handle)
    }

    fn get_blob(&self, handle: &FileHandle) -> Result<Vec<u8>, BlobError> {
        let path = self.blob_path(&handle.digest)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BlobError::NotFound(handle.digest.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        if content_digest(&bytes) != handle.digest {
            return Err(BlobError::DigestMismatch {
                digest: handle.digest.clone(),
            });
        }
        Ok(bytes)
    }
}
