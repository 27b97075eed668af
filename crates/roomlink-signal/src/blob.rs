//! Blob store boundary
//!
//! File bytes never pass through signaling. Clients upload to the blob
//! store and then announce the file with `file-shared`; the server only
//! talks to the store to delete removed or expired files.
//!
//! Two implementations: an in-memory map and a directory on disk.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

use roomlink_core::ids::random_hex;
use roomlink_core::path::validate_file_name;
use roomlink_core::{now_millis, ErrorCode, FileRecord};

/// Blob store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("payload too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },

    #[error("invalid blob name: {0}")]
    InvalidName(String),

    #[error("storage I/O error: {0}")]
    Io(String),
}

impl From<&BlobError> for ErrorCode {
    fn from(e: &BlobError) -> Self {
        match e {
            BlobError::NotFound(_) => ErrorCode::NotFound,
            BlobError::TooLarge { .. } => ErrorCode::ResourceLimit,
            BlobError::InvalidName(_) => ErrorCode::ProtocolViolation,
            BlobError::Io(_) => ErrorCode::TransientIo,
        }
    }
}

/// Result of a successful upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobReceipt {
    /// Retrieval handle (`/download/<name>`)
    pub handle: String,
    /// Unix millis after which the blob is eligible for deletion
    pub expires_at: u64,
}

/// Durable byte storage keyed by file name
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data` under `name`, replacing any previous blob
    async fn upload(&self, data: Bytes, name: &str) -> Result<BlobReceipt, BlobError>;

    /// Delete the blob stored under `name`
    async fn delete(&self, name: &str) -> Result<(), BlobError>;

    /// Fetch a blob by retrieval handle
    async fn download(&self, handle: &str) -> Result<Bytes, BlobError>;
}

/// Limits shared by the blob store implementations
#[derive(Debug, Clone, Copy)]
pub struct BlobLimits {
    pub max_bytes: u64,
    pub expiry_ms: u64,
}

impl BlobLimits {
    /// Reject oversized payloads and bad names before touching storage
    fn check(&self, data: &Bytes, name: &str) -> Result<(), BlobError> {
        let size = data.len() as u64;
        if size > self.max_bytes {
            return Err(BlobError::TooLarge {
                size,
                max: self.max_bytes,
            });
        }
        validate_file_name(name).map_err(|e| BlobError::InvalidName(e.to_string()))
    }

    fn receipt(&self, name: &str) -> BlobReceipt {
        BlobReceipt {
            handle: FileRecord::handle_for(name),
            expires_at: now_millis().saturating_add(self.expiry_ms),
        }
    }
}

/// Resolve a retrieval handle (or a bare name) to a blob name
fn name_from_handle(handle: &str) -> Result<&str, BlobError> {
    let name = handle.strip_prefix("/download/").unwrap_or(handle);
    validate_file_name(name).map_err(|e| BlobError::InvalidName(e.to_string()))?;
    Ok(name)
}

/// In-memory blob store
pub struct MemoryBlobStore {
    blobs: DashMap<String, Bytes>,
    limits: BlobLimits,
}

impl MemoryBlobStore {
    pub fn new(limits: BlobLimits) -> Self {
        Self {
            blobs: DashMap::new(),
            limits,
        }
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(&self, data: Bytes, name: &str) -> Result<BlobReceipt, BlobError> {
        self.limits.check(&data, name)?;
        self.blobs.insert(name.to_string(), data);
        Ok(self.limits.receipt(name))
    }

    async fn delete(&self, name: &str) -> Result<(), BlobError> {
        self.blobs
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| BlobError::NotFound(name.to_string()))
    }

    async fn download(&self, handle: &str) -> Result<Bytes, BlobError> {
        let name = name_from_handle(handle)?;
        self.blobs
            .get(name)
            .map(|b| b.value().clone())
            .ok_or_else(|| BlobError::NotFound(name.to_string()))
    }
}

/// Blob store backed by a directory
///
/// Uploads are written to a temporary file and renamed into place, so a
/// failed upload never leaves a partial blob under the final name.
pub struct DiskBlobStore {
    dir: PathBuf,
    limits: BlobLimits,
}

impl DiskBlobStore {
    /// Open a blob directory, creating it if needed
    pub fn open(dir: impl AsRef<Path>, limits: BlobLimits) -> Result<Self, BlobError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| BlobError::Io(e.to_string()))?;
        Ok(Self { dir, limits })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn io_error(name: &str, e: std::io::Error) -> BlobError {
    if e.kind() == std::io::ErrorKind::NotFound {
        BlobError::NotFound(name.to_string())
    } else {
        BlobError::Io(e.to_string())
    }
}

#[async_trait]
impl BlobStore for DiskBlobStore {
    async fn upload(&self, data: Bytes, name: &str) -> Result<BlobReceipt, BlobError> {
        self.limits.check(&data, name)?;

        let path = self.dir.join(name);
        // Scratch name stays short whatever the blob name's length
        let scratch = random_hex(8).map_err(|e| BlobError::Io(e.to_string()))?;
        let partial = self.dir.join(format!(".{}.part", scratch));

        let written = match tokio::fs::write(&partial, &data).await {
            Ok(()) => tokio::fs::rename(&partial, &path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(BlobError::Io(e.to_string()));
        }

        debug!("Stored blob {} ({} bytes)", name, data.len());
        Ok(self.limits.receipt(name))
    }

    async fn delete(&self, name: &str) -> Result<(), BlobError> {
        validate_file_name(name).map_err(|e| BlobError::InvalidName(e.to_string()))?;
        tokio::fs::remove_file(self.dir.join(name))
            .await
            .map_err(|e| io_error(name, e))?;
        debug!("Deleted blob {}", name);
        Ok(())
    }

    async fn download(&self, handle: &str) -> Result<Bytes, BlobError> {
        let name = name_from_handle(handle)?;
        let data = tokio::fs::read(self.dir.join(name))
            .await
            .map_err(|e| io_error(name, e))?;
        Ok(Bytes::from(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> BlobLimits {
        BlobLimits {
            max_bytes: 16,
            expiry_ms: 1000,
        }
    }

    #[tokio::test]
    async fn test_memory_round_trip() {
        let store = MemoryBlobStore::new(limits());
        let receipt = store.upload(Bytes::from_static(b"hello"), "a.txt").await.unwrap();
        assert_eq!(receipt.handle, "/download/a.txt");
        assert!(receipt.expires_at >= 1000);

        assert_eq!(store.download(&receipt.handle).await.unwrap(), "hello");
        store.delete("a.txt").await.unwrap();
        assert_eq!(
            store.download(&receipt.handle).await,
            Err(BlobError::NotFound("a.txt".into()))
        );
        assert_eq!(
            store.delete("a.txt").await,
            Err(BlobError::NotFound("a.txt".into()))
        );
    }

    #[tokio::test]
    async fn test_rejects_before_storing() {
        let store = MemoryBlobStore::new(limits());

        let err = store.upload(Bytes::from(vec![0u8; 17]), "big.bin").await.unwrap_err();
        assert_eq!(err, BlobError::TooLarge { size: 17, max: 16 });
        assert_eq!(ErrorCode::from(&err), ErrorCode::ResourceLimit);

        let err = store.upload(Bytes::from_static(b"x"), "../x").await.unwrap_err();
        assert!(matches!(err, BlobError::InvalidName(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_disk_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskBlobStore::open(dir.path().join("blobs"), limits()).unwrap();

        let receipt = store.upload(Bytes::from_static(b"on disk"), "d.txt").await.unwrap();
        assert_eq!(entries(store.dir()), vec!["d.txt".to_string()]);
        assert_eq!(store.download(&receipt.handle).await.unwrap(), "on disk");

        store.delete("d.txt").await.unwrap();
        assert!(matches!(
            store.delete("d.txt").await,
            Err(BlobError::NotFound(_))
        ));
        assert!(matches!(
            store.download("/download/d.txt").await,
            Err(BlobError::NotFound(_))
        ));
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_disk_accepts_longest_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskBlobStore::open(dir.path(), limits()).unwrap();

        let name = "n".repeat(roomlink_core::MAX_FILENAME_LEN);
        store.upload(Bytes::from_static(b"x"), &name).await.unwrap();
        assert_eq!(entries(store.dir()), vec![name]);
    }

    #[tokio::test]
    async fn test_disk_failed_rename_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskBlobStore::open(dir.path(), limits()).unwrap();

        // a non-empty directory cannot be replaced by a file
        std::fs::create_dir(store.dir().join("taken")).unwrap();
        std::fs::write(store.dir().join("taken").join("inner"), b"x").unwrap();

        let err = store.upload(Bytes::from_static(b"data"), "taken").await.unwrap_err();
        assert!(matches!(err, BlobError::Io(_)));
        assert_eq!(entries(store.dir()), vec!["taken".to_string()]);
    }

    #[tokio::test]
    async fn test_disk_rejects_traversal_handles() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskBlobStore::open(dir.path(), limits()).unwrap();
        assert!(matches!(
            store.download("/download/../secret").await,
            Err(BlobError::InvalidName(_))
        ));
    }
}
