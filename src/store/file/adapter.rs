//! Filesystem adapter
//!
//! The `FileStore` façade never touches the filesystem itself; all access
//! goes through a `FileStoreAdapter`. The default `FsAdapter` runs on
//! `tokio::fs` with a pluggable sidecar backend.
//!
//! Invariants maintained here:
//! - every payload has a valid sidecar; a payload whose sidecar is missing,
//!   unparseable or expired is deleted on the next read
//! - `open_output` at a nonzero offset resumes only when the existing
//!   sidecar matches the incoming metadata (policy excluded)

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::warn;

use crate::error::CacheError;
use crate::info::StorageInfo;
use crate::store::file::sidecar::{MetaFileSidecar, SidecarStore};

/// Read granularity for streaming fetches; cancellation is checked between
/// chunks of this size.
pub const READ_CHUNK_SIZE: usize = 64 * 1024;

/// A readable window of a payload file, limited to the resolved length.
pub struct FileSlice {
    file: Option<File>,
    remaining: u64,
}

impl FileSlice {
    fn new(file: File, limit: u64) -> Self {
        Self {
            file: Some(file),
            remaining: limit,
        }
    }

    /// Zero-length stream that reports immediate EOF.
    fn null() -> Self {
        Self {
            file: None,
            remaining: 0,
        }
    }

    /// Bytes this slice will deliver at most.
    pub fn limit(&self) -> u64 {
        self.remaining
    }

    /// Next chunk of at most `READ_CHUNK_SIZE` bytes; `None` at EOF or once
    /// the limit is exhausted.
    pub async fn read_chunk(&mut self) -> std::io::Result<Option<Bytes>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let file = match self.file.as_mut() {
            Some(file) => file,
            None => return Ok(None),
        };
        let want = READ_CHUNK_SIZE.min(self.remaining as usize);
        let mut buf = vec![0u8; want];
        let read = file.read(&mut buf).await?;
        if read == 0 {
            self.remaining = 0;
            return Ok(None);
        }
        buf.truncate(read);
        self.remaining -= read as u64;
        Ok(Some(Bytes::from(buf)))
    }
}

/// A writable payload positioned at the requested offset. The file is
/// truncated to the final write position on close, so rewriting an entry
/// with fewer bytes leaves no stale tail.
pub struct FileWriter {
    file: File,
    position: u64,
}

impl FileWriter {
    pub async fn write(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self.file.write_all(chunk).await?;
        self.position += chunk.len() as u64;
        Ok(())
    }

    pub async fn close(mut self) -> std::io::Result<()> {
        self.file.flush().await?;
        self.file.set_len(self.position).await?;
        Ok(())
    }
}

/// Filesystem operations behind the `FileStore`.
#[async_trait]
pub trait FileStoreAdapter: Send + Sync {
    /// Open `[offset, offset+length)` of the payload at `path`. `Ok(None)`
    /// means absence: no entry, or a partial entry that cannot serve the
    /// requested range yet.
    async fn open_input(
        &self,
        path: &Path,
        offset: u64,
        length: Option<u64>,
    ) -> Result<Option<(StorageInfo, FileSlice)>, CacheError>;

    /// Open the payload at `path` for writing at `offset`. `Ok(None)` means
    /// the write cannot proceed (resume metadata mismatch, offset past the
    /// materialized bytes).
    async fn open_output(
        &self,
        path: &Path,
        meta: &StorageInfo,
        offset: u64,
    ) -> Result<Option<FileWriter>, CacheError>;

    /// Sidecar and payload size, or `None`. Invalid or expired sidecars are
    /// deleted along with their payload.
    async fn read_meta(&self, path: &Path) -> Result<Option<(StorageInfo, u64)>, CacheError>;

    /// Rewrite the sidecar of an existing payload. `Ok(false)` when there
    /// is no payload to attach it to.
    async fn write_meta(&self, path: &Path, meta: &StorageInfo) -> Result<bool, CacheError>;

    /// Delete payload and sidecar. Idempotent.
    async fn remove(&self, path: &Path) -> Result<(), CacheError>;

    /// Delete a group subtree. Idempotent.
    async fn remove_dir(&self, path: &Path) -> Result<(), CacheError>;

    /// All payload paths under `root`, descending one level into group
    /// subdirectories.
    async fn list_payloads(&self, root: &Path) -> Result<Vec<PathBuf>, CacheError>;

    /// Delete every entry and group subtree under `root`, keeping `root`.
    async fn remove_all(&self, root: &Path) -> Result<(), CacheError>;
}

/// Default adapter on `tokio::fs`.
pub struct FsAdapter {
    sidecar: Arc<dyn SidecarStore>,
}

impl FsAdapter {
    pub fn new() -> Self {
        Self {
            sidecar: Arc::new(MetaFileSidecar::new()),
        }
    }

    pub fn with_sidecar(sidecar: Arc<dyn SidecarStore>) -> Self {
        Self { sidecar }
    }

    /// Load and validate the sidecar. Unparseable or expired records delete
    /// the whole entry and report absence.
    async fn load_sidecar(&self, path: &Path) -> Result<Option<StorageInfo>, CacheError> {
        let raw = match self.sidecar.read(path).await? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let meta = match StorageInfo::from_sidecar_json(&raw) {
            Ok(meta) => meta,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "invalid sidecar, removing entry");
                self.remove(path).await?;
                return Ok(None);
            }
        };
        if meta.policy.is_expired() {
            self.remove(path).await?;
            return Ok(None);
        }
        Ok(Some(meta))
    }

    async fn payload_size(path: &Path) -> std::io::Result<Option<u64>> {
        match tokio::fs::metadata(path).await {
            Ok(metadata) => Ok(Some(metadata.len())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}

impl Default for FsAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileStoreAdapter for FsAdapter {
    async fn open_input(
        &self,
        path: &Path,
        offset: u64,
        length: Option<u64>,
    ) -> Result<Option<(StorageInfo, FileSlice)>, CacheError> {
        let meta = match self.load_sidecar(path).await? {
            Some(meta) => meta,
            None => return Ok(None),
        };

        let mut file = match File::open(path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                // Sidecar without payload: clean up the orphan
                self.sidecar.remove(path).await?;
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        let file_size = file.metadata().await?.len();

        let total = meta.info.total_length.unwrap_or(file_size);
        let mut length = length.unwrap_or_else(|| total.saturating_sub(offset));
        if length == 0 {
            return Ok(Some((meta, FileSlice::null())));
        }

        if offset + length > file_size {
            if total <= file_size && offset < total {
                // Fully materialized; clamp to the real tail
                length = total - offset;
            } else if offset >= total {
                return Ok(Some((meta, FileSlice::null())));
            } else {
                // Partially materialized and the range is not available yet
                return Ok(None);
            }
        }

        file.seek(SeekFrom::Start(offset)).await?;
        Ok(Some((meta, FileSlice::new(file, length))))
    }

    async fn open_output(
        &self,
        path: &Path,
        meta: &StorageInfo,
        offset: u64,
    ) -> Result<Option<FileWriter>, CacheError> {
        if offset == 0 {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .open(path)
                .await?;
            self.sidecar.write(path, meta.to_sidecar_json()?).await?;
            return Ok(Some(FileWriter { file, position: 0 }));
        }

        let existing = match self.load_sidecar(path).await? {
            Some(existing) => existing,
            None => return Ok(None),
        };
        if !existing.matches_payload(meta) {
            self.remove(path).await?;
            return Ok(None);
        }

        let mut file = match OpenOptions::new().write(true).open(path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.sidecar.remove(path).await?;
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        let file_size = file.metadata().await?.len();
        if offset > file_size {
            return Ok(None);
        }
        file.set_len(offset).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(Some(FileWriter {
            file,
            position: offset,
        }))
    }

    async fn read_meta(&self, path: &Path) -> Result<Option<(StorageInfo, u64)>, CacheError> {
        let meta = match self.load_sidecar(path).await? {
            Some(meta) => meta,
            None => return Ok(None),
        };
        match Self::payload_size(path).await? {
            Some(size) => Ok(Some((meta, size))),
            None => {
                self.sidecar.remove(path).await?;
                Ok(None)
            }
        }
    }

    async fn write_meta(&self, path: &Path, meta: &StorageInfo) -> Result<bool, CacheError> {
        if Self::payload_size(path).await?.is_none() {
            return Ok(false);
        }
        self.sidecar.write(path, meta.to_sidecar_json()?).await?;
        Ok(true)
    }

    async fn remove(&self, path: &Path) -> Result<(), CacheError> {
        self.sidecar.remove(path).await?;
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn remove_dir(&self, path: &Path) -> Result<(), CacheError> {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_payloads(&self, root: &Path) -> Result<Vec<PathBuf>, CacheError> {
        let mut payloads = Vec::new();
        let mut top = match tokio::fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(payloads),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = top.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                let mut sub = tokio::fs::read_dir(&path).await?;
                while let Some(entry) = sub.next_entry().await? {
                    let path = entry.path();
                    if entry.file_type().await?.is_file()
                        && !self.sidecar.is_sidecar_path(&path)
                    {
                        payloads.push(path);
                    }
                }
            } else if file_type.is_file() && !self.sidecar.is_sidecar_path(&path) {
                payloads.push(path);
            }
        }
        Ok(payloads)
    }

    async fn remove_all(&self, root: &Path) -> Result<(), CacheError> {
        let mut top = match tokio::fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = top.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                self.remove_dir(&path).await?;
            } else {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Ok(())
    }
}
