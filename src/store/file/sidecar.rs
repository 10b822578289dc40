//! Sidecar metadata storage
//!
//! Each payload file carries one metadata record named `WebCache` holding
//! the JSON object `{m, t, l, p, h}`. Where the record physically lives is
//! abstracted behind `SidecarStore`: an extended attribute on the payload
//! file where the platform supports it, or a sibling `.meta` file
//! everywhere else. The JSON schema is the interoperability contract and is
//! identical for both backends.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

/// Name of the sidecar record.
pub const SIDECAR_NAME: &str = "WebCache";

#[async_trait]
pub trait SidecarStore: Send + Sync {
    /// Raw sidecar bytes for `payload`, or `None` when absent.
    async fn read(&self, payload: &Path) -> io::Result<Option<Vec<u8>>>;

    /// Attach sidecar bytes to `payload`. The payload file must exist.
    async fn write(&self, payload: &Path, data: Vec<u8>) -> io::Result<()>;

    /// Remove the sidecar. Idempotent.
    async fn remove(&self, payload: &Path) -> io::Result<()>;

    /// True when `path` is sidecar bookkeeping rather than payload data.
    /// Used when enumerating a cache directory.
    fn is_sidecar_path(&self, path: &Path) -> bool;
}

/// Portable backend: the record lives in a sibling `<payload>.meta` file.
#[derive(Debug, Default)]
pub struct MetaFileSidecar;

impl MetaFileSidecar {
    pub fn new() -> Self {
        Self
    }

    fn meta_path(payload: &Path) -> PathBuf {
        // Payload names are bare hashes, so this appends rather than swaps
        payload.with_extension("meta")
    }
}

#[async_trait]
impl SidecarStore for MetaFileSidecar {
    async fn read(&self, payload: &Path) -> io::Result<Option<Vec<u8>>> {
        match tokio::fs::read(Self::meta_path(payload)).await {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn write(&self, payload: &Path, data: Vec<u8>) -> io::Result<()> {
        tokio::fs::write(Self::meta_path(payload), data).await
    }

    async fn remove(&self, payload: &Path) -> io::Result<()> {
        match tokio::fs::remove_file(Self::meta_path(payload)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn is_sidecar_path(&self, path: &Path) -> bool {
        path.extension().and_then(|ext| ext.to_str()) == Some("meta")
    }
}

/// Extended-attribute backend for unix platforms. Linux requires user
/// attributes to live in the `user.` namespace; other unixes take the bare
/// name.
#[cfg(unix)]
#[derive(Debug, Default)]
pub struct XattrSidecar;

#[cfg(unix)]
impl XattrSidecar {
    pub fn new() -> Self {
        Self
    }

    fn attr_name() -> &'static str {
        if cfg!(target_os = "linux") {
            "user.WebCache"
        } else {
            SIDECAR_NAME
        }
    }
}

#[cfg(unix)]
#[async_trait]
impl SidecarStore for XattrSidecar {
    async fn read(&self, payload: &Path) -> io::Result<Option<Vec<u8>>> {
        let path = payload.to_path_buf();
        tokio::task::spawn_blocking(move || match xattr::get(&path, Self::attr_name()) {
            Ok(value) => Ok(value),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        })
        .await
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?
    }

    async fn write(&self, payload: &Path, data: Vec<u8>) -> io::Result<()> {
        let path = payload.to_path_buf();
        tokio::task::spawn_blocking(move || xattr::set(&path, Self::attr_name(), &data))
            .await
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?
    }

    async fn remove(&self, payload: &Path) -> io::Result<()> {
        let path = payload.to_path_buf();
        tokio::task::spawn_blocking(
            move || match xattr::remove(&path, Self::attr_name()) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(err),
            },
        )
        .await
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?
    }

    fn is_sidecar_path(&self, _path: &Path) -> bool {
        false
    }
}
