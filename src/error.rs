//! Error types for cache operations
//!
//! A single error enum is shared by every store and source. Absence of an
//! entry is not an error: stores signal it as `on_aborted(None)` so that a
//! layered cache can fall through to the next layer. The enum is cheaply
//! cloneable because terminal receiver callbacks and tee filters both
//! observe the same error value.

use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// Requested byte range cannot be served from the available bytes
    #[error("range {offset}+{length:?} is not available")]
    RangeInvalid { offset: u64, length: Option<u64> },

    /// HTTP status outside {200, 204, 206, 404} or a connection failure
    #[error("transport failure for {url}: {message}")]
    Transport {
        url: String,
        status: Option<u16>,
        message: String,
    },

    /// Filesystem failure
    #[error("i/o error: {0}")]
    Io(Arc<std::io::Error>),

    /// Sidecar metadata could not be decoded
    #[error("metadata error: {0}")]
    Metadata(String),

    /// Back-pressure on a storing receiver stalled past its timeout
    #[error("write stalled past back-pressure timeout")]
    WriteStalled,
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Metadata(err.to_string())
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(err: reqwest::Error) -> Self {
        CacheError::Transport {
            url: err.url().map(|u| u.to_string()).unwrap_or_default(),
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}
