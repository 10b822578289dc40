//! Store capability traits
//!
//! The pipeline is built from three capability levels:
//! - `Source`: can serve bytes for a URL (`fetch`)
//! - `Store`: a source that can also report what it holds (`peek`)
//! - `MutableStore`: a store that can record, mutate and remove entries
//!
//! Every store serializes its operations on a single FIFO queue; callers
//! may invoke from any task. Results are delivered through the receiver
//! callbacks (or the method's return value) once the operation has run.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use bytes::Bytes;

use crate::info::ResourceInfo;
use crate::policy::CachePolicy;
use crate::progress::Progress;
use crate::receiver::BoxReceiver;

/// A component that can serve byte resources keyed by URL.
#[async_trait]
pub trait Source: Send + Sync {
    /// Stream `[offset, offset+length)` of the resource into `receiver`.
    /// `length` of `None` means through the end. A miss is delivered as
    /// `on_aborted(None)`, never as an error.
    async fn fetch(
        &self,
        url: &str,
        offset: u64,
        length: Option<u64>,
        policy: CachePolicy,
        progress: Progress,
        receiver: BoxReceiver,
    );
}

/// A source that can report what it currently holds.
#[async_trait]
pub trait Store: Source {
    /// Metadata and stored byte count for `url`, or `(None, None)`.
    async fn peek(&self, url: &str) -> (Option<ResourceInfo>, Option<u64>);
}

/// A store that records, mutates and removes entries.
#[async_trait]
pub trait MutableStore: Store {
    /// A streaming receiver that persists whatever is written into it under
    /// `url`. `None` when this store cannot accept the entry.
    async fn store_receiver(&self, url: &str, policy: CachePolicy) -> Option<BoxReceiver>;

    /// Record a complete resource synchronously. An expired policy removes
    /// the entry instead.
    async fn store(&self, url: &str, info: ResourceInfo, policy: CachePolicy, data: Bytes);

    /// Mutate the stored policy in place. An expired policy removes.
    async fn change_policy(&self, url: &str, policy: CachePolicy);

    async fn remove(&self, url: &str);

    /// Delete every entry whose policy has expired.
    async fn remove_expired(&self);

    async fn remove_all(&self);
}
