//! Streaming receiver protocol
//!
//! A `Receiver` is the streaming sink for any fetch. Its lifecycle is a
//! four-phase state machine:
//!
//! ```text
//! on_inited -> on_started -> (on_data)* -> on_finished
//!      \            \______________________ on_aborted
//!       \___________________________________ on_aborted
//! ```
//!
//! `on_inited` is always delivered first; exactly one of `on_finished` /
//! `on_aborted` terminates the stream. `on_aborted(None)` means a cold miss
//! or a cancellation, never a failure.
//!
//! Chunks delivered through `on_data` are ordered, non-overlapping and
//! contiguous within the segment announced by `on_started`.

pub mod buffer;
pub mod filter;

pub use buffer::{BufferOutcome, BufferReceiver};
pub use filter::FilterReceiver;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::CacheError;
use crate::info::ResourceInfo;
use crate::progress::Progress;

/// Snapshot of a raw transport response, passed to decorators through
/// `on_inited`. Store-served fetches carry no response.
#[derive(Debug, Clone)]
pub struct ResponseHandle {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

pub type BoxReceiver = Box<dyn Receiver>;

/// Streaming sink callbacks. Each phase is one-shot per fetch.
#[async_trait]
pub trait Receiver: Send {
    /// Always called first. `response` is present only for transport-backed
    /// fetches.
    async fn on_inited(&mut self, response: Option<&ResponseHandle>, progress: &Progress);

    /// The segment to be delivered is known. `offset` is the byte position
    /// within the complete resource; `length` is absent when the origin did
    /// not declare one.
    async fn on_started(&mut self, info: ResourceInfo, offset: u64, length: Option<u64>);

    /// Zero or more ordered, contiguous chunks.
    async fn on_data(&mut self, chunk: Bytes);

    /// Successful end of the segment.
    async fn on_finished(&mut self);

    /// Terminal failure, miss (`None`) or cancellation (`None`).
    async fn on_aborted(&mut self, error: Option<CacheError>);
}

/// Receiver that discards everything. Used when only the side effects of a
/// fetch matter, e.g. prefetching through a tee.
pub struct NullReceiver;

#[async_trait]
impl Receiver for NullReceiver {
    async fn on_inited(&mut self, _response: Option<&ResponseHandle>, _progress: &Progress) {}

    async fn on_started(&mut self, _info: ResourceInfo, _offset: u64, _length: Option<u64>) {}

    async fn on_data(&mut self, _chunk: Bytes) {}

    async fn on_finished(&mut self) {}

    async fn on_aborted(&mut self, _error: Option<CacheError>) {}
}
