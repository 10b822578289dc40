//! Buffering sink
//!
//! Accumulates a delivered segment into memory, bounded by `size_limit`.
//! When the declared segment is too large, or a partial segment arrives and
//! `accept_partial` is off, the buffer is dropped and further chunks are
//! discarded; the completion still fires so callers always get an answer.

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use crate::error::CacheError;
use crate::info::ResourceInfo;
use crate::progress::Progress;
use crate::receiver::{Receiver, ResponseHandle};

/// What a finished buffer sink hands to its completion.
pub struct BufferOutcome {
    pub info: Option<ResourceInfo>,
    /// Accumulated bytes; `None` when the buffer was dropped
    pub data: Option<Bytes>,
    /// Offset of the delivered segment within the complete resource
    pub offset: u64,
    /// True on `on_finished`, false on `on_aborted`
    pub success: bool,
    pub error: Option<CacheError>,
    pub cancelled: bool,
}

type Completion = Box<dyn FnOnce(BufferOutcome) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

pub struct BufferReceiver {
    size_limit: u64,
    accept_partial: bool,
    info: Option<ResourceInfo>,
    offset: u64,
    buffer: Option<BytesMut>,
    progress: Option<Progress>,
    completion: Option<Completion>,
    done: bool,
}

impl BufferReceiver {
    pub fn new<F, Fut>(size_limit: u64, accept_partial: bool, completion: F) -> Self
    where
        F: FnOnce(BufferOutcome) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            size_limit,
            accept_partial,
            info: None,
            offset: 0,
            buffer: Some(BytesMut::new()),
            progress: None,
            completion: Some(Box::new(move |outcome| Box::pin(completion(outcome)))),
            done: false,
        }
    }

    async fn complete(&mut self, success: bool, error: Option<CacheError>) {
        if self.done {
            return;
        }
        self.done = true;

        let cancelled = self
            .progress
            .as_ref()
            .map(|p| p.is_cancelled())
            .unwrap_or(false);
        if let Some(completion) = self.completion.take() {
            completion(BufferOutcome {
                info: self.info.take(),
                data: self.buffer.take().map(BytesMut::freeze),
                offset: self.offset,
                success,
                error,
                cancelled,
            })
            .await;
        }
    }
}

#[async_trait]
impl Receiver for BufferReceiver {
    async fn on_inited(&mut self, _response: Option<&ResponseHandle>, progress: &Progress) {
        self.progress = Some(progress.clone());
    }

    async fn on_started(&mut self, info: ResourceInfo, offset: u64, length: Option<u64>) {
        if let Some(declared) = length {
            if declared > self.size_limit {
                self.buffer = None;
            }
        }
        if !self.accept_partial {
            let partial = offset != 0
                || matches!(
                    (length, info.total_length),
                    (Some(len), Some(total)) if len != total
                );
            if partial {
                self.buffer = None;
            }
        }
        self.offset = offset;
        self.info = Some(info);
    }

    async fn on_data(&mut self, chunk: Bytes) {
        if let Some(buffer) = self.buffer.as_mut() {
            if buffer.len() as u64 + chunk.len() as u64 > self.size_limit {
                self.buffer = None;
            } else {
                buffer.extend_from_slice(&chunk);
            }
        }
    }

    async fn on_finished(&mut self) {
        self.complete(true, None).await;
    }

    async fn on_aborted(&mut self, error: Option<CacheError>) {
        self.complete(false, error).await;
    }
}
