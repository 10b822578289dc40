//! Shared test receivers and sources
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use webcache::policy::CachePolicy;
use webcache::progress::Progress;
use webcache::receiver::{BoxReceiver, Receiver, ResponseHandle};
use webcache::store::Source;
use webcache::{CacheError, ResourceInfo};

/// Receiver that records the whole delivery for assertions.
pub struct Collect {
    state: Arc<Mutex<CollectState>>,
}

#[derive(Default)]
pub struct CollectState {
    pub inited: bool,
    pub response_status: Option<u16>,
    pub info: Option<ResourceInfo>,
    pub offset: u64,
    pub length: Option<u64>,
    pub started: bool,
    pub data: Vec<u8>,
    pub chunks: usize,
    pub finished: bool,
    pub aborted: Option<Option<CacheError>>,
}

impl Collect {
    pub fn new() -> (Self, Arc<Mutex<CollectState>>) {
        let state = Arc::new(Mutex::new(CollectState::default()));
        (
            Self {
                state: state.clone(),
            },
            state,
        )
    }
}

#[async_trait]
impl Receiver for Collect {
    async fn on_inited(&mut self, response: Option<&ResponseHandle>, _progress: &Progress) {
        let mut state = self.state.lock();
        state.inited = true;
        state.response_status = response.map(|r| r.status);
    }

    async fn on_started(&mut self, info: ResourceInfo, offset: u64, length: Option<u64>) {
        let mut state = self.state.lock();
        state.started = true;
        state.info = Some(info);
        state.offset = offset;
        state.length = length;
    }

    async fn on_data(&mut self, chunk: Bytes) {
        let mut state = self.state.lock();
        state.chunks += 1;
        state.data.extend_from_slice(&chunk);
    }

    async fn on_finished(&mut self) {
        self.state.lock().finished = true;
    }

    async fn on_aborted(&mut self, error: Option<CacheError>) {
        self.state.lock().aborted = Some(error);
    }
}

/// Source serving slices of a fixed blob, recording the ranges it was
/// asked for.
pub struct BlobSource {
    data: Bytes,
    info: ResourceInfo,
    pub fetches: Arc<AtomicUsize>,
    pub ranges: Arc<Mutex<Vec<(u64, Option<u64>)>>>,
}

impl BlobSource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let info = ResourceInfo::default().with_total_length(data.len() as u64);
        Self {
            data,
            info,
            fetches: Arc::new(AtomicUsize::new(0)),
            ranges: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_info(mut self, info: ResourceInfo) -> Self {
        self.info = info;
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Source for BlobSource {
    async fn fetch(
        &self,
        _url: &str,
        offset: u64,
        length: Option<u64>,
        _policy: CachePolicy,
        progress: Progress,
        mut receiver: BoxReceiver,
    ) {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.ranges.lock().push((offset, length));

        receiver.on_inited(None, &progress).await;
        let total = self.data.len() as u64;
        if offset > total {
            receiver.on_aborted(None).await;
            return;
        }
        let length = length.unwrap_or(total - offset).min(total - offset);
        receiver
            .on_started(self.info.clone(), offset, Some(length))
            .await;
        receiver
            .on_data(self.data.slice(offset as usize..(offset + length) as usize))
            .await;
        receiver.on_finished().await;
    }
}
