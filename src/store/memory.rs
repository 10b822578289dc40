//! In-memory store
//!
//! A keyed blob cache bounded by total cost (the sum of stored payload
//! bytes; metadata is amortized) and an optional entry count. Eviction is
//! approximately least-recently-used: reads refresh recency, `peek` does
//! not, and every insert pops LRU entries until both limits hold again.
//!
//! All operations run under the store's fair queue, so a store followed by
//! a fetch of the same URL always observes the store.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::CacheError;
use crate::info::{ResourceInfo, StorageInfo};
use crate::policy::CachePolicy;
use crate::progress::Progress;
use crate::receiver::{BoxReceiver, BufferReceiver};
use crate::store::{MutableStore, Source, Store};

/// Default total cost limit: 128 MiB of payload bytes.
pub const DEFAULT_TOTAL_COST_LIMIT: u64 = 128 * 1024 * 1024;

#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    queue: Mutex<MemoryState>,
    total_cost_limit: u64,
    count_limit: Option<usize>,
}

struct MemoryState {
    entries: LruCache<String, MemoryEntry>,
    cost: u64,
}

struct MemoryEntry {
    meta: StorageInfo,
    data: Bytes,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_TOTAL_COST_LIMIT, None)
    }

    /// `count_limit` of `None` means unlimited entry count.
    pub fn with_limits(total_cost_limit: u64, count_limit: Option<usize>) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                queue: Mutex::new(MemoryState {
                    entries: LruCache::unbounded(),
                    cost: 0,
                }),
                total_cost_limit,
                count_limit,
            }),
        }
    }

    pub fn total_cost_limit(&self) -> u64 {
        self.inner.total_cost_limit
    }

    /// Current payload cost in bytes.
    pub async fn cost(&self) -> u64 {
        self.inner.queue.lock().await.cost
    }

    pub async fn entry_count(&self) -> usize {
        self.inner.queue.lock().await.entries.len()
    }

    async fn insert(&self, url: &str, meta: StorageInfo, data: Bytes) {
        let mut state = self.inner.queue.lock().await;
        self.insert_locked(&mut state, url, meta, data);
    }

    fn insert_locked(&self, state: &mut MemoryState, url: &str, meta: StorageInfo, data: Bytes) {
        if let Some(previous) = state.entries.pop(url) {
            state.cost = state.cost.saturating_sub(previous.data.len() as u64);
        }
        state.cost += data.len() as u64;
        state.entries.push(url.to_string(), MemoryEntry { meta, data });

        // Bring both limits back within bounds
        while state.cost > self.inner.total_cost_limit
            || self
                .inner
                .count_limit
                .map(|limit| state.entries.len() > limit)
                .unwrap_or(false)
        {
            match state.entries.pop_lru() {
                Some((evicted_url, evicted)) => {
                    state.cost = state.cost.saturating_sub(evicted.data.len() as u64);
                    debug!(url = %evicted_url, "evicted memory entry");
                }
                None => break,
            }
        }
    }

    fn remove_locked(state: &mut MemoryState, url: &str) {
        if let Some(entry) = state.entries.pop(url) {
            state.cost = state.cost.saturating_sub(entry.data.len() as u64);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Source for MemoryStore {
    async fn fetch(
        &self,
        url: &str,
        offset: u64,
        length: Option<u64>,
        _policy: CachePolicy,
        progress: Progress,
        mut receiver: BoxReceiver,
    ) {
        let mut state = self.inner.queue.lock().await;
        receiver.on_inited(None, &progress).await;

        // Expired entries are deleted on sight
        let expired = state
            .entries
            .peek(url)
            .map(|e| e.meta.policy.is_expired())
            .unwrap_or(false);
        if expired {
            Self::remove_locked(&mut state, url);
        }

        let (info, data) = match state.entries.get(url) {
            Some(entry) => (entry.meta.info.clone(), entry.data.clone()),
            None => {
                receiver.on_aborted(None).await;
                return;
            }
        };

        let stored_len = data.len() as u64;
        if offset > stored_len {
            receiver
                .on_aborted(Some(CacheError::RangeInvalid { offset, length }))
                .await;
            return;
        }
        let length = length.unwrap_or(stored_len - offset);
        if offset + length > stored_len {
            receiver
                .on_aborted(Some(CacheError::RangeInvalid {
                    offset,
                    length: Some(length),
                }))
                .await;
            return;
        }

        if progress.total() < 0 {
            progress.set_total(length as i64);
        }
        receiver.on_started(info, offset, Some(length)).await;
        if progress.is_cancelled() {
            receiver.on_aborted(None).await;
            return;
        }
        receiver
            .on_data(data.slice(offset as usize..(offset + length) as usize))
            .await;
        progress.add_completed(length);
        receiver.on_finished().await;
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn peek(&self, url: &str) -> (Option<ResourceInfo>, Option<u64>) {
        let mut state = self.inner.queue.lock().await;
        let expired = state
            .entries
            .peek(url)
            .map(|e| e.meta.policy.is_expired())
            .unwrap_or(false);
        if expired {
            Self::remove_locked(&mut state, url);
            return (None, None);
        }
        match state.entries.peek(url) {
            Some(entry) => (
                Some(entry.meta.info.clone()),
                Some(entry.data.len() as u64),
            ),
            None => (None, None),
        }
    }
}

#[async_trait]
impl MutableStore for MemoryStore {
    async fn store_receiver(&self, url: &str, policy: CachePolicy) -> Option<BoxReceiver> {
        let store = self.clone();
        let url = url.to_string();
        let size_limit = self.inner.total_cost_limit / 4;
        Some(Box::new(BufferReceiver::new(
            size_limit,
            false,
            move |outcome| async move {
                if outcome.cancelled || !outcome.success {
                    return;
                }
                if let (Some(info), Some(data)) = (outcome.info, outcome.data) {
                    store
                        .insert(&url, StorageInfo::new(info, policy), data)
                        .await;
                }
            },
        )))
    }

    async fn store(&self, url: &str, info: ResourceInfo, policy: CachePolicy, data: Bytes) {
        let mut state = self.inner.queue.lock().await;
        if policy.is_expired() {
            Self::remove_locked(&mut state, url);
            return;
        }
        self.insert_locked(&mut state, url, StorageInfo::new(info, policy), data);
    }

    async fn change_policy(&self, url: &str, policy: CachePolicy) {
        let mut state = self.inner.queue.lock().await;
        if policy.is_expired() {
            Self::remove_locked(&mut state, url);
            return;
        }
        if let Some(entry) = state.entries.get_mut(url) {
            entry.meta.policy = policy;
        }
    }

    async fn remove(&self, url: &str) {
        let mut state = self.inner.queue.lock().await;
        Self::remove_locked(&mut state, url);
    }

    async fn remove_expired(&self) {
        let mut state = self.inner.queue.lock().await;
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| e.meta.policy.is_expired())
            .map(|(url, _)| url.clone())
            .collect();
        for url in expired {
            Self::remove_locked(&mut state, &url);
        }
    }

    async fn remove_all(&self) {
        let mut state = self.inner.queue.lock().await;
        state.entries.clear();
        state.cost = 0;
    }
}
