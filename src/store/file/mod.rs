//! Persistent file store
//!
//! Payloads live at `<root>/<md5(url)>`, or `<root>/<md5(prefix)>/<md5(url)>`
//! when a group prefix matches. Metadata travels in a sidecar record (see
//! `sidecar`). Partially written payloads are kept so interrupted transfers
//! can resume at a byte offset.
//!
//! The store serializes operations on a single FIFO queue; a streaming
//! store runs its writes on a dedicated writer task throttled to four
//! in-flight chunks with a one second stall timeout.

pub mod adapter;
pub mod sidecar;

pub use adapter::{FileStoreAdapter, FsAdapter, READ_CHUNK_SIZE};
pub use sidecar::{MetaFileSidecar, SidecarStore, SIDECAR_NAME};
#[cfg(unix)]
pub use sidecar::XattrSidecar;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::CacheError;
use crate::hash::url_hash;
use crate::info::{ResourceInfo, StorageInfo};
use crate::policy::CachePolicy;
use crate::progress::Progress;
use crate::receiver::{BoxReceiver, Receiver, ResponseHandle};
use crate::store::{MutableStore, Source, Store};

/// Streaming stores allow this many chunks in flight before the producer
/// is held back.
pub const WRITE_QUEUE_DEPTH: usize = 4;

/// How long a held-back producer waits before the write is declared
/// stalled.
pub const WRITE_STALL_TIMEOUT: Duration = Duration::from_secs(1);

/// Free-form group metadata; the reserved key `"policy"` supplies a default
/// write policy for the prefix (wire-encoded).
pub type GroupTag = HashMap<String, String>;

pub const GROUP_POLICY_KEY: &str = "policy";

#[derive(Debug, Clone)]
pub struct Group {
    pub prefix: String,
    pub root: PathBuf,
    pub tag: GroupTag,
}

#[derive(Clone)]
pub struct FileStore {
    inner: Arc<FileInner>,
}

struct FileInner {
    queue: Mutex<()>,
    adapter: Arc<dyn FileStoreAdapter>,
    root: PathBuf,
    groups: RwLock<Vec<Group>>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_adapter(root, Arc::new(FsAdapter::new()))
    }

    pub fn with_adapter(root: impl Into<PathBuf>, adapter: Arc<dyn FileStoreAdapter>) -> Self {
        Self {
            inner: Arc::new(FileInner {
                queue: Mutex::new(()),
                adapter,
                root: root.into(),
                groups: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.inner.root
    }

    /// Route all URLs under `prefix` to a dedicated subdirectory.
    /// Idempotent on the prefix; the latest tag wins.
    pub fn add_group(&self, prefix: impl Into<String>, tag: GroupTag) {
        let prefix = prefix.into();
        let group = Group {
            root: self.inner.root.join(url_hash(&prefix)),
            prefix: prefix.clone(),
            tag,
        };
        let mut groups = self.inner.groups.write();
        match groups.iter_mut().find(|g| g.prefix == prefix) {
            Some(existing) => *existing = group,
            None => groups.push(group),
        }
    }

    /// Remove a group and everything stored under it.
    pub async fn remove_group(&self, prefix: &str) {
        let removed = {
            let mut groups = self.inner.groups.write();
            match groups.iter().position(|g| g.prefix == prefix) {
                Some(index) => Some(groups.remove(index)),
                None => None,
            }
        };
        if let Some(group) = removed {
            let _guard = self.inner.queue.lock().await;
            if let Err(err) = self.inner.adapter.remove_dir(&group.root).await {
                warn!(prefix = %prefix, error = %err, "failed to remove group subtree");
            }
        }
    }

    /// Resolve the payload path and the matched group tag for `url`.
    /// Groups are consulted in insertion order; first match wins.
    pub fn resolve(&self, url: &str) -> (PathBuf, Option<GroupTag>) {
        let groups = self.inner.groups.read();
        for group in groups.iter() {
            if url.starts_with(&group.prefix) {
                return (group.root.join(url_hash(url)), Some(group.tag.clone()));
            }
        }
        (self.inner.root.join(url_hash(url)), None)
    }

    /// Apply the matched group's default policy to a `Default` policy.
    fn resolve_policy(policy: CachePolicy, tag: Option<&GroupTag>) -> CachePolicy {
        if matches!(policy, CachePolicy::Default) {
            if let Some(encoded) = tag.and_then(|t| t.get(GROUP_POLICY_KEY)) {
                return CachePolicy::parse(encoded);
            }
        }
        policy
    }
}

#[async_trait]
impl Source for FileStore {
    async fn fetch(
        &self,
        url: &str,
        offset: u64,
        length: Option<u64>,
        _policy: CachePolicy,
        progress: Progress,
        mut receiver: BoxReceiver,
    ) {
        let _guard = self.inner.queue.lock().await;
        receiver.on_inited(None, &progress).await;

        let (path, _tag) = self.resolve(url);
        let opened = match self.inner.adapter.open_input(&path, offset, length).await {
            Ok(opened) => opened,
            Err(err) => {
                warn!(url = %url, error = %err, "file store read failed");
                receiver.on_aborted(Some(err)).await;
                return;
            }
        };
        let (meta, mut slice) = match opened {
            Some(opened) => opened,
            None => {
                receiver.on_aborted(None).await;
                return;
            }
        };

        let limit = slice.limit();
        if progress.total() < 0 {
            match meta.info.total_length {
                // Serving through the tail of a known-length resource:
                // report position within the whole resource
                Some(total) if offset + limit == total => {
                    progress.set_total(total as i64);
                    progress.set_completed(offset as i64);
                }
                _ => progress.set_total(limit as i64),
            }
        }

        receiver.on_started(meta.info, offset, Some(limit)).await;
        loop {
            if progress.is_cancelled() {
                receiver.on_aborted(None).await;
                return;
            }
            match slice.read_chunk().await {
                Ok(Some(chunk)) => {
                    progress.add_completed(chunk.len() as u64);
                    receiver.on_data(chunk).await;
                }
                Ok(None) => break,
                Err(err) => {
                    receiver.on_aborted(Some(err.into())).await;
                    return;
                }
            }
        }
        receiver.on_finished().await;
    }
}

#[async_trait]
impl Store for FileStore {
    async fn peek(&self, url: &str) -> (Option<ResourceInfo>, Option<u64>) {
        let _guard = self.inner.queue.lock().await;
        let (path, _tag) = self.resolve(url);
        match self.inner.adapter.read_meta(&path).await {
            Ok(Some((meta, size))) => (Some(meta.info), Some(size)),
            Ok(None) => (None, None),
            Err(err) => {
                warn!(url = %url, error = %err, "file store peek failed");
                (None, None)
            }
        }
    }
}

#[async_trait]
impl MutableStore for FileStore {
    async fn store_receiver(&self, url: &str, policy: CachePolicy) -> Option<BoxReceiver> {
        Some(Box::new(FileStoreReceiver::new(
            self.clone(),
            url.to_string(),
            policy,
        )))
    }

    async fn store(&self, url: &str, info: ResourceInfo, policy: CachePolicy, data: Bytes) {
        let _guard = self.inner.queue.lock().await;
        let (path, tag) = self.resolve(url);
        let policy = Self::resolve_policy(policy, tag.as_ref());
        if policy.is_expired() {
            if let Err(err) = self.inner.adapter.remove(&path).await {
                warn!(url = %url, error = %err, "failed to remove expired entry");
            }
            return;
        }

        let meta = StorageInfo::new(info, policy);
        let writer = match self.inner.adapter.open_output(&path, &meta, 0).await {
            Ok(Some(writer)) => writer,
            Ok(None) => return,
            Err(err) => {
                warn!(url = %url, error = %err, "file store write failed");
                return;
            }
        };
        let mut writer = writer;
        let result = async {
            writer.write(&data).await?;
            writer.close().await
        }
        .await;
        if let Err(err) = result {
            warn!(url = %url, error = %err, "file store write failed");
            let _ = self.inner.adapter.remove(&path).await;
        }
    }

    async fn change_policy(&self, url: &str, policy: CachePolicy) {
        let _guard = self.inner.queue.lock().await;
        let (path, _tag) = self.resolve(url);
        if policy.is_expired() {
            if let Err(err) = self.inner.adapter.remove(&path).await {
                warn!(url = %url, error = %err, "failed to remove expired entry");
            }
            return;
        }
        match self.inner.adapter.read_meta(&path).await {
            Ok(Some((mut meta, _size))) => {
                meta.policy = policy;
                if let Err(err) = self.inner.adapter.write_meta(&path, &meta).await {
                    warn!(url = %url, error = %err, "failed to update sidecar policy");
                }
            }
            Ok(None) => {}
            Err(err) => warn!(url = %url, error = %err, "failed to read sidecar"),
        }
    }

    async fn remove(&self, url: &str) {
        let _guard = self.inner.queue.lock().await;
        let (path, _tag) = self.resolve(url);
        if let Err(err) = self.inner.adapter.remove(&path).await {
            warn!(url = %url, error = %err, "failed to remove entry");
        }
    }

    async fn remove_expired(&self) {
        let _guard = self.inner.queue.lock().await;
        let payloads = match self.inner.adapter.list_payloads(&self.inner.root).await {
            Ok(payloads) => payloads,
            Err(err) => {
                warn!(error = %err, "expiry sweep could not enumerate the cache");
                return;
            }
        };
        for path in payloads {
            // Reading the sidecar deletes expired and invalid entries
            if let Err(err) = self.inner.adapter.read_meta(&path).await {
                warn!(path = %path.display(), error = %err, "expiry sweep failed for entry");
            }
        }
    }

    async fn remove_all(&self) {
        let _guard = self.inner.queue.lock().await;
        if let Err(err) = self.inner.adapter.remove_all(&self.inner.root).await {
            warn!(error = %err, "failed to clear file store");
        }
    }
}

/// Streaming receiver persisting a delivered segment into the store.
///
/// Writes run on a dedicated task fed through a bounded channel: at most
/// `WRITE_QUEUE_DEPTH` chunks are in flight, and a producer held back for
/// longer than `WRITE_STALL_TIMEOUT` marks the write failed rather than
/// buffering without bound.
struct FileStoreReceiver {
    store: FileStore,
    url: String,
    policy: CachePolicy,
    progress: Option<Progress>,
    writer_tx: Option<mpsc::Sender<Bytes>>,
    writer_task: Option<JoinHandle<Result<(), CacheError>>>,
    failed: bool,
}

impl FileStoreReceiver {
    fn new(store: FileStore, url: String, policy: CachePolicy) -> Self {
        Self {
            store,
            url,
            policy,
            progress: None,
            writer_tx: None,
            writer_task: None,
            failed: false,
        }
    }

    async fn close(&mut self) {
        self.writer_tx = None;
        if let Some(task) = self.writer_task.take() {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(url = %self.url, error = %err, "store write failed"),
                Err(err) => warn!(url = %self.url, error = %err, "store writer task failed"),
            }
        }
    }
}

#[async_trait]
impl Receiver for FileStoreReceiver {
    async fn on_inited(&mut self, _response: Option<&ResponseHandle>, progress: &Progress) {
        self.progress = Some(progress.clone());
    }

    async fn on_started(&mut self, info: ResourceInfo, offset: u64, _length: Option<u64>) {
        let (path, tag) = self.store.resolve(&self.url);
        let policy = FileStore::resolve_policy(self.policy, tag.as_ref());
        if policy.is_expired() {
            debug!(url = %self.url, "expired policy, not persisting");
            return;
        }

        let meta = StorageInfo::new(info, policy);
        let writer = {
            let _guard = self.store.inner.queue.lock().await;
            self.store.inner.adapter.open_output(&path, &meta, offset).await
        };
        let writer = match writer {
            Ok(Some(writer)) => writer,
            Ok(None) => {
                debug!(url = %self.url, offset = offset, "store output unavailable");
                return;
            }
            Err(err) => {
                warn!(url = %self.url, error = %err, "failed to open store output");
                return;
            }
        };

        let (tx, mut rx) = mpsc::channel::<Bytes>(WRITE_QUEUE_DEPTH);
        let task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(chunk) = rx.recv().await {
                writer.write(&chunk).await?;
            }
            writer.close().await?;
            Ok(())
        });
        self.writer_tx = Some(tx);
        self.writer_task = Some(task);
    }

    async fn on_data(&mut self, chunk: Bytes) {
        if self.failed {
            return;
        }
        if self
            .progress
            .as_ref()
            .map(|p| p.is_cancelled())
            .unwrap_or(false)
        {
            self.failed = true;
            return;
        }
        let tx = match self.writer_tx.as_ref() {
            Some(tx) => tx,
            None => return,
        };
        match tx.send_timeout(chunk, WRITE_STALL_TIMEOUT).await {
            Ok(()) => {}
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                warn!(url = %self.url, error = %CacheError::WriteStalled, "dropping store write");
                self.failed = true;
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                self.failed = true;
            }
        }
    }

    async fn on_finished(&mut self) {
        self.close().await;
    }

    async fn on_aborted(&mut self, error: Option<CacheError>) {
        // Keep whatever was written; a later fetch can resume at the tail
        if let Some(err) = error {
            debug!(url = %self.url, error = %err, "store stream aborted");
        }
        self.close().await;
    }
}
