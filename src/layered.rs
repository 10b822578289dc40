//! Layered cache orchestration
//!
//! A `LayeredCache` pairs one store with an optional source; either side
//! may itself be a layered cache, so arbitrary pipelines compose, e.g.
//! `memory | file | http`. Fetches try the store first (source first under
//! an `Update` policy) and fall through on a clean miss; bytes served by
//! the source are teed into the store on the way to the caller.
//!
//! The pipeline node is a tagged variant dispatched by match; chains are
//! associative in effect, not in identity.

use std::future::Future;
use std::ops::BitOr;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::fetcher::HttpFetcher;
use crate::info::ResourceInfo;
use crate::policy::CachePolicy;
use crate::progress::Progress;
use crate::receiver::filter::RecoverySlot;
use crate::receiver::{BoxReceiver, BufferReceiver, FilterReceiver, NullReceiver};
use crate::store::{FileStore, MemoryStore, MutableStore, Source, Store};

/// When resuming a partial entry, rewind this far behind the materialized
/// tail to compensate for a possibly-truncated final write.
pub const PREFETCH_REWIND: u64 = 4096;

/// One element of a cache pipeline, tagged by capability.
#[derive(Clone)]
pub enum Node {
    /// Can only serve (e.g. an HTTP fetcher)
    Source(Arc<dyn Source>),
    /// Can serve and report contents
    Store(Arc<dyn Store>),
    /// Can serve, report and record
    Mutable(Arc<dyn MutableStore>),
    /// A nested layered cache
    Cache(Arc<LayeredCache>),
}

impl Node {
    pub fn source(source: Arc<dyn Source>) -> Self {
        Node::Source(source)
    }

    pub fn store(store: Arc<dyn Store>) -> Self {
        Node::Store(store)
    }

    pub fn mutable(store: Arc<dyn MutableStore>) -> Self {
        Node::Mutable(store)
    }

    pub fn cache(cache: LayeredCache) -> Self {
        Node::Cache(Arc::new(cache))
    }

    /// True for nodes that can at least report their contents.
    pub fn is_store(&self) -> bool {
        !matches!(self, Node::Source(_))
    }

    /// Dispatch a fetch to this node. Nested caches run their own
    /// orchestration.
    ///
    /// Returns a manually boxed future (rather than an `async fn`) because
    /// this and `LayeredCache::fetch` are mutually recursive through
    /// `Node::Cache`; going through an opaque `impl Future` on both sides
    /// of that cycle defeats rustc's auto-trait (`Send`) inference.
    pub fn fetch<'a>(
        &'a self,
        url: &'a str,
        offset: u64,
        length: Option<u64>,
        policy: CachePolicy,
        progress: Progress,
        receiver: BoxReceiver,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        match self {
            Node::Source(source) => Box::pin(async move {
                source
                    .fetch(url, offset, length, policy, progress, receiver)
                    .await
            }),
            Node::Store(store) => Box::pin(async move {
                store
                    .fetch(url, offset, length, policy, progress, receiver)
                    .await
            }),
            Node::Mutable(store) => Box::pin(async move {
                store
                    .fetch(url, offset, length, policy, progress, receiver)
                    .await
            }),
            Node::Cache(cache) => {
                // Boxed so nested caches do not make this future recursive
                Box::pin(cache.fetch(url, offset, length, policy, progress, receiver))
            }
        }
    }

    /// Leaf nodes of the pipeline tree, store side before source side.
    fn collect_leaves(&self, out: &mut Vec<Node>) {
        match self {
            Node::Cache(cache) => {
                cache.store.collect_leaves(out);
                if let Some(source) = &cache.source {
                    source.collect_leaves(out);
                }
            }
            leaf => out.push(leaf.clone()),
        }
    }
}

impl<S: MutableStore + 'static> From<Arc<S>> for Node {
    fn from(store: Arc<S>) -> Self {
        Node::Mutable(store)
    }
}

impl From<MemoryStore> for Node {
    fn from(store: MemoryStore) -> Self {
        Node::Mutable(Arc::new(store))
    }
}

impl From<FileStore> for Node {
    fn from(store: FileStore) -> Self {
        Node::Mutable(Arc::new(store))
    }
}

impl From<HttpFetcher> for Node {
    fn from(fetcher: HttpFetcher) -> Self {
        Node::Source(Arc::new(fetcher))
    }
}

impl From<LayeredCache> for Node {
    fn from(cache: LayeredCache) -> Self {
        Node::cache(cache)
    }
}

/// `store | source` composes a layered cache node. Appending to an
/// existing cache splices onto the end of its chain.
impl BitOr for Node {
    type Output = Node;

    fn bitor(self, source: Node) -> Node {
        match self {
            Node::Cache(cache) => Node::cache(cache.connect(source)),
            store => Node::cache(LayeredCache::with_source(store, source)),
        }
    }
}

/// A store paired with an optional source.
#[derive(Clone)]
pub struct LayeredCache {
    store: Node,
    source: Option<Node>,
}

impl LayeredCache {
    pub fn new(store: impl Into<Node>) -> Self {
        Self {
            store: store.into(),
            source: None,
        }
    }

    pub fn with_source(store: impl Into<Node>, source: impl Into<Node>) -> Self {
        Self {
            store: store.into(),
            source: Some(source.into()),
        }
    }

    /// Append `source` to the end of the chain. A chain ending in a plain
    /// source cannot be extended past it and is returned unchanged.
    pub fn connect(&self, source: impl Into<Node>) -> LayeredCache {
        let source = source.into();
        match &self.source {
            None => LayeredCache {
                store: self.store.clone(),
                source: Some(source),
            },
            Some(Node::Cache(inner)) => LayeredCache {
                store: self.store.clone(),
                source: Some(Node::cache(inner.connect(source))),
            },
            Some(existing) if existing.is_store() => {
                let tail = LayeredCache {
                    store: existing.clone(),
                    source: Some(source),
                };
                LayeredCache {
                    store: self.store.clone(),
                    source: Some(Node::cache(tail)),
                }
            }
            Some(_) => {
                debug!("chain already ends in a plain source; connect ignored");
                self.clone()
            }
        }
    }

    /// Stream `[offset, offset+length)` of `url` into `receiver`.
    ///
    /// Policy `Update` consults the source before the store; anything else
    /// tries the store first. The losing side is consulted only on a clean
    /// miss (no bytes, no error, not cancelled); bytes served by the source
    /// are teed into the store.
    pub async fn fetch(
        &self,
        url: &str,
        offset: u64,
        length: Option<u64>,
        policy: CachePolicy,
        progress: Progress,
        receiver: BoxReceiver,
    ) {
        let source = match &self.source {
            Some(source) => source,
            None => {
                self.store
                    .fetch(url, offset, length, policy, progress, receiver)
                    .await;
                return;
            }
        };

        let slot: RecoverySlot = Arc::new(Mutex::new(None));

        if policy == CachePolicy::Update {
            // Source first, teed into the store; store serves on failure
            let mut filter = FilterReceiver::new(receiver)
                .with_completion(Box::new(|success, error, progress| {
                    !success && error.is_none() && !progress.is_cancelled()
                }))
                .with_recovery(slot.clone());
            if let Some(tee) = self.store_tee(url, policy).await {
                filter = filter.with_tee(tee);
            }
            source
                .fetch(url, offset, length, policy, progress.clone(), Box::new(filter))
                .await;
            let recovered = slot.lock().take();
            if let Some(receiver) = recovered {
                self.store
                    .fetch(url, offset, length, policy, progress, receiver)
                    .await;
            }
        } else {
            let filter = FilterReceiver::new(receiver)
                .with_completion(Box::new(|success, error, progress| {
                    !success && error.is_none() && !progress.is_cancelled()
                }))
                .with_recovery(slot.clone());
            self.store
                .fetch(url, offset, length, policy, progress.clone(), Box::new(filter))
                .await;
            let recovered = slot.lock().take();
            if let Some(mut receiver) = recovered {
                if let Some(tee) = self.store_tee(url, policy).await {
                    receiver = Box::new(FilterReceiver::new(receiver).with_tee(tee));
                }
                source
                    .fetch(url, offset, length, policy, progress, receiver)
                    .await;
            }
        }
    }

    /// Fetch and buffer a segment. Returns `(None, None)` on miss, error or
    /// cancellation.
    pub async fn fetch_bytes(
        &self,
        url: &str,
        offset: u64,
        length: Option<u64>,
        policy: CachePolicy,
        progress: Progress,
    ) -> (Option<ResourceInfo>, Option<Bytes>) {
        let (tx, rx) = oneshot::channel();
        let buffer = BufferReceiver::new(u64::MAX, true, move |outcome| async move {
            let _ = tx.send(outcome);
        });
        self.fetch(url, offset, length, policy, progress, Box::new(buffer))
            .await;
        match rx.await {
            Ok(outcome) if outcome.success => (outcome.info, outcome.data),
            _ => (None, None),
        }
    }

    /// Ensure `url` is fully materialized in the store. Already-complete
    /// entries succeed immediately; partial entries resume from just before
    /// the materialized tail. Returns success.
    pub async fn prefetch(&self, url: &str, policy: CachePolicy, progress: Progress) -> bool {
        if policy == CachePolicy::Update {
            return self.source_to_store(url, 0, None, policy, progress).await;
        }

        let (info, length) = self.peek(url).await;
        if let (Some(info), Some(length)) = (&info, length) {
            if info.total_length == Some(length) {
                if progress.total() < 0 {
                    progress.set_total(length as i64);
                }
                progress.set_completed(length as i64);
                return true;
            }
        }

        // Rewind behind the tail in case the last write was truncated
        let offset = length.map(|l| l.saturating_sub(PREFETCH_REWIND)).unwrap_or(0);
        let remaining = info
            .as_ref()
            .and_then(|i| i.total_length)
            .map(|total| total.saturating_sub(offset));
        self.source_to_store(url, offset, remaining, policy, progress)
            .await
    }

    /// Metadata and stored length, consulting the store side first and then
    /// any store-capable sources down the chain.
    pub async fn peek(&self, url: &str) -> (Option<ResourceInfo>, Option<u64>) {
        for leaf in self.leaves() {
            let result = match &leaf {
                Node::Store(store) => store.peek(url).await,
                Node::Mutable(store) => store.peek(url).await,
                _ => continue,
            };
            if result.0.is_some() || result.1.is_some() {
                return result;
            }
        }
        (None, None)
    }

    /// Record a complete resource. Write-through: every mutable layer in
    /// the chain receives the entry.
    pub async fn store(&self, url: &str, info: ResourceInfo, policy: CachePolicy, data: Bytes) {
        for store in self.mutable_leaves() {
            store
                .store(url, info.clone(), policy, data.clone())
                .await;
        }
    }

    /// Mutate the stored policy everywhere in the chain.
    pub async fn change_policy(&self, url: &str, policy: CachePolicy) {
        for store in self.mutable_leaves() {
            store.change_policy(url, policy).await;
        }
    }

    /// Remove `url` everywhere in the chain.
    pub async fn remove(&self, url: &str) {
        for store in self.mutable_leaves() {
            store.remove(url).await;
        }
    }

    /// Sweep expired entries everywhere in the chain.
    pub async fn remove_expired(&self) {
        for store in self.mutable_leaves() {
            store.remove_expired().await;
        }
    }

    /// Clear every mutable layer in the chain.
    pub async fn remove_all(&self) {
        for store in self.mutable_leaves() {
            store.remove_all().await;
        }
    }

    fn leaves(&self) -> Vec<Node> {
        let mut leaves = Vec::new();
        self.store.collect_leaves(&mut leaves);
        if let Some(source) = &self.source {
            source.collect_leaves(&mut leaves);
        }
        leaves
    }

    fn mutable_leaves(&self) -> Vec<Arc<dyn MutableStore>> {
        self.leaves()
            .into_iter()
            .filter_map(|leaf| match leaf {
                Node::Mutable(store) => Some(store),
                _ => None,
            })
            .collect()
    }

    /// First mutable layer on the store side; segments served by the
    /// source are teed into it.
    async fn store_tee(&self, url: &str, policy: CachePolicy) -> Option<BoxReceiver> {
        let mut leaves = Vec::new();
        self.store.collect_leaves(&mut leaves);
        for leaf in leaves {
            if let Node::Mutable(store) = leaf {
                return store.store_receiver(url, policy).await;
            }
        }
        None
    }

    /// Fetch from the source through a tee into the store, discarding the
    /// delivery. Returns whether the stream finished.
    async fn source_to_store(
        &self,
        url: &str,
        offset: u64,
        length: Option<u64>,
        policy: CachePolicy,
        progress: Progress,
    ) -> bool {
        let source = match &self.source {
            Some(source) => source,
            None => return false,
        };

        let outcome = Arc::new(Mutex::new(false));
        let outcome_probe = outcome.clone();
        let mut filter = FilterReceiver::new(Box::new(NullReceiver)).with_completion(Box::new(
            move |success, _error, _progress| {
                *outcome_probe.lock() = success;
                false
            },
        ));
        if let Some(tee) = self.store_tee(url, policy).await {
            filter = filter.with_tee(tee);
        }
        source
            .fetch(url, offset, length, policy, progress, Box::new(filter))
            .await;
        let finished = *outcome.lock();
        finished
    }
}
