//! Tee/fallthrough receiver
//!
//! A `FilterReceiver` delegates every event to an inner receiver and can
//! additionally tee the stream into a second receiver (used to persist
//! bytes while delivering them). A completion callback runs on terminal
//! transitions; returning `true` suppresses forwarding the terminal event
//! to the inner receiver and parks it in a recovery slot, which is how
//! fallthrough chains re-dispatch the caller's receiver to the next layer.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::CacheError;
use crate::info::ResourceInfo;
use crate::progress::Progress;
use crate::receiver::{BoxReceiver, Receiver, ResponseHandle};

/// Callback invoked once on `on_finished` (success) or `on_aborted`.
/// Returning `true` suppresses forwarding to the inner receiver.
pub type CompletionFn = Box<dyn FnOnce(bool, Option<&CacheError>, &Progress) -> bool + Send>;

/// Slot a suppressed inner receiver is parked in for re-dispatch.
pub type RecoverySlot = Arc<Mutex<Option<BoxReceiver>>>;

pub struct FilterReceiver {
    inner: Option<BoxReceiver>,
    tee: Option<BoxReceiver>,
    completion: Option<CompletionFn>,
    recovery: Option<RecoverySlot>,
    progress: Option<Progress>,
    done: bool,
}

impl FilterReceiver {
    pub fn new(inner: BoxReceiver) -> Self {
        Self {
            inner: Some(inner),
            tee: None,
            completion: None,
            recovery: None,
            progress: None,
            done: false,
        }
    }

    /// Tee every event into a second receiver.
    pub fn with_tee(mut self, tee: BoxReceiver) -> Self {
        self.tee = Some(tee);
        self
    }

    /// Run `completion` on the terminal transition.
    pub fn with_completion(mut self, completion: CompletionFn) -> Self {
        self.completion = Some(completion);
        self
    }

    /// Park the inner receiver in `slot` when the completion suppresses the
    /// terminal event.
    pub fn with_recovery(mut self, slot: RecoverySlot) -> Self {
        self.recovery = Some(slot);
        self
    }

    async fn terminal(&mut self, success: bool, error: Option<CacheError>) {
        if self.done {
            return;
        }
        self.done = true;

        // The tee observes the terminal event unconditionally so a storing
        // receiver always gets to close its output.
        if let Some(tee) = self.tee.as_mut() {
            if success {
                tee.on_finished().await;
            } else {
                tee.on_aborted(error.clone()).await;
            }
        }

        let progress = self.progress.clone().unwrap_or_default();
        let suppress = match self.completion.take() {
            Some(completion) => completion(success, error.as_ref(), &progress),
            None => false,
        };

        if suppress {
            if let (Some(slot), Some(inner)) = (self.recovery.as_ref(), self.inner.take()) {
                *slot.lock() = Some(inner);
            }
            return;
        }

        if let Some(inner) = self.inner.as_mut() {
            if success {
                inner.on_finished().await;
            } else {
                inner.on_aborted(error).await;
            }
        }
    }
}

#[async_trait]
impl Receiver for FilterReceiver {
    async fn on_inited(&mut self, response: Option<&ResponseHandle>, progress: &Progress) {
        self.progress = Some(progress.clone());
        if let Some(tee) = self.tee.as_mut() {
            tee.on_inited(response, progress).await;
        }
        if let Some(inner) = self.inner.as_mut() {
            inner.on_inited(response, progress).await;
        }
    }

    async fn on_started(&mut self, info: ResourceInfo, offset: u64, length: Option<u64>) {
        if let Some(tee) = self.tee.as_mut() {
            tee.on_started(info.clone(), offset, length).await;
        }
        if let Some(inner) = self.inner.as_mut() {
            inner.on_started(info, offset, length).await;
        }
    }

    async fn on_data(&mut self, chunk: Bytes) {
        if let Some(tee) = self.tee.as_mut() {
            tee.on_data(chunk.clone()).await;
        }
        if let Some(inner) = self.inner.as_mut() {
            inner.on_data(chunk).await;
        }
    }

    async fn on_finished(&mut self) {
        self.terminal(true, None).await;
    }

    async fn on_aborted(&mut self, error: Option<CacheError>) {
        self.terminal(false, error).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records the events it sees; shared via Arc so tests can inspect it
    /// after the receiver has been boxed away.
    struct Recording {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl Recording {
        fn new() -> (Self, Arc<Mutex<Vec<String>>>) {
            let events = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    events: events.clone(),
                },
                events,
            )
        }
    }

    #[async_trait]
    impl Receiver for Recording {
        async fn on_inited(&mut self, _response: Option<&ResponseHandle>, _progress: &Progress) {
            self.events.lock().push("inited".to_string());
        }

        async fn on_started(&mut self, _info: ResourceInfo, offset: u64, _length: Option<u64>) {
            self.events.lock().push(format!("started@{}", offset));
        }

        async fn on_data(&mut self, chunk: Bytes) {
            self.events.lock().push(format!("data:{}", chunk.len()));
        }

        async fn on_finished(&mut self) {
            self.events.lock().push("finished".to_string());
        }

        async fn on_aborted(&mut self, error: Option<CacheError>) {
            self.events
                .lock()
                .push(format!("aborted:{}", error.is_some()));
        }
    }

    #[tokio::test]
    async fn test_forwards_all_events_to_inner() {
        let (inner, events) = Recording::new();
        let mut filter = FilterReceiver::new(Box::new(inner));
        let progress = Progress::new();

        filter.on_inited(None, &progress).await;
        filter
            .on_started(ResourceInfo::default(), 0, Some(4))
            .await;
        filter.on_data(Bytes::from_static(b"abcd")).await;
        filter.on_finished().await;

        assert_eq!(
            *events.lock(),
            vec!["inited", "started@0", "data:4", "finished"]
        );
    }

    #[tokio::test]
    async fn test_tee_sees_the_same_stream() {
        let (inner, inner_events) = Recording::new();
        let (tee, tee_events) = Recording::new();
        let mut filter = FilterReceiver::new(Box::new(inner)).with_tee(Box::new(tee));
        let progress = Progress::new();

        filter.on_inited(None, &progress).await;
        filter
            .on_started(ResourceInfo::default(), 0, Some(2))
            .await;
        filter.on_data(Bytes::from_static(b"ab")).await;
        filter.on_finished().await;

        assert_eq!(*inner_events.lock(), *tee_events.lock());
    }

    #[tokio::test]
    async fn test_completion_suppresses_and_recovers_inner() {
        let (inner, events) = Recording::new();
        let slot: RecoverySlot = Arc::new(Mutex::new(None));
        let mut filter = FilterReceiver::new(Box::new(inner))
            .with_completion(Box::new(|success, error, progress| {
                !success && error.is_none() && !progress.is_cancelled()
            }))
            .with_recovery(slot.clone());
        let progress = Progress::new();

        filter.on_inited(None, &progress).await;
        filter.on_aborted(None).await;

        // The inner receiver never saw the abort and is parked for retry
        assert_eq!(*events.lock(), vec!["inited"]);
        assert!(slot.lock().is_some());
    }

    #[tokio::test]
    async fn test_completion_forwards_real_errors() {
        let (inner, events) = Recording::new();
        let slot: RecoverySlot = Arc::new(Mutex::new(None));
        let mut filter = FilterReceiver::new(Box::new(inner))
            .with_completion(Box::new(|success, error, progress| {
                !success && error.is_none() && !progress.is_cancelled()
            }))
            .with_recovery(slot.clone());
        let progress = Progress::new();

        filter.on_inited(None, &progress).await;
        filter
            .on_aborted(Some(CacheError::WriteStalled))
            .await;

        assert_eq!(*events.lock(), vec!["inited", "aborted:true"]);
        assert!(slot.lock().is_none());
    }

    #[tokio::test]
    async fn test_terminal_fires_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let (inner, _) = Recording::new();
        let mut filter =
            FilterReceiver::new(Box::new(inner)).with_completion(Box::new(move |_, _, _| {
                count_clone.fetch_add(1, Ordering::SeqCst);
                false
            }));
        let progress = Progress::new();

        filter.on_inited(None, &progress).await;
        filter.on_finished().await;
        filter.on_aborted(None).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
