//! Per-run deduplication of identical fetches.
//!
//! Concurrent requests with the same fingerprint share one network call.
//! Every caller gets a [`Pending`] future; all of them resolve to the same
//! `Arc<FetchResult>` in the order they were registered. Resolved results
//! stay cached (bounded, oldest first out) so later lookups skip the
//! network entirely.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::DedupError;
use crate::events::{CoreEvent, EventKind, SinkRef};
use crate::models::{FetchRequest, FetchResult, Fingerprint};
use crate::pipeline::{fetch_isolated, Fetcher};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupStats {
    /// Lookups answered from the resolved cache.
    pub hits: u64,
    /// Lookups that started a fetch.
    pub misses: u64,
    /// Lookups that attached to a fetch already in flight.
    pub joins: u64,
}

struct Waiter {
    seq: u64,
    tx: oneshot::Sender<Arc<FetchResult>>,
}

#[derive(Default)]
struct Inner {
    downloading: HashSet<Fingerprint>,
    downloaded: HashMap<Fingerprint, Arc<FetchResult>>,
    /// Insertion order of `downloaded`, for eviction.
    order: VecDeque<Fingerprint>,
    waiting: HashMap<Fingerprint, Vec<Waiter>>,
    next_seq: u64,
    stats: DedupStats,
}

impl Inner {
    fn store(&mut self, fingerprint: &Fingerprint, result: Arc<FetchResult>, capacity: usize) {
        if capacity == 0 {
            return;
        }
        if self
            .downloaded
            .insert(fingerprint.clone(), result)
            .is_none()
        {
            self.order.push_back(fingerprint.clone());
        }
        while self.downloaded.len() > capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.downloaded.remove(&oldest);
                }
                None => break,
            }
        }
    }
}

pub struct DedupCache {
    inner: Mutex<Inner>,
    fetcher: Arc<dyn Fetcher>,
    capacity: usize,
    events: SinkRef,
}

impl DedupCache {
    pub fn new(fetcher: Arc<dyn Fetcher>, capacity: usize, events: SinkRef) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            fetcher,
            capacity,
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up `fingerprint`, joining or starting a fetch for `request` as
    /// needed. Must be called from within a tokio runtime.
    pub fn request(self: &Arc<Self>, fingerprint: Fingerprint, request: &FetchRequest) -> Pending {
        let mut inner = self.lock();

        if let Some(result) = inner.downloaded.get(&fingerprint).cloned() {
            inner.stats.hits += 1;
            drop(inner);
            self.events
                .emit(CoreEvent::new(EventKind::CacheHit, fingerprint.to_string()));
            return Pending {
                fingerprint,
                seq: None,
                state: PendingState::Ready(Some(result)),
            };
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        let (tx, rx) = oneshot::channel();
        let waiters = inner.waiting.entry(fingerprint.clone()).or_default();
        waiters.push(Waiter { seq, tx });
        let waiting = waiters.len();

        let start = inner.downloading.insert(fingerprint.clone());
        if start {
            inner.stats.misses += 1;
        } else {
            inner.stats.joins += 1;
        }
        drop(inner);

        let kind = if start {
            EventKind::CacheMiss
        } else {
            EventKind::CacheJoined
        };
        self.events.emit(
            CoreEvent::new(kind, fingerprint.to_string()).field("waiters", waiting as f64),
        );

        if start {
            debug!("Fetching {} for {}", fingerprint, request.url);
            self.spawn_fetch(fingerprint.clone(), request.clone());
        }

        Pending {
            fingerprint,
            seq: Some(seq),
            state: PendingState::Waiting(rx),
        }
    }

    fn spawn_fetch(self: &Arc<Self>, fingerprint: Fingerprint, request: FetchRequest) {
        let cache = Arc::clone(self);
        let fetcher = Arc::clone(&self.fetcher);
        tokio::spawn(async move {
            let result = fetch_isolated(fetcher, request).await;
            cache.complete(&fingerprint, result);
        });
    }

    /// Record the outcome for `fingerprint` and resolve its waiters in
    /// registration order. Failures are cached without their retained
    /// context. Returns the number of waiters resolved.
    pub fn complete(&self, fingerprint: &Fingerprint, result: FetchResult) -> usize {
        let result = Arc::new(result.stripped());
        let waiters = {
            let mut inner = self.lock();
            inner.downloading.remove(fingerprint);
            inner.store(fingerprint, Arc::clone(&result), self.capacity);
            inner.waiting.remove(fingerprint).unwrap_or_default()
        };

        let resolved = waiters.len();
        for waiter in waiters {
            // A dropped receiver just means that caller stopped caring.
            let _ = waiter.tx.send(Arc::clone(&result));
            self.events.emit(
                CoreEvent::new(EventKind::WaiterResolved, fingerprint.to_string())
                    .field("seq", waiter.seq as f64),
            );
        }
        resolved
    }

    /// Drop every pending continuation; their futures resolve to
    /// [`DedupError::Abandoned`]. Fetches still running stay marked as in
    /// flight, so a repeat request joins them instead of fetching again.
    pub fn abandon_all(&self) -> usize {
        let waiting = std::mem::take(&mut self.lock().waiting);
        let abandoned: usize = waiting.values().map(Vec::len).sum();
        if abandoned > 0 {
            warn!("Abandoning {} dedup waiters", abandoned);
            self.events.emit(
                CoreEvent::new(EventKind::WaitersAbandoned, "")
                    .field("waiters", abandoned as f64),
            );
        }
        abandoned
    }

    /// Evict a resolved entry so the next request fetches again.
    pub fn forget(&self, fingerprint: &Fingerprint) -> bool {
        let mut inner = self.lock();
        inner.order.retain(|f| f != fingerprint);
        inner.downloaded.remove(fingerprint).is_some()
    }

    pub fn is_downloading(&self, fingerprint: &Fingerprint) -> bool {
        self.lock().downloading.contains(fingerprint)
    }

    pub fn cached(&self, fingerprint: &Fingerprint) -> Option<Arc<FetchResult>> {
        self.lock().downloaded.get(fingerprint).cloned()
    }

    pub fn waiting(&self, fingerprint: &Fingerprint) -> usize {
        self.lock().waiting.get(fingerprint).map_or(0, Vec::len)
    }

    pub fn stats(&self) -> DedupStats {
        self.lock().stats
    }
}

enum PendingState {
    Ready(Option<Arc<FetchResult>>),
    Waiting(oneshot::Receiver<Arc<FetchResult>>),
}

/// Result of a [`DedupCache::request`]; resolves when the fetch completes.
pub struct Pending {
    fingerprint: Fingerprint,
    seq: Option<u64>,
    state: PendingState,
}

impl Pending {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Registration sequence number; `None` for cache hits.
    pub fn seq(&self) -> Option<u64> {
        self.seq
    }

    pub fn is_cached(&self) -> bool {
        matches!(self.state, PendingState::Ready(_))
    }
}

impl Future for Pending {
    type Output = Result<Arc<FetchResult>, DedupError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Pending {
            fingerprint, state, ..
        } = self.get_mut();
        match state {
            PendingState::Ready(result) => {
                Poll::Ready(Ok(result.take().expect("Pending polled after completion")))
            }
            PendingState::Waiting(rx) => Pin::new(rx)
                .poll(cx)
                .map(|r| r.map_err(|_| DedupError::Abandoned(fingerprint.to_string()))),
        }
    }
}
