//! Per-host fetch slots.
//!
//! A slot groups requests by key (normally the remote host). It carries the
//! delay the throttle maintains for that host, the set of requests currently
//! transferring, and a permit pool bounding per-host concurrency.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

use crate::models::{FetchRequest, Fingerprint};

/// State for a single slot.
#[derive(Debug)]
pub struct FetchSlot {
    /// Minimum spacing between request starts.
    pub delay: Duration,
    concurrency: usize,
    /// Transfer id -> fingerprint. Keyed by id so identical requests
    /// running side by side are counted separately.
    transferring: HashMap<u64, Fingerprint>,
    next_transfer: u64,
    /// Start time handed to the most recent acquirer (may lie in the future).
    last_start: Option<Instant>,
    permits: Arc<Semaphore>,
    total_requests: u64,
}

impl FetchSlot {
    pub fn new(delay: Duration, concurrency: usize) -> Self {
        Self {
            delay,
            concurrency,
            transferring: HashMap::new(),
            next_transfer: 0,
            last_start: None,
            permits: Arc::new(Semaphore::new(concurrency)),
            total_requests: 0,
        }
    }

    /// Number of requests currently transferring.
    pub fn transferring(&self) -> usize {
        self.transferring.len()
    }

    pub fn is_transferring(&self, fingerprint: &Fingerprint) -> bool {
        self.transferring.values().any(|f| f == fingerprint)
    }

    pub fn free_transfer_slots(&self) -> usize {
        self.concurrency.saturating_sub(self.transferring.len())
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests
    }

    /// Time until this slot may start another request.
    pub fn time_until_ready(&self, now: Instant) -> Duration {
        match self.last_start {
            Some(last) => match last.checked_add(self.delay) {
                Some(ready) => ready.saturating_duration_since(now),
                None => self.delay,
            },
            None => Duration::ZERO,
        }
    }

    /// Claim the next start time, returning how long the caller must wait.
    /// The claimed start is never earlier than `not_before`.
    fn reserve(&mut self, now: Instant, not_before: Option<Instant>) -> Duration {
        let mut wait = self.time_until_ready(now);
        if let Some(not_before) = not_before {
            wait = wait.max(not_before.saturating_duration_since(now));
        }
        self.last_start = Some(now.checked_add(wait).unwrap_or(now));
        self.total_requests += 1;
        wait
    }

    fn begin_transfer(&mut self, fingerprint: Fingerprint) -> u64 {
        let id = self.next_transfer;
        self.next_transfer += 1;
        self.transferring.insert(id, fingerprint);
        id
    }
}

/// Point-in-time view of one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotStats {
    pub delay: Duration,
    pub transferring: usize,
    pub total_requests: u64,
}

type SlotMap = Arc<Mutex<HashMap<String, FetchSlot>>>;

fn lock(slots: &Mutex<HashMap<String, FetchSlot>>) -> MutexGuard<'_, HashMap<String, FetchSlot>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lazily created slots, one per key, alive for the whole run.
#[derive(Debug, Clone)]
pub struct SlotRegistry {
    slots: SlotMap,
    start_delay: Duration,
    concurrency: usize,
}

impl SlotRegistry {
    pub fn new(start_delay: Duration, concurrency: usize) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            start_delay,
            concurrency: concurrency.max(1),
        }
    }

    /// Slot key for a request: explicit override, then host, then raw URL.
    pub fn key_for(request: &FetchRequest) -> String {
        if let Some(slot) = &request.meta.download_slot {
            return slot.clone();
        }
        request.host().unwrap_or_else(|| request.url.clone())
    }

    /// Take a concurrency permit, then wait out this slot's pacing and mark
    /// the fingerprint as transferring until the guard is dropped.
    ///
    /// `extra_wait` is a pause the caller already knows about (a rate-limit
    /// window still open), measured from now. The start is never earlier
    /// than that, nor earlier than the previous start plus the delay.
    pub async fn acquire(
        &self,
        key: &str,
        fingerprint: Fingerprint,
        extra_wait: Duration,
    ) -> SlotGuard {
        let not_before = Instant::now().checked_add(extra_wait);
        let permits = lock(&self.slots)
            .entry(key.to_string())
            .or_insert_with(|| FetchSlot::new(self.start_delay, self.concurrency))
            .permits
            .clone();

        let permit = permits
            .acquire_owned()
            .await
            .expect("slot semaphores are never closed");

        // Reserved only once the permit is held: a request that queued on
        // the permit pool is still spaced from the latest start.
        let wait = lock(&self.slots)
            .get_mut(key)
            .map_or(Duration::ZERO, |slot| slot.reserve(Instant::now(), not_before));
        if wait > Duration::ZERO {
            debug!("Slot {}: waiting {:?}", key, wait);
            tokio::time::sleep(wait).await;
        }

        let transfer = lock(&self.slots)
            .get_mut(key)
            .map(|slot| slot.begin_transfer(fingerprint));

        SlotGuard {
            slots: self.slots.clone(),
            key: key.to_string(),
            transfer,
            _permit: permit,
        }
    }

    /// Run `f` with exclusive access to an existing slot.
    pub fn update<R>(&self, key: &str, f: impl FnOnce(&mut FetchSlot) -> R) -> Option<R> {
        lock(&self.slots).get_mut(key).map(f)
    }

    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> HashMap<String, SlotStats> {
        lock(&self.slots)
            .iter()
            .map(|(k, s)| {
                (
                    k.clone(),
                    SlotStats {
                        delay: s.delay,
                        transferring: s.transferring(),
                        total_requests: s.total_requests,
                    },
                )
            })
            .collect()
    }
}

/// Held for the duration of one transfer.
#[derive(Debug)]
pub struct SlotGuard {
    slots: SlotMap,
    key: String,
    transfer: Option<u64>,
    _permit: OwnedSemaphorePermit,
}

impl SlotGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let Some(transfer) = self.transfer else {
            return;
        };
        if let Some(slot) = lock(&self.slots).get_mut(&self.key) {
            slot.transferring.remove(&transfer);
        }
    }
}
