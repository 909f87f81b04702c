//! Bounded holding area between fetch completion and downstream processing.
//!
//! Every admitted result is charged `max(byte_size, MIN_UNIT)` against the
//! stage until it is finished. The charge is fixed at admission and carried
//! by the [`Ticket`], so the amount released always matches the amount taken
//! even if the result changes in between. The stage never blocks; callers
//! poll [`BackpressureStage::needs_backout`] before pulling more work.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::debug;

use crate::config::MIN_UNIT;
use crate::events::{CoreEvent, EventKind, SinkRef};
use crate::models::{FetchRequest, FetchResult};

static NEXT_STAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Resolves once the admitted pair has been finished. Errors if the stage
/// was dropped first.
pub type Completion = oneshot::Receiver<()>;

/// Proof that a pair is being processed. Only [`BackpressureStage::finish`]
/// consumes it.
#[must_use = "a ticket must be passed to finish() or the stage never drains"]
#[derive(Debug)]
pub struct Ticket {
    stage: u64,
    id: u64,
    charged: u64,
    done: oneshot::Sender<()>,
}

impl Ticket {
    /// Bytes charged against the stage for this pair.
    pub fn charged(&self) -> u64 {
        self.charged
    }
}

/// A pair handed out for processing.
#[derive(Debug)]
pub struct Admitted {
    pub result: Arc<FetchResult>,
    pub request: FetchRequest,
    pub ticket: Ticket,
}

#[derive(Debug)]
struct Queued {
    result: Arc<FetchResult>,
    request: FetchRequest,
    ticket: Ticket,
}

pub struct BackpressureStage {
    id: u64,
    queue: VecDeque<Queued>,
    /// Ticket id -> bytes charged.
    active: HashMap<u64, u64>,
    active_size: u64,
    ceiling: u64,
    next_ticket: u64,
    backing_out: bool,
    peak_active_size: u64,
    backouts: u64,
    events: SinkRef,
}

impl BackpressureStage {
    pub fn new(ceiling: u64, events: SinkRef) -> Self {
        Self {
            id: NEXT_STAGE_ID.fetch_add(1, Ordering::Relaxed),
            queue: VecDeque::new(),
            active: HashMap::new(),
            active_size: 0,
            ceiling,
            next_ticket: 0,
            backing_out: false,
            peak_active_size: 0,
            backouts: 0,
            events,
        }
    }

    /// Queue a pair for processing and charge its size immediately.
    pub fn admit(&mut self, result: Arc<FetchResult>, request: FetchRequest) -> Completion {
        let charged = result.byte_size().max(MIN_UNIT);
        let (done, completion) = oneshot::channel();
        let ticket = Ticket {
            stage: self.id,
            id: self.next_ticket,
            charged,
            done,
        };
        self.next_ticket += 1;

        self.active_size += charged;
        self.peak_active_size = self.peak_active_size.max(self.active_size);

        self.events.emit(
            CoreEvent::new(EventKind::Admitted, request.url.clone())
                .field("size", charged as f64)
                .field("active_size", self.active_size as f64),
        );
        self.queue.push_back(Queued {
            result,
            request,
            ticket,
        });
        self.note_pressure();
        completion
    }

    /// Oldest queued pair, now counted as active. `None` when nothing is queued.
    pub fn take_next(&mut self) -> Option<Admitted> {
        let Queued {
            result,
            request,
            ticket,
        } = self.queue.pop_front()?;
        self.active.insert(ticket.id, ticket.charged);
        Some(Admitted {
            result,
            request,
            ticket,
        })
    }

    /// Release a processed pair.
    ///
    /// # Panics
    ///
    /// If the ticket belongs to another stage or is not active here.
    pub fn finish(&mut self, ticket: Ticket) {
        assert_eq!(
            ticket.stage, self.id,
            "ticket from stage {} finished on stage {}",
            ticket.stage, self.id
        );
        let charged = match self.active.remove(&ticket.id) {
            Some(charged) => charged,
            None => panic!("ticket {} is not active on stage {}", ticket.id, self.id),
        };
        debug_assert_eq!(charged, ticket.charged);

        self.active_size -= charged;
        let _ = ticket.done.send(());

        self.events.emit(
            CoreEvent::new(EventKind::Finished, "")
                .field("size", charged as f64)
                .field("active_size", self.active_size as f64),
        );
        self.note_pressure();
    }

    /// True when nothing is queued and nothing is being processed.
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.active.is_empty()
    }

    /// True while the charged size exceeds the ceiling.
    pub fn needs_backout(&self) -> bool {
        self.active_size > self.ceiling
    }

    pub fn active_size(&self) -> u64 {
        self.active_size
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn active(&self) -> usize {
        self.active.len()
    }

    pub fn peak_active_size(&self) -> u64 {
        self.peak_active_size
    }

    /// Number of times the stage crossed above its ceiling.
    pub fn backouts(&self) -> u64 {
        self.backouts
    }

    fn note_pressure(&mut self) {
        let backing_out = self.needs_backout();
        if backing_out == self.backing_out {
            return;
        }
        self.backing_out = backing_out;

        let kind = if backing_out {
            self.backouts += 1;
            debug!(
                "Backpressure: {} bytes active exceeds ceiling {}, backing out",
                self.active_size, self.ceiling
            );
            EventKind::BackoutStarted
        } else {
            debug!(
                "Backpressure: {} bytes active, resuming",
                self.active_size
            );
            EventKind::BackoutCleared
        };
        self.events.emit(
            CoreEvent::new(kind, "")
                .field("active_size", self.active_size as f64)
                .field("ceiling", self.ceiling as f64),
        );
    }
}
