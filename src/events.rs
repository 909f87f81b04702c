//! Structured observability events.
//!
//! Sinks are fire-and-forget: `emit` must not block and must not fail the
//! operation that produced the event.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    DelayAdjusted,
    RateLimited,
    GranularityEscalated,
    Admitted,
    Finished,
    BackoutStarted,
    BackoutCleared,
    CacheHit,
    CacheMiss,
    CacheJoined,
    WaiterResolved,
    WaitersAbandoned,
}

/// One event: what happened, to which host or fingerprint, plus numbers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoreEvent {
    pub kind: EventKind,
    pub key: String,
    pub fields: Vec<(&'static str, f64)>,
}

impl CoreEvent {
    pub fn new(kind: EventKind, key: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, name: &'static str, value: f64) -> Self {
        self.fields.push((name, value));
        self
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.fields
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| *v)
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: CoreEvent);
}

pub type SinkRef = Arc<dyn EventSink>;

/// Writes events to the tracing debug stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TracingSink {
    pub fn new_ref() -> SinkRef {
        Arc::new(Self)
    }
}

impl EventSink for TracingSink {
    fn emit(&self, event: CoreEvent) {
        debug!(kind = ?event.kind, key = %event.key, fields = ?event.fields, "event");
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl NullSink {
    pub fn new_ref() -> SinkRef {
        Arc::new(Self)
    }
}

impl EventSink for NullSink {
    fn emit(&self, _event: CoreEvent) {}
}

/// Forwards events over an unbounded channel. A closed receiver drops them.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<CoreEvent>,
}

impl ChannelSink {
    pub fn channel() -> (SinkRef, mpsc::UnboundedReceiver<CoreEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: CoreEvent) {
        let _ = self.tx.send(event);
    }
}

/// Drain whatever a [`ChannelSink`] has buffered so far.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<CoreEvent>) -> Vec<CoreEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
