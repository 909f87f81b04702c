//! Flow control for web crawlers.
//!
//! Three cooperating pieces sit between a request scheduler and whatever
//! consumes fetched pages:
//!
//! - [`BackpressureStage`] bounds the bytes held between fetch completion and
//!   processing, telling the engine when to stop pulling requests.
//! - [`DedupCache`] collapses concurrent fetches of the same resource into one.
//! - [`AdaptiveThrottle`] paces each host from observed latency and backs off
//!   on rate-limit responses.
//!
//! [`CrawlEngine`] wires them together around caller-supplied [`Fetcher`],
//! [`Processor`] and [`Scheduler`] implementations.

pub mod backpressure;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod slot;
pub mod throttle;

pub use backpressure::{Admitted, BackpressureStage, Completion, Ticket};
pub use config::{load_settings, Config, Settings};
pub use dedup::{DedupCache, DedupStats, Pending};
pub use engine::{CrawlEngine, RunContext, RunSummary, ShutdownHandle};
pub use error::{ConfigError, DedupError, FailureKind, FetchFailure};
pub use events::{ChannelSink, CoreEvent, EventKind, EventSink, NullSink, SinkRef, TracingSink};
pub use models::{FetchRequest, FetchResponse, FetchResult, Fingerprint, Fingerprinter, RequestMeta};
pub use pipeline::{Fetcher, Processor, Scheduler};
pub use slot::{FetchSlot, SlotGuard, SlotRegistry};
pub use throttle::{AdaptiveThrottle, FetchTelemetry, ThrottleConfig};
