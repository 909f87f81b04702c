//! The crawl loop.
//!
//! Pulls requests from a [`Scheduler`], fetches them through the dedup cache
//! and the per-host slot gate, holds results in a [`BackpressureStage`] and
//! hands them to a [`Processor`]. The scheduler is only asked for more work
//! while the stage is under its ceiling and fewer than
//! `concurrent_requests` fetches are in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::backpressure::{Admitted, BackpressureStage, Ticket};
use crate::config::Settings;
use crate::dedup::{DedupCache, DedupStats};
use crate::error::{ConfigError, DedupError};
use crate::events::{SinkRef, TracingSink};
use crate::models::{FetchRequest, FetchResult, Fingerprinter};
use crate::pipeline::{fetch_isolated, Fetcher, Processor, Scheduler};
use crate::slot::{SlotRegistry, SlotStats};
use crate::throttle::{AdaptiveThrottle, FetchTelemetry, ThrottleConfig};

/// Everything one run needs that is not a collaborator.
#[derive(Clone)]
pub struct RunContext {
    pub settings: Settings,
    pub events: SinkRef,
    pub run_id: Uuid,
}

impl RunContext {
    pub fn new(settings: Settings, events: SinkRef) -> Self {
        Self {
            settings,
            events,
            run_id: Uuid::new_v4(),
        }
    }

    /// Context whose events go to the tracing debug stream.
    pub fn with_tracing(settings: Settings) -> Self {
        Self::new(settings, TracingSink::new_ref())
    }
}

/// Stops a running engine. Clones share the same signal.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Stop pulling new requests. Work already started is drained.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// What a finished run did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// True when the run ended because of a shutdown request.
    pub shut_down: bool,
    /// Requests taken from the scheduler.
    pub pulled: u64,
    /// Requests that went to the network.
    pub fetched: u64,
    pub cache_hits: u64,
    /// Requests that shared another request's in-flight fetch.
    pub joined: u64,
    pub processed: u64,
    pub processing_errors: u64,
    /// Requests whose dedup wait was abandoned.
    pub abandoned: u64,
    pub backouts: u64,
    pub peak_active_size: u64,
}

fn lock(throttle: &Mutex<AdaptiveThrottle>) -> MutexGuard<'_, AdaptiveThrottle> {
    throttle.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The network path behind the dedup cache: wait for the slot, fetch, then
/// feed the observed latency back into the slot's delay.
struct PacedFetcher {
    inner: Arc<dyn Fetcher>,
    fingerprinter: Fingerprinter,
    slots: SlotRegistry,
    throttle: Arc<Mutex<AdaptiveThrottle>>,
    adjust_delays: bool,
    fetched: AtomicU64,
}

#[async_trait]
impl Fetcher for PacedFetcher {
    async fn fetch(&self, request: &FetchRequest) -> FetchResult {
        let key = SlotRegistry::key_for(request);
        let pause = lock(&self.throttle).pending_pause(&key, Utc::now());
        let guard = self
            .slots
            .acquire(&key, self.fingerprinter.fingerprint(request), pause)
            .await;

        let sent_at = Utc::now();
        let started = Instant::now();
        let result = self.inner.fetch(request).await;
        let latency = started.elapsed();
        self.fetched.fetch_add(1, Ordering::Relaxed);

        if self.adjust_delays && !request.meta.dont_adjust_delay {
            let telemetry = FetchTelemetry {
                latency,
                status: result.status(),
                sent_at,
                response_size: result.byte_size(),
            };
            let mut throttle = lock(&self.throttle);
            self.slots
                .update(&key, |slot| throttle.on_fetch_completed(&key, slot, &telemetry));
        }

        drop(guard);
        result
    }
}

enum TaskOutcome {
    Fetched {
        request: FetchRequest,
        result: Result<Arc<FetchResult>, DedupError>,
    },
    Processed {
        ticket: Ticket,
        url: String,
        outcome: Result<anyhow::Result<()>, JoinError>,
    },
}

pub struct CrawlEngine {
    ctx: RunContext,
    fingerprinter: Fingerprinter,
    paced: Arc<PacedFetcher>,
    dedup: Arc<DedupCache>,
    processor: Arc<dyn Processor>,
    shutdown: ShutdownHandle,
}

impl CrawlEngine {
    pub fn new(
        ctx: RunContext,
        fetcher: Arc<dyn Fetcher>,
        processor: Arc<dyn Processor>,
    ) -> Result<Self, ConfigError> {
        Self::with_fingerprinter(ctx, fetcher, processor, Fingerprinter::new())
    }

    /// Like [`CrawlEngine::new`], with custom request identity for dedup
    /// and transfer tracking.
    pub fn with_fingerprinter(
        ctx: RunContext,
        fetcher: Arc<dyn Fetcher>,
        processor: Arc<dyn Processor>,
        fingerprinter: Fingerprinter,
    ) -> Result<Self, ConfigError> {
        ctx.settings.validate()?;
        let settings = &ctx.settings;

        let mut throttle =
            AdaptiveThrottle::new(ThrottleConfig::from(settings), ctx.events.clone());
        let start_delay = if settings.throttle_enabled {
            throttle.on_spider_start()
        } else {
            settings.min_delay
        };

        let paced = Arc::new(PacedFetcher {
            inner: fetcher,
            fingerprinter: fingerprinter.clone(),
            slots: SlotRegistry::new(start_delay, settings.concurrent_requests_per_host),
            throttle: Arc::new(Mutex::new(throttle)),
            adjust_delays: settings.throttle_enabled,
            fetched: AtomicU64::new(0),
        });
        let dedup = Arc::new(DedupCache::new(
            paced.clone(),
            settings.dedup_cache_capacity,
            ctx.events.clone(),
        ));

        Ok(Self {
            ctx,
            fingerprinter,
            paced,
            dedup,
            processor,
            shutdown: ShutdownHandle::new(),
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn slots(&self) -> HashMap<String, SlotStats> {
        self.paced.slots.snapshot()
    }

    pub fn dedup_stats(&self) -> DedupStats {
        self.dedup.stats()
    }

    /// Drive `scheduler` until it has nothing left and all work has
    /// drained, or until shutdown is triggered.
    pub async fn run<S: Scheduler>(&self, scheduler: S) -> anyhow::Result<RunSummary> {
        let span = info_span!("crawl", run_id = %self.ctx.run_id);
        self.drive(scheduler).instrument(span).await
    }

    async fn drive<S: Scheduler>(&self, mut scheduler: S) -> anyhow::Result<RunSummary> {
        let settings = &self.ctx.settings;
        let run_id = self.ctx.run_id.to_string();
        let started_at = Utc::now();
        let fetched_before = self.paced.fetched.load(Ordering::Relaxed);
        let stats_before = self.dedup.stats();

        let mut stage =
            BackpressureStage::new(settings.backpressure_byte_ceiling, self.ctx.events.clone());
        let mut tasks: JoinSet<TaskOutcome> = JoinSet::new();
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut stopping = *shutdown_rx.borrow_and_update();
        let mut exhausted = false;
        let mut in_flight = 0usize;

        let mut pulled = 0u64;
        let mut processed = 0u64;
        let mut processing_errors = 0u64;
        let mut abandoned = 0u64;

        info!("Crawl {} started", run_id);

        loop {
            stopping |= self.shutdown.is_triggered();
            while !stopping
                && !exhausted
                && in_flight < settings.concurrent_requests
                && !stage.needs_backout()
            {
                match scheduler.next_request() {
                    Some(request) => {
                        self.spawn_fetch(&mut tasks, request);
                        in_flight += 1;
                        pulled += 1;
                    }
                    None => exhausted = true,
                }
            }

            while let Some(admitted) = stage.take_next() {
                self.spawn_processing(&mut tasks, admitted);
            }

            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                joined = tasks.join_next() => {
                    let outcome = match joined {
                        Some(Ok(outcome)) => outcome,
                        Some(Err(e)) => {
                            return Err(anyhow::Error::new(e).context("crawl task failed"));
                        }
                        None => continue,
                    };
                    match outcome {
                        TaskOutcome::Fetched { request, result } => {
                            in_flight -= 1;
                            match result {
                                Ok(result) => {
                                    let _ = stage.admit(result, request);
                                }
                                Err(e) => {
                                    warn!("Dropping {}: {}", request.url, e);
                                    abandoned += 1;
                                }
                            }
                        }
                        TaskOutcome::Processed { ticket, url, outcome } => {
                            stage.finish(ticket);
                            processed += 1;
                            match outcome {
                                Ok(Ok(())) => debug!("Processed {}", url),
                                Ok(Err(e)) => {
                                    processing_errors += 1;
                                    warn!("Processing {} failed: {:#}", url, e);
                                }
                                Err(e) => {
                                    processing_errors += 1;
                                    warn!("Processing {} panicked: {}", url, e);
                                }
                            }
                            // Processing may have scheduled follow-ups.
                            exhausted = false;
                        }
                    }
                }
                changed = shutdown_rx.changed(), if !stopping => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        stopping = true;
                        info!(
                            "Crawl {} shutting down, draining {} tasks ({} queued, {} processing)",
                            run_id,
                            tasks.len(),
                            stage.queued(),
                            stage.active()
                        );
                    }
                }
            }
        }

        abandoned += self.dedup.abandon_all() as u64;
        let stats = self.dedup.stats();

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            shut_down: stopping,
            pulled,
            fetched: self.paced.fetched.load(Ordering::Relaxed) - fetched_before,
            cache_hits: stats.hits - stats_before.hits,
            joined: stats.joins - stats_before.joins,
            processed,
            processing_errors,
            abandoned,
            backouts: stage.backouts(),
            peak_active_size: stage.peak_active_size(),
        };
        info!(
            "Crawl {} finished: {} pulled, {} fetched, {} processed ({} errors)",
            summary.run_id,
            summary.pulled,
            summary.fetched,
            summary.processed,
            summary.processing_errors
        );
        Ok(summary)
    }

    fn spawn_fetch(&self, tasks: &mut JoinSet<TaskOutcome>, request: FetchRequest) {
        if request.meta.dont_dedup {
            let fetcher: Arc<dyn Fetcher> = self.paced.clone();
            tasks.spawn(async move {
                let result = fetch_isolated(fetcher, request.clone()).await;
                TaskOutcome::Fetched {
                    request,
                    result: Ok(Arc::new(result)),
                }
            });
            return;
        }

        let pending = self
            .dedup
            .request(self.fingerprinter.fingerprint(&request), &request);
        tasks.spawn(async move {
            let result = pending.await;
            TaskOutcome::Fetched { request, result }
        });
    }

    fn spawn_processing(&self, tasks: &mut JoinSet<TaskOutcome>, admitted: Admitted) {
        let Admitted {
            result,
            request,
            ticket,
        } = admitted;
        let processor = Arc::clone(&self.processor);
        let url = request.url.clone();
        tasks.spawn(async move {
            // The ticket stays out here so a panicking processor still
            // releases its charge.
            let outcome =
                tokio::spawn(async move { processor.process(result, &request).await }).await;
            TaskOutcome::Processed {
                ticket,
                url,
                outcome,
            }
        });
    }
}
