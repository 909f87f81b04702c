//! End-to-end runs of the crawl engine against in-memory collaborators.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use crawlflow::events::drain;
use crawlflow::{
    ChannelSink, CrawlEngine, EventKind, FetchRequest, FetchResponse, FetchResult, Fetcher,
    NullSink, Processor, RequestMeta, RunContext, Settings,
};
use tokio::sync::Semaphore;

/// Serves `body_size` bytes for every URL, counting calls. Paths containing
/// "limited" answer 429. An optional gate holds fetches until opened.
struct StubFetcher {
    calls: AtomicUsize,
    body_size: usize,
    latency: Duration,
    gate: Option<Semaphore>,
}

impl StubFetcher {
    fn new(body_size: usize) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            body_size,
            latency: Duration::ZERO,
            gate: None,
        }
    }

    fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn gated(mut self) -> Self {
        self.gate = Some(Semaphore::new(0));
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for StubFetcher {
    async fn fetch(&self, request: &FetchRequest) -> FetchResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await.unwrap();
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let status = if request.url.contains("limited") { 429 } else { 200 };
        FetchResponse::new(request.url.clone(), status, vec![b'x'; self.body_size]).into()
    }
}

/// Records what it saw; can be told to fail, panic, or schedule follow-ups.
#[derive(Default)]
struct RecordingProcessor {
    seen: Mutex<Vec<String>>,
    hold: Duration,
    follow_ups: Option<Arc<Mutex<VecDeque<FetchRequest>>>>,
}

impl RecordingProcessor {
    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Processor for RecordingProcessor {
    async fn process(&self, result: Arc<FetchResult>, request: &FetchRequest) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(request.url.clone());
        if !self.hold.is_zero() {
            tokio::time::sleep(self.hold).await;
        }
        if request.url.ends_with("/explode") {
            panic!("processor bug");
        }
        if request.url.ends_with("/broken") {
            anyhow::bail!("could not parse {} bytes", result.byte_size());
        }
        if let Some(queue) = &self.follow_ups {
            if !request.url.ends_with("/next") {
                queue
                    .lock()
                    .unwrap()
                    .push_back(FetchRequest::get(format!("{}/next", request.url)));
            }
        }
        Ok(())
    }
}

fn settings() -> Settings {
    Settings {
        start_delay: Duration::ZERO,
        ..Default::default()
    }
}

fn requests(paths: &[&str]) -> VecDeque<FetchRequest> {
    paths
        .iter()
        .map(|p| FetchRequest::get(format!("https://example.com/{p}")))
        .collect()
}

fn engine(
    settings: Settings,
    fetcher: Arc<StubFetcher>,
    processor: Arc<RecordingProcessor>,
) -> CrawlEngine {
    CrawlEngine::new(RunContext::new(settings, NullSink::new_ref()), fetcher, processor).unwrap()
}

// ============================================================================
// Deduplication
// ============================================================================

#[tokio::test(start_paused = true)]
async fn identical_requests_share_one_fetch() {
    let fetcher = Arc::new(StubFetcher::new(100));
    let processor = Arc::new(RecordingProcessor::default());
    let engine = engine(settings(), fetcher.clone(), processor.clone());

    let summary = engine
        .run(requests(&["doc.pdf", "doc.pdf", "doc.pdf", "doc.pdf", "doc.pdf"]))
        .await
        .unwrap();

    assert_eq!(fetcher.calls(), 1);
    assert_eq!(summary.pulled, 5);
    assert_eq!(summary.fetched, 1);
    assert_eq!(summary.joined, 4);
    assert_eq!(summary.processed, 5);
    assert_eq!(processor.seen().len(), 5);
}

#[tokio::test(start_paused = true)]
async fn late_duplicate_is_served_from_cache() {
    let fetcher = Arc::new(StubFetcher::new(100));
    let processor = Arc::new(RecordingProcessor::default());
    let engine = engine(
        Settings {
            concurrent_requests: 1,
            ..settings()
        },
        fetcher.clone(),
        processor,
    );

    let summary = engine.run(requests(&["a", "a"])).await.unwrap();
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(summary.cache_hits, 1);
    assert_eq!(summary.processed, 2);
}

#[tokio::test(start_paused = true)]
async fn dont_dedup_always_fetches() {
    let fetcher = Arc::new(StubFetcher::new(100));
    let processor = Arc::new(RecordingProcessor::default());
    let engine = engine(settings(), fetcher.clone(), processor);

    let meta = RequestMeta {
        dont_dedup: true,
        ..Default::default()
    };
    let queue: VecDeque<FetchRequest> = (0..3)
        .map(|_| FetchRequest::get("https://example.com/feed").with_meta(meta.clone()))
        .collect();

    let summary = engine.run(queue).await.unwrap();
    assert_eq!(fetcher.calls(), 3);
    assert_eq!(summary.fetched, 3);
    assert_eq!(engine.dedup_stats().misses, 0);
}

// ============================================================================
// Backpressure
// ============================================================================

#[tokio::test(start_paused = true)]
async fn pulling_pauses_while_over_ceiling() {
    let fetcher = Arc::new(StubFetcher::new(1500));
    let processor = Arc::new(RecordingProcessor {
        hold: Duration::from_secs(1),
        ..Default::default()
    });
    let engine = engine(
        Settings {
            concurrent_requests: 1,
            throttle_enabled: false,
            backpressure_byte_ceiling: 2048,
            ..settings()
        },
        fetcher,
        processor.clone(),
    );

    let paths: Vec<String> = (0..8).map(|i| format!("page/{i}")).collect();
    let paths: Vec<&str> = paths.iter().map(String::as_str).collect();
    let summary = engine.run(requests(&paths)).await.unwrap();

    assert_eq!(summary.processed, 8);
    assert!(summary.backouts >= 1);
    // Pulling stops as soon as the ceiling is crossed, so at most one
    // response can land on top of a full stage.
    assert!(summary.peak_active_size <= 2048 + 1500);
    assert!(summary.peak_active_size > 2048);
}

#[tokio::test(start_paused = true)]
async fn failed_and_panicking_processors_release_their_charge() {
    let fetcher = Arc::new(StubFetcher::new(10));
    let processor = Arc::new(RecordingProcessor::default());
    let engine = engine(
        Settings {
            backpressure_byte_ceiling: 1024,
            ..settings()
        },
        fetcher,
        processor,
    );

    let summary = engine
        .run(requests(&["ok", "broken", "explode", "fine"]))
        .await
        .unwrap();
    assert_eq!(summary.processed, 4);
    assert_eq!(summary.processing_errors, 2);
}

// ============================================================================
// Scheduling and shutdown
// ============================================================================

#[tokio::test(start_paused = true)]
async fn follow_ups_from_processing_are_pulled() {
    let queue = Arc::new(Mutex::new(requests(&["a", "b"])));
    let fetcher = Arc::new(StubFetcher::new(10));
    let processor = Arc::new(RecordingProcessor {
        follow_ups: Some(queue.clone()),
        ..Default::default()
    });
    let engine = engine(settings(), fetcher, processor.clone());

    let summary = engine.run(queue).await.unwrap();
    assert_eq!(summary.pulled, 4);
    let mut seen = processor.seen();
    seen.sort();
    assert_eq!(
        seen,
        vec![
            "https://example.com/a",
            "https://example.com/a/next",
            "https://example.com/b",
            "https://example.com/b/next",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn shutdown_drains_in_flight_work() {
    let fetcher = Arc::new(StubFetcher::new(10).gated());
    let processor = Arc::new(RecordingProcessor::default());
    let engine = Arc::new(engine(
        Settings {
            concurrent_requests: 2,
            ..settings()
        },
        fetcher.clone(),
        processor.clone(),
    ));
    let shutdown = engine.shutdown_handle();

    let paths: Vec<String> = (0..10).map(|i| format!("item/{i}")).collect();
    let paths: Vec<&str> = paths.iter().map(String::as_str).collect();
    let queue = requests(&paths);

    let run = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run(queue).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(fetcher.calls(), 2);

    shutdown.trigger();
    assert!(shutdown.is_triggered());
    fetcher.gate.as_ref().unwrap().add_permits(100);

    let summary = run.await.unwrap().unwrap();
    assert!(summary.shut_down);
    assert_eq!(summary.pulled, 2);
    assert_eq!(summary.processed, 2);
    assert_eq!(processor.seen().len(), 2);
}

// ============================================================================
// Throttling
// ============================================================================

#[tokio::test(start_paused = true)]
async fn slot_delay_follows_latency() {
    let fetcher = Arc::new(StubFetcher::new(10).with_latency(Duration::from_secs(2)));
    let processor = Arc::new(RecordingProcessor::default());
    let engine = engine(
        Settings {
            start_delay: Duration::from_secs(5),
            ..Default::default()
        },
        fetcher,
        processor,
    );

    engine.run(requests(&["slow"])).await.unwrap();

    // max(2.0, (5.0 + 2.0) / 2)
    let delay = engine.slots()["example.com"].delay.as_secs_f64();
    assert!((delay - 3.5).abs() < 0.01, "delay {delay}");
}

#[tokio::test(start_paused = true)]
async fn dont_adjust_delay_leaves_slot_alone() {
    let fetcher = Arc::new(StubFetcher::new(10).with_latency(Duration::from_secs(2)));
    let processor = Arc::new(RecordingProcessor::default());
    let engine = engine(
        Settings {
            start_delay: Duration::from_secs(5),
            ..Default::default()
        },
        fetcher,
        processor,
    );

    let queue = VecDeque::from([FetchRequest::get("https://example.com/slow").with_meta(
        RequestMeta {
            dont_adjust_delay: true,
            ..Default::default()
        },
    )]);
    engine.run(queue).await.unwrap();
    assert_eq!(engine.slots()["example.com"].delay, Duration::from_secs(5));
}

/// Sleeps for the number of seconds in the last path segment and records
/// when each fetch actually began.
struct TimedFetcher {
    origin: tokio::time::Instant,
    starts: Mutex<Vec<Duration>>,
}

#[async_trait]
impl Fetcher for TimedFetcher {
    async fn fetch(&self, request: &FetchRequest) -> FetchResult {
        self.starts.lock().unwrap().push(self.origin.elapsed());
        let secs: u64 = request
            .url
            .rsplit('/')
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        tokio::time::sleep(Duration::from_secs(secs)).await;
        FetchResponse::new(request.url.clone(), 200, b"ok".to_vec()).into()
    }
}

#[tokio::test(start_paused = true)]
async fn fixed_delay_spaces_every_start_to_a_host() {
    let fetcher = Arc::new(TimedFetcher {
        origin: tokio::time::Instant::now(),
        starts: Mutex::new(Vec::new()),
    });
    let engine = CrawlEngine::new(
        RunContext::new(
            Settings {
                throttle_enabled: false,
                min_delay: Duration::from_secs(1),
                concurrent_requests_per_host: 2,
                ..settings()
            },
            NullSink::new_ref(),
        ),
        fetcher.clone(),
        Arc::new(RecordingProcessor::default()),
    )
    .unwrap();

    let summary = engine
        .run(requests(&["a/10", "b/9", "c/1", "d/1"]))
        .await
        .unwrap();
    assert_eq!(summary.processed, 4);

    let mut starts = fetcher.starts.lock().unwrap().clone();
    starts.sort();
    assert_eq!(starts.len(), 4);
    for pair in starts.windows(2) {
        assert!(
            pair[1] - pair[0] >= Duration::from_secs(1),
            "starts too close: {starts:?}"
        );
    }
    assert_eq!(engine.slots()["example.com"].delay, Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn rate_limit_responses_are_reported() {
    let (sink, mut rx) = ChannelSink::channel();
    let fetcher = Arc::new(StubFetcher::new(10));
    let processor = Arc::new(RecordingProcessor::default());
    let engine = CrawlEngine::new(
        RunContext::new(
            Settings {
                rate_limit_handling_enabled: true,
                ..settings()
            },
            sink,
        ),
        fetcher,
        processor,
    )
    .unwrap();

    let summary = engine.run(requests(&["ok", "limited"])).await.unwrap();
    assert_eq!(summary.processed, 2);

    let events = drain(&mut rx);
    let limited: Vec<_> = events
        .iter()
        .filter(|e| e.kind == EventKind::RateLimited)
        .collect();
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].key, "example.com");
    assert!(events.iter().any(|e| e.kind == EventKind::Admitted));
}
