//! Time-bucketed counters for estimating a host's recent request rate.
//!
//! Each window keeps only two numbers: the count in the current bucket and
//! the count in the bucket before it. The rate over the last full bucket
//! width is approximated by assuming the previous bucket's requests were
//! spread evenly across it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Second,
    Minute,
    Hour,
    Day,
}

impl Granularity {
    /// Finest first.
    pub const ALL: [Granularity; 4] = [
        Granularity::Second,
        Granularity::Minute,
        Granularity::Hour,
        Granularity::Day,
    ];

    pub fn bucket_secs(self) -> u64 {
        match self {
            Granularity::Second => 1,
            Granularity::Minute => 60,
            Granularity::Hour => 3_600,
            Granularity::Day => 86_400,
        }
    }

    fn bucket_millis(self) -> i64 {
        self.bucket_secs() as i64 * 1_000
    }

    /// Next more conservative granularity; `None` at `Day`.
    pub fn coarser(self) -> Option<Granularity> {
        match self {
            Granularity::Second => Some(Granularity::Minute),
            Granularity::Minute => Some(Granularity::Hour),
            Granularity::Hour => Some(Granularity::Day),
            Granularity::Day => None,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Counts of successful requests in the current and previous bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlidingWindow {
    granularity: Granularity,
    /// Start of the current bucket, epoch milliseconds.
    bucket_start: Option<i64>,
    current: u64,
    previous: u64,
}

impl SlidingWindow {
    pub fn new(granularity: Granularity) -> Self {
        Self {
            granularity,
            bucket_start: None,
            current: 0,
            previous: 0,
        }
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn current_count(&self) -> u64 {
        self.current
    }

    pub fn previous_count(&self) -> u64 {
        self.previous
    }

    /// Slide forward so the current bucket contains `at`. Timestamps from
    /// before the current bucket leave the window where it is.
    fn advance(&mut self, at: DateTime<Utc>) -> i64 {
        let width = self.granularity.bucket_millis();
        let bucket = at.timestamp_millis().div_euclid(width) * width;
        match self.bucket_start {
            Some(start) if bucket <= start => start,
            Some(start) => {
                self.previous = if bucket - start == width {
                    self.current
                } else {
                    0
                };
                self.current = 0;
                self.bucket_start = Some(bucket);
                bucket
            }
            None => {
                self.bucket_start = Some(bucket);
                bucket
            }
        }
    }

    pub fn record(&mut self, at: DateTime<Utc>) {
        self.advance(at);
        self.current += 1;
    }

    /// Estimated requests per bucket width at `at`, discounting the request
    /// being evaluated: `previous * fraction_of_bucket_remaining + current - 1`.
    pub fn estimate(&mut self, at: DateTime<Utc>) -> f64 {
        let start = self.advance(at);
        let width = self.granularity.bucket_millis();
        let remaining = (start + width - at.timestamp_millis()) as f64 / width as f64;
        self.previous as f64 * remaining.clamp(0.0, 1.0) + self.current as f64 - 1.0
    }

    /// Time until the bucket containing `at` ends. Never negative.
    pub fn time_remaining(&mut self, at: DateTime<Utc>) -> Duration {
        let start = self.advance(at);
        let end = start + self.granularity.bucket_millis();
        let millis = (end - at.timestamp_millis()).max(0);
        Duration::from_millis(millis as u64)
    }
}

/// One window per granularity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlidingWindowSet {
    windows: [SlidingWindow; 4],
}

impl Default for SlidingWindowSet {
    fn default() -> Self {
        Self {
            windows: Granularity::ALL.map(SlidingWindow::new),
        }
    }
}

impl SlidingWindowSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, at: DateTime<Utc>) {
        for window in &mut self.windows {
            window.record(at);
        }
    }

    pub fn window(&self, granularity: Granularity) -> &SlidingWindow {
        &self.windows[granularity.index()]
    }

    pub fn window_mut(&mut self, granularity: Granularity) -> &mut SlidingWindow {
        &mut self.windows[granularity.index()]
    }
}
