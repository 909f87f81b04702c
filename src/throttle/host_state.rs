//! Per-host rate-limit state.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::window::{Granularity, SlidingWindowSet};

/// What the estimator concluded from one rate-limit response.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitEstimate {
    /// Granularity in force when the response arrived.
    pub granularity: Granularity,
    /// Granularity whose counts produced `estimated_rate` (may be coarser
    /// than `granularity` when the finer window had too little data).
    pub estimated_with: Option<Granularity>,
    /// Requests per bucket width, or `None` when no window had data.
    pub estimated_rate: Option<f64>,
    /// Delay that would bring the rate down to the estimate.
    pub floor: Option<Duration>,
    /// Pause until the active bucket ends.
    pub special_delay: Duration,
    /// Set when this hit used up the last life.
    pub escalated_to: Option<Granularity>,
    pub failover_lives: u32,
}

/// Rate-limit tracking for a single host.
#[derive(Debug, Clone)]
pub struct RateLimitState {
    pub windows: SlidingWindowSet,
    pub granularity: Granularity,
    pub failover_lives: u32,
    /// Requests to this host should not start before this instant.
    pub resume_at: Option<DateTime<Utc>>,
    pub rate_limit_hits: u64,
}

impl RateLimitState {
    pub fn new(failover_lives: u32) -> Self {
        Self {
            windows: SlidingWindowSet::new(),
            granularity: Granularity::Second,
            failover_lives,
            resume_at: None,
            rate_limit_hits: 0,
        }
    }

    /// Count a successful response sent at `at`.
    pub fn record_success(&mut self, at: DateTime<Utc>) {
        self.windows.record(at);
    }

    /// Estimate a delay floor for a rate-limit response sent at `at`, then
    /// spend one life, escalating to a coarser granularity when none remain.
    pub fn on_rate_limited(&mut self, at: DateTime<Utc>, initial_lives: u32) -> RateLimitEstimate {
        self.rate_limit_hits += 1;
        let granularity = self.granularity;

        let mut estimated_with = None;
        let mut estimated_rate = None;
        let mut floor = None;
        for candidate in Granularity::ALL.into_iter().filter(|g| *g >= granularity) {
            let rate = self.windows.window_mut(candidate).estimate(at);
            if rate > 0.0 {
                let secs = candidate.bucket_secs() as f64 / rate;
                estimated_with = Some(candidate);
                estimated_rate = Some(rate);
                floor = Some(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX));
                break;
            }
        }

        let special_delay = self.windows.window_mut(granularity).time_remaining(at);
        self.resume_at = chrono::Duration::from_std(special_delay)
            .ok()
            .and_then(|d| at.checked_add_signed(d));

        self.failover_lives = self.failover_lives.saturating_sub(1);
        let mut escalated_to = None;
        if self.failover_lives == 0 {
            if let Some(coarser) = granularity.coarser() {
                self.granularity = coarser;
                escalated_to = Some(coarser);
            }
            self.failover_lives = initial_lives;
        }

        RateLimitEstimate {
            granularity,
            estimated_with,
            estimated_rate,
            floor,
            special_delay,
            escalated_to,
            failover_lives: self.failover_lives,
        }
    }

    /// Pause still owed at `now`. Clears itself once the window has passed;
    /// a clock that moved backwards yields zero rather than a negative pause.
    pub fn pending_pause(&mut self, now: DateTime<Utc>) -> Duration {
        let Some(resume_at) = self.resume_at else {
            return Duration::ZERO;
        };
        match (resume_at - now).to_std() {
            Ok(remaining) if remaining > Duration::ZERO => remaining,
            _ => {
                self.resume_at = None;
                Duration::ZERO
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(offset_ms: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_040, 0).unwrap() + chrono::Duration::milliseconds(offset_ms)
    }

    #[test]
    fn test_first_hit_without_data_has_no_floor() {
        let mut state = RateLimitState::new(3);
        let estimate = state.on_rate_limited(at(250), 3);
        assert_eq!(estimate.granularity, Granularity::Second);
        assert!(estimate.floor.is_none());
        assert!(estimate.estimated_with.is_none());
        assert_eq!(estimate.special_delay, Duration::from_millis(750));
        assert_eq!(state.rate_limit_hits, 1);
        assert_eq!(state.failover_lives, 2);
    }

    #[test]
    fn test_falls_through_to_coarser_window() {
        let mut state = RateLimitState::new(3);
        for i in 0..10 {
            state.record_success(at(i * 5_000));
        }
        // The second window saw nothing recently; the minute window holds 10.
        let estimate = state.on_rate_limited(at(50_000), 3);
        assert_eq!(estimate.granularity, Granularity::Second);
        assert_eq!(estimate.estimated_with, Some(Granularity::Minute));
        assert_eq!(estimate.estimated_rate, Some(9.0));
        let floor = estimate.floor.unwrap().as_secs_f64();
        assert!((floor - 60.0 / 9.0).abs() < 1e-6);
    }

    #[test]
    fn test_escalation_resets_lives() {
        let mut state = RateLimitState::new(3);
        state.on_rate_limited(at(0), 3);
        state.on_rate_limited(at(10), 3);
        assert_eq!(state.granularity, Granularity::Second);
        assert_eq!(state.failover_lives, 1);

        let estimate = state.on_rate_limited(at(20), 3);
        assert_eq!(estimate.escalated_to, Some(Granularity::Minute));
        assert_eq!(state.granularity, Granularity::Minute);
        assert_eq!(state.failover_lives, 3);
    }

    #[test]
    fn test_day_is_terminal() {
        let mut state = RateLimitState::new(1);
        for i in 0..3 {
            state.on_rate_limited(at(i), 1);
        }
        assert_eq!(state.granularity, Granularity::Day);
        let estimate = state.on_rate_limited(at(10), 1);
        assert_eq!(estimate.escalated_to, None);
        assert_eq!(state.granularity, Granularity::Day);
        assert_eq!(state.failover_lives, 1);
    }

    #[test]
    fn test_pending_pause_expires() {
        let mut state = RateLimitState::new(3);
        state.on_rate_limited(at(60_400), 3);
        assert_eq!(state.pending_pause(at(60_400)), Duration::from_millis(600));
        assert_eq!(state.pending_pause(at(60_900)), Duration::from_millis(100));
        assert_eq!(state.pending_pause(at(62_000)), Duration::ZERO);
        assert!(state.resume_at.is_none());
    }

    #[test]
    fn test_pending_pause_after_clock_rewind_is_bounded() {
        let mut state = RateLimitState::new(3);
        state.on_rate_limited(at(500), 3);
        // Asking from an earlier instant just yields the distance to resume.
        assert_eq!(state.pending_pause(at(0)), Duration::from_secs(1));
    }
}
