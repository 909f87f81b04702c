//! Adaptive per-host throttle.
//!
//! Recomputes a slot's delay from each completed fetch so that, at constant
//! latency, about `target_concurrency` requests stay in flight to that host.
//! Rate-limit responses additionally feed a sliding-window estimate of the
//! rate the host tolerated, which becomes a floor for the delay.

mod host_state;
mod window;

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::Settings;
use crate::events::{CoreEvent, EventKind, SinkRef};
use crate::slot::FetchSlot;

pub use host_state::{RateLimitEstimate, RateLimitState};
pub use window::{Granularity, SlidingWindow, SlidingWindowSet};

/// Status counted as a success for window counts and the asymmetry rule.
const SUCCESS_STATUS: u16 = 200;

/// Configuration for throttling behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct ThrottleConfig {
    pub target_concurrency: f64,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub start_delay: Duration,
    pub rate_limit_status_code: u16,
    pub rate_limit_enabled: bool,
    pub debug: bool,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for ThrottleConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            target_concurrency: settings.target_concurrency,
            min_delay: settings.min_delay,
            max_delay: settings.max_delay,
            start_delay: settings.start_delay,
            rate_limit_status_code: settings.rate_limit_status_code,
            rate_limit_enabled: settings.rate_limit_handling_enabled,
            debug: settings.debug_logging,
        }
    }
}

/// What the network layer observed for one completed fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchTelemetry {
    pub latency: Duration,
    /// `None` for failures that produced no response.
    pub status: Option<u16>,
    pub sent_at: DateTime<Utc>,
    pub response_size: u64,
}

/// A committed delay change.
#[derive(Debug, Clone, PartialEq)]
pub struct DelayAdjustment {
    pub key: String,
    pub old_delay: Duration,
    pub new_delay: Duration,
    pub concurrency: usize,
    pub latency: Duration,
    pub response_size: u64,
    pub rate_limit: Option<RateLimitEstimate>,
}

impl DelayAdjustment {
    pub fn delta_secs(&self) -> f64 {
        self.new_delay.as_secs_f64() - self.old_delay.as_secs_f64()
    }
}

pub struct AdaptiveThrottle {
    config: ThrottleConfig,
    hosts: HashMap<String, RateLimitState>,
    events: SinkRef,
}

impl AdaptiveThrottle {
    pub fn new(config: ThrottleConfig, events: SinkRef) -> Self {
        Self {
            config,
            hosts: HashMap::new(),
            events,
        }
    }

    /// Delay for hosts with no latency observed yet.
    pub fn on_spider_start(&mut self) -> Duration {
        self.config.start_delay = self.config.start_delay.max(self.config.min_delay);
        self.config.start_delay
    }

    pub fn initial_failover_lives(&self) -> u32 {
        let target = self.config.target_concurrency.max(0.0) as u32;
        target.saturating_add(2).max(3)
    }

    pub fn rate_limit_state(&self, key: &str) -> Option<&RateLimitState> {
        self.hosts.get(key)
    }

    /// Pause owed to `key` because of an open rate-limit window.
    pub fn pending_pause(&mut self, key: &str, now: DateTime<Utc>) -> Duration {
        self.hosts
            .get_mut(key)
            .map(|state| state.pending_pause(now))
            .unwrap_or(Duration::ZERO)
    }

    /// Feed one completed fetch and update the slot's delay.
    ///
    /// Returns the adjustment when the delay was committed. Non-success
    /// responses may raise the delay but never lower it.
    pub fn on_fetch_completed(
        &mut self,
        key: &str,
        slot: &mut FetchSlot,
        telemetry: &FetchTelemetry,
    ) -> Option<DelayAdjustment> {
        let old_delay = slot.delay;
        let is_success = telemetry.status == Some(SUCCESS_STATUS);

        let rate_limit = if self.config.rate_limit_enabled {
            self.track_rate_limit(key, telemetry, is_success)
        } else {
            None
        };

        let target = self.latency_target(telemetry.latency);
        let mut candidate = target.max(old_delay.saturating_add(target) / 2);
        if let Some(floor) = rate_limit.as_ref().and_then(|e| e.floor) {
            candidate = candidate.max(floor);
        }
        let candidate = candidate.max(self.config.min_delay).min(self.config.max_delay);

        // Error pages come back fast; letting them pull the delay down
        // feeds on itself.
        if !is_success && candidate <= old_delay {
            return None;
        }

        slot.delay = candidate;
        let adjustment = DelayAdjustment {
            key: key.to_string(),
            old_delay,
            new_delay: candidate,
            concurrency: slot.transferring(),
            latency: telemetry.latency,
            response_size: telemetry.response_size,
            rate_limit,
        };
        if self.config.debug {
            self.report(&adjustment);
        }
        Some(adjustment)
    }

    /// Spacing that keeps `target_concurrency` requests in flight at this
    /// latency. Saturates at `max_delay` when the quotient is unrepresentable.
    fn latency_target(&self, latency: Duration) -> Duration {
        Duration::try_from_secs_f64(latency.as_secs_f64() / self.config.target_concurrency)
            .unwrap_or(self.config.max_delay)
    }

    fn track_rate_limit(
        &mut self,
        key: &str,
        telemetry: &FetchTelemetry,
        is_success: bool,
    ) -> Option<RateLimitEstimate> {
        let lives = self.initial_failover_lives();
        let state = self
            .hosts
            .entry(key.to_string())
            .or_insert_with(|| RateLimitState::new(lives));

        if is_success {
            state.record_success(telemetry.sent_at);
            return None;
        }
        if telemetry.status != Some(self.config.rate_limit_status_code) {
            return None;
        }

        let estimate = state.on_rate_limited(telemetry.sent_at, lives);
        warn!(
            "Rate limited by {} (HTTP {}), floor {:?}, pausing {:?} ({} lives left at {:?})",
            key,
            self.config.rate_limit_status_code,
            estimate.floor,
            estimate.special_delay,
            estimate.failover_lives,
            estimate.granularity
        );

        let mut event = CoreEvent::new(EventKind::RateLimited, key)
            .field("special_delay", estimate.special_delay.as_secs_f64())
            .field("failover_lives", estimate.failover_lives as f64);
        if let Some(floor) = estimate.floor {
            event = event.field("floor", floor.as_secs_f64());
        }
        if let Some(rate) = estimate.estimated_rate {
            event = event.field("estimated_rate", rate);
        }
        self.events.emit(event);

        if let Some(coarser) = estimate.escalated_to {
            info!("Rate limit pacing for {} escalated to {:?} windows", key, coarser);
            self.events.emit(
                CoreEvent::new(EventKind::GranularityEscalated, key)
                    .field("bucket_secs", coarser.bucket_secs() as f64),
            );
        }
        Some(estimate)
    }

    fn report(&self, adj: &DelayAdjustment) {
        let delta_ms = adj.delta_secs() * 1000.0;
        info!(
            "slot: {} | conc:{:2} | delay:{:5} ms ({:+.0}) | latency:{:5} ms | size:{:6} bytes",
            adj.key,
            adj.concurrency,
            adj.new_delay.as_millis(),
            delta_ms,
            adj.latency.as_millis(),
            adj.response_size
        );
        self.events.emit(
            CoreEvent::new(EventKind::DelayAdjusted, adj.key.clone())
                .field("concurrency", adj.concurrency as f64)
                .field("old_delay", adj.old_delay.as_secs_f64())
                .field("new_delay", adj.new_delay.as_secs_f64())
                .field("delta", adj.delta_secs())
                .field("size", adj.response_size as f64),
        );
    }
}
