//! Configuration management using the prefer crate.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Floor applied to every admitted result's size, in bytes.
pub const MIN_UNIT: u64 = 1024;

/// Default byte ceiling for results held between fetch and processing.
pub const DEFAULT_BACKPRESSURE_CEILING: u64 = 5_000_000;

/// Longest delay any setting may ask for.
pub const MAX_DELAY_LIMIT: Duration = Duration::from_secs(86_400);

/// Prefix for environment overrides (`CRAWLFLOW_MAX_DELAY=30`).
const ENV_PREFIX: &str = "CRAWLFLOW_";

/// Effective settings for one crawl run.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Maximum fetches in flight across all hosts.
    pub concurrent_requests: usize,
    /// Maximum fetches in flight per slot.
    pub concurrent_requests_per_host: usize,
    /// Whether latency feedback adjusts slot delays at all.
    pub throttle_enabled: bool,
    /// Average number of requests the throttle aims to keep in flight per host.
    pub target_concurrency: f64,
    /// Delay floor.
    pub min_delay: Duration,
    /// Delay ceiling.
    pub max_delay: Duration,
    /// Delay for hosts with no latency observed yet.
    pub start_delay: Duration,
    /// Active byte size above which the engine stops pulling requests.
    pub backpressure_byte_ceiling: u64,
    /// Status code treated as "rate limited".
    pub rate_limit_status_code: u16,
    /// Whether rate-limit responses run the sliding-window estimator.
    pub rate_limit_handling_enabled: bool,
    /// Emit per-adjustment throttle telemetry.
    pub debug_logging: bool,
    /// Resolved results kept for late dedup lookups.
    pub dedup_cache_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            concurrent_requests: 16,
            concurrent_requests_per_host: 8,
            throttle_enabled: true,
            target_concurrency: 1.0,
            min_delay: Duration::ZERO,
            max_delay: Duration::from_secs(60),
            start_delay: Duration::from_secs(5),
            backpressure_byte_ceiling: DEFAULT_BACKPRESSURE_CEILING,
            rate_limit_status_code: 429,
            rate_limit_handling_enabled: false,
            debug_logging: false,
            dedup_cache_capacity: 1024,
        }
    }
}

impl Settings {
    /// Reject combinations the throttle and stage cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.target_concurrency.is_finite() && self.target_concurrency > 0.0) {
            return Err(ConfigError::invalid(
                "target_concurrency",
                format!("must be a positive number, got {}", self.target_concurrency),
            ));
        }
        if self.min_delay > self.max_delay {
            return Err(ConfigError::invalid(
                "min_delay",
                format!(
                    "{:?} is greater than max_delay {:?}",
                    self.min_delay, self.max_delay
                ),
            ));
        }
        for (field, delay) in [("max_delay", self.max_delay), ("start_delay", self.start_delay)] {
            if delay > MAX_DELAY_LIMIT {
                return Err(ConfigError::invalid(
                    field,
                    format!("{delay:?} exceeds the limit of {MAX_DELAY_LIMIT:?}"),
                ));
            }
        }
        if self.concurrent_requests == 0 {
            return Err(ConfigError::invalid("concurrent_requests", "must be at least 1"));
        }
        if self.concurrent_requests_per_host == 0 {
            return Err(ConfigError::invalid(
                "concurrent_requests_per_host",
                "must be at least 1",
            ));
        }
        if !(100..=599).contains(&self.rate_limit_status_code) {
            return Err(ConfigError::invalid(
                "rate_limit_status_code",
                format!("{} is not an HTTP status", self.rate_limit_status_code),
            ));
        }
        Ok(())
    }
}

/// Configuration file structure. Delays are in (fractional) seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub concurrent_requests: Option<usize>,
    #[serde(default)]
    pub concurrent_requests_per_host: Option<usize>,
    #[serde(default)]
    pub throttle_enabled: Option<bool>,
    #[serde(default)]
    pub target_concurrency: Option<f64>,
    #[serde(default)]
    pub min_delay: Option<f64>,
    #[serde(default)]
    pub max_delay: Option<f64>,
    #[serde(default)]
    pub start_delay: Option<f64>,
    #[serde(default)]
    pub backpressure_byte_ceiling: Option<u64>,
    #[serde(default)]
    pub rate_limit_status_code: Option<u16>,
    #[serde(default)]
    pub rate_limit_handling_enabled: Option<bool>,
    #[serde(default)]
    pub debug_logging: Option<bool>,
    #[serde(default)]
    pub dedup_cache_capacity: Option<usize>,
}

impl Config {
    /// Load configuration using prefer crate.
    /// Automatically discovers crawlflow config files in standard locations.
    pub async fn load() -> Self {
        match prefer::load("crawlflow").await {
            Ok(pref_config) => Config {
                concurrent_requests: pref_config.get("concurrent_requests").ok(),
                concurrent_requests_per_host: pref_config.get("concurrent_requests_per_host").ok(),
                throttle_enabled: pref_config.get("throttle_enabled").ok(),
                target_concurrency: pref_config.get("target_concurrency").ok(),
                min_delay: pref_config.get("min_delay").ok(),
                max_delay: pref_config.get("max_delay").ok(),
                start_delay: pref_config.get("start_delay").ok(),
                backpressure_byte_ceiling: pref_config.get("backpressure_byte_ceiling").ok(),
                rate_limit_status_code: pref_config.get("rate_limit_status_code").ok(),
                rate_limit_handling_enabled: pref_config.get("rate_limit_handling_enabled").ok(),
                debug_logging: pref_config.get("debug_logging").ok(),
                dedup_cache_capacity: pref_config.get("dedup_cache_capacity").ok(),
            },
            // No config file found, use defaults
            Err(_) => Self::default(),
        }
    }

    /// Parse a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    /// Read and parse a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Overlay `CRAWLFLOW_*` environment variables on top of this config.
    /// Values that fail to parse are reported rather than ignored.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(format!("{ENV_PREFIX}{key}")).ok())
    }

    fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(
            field: &'static str,
            raw: Option<String>,
        ) -> Result<Option<T>, ConfigError> {
            match raw {
                None => Ok(None),
                Some(raw) => raw
                    .trim()
                    .parse()
                    .map(Some)
                    .map_err(|_| ConfigError::invalid(field, format!("cannot parse {raw:?}"))),
            }
        }

        macro_rules! overlay {
            ($field:ident, $key:literal) => {
                if let Some(value) = parse(stringify!($field), lookup($key))? {
                    self.$field = Some(value);
                }
            };
        }

        overlay!(concurrent_requests, "CONCURRENT_REQUESTS");
        overlay!(concurrent_requests_per_host, "CONCURRENT_REQUESTS_PER_HOST");
        overlay!(throttle_enabled, "THROTTLE_ENABLED");
        overlay!(target_concurrency, "TARGET_CONCURRENCY");
        overlay!(min_delay, "MIN_DELAY");
        overlay!(max_delay, "MAX_DELAY");
        overlay!(start_delay, "START_DELAY");
        overlay!(backpressure_byte_ceiling, "BACKPRESSURE_BYTE_CEILING");
        overlay!(rate_limit_status_code, "RATE_LIMIT_STATUS_CODE");
        overlay!(rate_limit_handling_enabled, "RATE_LIMIT_HANDLING_ENABLED");
        overlay!(debug_logging, "DEBUG_LOGGING");
        overlay!(dedup_cache_capacity, "DEDUP_CACHE_CAPACITY");
        Ok(self)
    }

    /// Apply configuration to settings.
    pub fn apply_to_settings(&self, settings: &mut Settings) -> Result<(), ConfigError> {
        if let Some(n) = self.concurrent_requests {
            settings.concurrent_requests = n;
        }
        if let Some(n) = self.concurrent_requests_per_host {
            settings.concurrent_requests_per_host = n;
        }
        if let Some(enabled) = self.throttle_enabled {
            settings.throttle_enabled = enabled;
        }
        if let Some(target) = self.target_concurrency {
            settings.target_concurrency = target;
        }
        if let Some(secs) = self.min_delay {
            settings.min_delay = seconds("min_delay", secs)?;
        }
        if let Some(secs) = self.max_delay {
            settings.max_delay = seconds("max_delay", secs)?;
        }
        if let Some(secs) = self.start_delay {
            settings.start_delay = seconds("start_delay", secs)?;
        }
        if let Some(ceiling) = self.backpressure_byte_ceiling {
            settings.backpressure_byte_ceiling = ceiling;
        }
        if let Some(code) = self.rate_limit_status_code {
            settings.rate_limit_status_code = code;
        }
        if let Some(enabled) = self.rate_limit_handling_enabled {
            settings.rate_limit_handling_enabled = enabled;
        }
        if let Some(debug) = self.debug_logging {
            settings.debug_logging = debug;
        }
        if let Some(capacity) = self.dedup_cache_capacity {
            settings.dedup_cache_capacity = capacity;
        }
        Ok(())
    }

    /// Defaults overlaid with this config, validated.
    pub fn into_settings(self) -> Result<Settings, ConfigError> {
        let mut settings = Settings::default();
        self.apply_to_settings(&mut settings)?;
        settings.validate()?;
        Ok(settings)
    }
}

fn seconds(field: &'static str, secs: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs)
        .map_err(|_| ConfigError::invalid(field, format!("{secs} is not a valid number of seconds")))
}

/// Load settings from `.env`, discovered config files and the environment.
pub async fn load_settings() -> Result<Settings, ConfigError> {
    // A missing .env file is the normal case.
    let _ = dotenvy::dotenv();
    Config::load().await.with_env_overrides()?.into_settings()
}
