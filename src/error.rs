//! Error types.
//!
//! Fetch failures are data: they travel through the pipeline as the failure
//! variant of a [`FetchResult`](crate::models::FetchResult) instead of being
//! raised. Configuration and cache errors are ordinary `Result` errors.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Classification of a failed fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Connection,
    Dns,
    Tls,
    Protocol,
    Cancelled,
    /// The downloader task itself died (panic or abort).
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Timeout => "timeout",
            FailureKind::Connection => "connection",
            FailureKind::Dns => "dns",
            FailureKind::Tls => "tls",
            FailureKind::Protocol => "protocol",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// A fetch that produced no response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} failure: {message}")]
pub struct FetchFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Large retained context (payload dumps, traces). Dropped before caching.
    pub detail: Option<String>,
}

impl FetchFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Copy keeping only what is needed to report the failure.
    pub fn stripped(&self) -> Self {
        Self {
            kind: self.kind,
            message: self.message.clone(),
            detail: None,
        }
    }
}

/// Errors from loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

/// Errors surfaced to callers waiting on a deduplicated fetch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DedupError {
    #[error("fetch for {0} was abandoned before it completed")]
    Abandoned(String),
}
