//! Request and result types that flow through the fetch pipeline.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::FetchFailure;

/// Stable hash of the identity-relevant parts of a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Fingerprint {
    fn from(value: &str) -> Self {
        Fingerprint(value.to_string())
    }
}

/// Computes fingerprints, optionally including some request headers.
#[derive(Debug, Clone, Default)]
pub struct Fingerprinter {
    include_headers: Vec<String>,
}

impl Fingerprinter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat the named headers as part of the request identity.
    pub fn with_headers<I, S>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.include_headers = headers
            .into_iter()
            .map(|h| h.as_ref().to_ascii_lowercase())
            .collect();
        self.include_headers.sort();
        self.include_headers.dedup();
        self
    }

    pub fn fingerprint(&self, request: &FetchRequest) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update(request.method.to_ascii_uppercase().as_bytes());
        hasher.update([0u8]);
        hasher.update(canonicalize_url(&request.url).as_bytes());
        hasher.update([0u8]);

        for name in &self.include_headers {
            let value = request
                .headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str());
            if let Some(value) = value {
                hasher.update(name.as_bytes());
                hasher.update(b":");
                hasher.update(value.as_bytes());
                hasher.update([0u8]);
            }
        }

        hasher.update(&request.body);
        Fingerprint(hex::encode(hasher.finalize()))
    }
}

/// Drop the fragment and sort query pairs so equivalent URLs hash alike.
/// Unparseable input is used verbatim.
pub fn canonicalize_url(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw) else {
        return raw.to_string();
    };
    url.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        pairs.sort();
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }
    url.to_string()
}

/// Annotations carried alongside a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestMeta {
    /// Overrides the slot key (normally the URL host).
    #[serde(default)]
    pub download_slot: Option<String>,
    /// Never let this request's latency adjust the slot delay.
    #[serde(default)]
    pub dont_adjust_delay: bool,
    /// Always hit the network, skipping the dedup cache.
    #[serde(default)]
    pub dont_dedup: bool,
    #[serde(default)]
    pub retry_times: u32,
    #[serde(default)]
    pub redirect_times: u32,
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// A request chosen by the scheduler to be fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Vec<u8>,
    #[serde(default)]
    pub meta: RequestMeta,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            headers: Vec::new(),
            body: Vec::new(),
            meta: RequestMeta::default(),
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_meta(mut self, meta: RequestMeta) -> Self {
        self.meta = meta;
        self
    }

    /// Fingerprint over method, URL and body.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprinter::default().fingerprint(self)
    }

    /// Host part of the URL, lower-cased.
    pub fn host(&self) -> Option<String> {
        Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
    }
}

/// A response received from the network layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResponse {
    pub url: String,
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Vec<u8>,
}

impl FetchResponse {
    pub fn new(url: impl Into<String>, status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            url: url.into(),
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }
}

/// Outcome of one fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchResult {
    Response(FetchResponse),
    Failure(FetchFailure),
}

impl FetchResult {
    /// HTTP status, or `None` for failures.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchResult::Response(r) => Some(r.status),
            FetchResult::Failure(_) => None,
        }
    }

    /// Payload size in bytes. Failures have no payload.
    pub fn byte_size(&self) -> u64 {
        match self {
            FetchResult::Response(r) => r.body.len() as u64,
            FetchResult::Failure(_) => 0,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, FetchResult::Failure(_))
    }

    pub fn failure(&self) -> Option<&FetchFailure> {
        match self {
            FetchResult::Failure(f) => Some(f),
            FetchResult::Response(_) => None,
        }
    }

    /// Form suitable for caching: failures lose their retained context.
    pub fn stripped(self) -> Self {
        match self {
            FetchResult::Failure(f) => FetchResult::Failure(f.stripped()),
            response => response,
        }
    }
}

impl From<FetchResponse> for FetchResult {
    fn from(response: FetchResponse) -> Self {
        FetchResult::Response(response)
    }
}

impl From<FetchFailure> for FetchResult {
    fn from(failure: FetchFailure) -> Self {
        FetchResult::Failure(failure)
    }
}
