//! Interfaces to the collaborators that sit outside this crate: the request
//! scheduler, the network layer and the downstream consumer.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::warn;

use crate::error::{FailureKind, FetchFailure};
use crate::models::{FetchRequest, FetchResult};

/// Performs the actual network fetch. Timeouts and retries are its concern;
/// whatever it returns, success or failure, is taken as final.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    async fn fetch(&self, request: &FetchRequest) -> FetchResult;
}

/// Consumes a fetched result (spider callbacks, item pipelines).
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    async fn process(&self, result: Arc<FetchResult>, request: &FetchRequest) -> anyhow::Result<()>;
}

/// Hands out requests one at a time. Returning `None` means "nothing right
/// now"; the engine asks again after downstream processing completes.
pub trait Scheduler: Send {
    fn next_request(&mut self) -> Option<FetchRequest>;
}

impl Scheduler for VecDeque<FetchRequest> {
    fn next_request(&mut self) -> Option<FetchRequest> {
        self.pop_front()
    }
}

/// A scheduler shared with processors that enqueue follow-up requests.
impl<S: Scheduler> Scheduler for Arc<Mutex<S>> {
    fn next_request(&mut self) -> Option<FetchRequest> {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next_request()
    }
}

/// Run `fetcher` on its own task so a panic becomes a failure result
/// instead of taking the caller down with it.
pub(crate) async fn fetch_isolated(fetcher: Arc<dyn Fetcher>, request: FetchRequest) -> FetchResult {
    let url = request.url.clone();
    match tokio::spawn(async move { fetcher.fetch(&request).await }).await {
        Ok(result) => result,
        Err(e) => {
            let kind = if e.is_cancelled() {
                FailureKind::Cancelled
            } else {
                FailureKind::Internal
            };
            warn!("Fetch task for {} died: {}", url, e);
            FetchFailure::new(kind, format!("fetch task failed: {e}")).into()
        }
    }
}
