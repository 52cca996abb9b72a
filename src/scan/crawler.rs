//! Cancelable consumer of an async item stream

use crate::error::Result;
use futures::{Stream, StreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

struct CrawlState {
    collected: AtomicU64,
    stopped_early: AtomicBool,
    token: CancellationToken,
}

/// Shared view of a crawl, readable while it runs
#[derive(Clone)]
pub struct CrawlHandle {
    state: Arc<CrawlState>,
}

impl CrawlHandle {
    fn new(token: CancellationToken) -> Self {
        Self {
            state: Arc::new(CrawlState {
                collected: AtomicU64::new(0),
                stopped_early: AtomicBool::new(false),
                token,
            }),
        }
    }

    /// Ask the crawl to end at the next item boundary
    pub fn stop(&self) {
        self.state.token.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.state.token.is_cancelled()
    }

    /// Items accepted so far
    pub fn num_collected(&self) -> u64 {
        self.state.collected.load(Ordering::Acquire)
    }

    /// Whether the crawl ended because of `stop()` rather than exhaustion
    pub fn was_stopped(&self) -> bool {
        self.state.stopped_early.load(Ordering::Acquire)
    }

    /// Resolves once the crawl is no longer running
    pub async fn finished(&self) {
        self.state.token.cancelled().await
    }
}

/// Applies an action to every item of an ordered stream until the stream is
/// exhausted or the crawl is stopped, counting the items the action accepts.
pub struct Crawler<S, F> {
    source: S,
    action: F,
    handle: CrawlHandle,
}

impl<S, F, T, Fut> Crawler<S, F>
where
    S: Stream<Item = Result<T>> + Unpin,
    F: FnMut(T) -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    pub fn new(source: S, action: F) -> Self {
        Self::with_token(source, action, CancellationToken::new())
    }

    /// Use an existing token, so the crawl can be stopped by whoever owns it
    pub fn with_token(source: S, action: F, token: CancellationToken) -> Self {
        Self {
            source,
            action,
            handle: CrawlHandle::new(token),
        }
    }

    pub fn handle(&self) -> CrawlHandle {
        self.handle.clone()
    }

    /// Consume the source. Returns the number of accepted items. Errors from
    /// the source or the action end the crawl and are returned as-is.
    pub async fn crawl(mut self) -> Result<u64> {
        let result = self.run().await;
        // Not running anymore, however we got here
        self.handle.state.token.cancel();
        result
    }

    async fn run(&mut self) -> Result<u64> {
        let state = self.handle.state.clone();

        loop {
            let next = tokio::select! {
                biased;
                _ = state.token.cancelled() => None,
                item = self.source.next() => item,
            };

            let Some(item) = next else {
                if state.token.is_cancelled() {
                    state.stopped_early.store(true, Ordering::Release);
                }
                break;
            };
            if state.token.is_cancelled() {
                state.stopped_early.store(true, Ordering::Release);
                break;
            }

            if (self.action)(item?).await? {
                state.collected.fetch_add(1, Ordering::AcqRel);
            }
        }

        Ok(state.collected.load(Ordering::Acquire))
    }
}
