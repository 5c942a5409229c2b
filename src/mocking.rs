//! Scripted fetchers, so tests can make the upstream fail on demand

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::fetcher::{EventFetcher, FetchFailure};
use crate::planning::Event;

/// A fetcher that replays a script of outcomes, one per call.
///
/// When the script runs out, the fallback outcome repeats forever. The call
/// counter lets tests assert how often the network was actually touched.
pub struct MockFetcher {
    script: Mutex<VecDeque<Result<Vec<Event>, FetchFailure>>>,
    fallback: Result<Vec<Event>, FetchFailure>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl MockFetcher {
    /// Always succeeds with the given events.
    pub fn ok(events: Vec<Event>) -> Self {
        Self::with_script(Vec::new(), Ok(events))
    }

    /// Always fails the given way.
    pub fn failing(failure: FetchFailure) -> Self {
        Self::with_script(Vec::new(), Err(failure))
    }

    /// Plays `script` front to back, then repeats `fallback`.
    pub fn with_script(
        script: Vec<Result<Vec<Event>, FetchFailure>>,
        fallback: Result<Vec<Event>, FetchFailure>,
    ) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Makes every call take at least `delay`, to exercise timeouts and
    /// concurrency limits.
    pub fn slowed_by(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventFetcher for MockFetcher {
    async fn fetch_events(&self, _url: &Url) -> Result<Vec<Event>, FetchFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| self.fallback.clone())
    }
}
