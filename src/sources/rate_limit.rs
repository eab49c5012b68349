//! Request spacing per upstream database.
//!
//! Clients tag each request with its [`SourceKind`] as a request extension;
//! the middleware reserves the next free slot for that kind before sending.
//! Untagged requests are not delayed.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use http::Extensions;
use reqwest_middleware::{Middleware, Next};
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep_until};
use tracing::trace;

use super::SourceKind;

/// Published courtesy limits per upstream.
fn published_interval(kind: SourceKind) -> Duration {
    match kind {
        SourceKind::OpenTargets => Duration::from_millis(500),
        SourceKind::ClinicalTrials => Duration::from_millis(200),
        SourceKind::Chembl => Duration::from_millis(334),
        SourceKind::ProteinAtlas => Duration::from_millis(500),
    }
}

#[derive(Debug)]
pub(crate) struct RateLimiter {
    intervals: HashMap<SourceKind, Duration>,
    next_slot: Mutex<HashMap<SourceKind, Instant>>,
}

impl RateLimiter {
    pub(crate) fn published() -> Self {
        Self::new(SourceKind::ALL.map(|kind| (kind, published_interval(kind))))
    }

    pub(crate) fn new(intervals: impl IntoIterator<Item = (SourceKind, Duration)>) -> Self {
        Self {
            intervals: intervals.into_iter().collect(),
            next_slot: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn interval(&self, kind: SourceKind) -> Duration {
        self.intervals.get(&kind).copied().unwrap_or_default()
    }

    /// Waits until `kind` may send again. Concurrent callers get consecutive
    /// slots, so a burst of N requests spans N - 1 intervals.
    pub(crate) async fn acquire(&self, kind: SourceKind) {
        let interval = self.interval(kind);
        if interval.is_zero() {
            return;
        }

        let slot = {
            let mut next_slot = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = next_slot.get(&kind).map_or(now, |next| (*next).max(now));
            next_slot.insert(kind, slot + interval);
            slot
        };

        let wait = slot.saturating_duration_since(Instant::now());
        if !wait.is_zero() {
            trace!(
                source = kind.api_name(),
                wait_ms = wait.as_millis() as u64,
                "Throttling request"
            );
            sleep_until(slot).await;
        }
    }
}

static GLOBAL_RATE_LIMITER: OnceLock<Arc<RateLimiter>> = OnceLock::new();

fn global_limiter() -> Arc<RateLimiter> {
    GLOBAL_RATE_LIMITER
        .get_or_init(|| Arc::new(RateLimiter::published()))
        .clone()
}

#[derive(Clone, Debug)]
pub(crate) struct RateLimitMiddleware {
    limiter: Arc<RateLimiter>,
}

impl RateLimitMiddleware {
    pub(crate) fn new() -> Self {
        Self {
            limiter: global_limiter(),
        }
    }
}

#[async_trait::async_trait]
impl Middleware for RateLimitMiddleware {
    async fn handle(
        &self,
        req: reqwest::Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<reqwest::Response> {
        if let Some(kind) = extensions.get::<SourceKind>().copied() {
            self.limiter.acquire(kind).await;
        }
        next.run(req, extensions).await
    }
}
