use crate::error::{MarketContextError, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimits {
    pub requests_per_window: usize,
    /// Estimated tokens (characters / 4) allowed per window.
    pub tokens_per_window: u64,
    pub max_concurrent: usize,
    pub window: Duration,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            requests_per_window: 50,
            tokens_per_window: 40_000,
            max_concurrent: 5,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default)]
struct WindowState {
    requests: VecDeque<Instant>,
    tokens: VecDeque<(Instant, u64)>,
}

impl WindowState {
    fn prune(&mut self, now: Instant, window: Duration) {
        while self
            .requests
            .front()
            .is_some_and(|&t| now.duration_since(t) >= window)
        {
            self.requests.pop_front();
        }
        while self
            .tokens
            .front()
            .is_some_and(|&(t, _)| now.duration_since(t) >= window)
        {
            self.tokens.pop_front();
        }
    }

    fn tokens_in_window(&self) -> u64 {
        self.tokens.iter().map(|(_, n)| n).sum()
    }
}

/// Process-wide gate for outbound model calls: a concurrency semaphore plus
/// sliding windows over request count and token usage.
///
/// Share one instance through an `Arc`.
#[derive(Debug)]
pub struct RateLimiter {
    limits: RateLimits,
    permits: Arc<Semaphore>,
    state: Mutex<WindowState>,
}

/// Held for the duration of one call. Dropping it frees the concurrency slot.
#[derive(Debug)]
pub struct RatePermit<'a> {
    limiter: &'a RateLimiter,
    _permit: OwnedSemaphorePermit,
}

impl RatePermit<'_> {
    /// Records the tokens the call actually consumed and releases the slot.
    pub fn record_usage(self, tokens: u64) {
        self.limiter.record_usage(tokens);
    }
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        let permits = Arc::new(Semaphore::new(limits.max_concurrent.max(1)));
        Self {
            limits,
            permits,
            state: Mutex::new(WindowState::default()),
        }
    }

    pub fn limits(&self) -> &RateLimits {
        &self.limits
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Waits for a concurrency slot, then for room in both windows.
    ///
    /// A request whose estimate alone exceeds the token budget is admitted
    /// once the token window is empty rather than waiting forever.
    pub async fn acquire(&self, estimated_tokens: u64) -> Result<RatePermit<'_>> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| MarketContextError::RateLimiterClosed)?;

        loop {
            let wait = {
                let mut state = self
                    .state
                    .lock()
                    .map_err(|_| MarketContextError::RateLimiterClosed)?;
                let now = Instant::now();
                state.prune(now, self.limits.window);

                let request_wait = if state.requests.len() < self.limits.requests_per_window.max(1) {
                    None
                } else {
                    state
                        .requests
                        .front()
                        .map(|&oldest| self.limits.window.saturating_sub(now.duration_since(oldest)))
                };

                let used = state.tokens_in_window();
                let token_wait = if state.tokens.is_empty()
                    || used + estimated_tokens <= self.limits.tokens_per_window
                {
                    None
                } else {
                    state
                        .tokens
                        .front()
                        .map(|&(oldest, _)| self.limits.window.saturating_sub(now.duration_since(oldest)))
                };

                match (request_wait, token_wait) {
                    (None, None) => {
                        state.requests.push_back(now);
                        debug!(
                            "Rate limiter admitted call ({} requests, {} tokens in window)",
                            state.requests.len(),
                            used
                        );
                        return Ok(RatePermit {
                            limiter: self,
                            _permit: permit,
                        });
                    }
                    (r, t) => r.max(t).unwrap_or_default(),
                }
            };

            warn!("Rate limit reached, waiting {:.2}s", wait.as_secs_f64());
            if wait.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(wait).await;
            }
        }
    }

    pub fn record_usage(&self, tokens: u64) {
        if tokens == 0 {
            return;
        }
        if let Ok(mut state) = self.state.lock() {
            state.tokens.push_back((Instant::now(), tokens));
        }
    }

    pub fn tokens_in_window(&self) -> u64 {
        match self.state.lock() {
            Ok(mut state) => {
                state.prune(Instant::now(), self.limits.window);
                state.tokens_in_window()
            }
            Err(_) => 0,
        }
    }
}
