use crate::error::{MarketContextError, Result};
use crate::llm::generator::TextGenerator;
use crate::llm::rate_limiter::RateLimiter;
use crate::llm::types::GenerationRequest;
use crate::utils::estimate_tokens;
use async_trait::async_trait;
use log::{debug, error, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Timeout and retry rules applied to every outbound model call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallPolicy {
    pub timeout: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_backoff: Duration,
    /// Upper bound of the uniform random jitter added to each backoff.
    pub max_jitter: Duration,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_retries: 3,
            base_backoff: Duration::from_secs(1),
            max_jitter: Duration::from_secs(1),
        }
    }
}

impl CallPolicy {
    /// `base * 2^attempt + uniform(0, max_jitter)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponential = self
            .base_backoff
            .saturating_mul(2u32.saturating_pow(attempt));
        let jitter = if self.max_jitter.is_zero() {
            Duration::ZERO
        } else {
            let secs = rand::thread_rng().gen_range(0.0..self.max_jitter.as_secs_f64());
            Duration::from_secs_f64(secs)
        };
        exponential.saturating_add(jitter)
    }
}

/// Wraps a generator with the shared rate limiter, a per-call timeout and
/// jittered exponential backoff on transient failures.
///
/// Non-retryable errors (4xx other than 429) surface immediately.
pub struct GuardedGenerator {
    inner: Arc<dyn TextGenerator>,
    limiter: Arc<RateLimiter>,
    policy: CallPolicy,
}

impl GuardedGenerator {
    pub fn new(inner: Arc<dyn TextGenerator>, limiter: Arc<RateLimiter>, policy: CallPolicy) -> Self {
        Self {
            inner,
            limiter,
            policy,
        }
    }

    pub fn policy(&self) -> &CallPolicy {
        &self.policy
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    async fn attempt(&self, request: &GenerationRequest, estimated: u64) -> Result<String> {
        let permit = self.limiter.acquire(estimated).await?;

        let outcome = match tokio::time::timeout(self.policy.timeout, self.inner.generate(request)).await {
            Ok(result) => result,
            Err(_) => Err(MarketContextError::Timeout(self.policy.timeout.as_secs())),
        };

        match &outcome {
            Ok(text) => permit.record_usage(estimated + estimate_tokens(text)),
            Err(_) => drop(permit),
        }
        outcome
    }
}

#[async_trait]
impl TextGenerator for GuardedGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let estimated = (request.prompt_chars() / 4) as u64;
        let mut attempt: u32 = 0;

        loop {
            match self.attempt(request, estimated).await {
                Ok(text) => {
                    debug!("Model call succeeded on attempt {}", attempt + 1);
                    return Ok(text);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt >= self.policy.max_retries => {
                    error!("Model call failed after {} attempts: {}", attempt + 1, e);
                    return Err(MarketContextError::RetriesExhausted {
                        attempts: attempt + 1,
                        last_error: e.to_string(),
                    });
                }
                Err(e) => {
                    let wait = self.policy.backoff_delay(attempt);
                    warn!(
                        "Model call failed (attempt {}), retrying in {:.2}s: {}",
                        attempt + 1,
                        wait.as_secs_f64(),
                        e
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::rate_limiter::RateLimits;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    enum Step {
        Reply(&'static str),
        Fail(MarketContextError),
        Hang,
    }

    struct Scripted {
        steps: Mutex<VecDeque<Step>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl TextGenerator for Scripted {
        async fn generate(&self, _request: &GenerationRequest) -> Result<String> {
            *self.calls.lock().unwrap() += 1;
            let step = self.steps.lock().unwrap().pop_front();
            match step {
                Some(Step::Reply(text)) => Ok(text.to_string()),
                Some(Step::Fail(e)) => Err(e),
                Some(Step::Hang) => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(String::new())
                }
                None => Err(MarketContextError::Transport("script exhausted".into())),
            }
        }
    }

    fn policy() -> CallPolicy {
        CallPolicy {
            timeout: Duration::from_secs(5),
            max_retries: 2,
            base_backoff: Duration::from_millis(100),
            max_jitter: Duration::ZERO,
        }
    }

    fn guarded(inner: Arc<Scripted>) -> GuardedGenerator {
        GuardedGenerator::new(inner, Arc::new(RateLimiter::new(RateLimits::default())), policy())
    }

    fn request() -> GenerationRequest {
        GenerationRequest::new("system", "user")
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = policy();
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(400));

        let jittered = CallPolicy {
            max_jitter: Duration::from_secs(1),
            ..policy
        };
        let delay = jittered.backoff_delay(0);
        assert!(delay >= Duration::from_millis(100) && delay < Duration::from_millis(1100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_success_is_retried() {
        let inner = Scripted::new(vec![Step::Hang, Step::Reply("{}")]);
        let generator = guarded(inner.clone());

        let text = generator.generate(&request()).await.unwrap();
        assert_eq!(text, "{}");
        assert_eq!(inner.calls(), 2);
        assert_eq!(generator.limiter().available_permits(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_errors_exhaust_retries() {
        let inner = Scripted::new(vec![
            Step::Fail(MarketContextError::ApiStatus { status: 503, body: "busy".into() }),
            Step::Fail(MarketContextError::ApiStatus { status: 429, body: "slow down".into() }),
            Step::Fail(MarketContextError::ApiStatus { status: 500, body: "oops".into() }),
            Step::Reply("never reached"),
        ]);
        let generator = guarded(inner.clone());

        let err = generator.generate(&request()).await.unwrap_err();
        assert!(matches!(err, MarketContextError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(inner.calls(), 3);
        assert_eq!(generator.limiter().available_permits(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_is_not_retried() {
        let inner = Scripted::new(vec![Step::Fail(MarketContextError::ApiStatus {
            status: 401,
            body: "bad key".into(),
        })]);
        let generator = guarded(inner.clone());

        let err = generator.generate(&request()).await.unwrap_err();
        assert!(matches!(err, MarketContextError::ApiStatus { status: 401, .. }));
        assert_eq!(inner.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_call_records_usage() {
        let inner = Scripted::new(vec![Step::Reply("abcdefgh")]);
        let generator = guarded(inner);

        generator
            .generate(&GenerationRequest::new("12345678", "1234"))
            .await
            .unwrap();
        // 12 prompt chars / 4 + 8 reply chars / 4
        assert_eq!(generator.limiter().tokens_in_window(), 5);
    }
}
