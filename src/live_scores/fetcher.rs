//! Resilient access to the upstream provider.
//!
//! Every logical request goes through three gates before touching the
//! network: the endpoint's circuit breaker, the daily quota (checked per
//! attempt) and the retry loop. Shared state sits behind one mutex that is
//! never held across a network call or a backoff wait.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::circuit::{BreakerPolicy, CircuitBreaker};
use super::provider::{EndpointClass, FetchRequest, MatchDataProvider};
use super::quota::DailyQuota;
use crate::error::{FetchError, ProviderError};

/// Source of "now" for quota and breaker bookkeeping.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Relative jitter, e.g. 0.2 for ±20 %.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (1-based), before jitter.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        if self.jitter <= 0.0 {
            return base;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        base.mul_f64(factor.max(0.0))
    }
}

struct FetcherState {
    quota: DailyQuota,
    breakers: HashMap<EndpointClass, CircuitBreaker>,
}

pub struct ResilientFetcher {
    provider: Arc<dyn MatchDataProvider>,
    retry: RetryPolicy,
    breaker_policy: BreakerPolicy,
    state: Mutex<FetcherState>,
    clock: Clock,
    cancel: CancellationToken,
}

impl ResilientFetcher {
    pub fn new(
        provider: Arc<dyn MatchDataProvider>,
        retry: RetryPolicy,
        breaker_policy: BreakerPolicy,
        daily_quota: u32,
        cancel: CancellationToken,
    ) -> Self {
        Self::with_clock(
            provider,
            retry,
            breaker_policy,
            daily_quota,
            cancel,
            Arc::new(Utc::now),
        )
    }

    pub fn with_clock(
        provider: Arc<dyn MatchDataProvider>,
        retry: RetryPolicy,
        breaker_policy: BreakerPolicy,
        daily_quota: u32,
        cancel: CancellationToken,
        clock: Clock,
    ) -> Self {
        let state = FetcherState {
            quota: DailyQuota::new(daily_quota, clock()),
            breakers: HashMap::new(),
        };
        ResilientFetcher {
            provider,
            retry,
            breaker_policy,
            state: Mutex::new(state),
            clock,
            cancel,
        }
    }

    /// Run one logical request to a final outcome.
    pub async fn fetch(&self, request: &FetchRequest) -> Result<Value, FetchError> {
        let class = request.endpoint_class();
        if !self.admit(class) {
            debug!(endpoint = class.as_str(), "Circuit open, failing fast");
            return Err(FetchError::CircuitOpen(class.as_str()));
        }

        let outcome = self.fetch_with_retries(request, class).await;
        self.settle(class, &outcome);
        outcome
    }

    /// Requests made today.
    pub fn quota_used(&self) -> u32 {
        self.state.lock().quota.used()
    }

    fn admit(&self, class: EndpointClass) -> bool {
        let now = (self.clock)();
        let policy = self.breaker_policy;
        let mut state = self.state.lock();
        state
            .breakers
            .entry(class)
            .or_insert_with(|| CircuitBreaker::new(class, policy))
            .try_acquire(now)
    }

    fn consume_quota(&self) -> bool {
        let now = (self.clock)();
        self.state.lock().quota.try_consume(now)
    }

    fn settle(&self, class: EndpointClass, outcome: &Result<Value, FetchError>) {
        let now = (self.clock)();
        let mut state = self.state.lock();
        let Some(breaker) = state.breakers.get_mut(&class) else {
            return;
        };
        match outcome {
            Ok(_) => breaker.record_success(),
            Err(FetchError::TransientNetwork(_))
            | Err(FetchError::ClientError { .. })
            | Err(FetchError::RateLimited) => breaker.record_failure(now),
            Err(_) => breaker.release(),
        }
    }

    async fn fetch_with_retries(
        &self,
        request: &FetchRequest,
        class: EndpointClass,
    ) -> Result<Value, FetchError> {
        let mut retries = 0u32;
        loop {
            if !self.consume_quota() {
                return Err(FetchError::QuotaExceeded);
            }

            let err = match self.provider.execute(request).await {
                Ok(raw) => return Ok(raw),
                Err(e) => e,
            };

            let (failure, wait_hint) = match err {
                ProviderError::Malformed(msg) => {
                    error!(endpoint = class.as_str(), "Malformed provider response: {}", msg);
                    return Err(FetchError::SchemaViolation(msg));
                }
                ProviderError::Status {
                    status: 429,
                    retry_after,
                    ..
                } => (FetchError::RateLimited, retry_after),
                ProviderError::Status {
                    status, message, ..
                } if (400..500).contains(&status) => {
                    warn!(endpoint = class.as_str(), status, "Provider rejected request: {}", message);
                    return Err(FetchError::ClientError { status, message });
                }
                ProviderError::Status { status, .. } => (
                    FetchError::TransientNetwork(format!("HTTP {}", status)),
                    None,
                ),
                ProviderError::Network(msg) => (FetchError::TransientNetwork(msg), None),
            };

            if retries >= self.retry.max_retries {
                warn!(
                    provider = self.provider.name(),
                    endpoint = class.as_str(),
                    attempts = retries + 1,
                    quota_used = self.quota_used(),
                    "Retry budget exhausted: {}",
                    failure
                );
                return Err(failure);
            }
            retries += 1;

            let delay = wait_hint.unwrap_or_else(|| self.retry.delay_for_retry(retries));
            warn!(
                endpoint = class.as_str(),
                retry = retries,
                max_retries = self.retry.max_retries,
                delay_ms = delay.as_millis() as u64,
                "Provider request failed ({}), retrying",
                failure
            );

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::live_scores::circuit::CircuitState;
    use approx::assert_relative_eq;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Provider that replays scripted attempt outcomes, then repeats the
    /// fallback forever.
    pub(crate) struct ScriptedProvider {
        script: Mutex<VecDeque<Result<Value, ProviderError>>>,
        fallback: Result<Value, ProviderError>,
        pub calls: AtomicUsize,
    }

    impl ScriptedProvider {
        pub(crate) fn new(
            script: Vec<Result<Value, ProviderError>>,
            fallback: Result<Value, ProviderError>,
        ) -> Self {
            ScriptedProvider {
                script: Mutex::new(script.into()),
                fallback,
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MatchDataProvider for ScriptedProvider {
        async fn execute(&self, _request: &FetchRequest) -> Result<Value, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().pop_front();
            next.unwrap_or_else(|| self.fallback.clone())
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    pub(crate) fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            backoff_factor: 2.0,
            jitter: 0.2,
        }
    }

    fn status(code: u16) -> ProviderError {
        ProviderError::Status {
            status: code,
            retry_after: None,
            message: String::new(),
        }
    }

    fn live_request() -> FetchRequest {
        FetchRequest::LiveMatch {
            match_id: "101".into(),
        }
    }

    fn fetcher(provider: Arc<ScriptedProvider>, quota: u32) -> ResilientFetcher {
        ResilientFetcher::new(
            provider,
            fast_retry(),
            BreakerPolicy::default(),
            quota,
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::default()
        };
        assert_relative_eq!(policy.base_delay(1).as_secs_f64(), 1.0);
        assert_relative_eq!(policy.base_delay(2).as_secs_f64(), 2.0);
        assert_relative_eq!(policy.base_delay(4).as_secs_f64(), 8.0);
        assert_relative_eq!(policy.base_delay(10).as_secs_f64(), 60.0);
        assert_eq!(policy.delay_for_retry(3), Duration::from_secs(4));
    }

    #[test]
    fn test_jitter_stays_within_twenty_percent() {
        let policy = RetryPolicy::default();
        for _ in 0..200 {
            let d = policy.delay_for_retry(3).as_secs_f64();
            assert!((3.2..=4.8).contains(&d), "delay {} out of bounds", d);
        }
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let provider = Arc::new(ScriptedProvider::new(
            vec![
                Err(ProviderError::Network("reset".into())),
                Err(status(503)),
            ],
            Ok(serde_json::json!({ "response": [] })),
        ));
        let f = fetcher(provider.clone(), 100);
        assert!(f.fetch(&live_request()).await.is_ok());
        assert_eq!(provider.calls(), 3);
        assert_eq!(f.quota_used(), 3);
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let provider = Arc::new(ScriptedProvider::new(vec![], Err(status(500))));
        let f = fetcher(provider.clone(), 100);
        let err = f.fetch(&live_request()).await.unwrap_err();
        assert!(matches!(err, FetchError::TransientNetwork(_)));
        assert_eq!(provider.calls(), 6);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let provider = Arc::new(ScriptedProvider::new(vec![], Err(status(404))));
        let f = fetcher(provider.clone(), 100);
        let err = f.fetch(&live_request()).await.unwrap_err();
        assert!(matches!(err, FetchError::ClientError { status: 404, .. }));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_honors_retry_after() {
        let provider = Arc::new(ScriptedProvider::new(
            vec![Err(ProviderError::Status {
                status: 429,
                retry_after: Some(Duration::from_millis(5)),
                message: String::new(),
            })],
            Ok(serde_json::json!({ "response": [] })),
        ));
        let f = fetcher(provider.clone(), 100);
        let started = tokio::time::Instant::now();
        assert!(f.fetch(&live_request()).await.is_ok());
        assert!(started.elapsed() >= Duration::from_millis(5));
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_rate_limit_exhausts_into_rate_limited() {
        let provider = Arc::new(ScriptedProvider::new(vec![], Err(status(429))));
        let f = fetcher(provider.clone(), 100);
        assert_eq!(f.fetch(&live_request()).await, Err(FetchError::RateLimited));
        assert_eq!(provider.calls(), 6);
    }

    #[tokio::test]
    async fn test_malformed_response_is_schema_violation() {
        let provider = Arc::new(ScriptedProvider::new(
            vec![],
            Err(ProviderError::Malformed("expected value".into())),
        ));
        let f = fetcher(provider.clone(), 100);
        let err = f.fetch(&live_request()).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_circuit_opens_after_consecutive_terminal_failures() {
        let provider = Arc::new(ScriptedProvider::new(vec![], Err(status(404))));
        let f = fetcher(provider.clone(), 100);
        for _ in 0..5 {
            assert!(matches!(
                f.fetch(&live_request()).await,
                Err(FetchError::ClientError { .. })
            ));
        }
        assert_eq!(
            f.fetch(&live_request()).await,
            Err(FetchError::CircuitOpen("live_match"))
        );
        assert_eq!(provider.calls(), 5);

        // Other endpoint classes are unaffected.
        let events = FetchRequest::MatchEvents {
            match_id: "101".into(),
        };
        assert!(matches!(
            f.fetch(&events).await,
            Err(FetchError::ClientError { .. })
        ));
        assert_eq!(provider.calls(), 6);
    }

    #[tokio::test]
    async fn test_half_open_trial_after_cooldown() {
        let now = Arc::new(Mutex::new(Utc.with_ymd_and_hms(2024, 5, 4, 14, 0, 0).unwrap()));
        let clock_now = now.clone();
        let provider = Arc::new(ScriptedProvider::new(
            vec![Err(status(404)), Err(status(404))],
            Ok(serde_json::json!({ "response": [] })),
        ));
        let policy = BreakerPolicy {
            failure_threshold: 2,
            ..BreakerPolicy::default()
        };
        let f = ResilientFetcher::with_clock(
            provider.clone(),
            fast_retry(),
            policy,
            100,
            CancellationToken::new(),
            Arc::new(move || *clock_now.lock()),
        );

        let _ = f.fetch(&live_request()).await;
        let _ = f.fetch(&live_request()).await;
        assert_eq!(
            f.fetch(&live_request()).await,
            Err(FetchError::CircuitOpen("live_match"))
        );
        assert_eq!(provider.calls(), 2);

        *now.lock() += chrono::Duration::seconds(60);
        assert!(f.fetch(&live_request()).await.is_ok());
        assert_eq!(provider.calls(), 3);
        let state = f.state.lock().breakers[&EndpointClass::LiveMatch].state();
        assert_eq!(state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_quota_fails_fast_until_midnight() {
        let now = Arc::new(Mutex::new(Utc.with_ymd_and_hms(2024, 5, 4, 22, 0, 0).unwrap()));
        let clock_now = now.clone();
        let provider = Arc::new(ScriptedProvider::new(
            vec![],
            Ok(serde_json::json!({ "response": [] })),
        ));
        let f = ResilientFetcher::with_clock(
            provider.clone(),
            fast_retry(),
            BreakerPolicy::default(),
            2,
            CancellationToken::new(),
            Arc::new(move || *clock_now.lock()),
        );

        assert!(f.fetch(&live_request()).await.is_ok());
        assert!(f.fetch(&live_request()).await.is_ok());
        for _ in 0..3 {
            assert_eq!(
                f.fetch(&live_request()).await,
                Err(FetchError::QuotaExceeded)
            );
        }
        assert_eq!(provider.calls(), 2);

        *now.lock() = Utc.with_ymd_and_hms(2024, 5, 5, 0, 0, 1).unwrap();
        assert!(f.fetch(&live_request()).await.is_ok());
        assert_eq!(provider.calls(), 3);
        assert_eq!(f.quota_used(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_backoff() {
        let provider = Arc::new(ScriptedProvider::new(vec![], Err(status(503))));
        let cancel = CancellationToken::new();
        let f = ResilientFetcher::new(
            provider.clone(),
            RetryPolicy {
                initial_delay: Duration::from_secs(3600),
                max_delay: Duration::from_secs(3600),
                ..RetryPolicy::default()
            },
            BreakerPolicy::default(),
            100,
            cancel.clone(),
        );
        cancel.cancel();
        assert_eq!(f.fetch(&live_request()).await, Err(FetchError::Cancelled));
        assert_eq!(provider.calls(), 1);
    }
}
