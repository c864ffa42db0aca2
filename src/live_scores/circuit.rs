//! Per-endpoint-class circuit breaker.
//!
//! ```text
//!   Closed ──N consecutive terminal failures──▶ Open(until)
//!     ▲                                           │ cooldown elapsed
//!     │ trial succeeds                            ▼
//!     └──────────────────────────────────── HalfOpen (one trial)
//!                                                 │ trial fails
//!                                                 ▼
//!                                       Open(cooldown × 2, capped)
//! ```

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use super::provider::EndpointClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerPolicy {
    /// Consecutive terminal failures that open the circuit.
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub max_cooldown: Duration,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        BreakerPolicy {
            failure_threshold: 5,
            cooldown: Duration::seconds(60),
            max_cooldown: Duration::seconds(960),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open { until: DateTime<Utc> },
    /// `trial_in_flight` is set while the single trial request is running.
    HalfOpen { trial_in_flight: bool },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    endpoint: EndpointClass,
    policy: BreakerPolicy,
    state: CircuitState,
    consecutive_failures: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(endpoint: EndpointClass, policy: BreakerPolicy) -> Self {
        CircuitBreaker {
            endpoint,
            policy,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            cooldown: policy.cooldown,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Whether a request may go out now. Admitting the half-open trial
    /// blocks every other caller until that trial settles.
    pub fn try_acquire(&mut self, now: DateTime<Utc>) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open { until } if now >= until => {
                info!(endpoint = self.endpoint.as_str(), "Circuit half-open, admitting one trial request");
                self.state = CircuitState::HalfOpen {
                    trial_in_flight: true,
                };
                true
            }
            CircuitState::Open { .. } => false,
            CircuitState::HalfOpen {
                trial_in_flight: true,
            } => false,
            CircuitState::HalfOpen {
                trial_in_flight: false,
            } => {
                self.state = CircuitState::HalfOpen {
                    trial_in_flight: true,
                };
                true
            }
        }
    }

    pub fn record_success(&mut self) {
        if self.state != CircuitState::Closed {
            info!(endpoint = self.endpoint.as_str(), "Circuit closed");
        }
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.cooldown = self.policy.cooldown;
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        match self.state {
            CircuitState::HalfOpen { .. } => {
                self.cooldown = (self.cooldown * 2).min(self.policy.max_cooldown);
                self.open(now);
            }
            CircuitState::Closed if self.consecutive_failures >= self.policy.failure_threshold => {
                self.open(now);
            }
            // Straggler admitted before the circuit opened.
            CircuitState::Closed | CircuitState::Open { .. } => {}
        }
    }

    /// An admitted request ended without telling us anything about the
    /// upstream (quota, shutdown). Frees the half-open trial slot.
    pub fn release(&mut self) {
        if let CircuitState::HalfOpen { .. } = self.state {
            self.state = CircuitState::HalfOpen {
                trial_in_flight: false,
            };
        }
    }

    fn open(&mut self, now: DateTime<Utc>) {
        let until = now + self.cooldown;
        warn!(
            endpoint = self.endpoint.as_str(),
            failures = self.consecutive_failures,
            cooldown_secs = self.cooldown.num_seconds(),
            "Circuit opened"
        );
        self.state = CircuitState::Open { until };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 4, 14, 0, 0).unwrap()
    }

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(EndpointClass::LiveMatch, BreakerPolicy::default())
    }

    #[test]
    fn test_opens_after_threshold() {
        let mut cb = breaker();
        for _ in 0..4 {
            assert!(cb.try_acquire(t0()));
            cb.record_failure(t0());
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire(t0()));
        cb.record_failure(t0());
        assert_eq!(
            cb.state(),
            CircuitState::Open {
                until: t0() + Duration::seconds(60)
            }
        );
        assert!(!cb.try_acquire(t0() + Duration::seconds(59)));
    }

    #[test]
    fn test_success_resets_counter() {
        let mut cb = breaker();
        for _ in 0..4 {
            cb.record_failure(t0());
        }
        cb.record_success();
        assert_eq!(cb.consecutive_failures(), 0);
        cb.record_failure(t0());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_admits_exactly_one_trial() {
        let mut cb = breaker();
        for _ in 0..5 {
            cb.record_failure(t0());
        }
        let later = t0() + Duration::seconds(60);
        assert!(cb.try_acquire(later));
        assert!(!cb.try_acquire(later));
        assert!(!cb.try_acquire(later + Duration::seconds(1)));

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire(later));
    }

    #[test]
    fn test_failed_trial_doubles_cooldown_up_to_cap() {
        let policy = BreakerPolicy {
            failure_threshold: 1,
            cooldown: Duration::seconds(60),
            max_cooldown: Duration::seconds(150),
        };
        let mut cb = CircuitBreaker::new(EndpointClass::Fixtures, policy);
        cb.record_failure(t0());

        let t1 = t0() + Duration::seconds(60);
        assert!(cb.try_acquire(t1));
        cb.record_failure(t1);
        assert_eq!(cb.state(), CircuitState::Open { until: t1 + Duration::seconds(120) });

        let t2 = t1 + Duration::seconds(120);
        assert!(cb.try_acquire(t2));
        cb.record_failure(t2);
        assert_eq!(cb.state(), CircuitState::Open { until: t2 + Duration::seconds(150) });

        let t3 = t2 + Duration::seconds(150);
        assert!(cb.try_acquire(t3));
        cb.record_success();
        cb.record_failure(t3);
        assert_eq!(cb.state(), CircuitState::Open { until: t3 + Duration::seconds(60) });
    }

    #[test]
    fn test_release_frees_trial_slot() {
        let mut cb = breaker();
        for _ in 0..5 {
            cb.record_failure(t0());
        }
        let later = t0() + Duration::seconds(61);
        assert!(cb.try_acquire(later));
        cb.release();
        assert!(cb.try_acquire(later));
        assert!(!cb.try_acquire(later));
    }
}
