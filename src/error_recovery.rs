use std::time::{Duration, Instant};

use log::{info, warn};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_RECOVERY_ATTEMPTS: u32 = 3;
pub const DEFAULT_BREAKER_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitBreakerState {
    Closed,   // Normal operation
    Open,     // Failing, calls diverted
    HalfOpen, // Probing with a single call
}

/// Consecutive-failure circuit breaker guarding a best-effort delivery path.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: String,
    failure_count: u32,
    success_count: u64,
    last_failure: Option<Instant>,
    state: CircuitBreakerState,
    failure_threshold: u32,
    recovery_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_count: 0,
            success_count: 0,
            last_failure: None,
            state: CircuitBreakerState::Closed,
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
        }
    }

    pub fn state(&self) -> CircuitBreakerState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Whether the protected call should be attempted now. An open breaker lets one
    /// trial call through once the recovery timeout has passed.
    pub fn allow_request(&mut self) -> bool {
        match self.state {
            CircuitBreakerState::Closed | CircuitBreakerState::HalfOpen => true,
            CircuitBreakerState::Open => {
                let cooled = self
                    .last_failure
                    .is_none_or(|at| at.elapsed() >= self.recovery_timeout);
                if cooled {
                    self.state = CircuitBreakerState::HalfOpen;
                    info!("Circuit breaker half-open for: {}", self.name);
                }
                cooled
            }
        }
    }

    pub fn record_success(&mut self) {
        self.success_count += 1;
        self.failure_count = 0;
        if self.state != CircuitBreakerState::Closed {
            self.state = CircuitBreakerState::Closed;
            info!("Circuit breaker closed for: {}", self.name);
        }
    }

    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure = Some(Instant::now());

        let trip = self.state == CircuitBreakerState::HalfOpen || self.failure_count >= self.failure_threshold;
        if trip && self.state != CircuitBreakerState::Open {
            self.state = CircuitBreakerState::Open;
            warn!(
                "Circuit breaker opened for: {} (failures: {})",
                self.name, self.failure_count
            );
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// Try to re-initialise after the delay
    Attempt { attempt: u32, delay: Duration },
    /// Budget spent; stay in ERROR until an operator resets
    Exhausted,
}

/// Bounds how many times the audio pipeline tries to leave ERROR on its own.
#[derive(Debug, Clone)]
pub struct RecoveryTracker {
    max_attempts: u32,
    base_delay: Duration,
    attempts: u32,
    exhausted: bool,
}

impl Default for RecoveryTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECOVERY_ATTEMPTS, Duration::from_millis(500))
    }
}

impl RecoveryTracker {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            attempts: 0,
            exhausted: false,
        }
    }

    /// Reserve the next attempt; delay doubles per attempt.
    pub fn next_attempt(&mut self) -> RecoveryDecision {
        if self.attempts >= self.max_attempts {
            if !self.exhausted {
                warn!(
                    "Recovery gave up after {} attempts; operator intervention required",
                    self.attempts
                );
                self.exhausted = true;
            }
            return RecoveryDecision::Exhausted;
        }
        let delay = self.base_delay * 2u32.saturating_pow(self.attempts);
        self.attempts += 1;
        RecoveryDecision::Attempt {
            attempt: self.attempts,
            delay,
        }
    }

    pub fn record_success(&mut self) {
        if self.attempts > 0 {
            info!("Recovered after {} attempt(s)", self.attempts);
        }
        self.attempts = 0;
        self.exhausted = false;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Operator cleared the fault; allow a fresh budget.
    pub fn reset_after_intervention(&mut self) {
        info!("Recovery budget reset by operator");
        self.attempts = 0;
        self.exhausted = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_opens_after_threshold() {
        let mut breaker = CircuitBreaker::new("remote-alerts", 3, Duration::from_secs(60));
        assert!(breaker.allow_request());
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitBreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitBreakerState::Open);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn test_breaker_half_open_trial() {
        let mut breaker = CircuitBreaker::new("remote-alerts", 1, Duration::ZERO);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitBreakerState::Open);
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), CircuitBreakerState::HalfOpen);

        // failed trial call re-opens immediately
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitBreakerState::Open);

        assert!(breaker.allow_request());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitBreakerState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn test_recovery_tracker_is_bounded() {
        let mut tracker = RecoveryTracker::new(3, Duration::from_millis(100));
        assert_eq!(
            tracker.next_attempt(),
            RecoveryDecision::Attempt {
                attempt: 1,
                delay: Duration::from_millis(100)
            }
        );
        assert_eq!(
            tracker.next_attempt(),
            RecoveryDecision::Attempt {
                attempt: 2,
                delay: Duration::from_millis(200)
            }
        );
        assert!(matches!(tracker.next_attempt(), RecoveryDecision::Attempt { attempt: 3, .. }));
        assert_eq!(tracker.next_attempt(), RecoveryDecision::Exhausted);
        assert!(tracker.is_exhausted());

        tracker.reset_after_intervention();
        assert!(matches!(tracker.next_attempt(), RecoveryDecision::Attempt { attempt: 1, .. }));
        tracker.record_success();
        assert_eq!(tracker.attempts(), 0);
    }
}
