//! Sliding-window circuit breaker
//!
//! Guards repeated connection or order-placement failures. Failures are
//! timestamped; once the number inside the window reaches the threshold the
//! breaker opens and refuses every attempt until its cooldown elapses.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - attempts allowed
    Closed,
    /// Failure threshold reached - attempts blocked
    Open,
    /// Cooldown elapsed - one probe attempt decides
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures inside the window that open the breaker
    pub failure_threshold: u32,
    /// Sliding window length
    pub window: Duration,
    /// How long the breaker stays open
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(300),
            cooldown: Duration::from_secs(120),
        }
    }
}

impl From<&crate::config::ConnectionConfig> for CircuitBreakerConfig {
    fn from(config: &crate::config::ConnectionConfig) -> Self {
        Self {
            failure_threshold: config.breaker_failure_threshold.max(1),
            window: Duration::from_secs(config.breaker_window_secs),
            cooldown: Duration::from_secs(config.breaker_cooldown_secs),
        }
    }
}

/// Snapshot of breaker counters for status output
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub failures_in_window: usize,
    pub total_trips: u64,
    pub cooldown_remaining: Option<Duration>,
}

/// Failure-rate guard
#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    config: CircuitBreakerConfig,
    failures: VecDeque<Instant>,
    cooldown_until: Option<Instant>,
    half_open: bool,
    total_trips: u64,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            config,
            failures: VecDeque::new(),
            cooldown_until: None,
            half_open: false,
            total_trips: 0,
        }
    }

    /// Get current state
    pub fn state(&self) -> CircuitState {
        match self.cooldown_until {
            Some(until) if Instant::now() < until => CircuitState::Open,
            Some(_) => CircuitState::HalfOpen,
            None if self.half_open => CircuitState::HalfOpen,
            None => CircuitState::Closed,
        }
    }

    /// Check if an attempt is allowed right now
    pub fn should_allow(&mut self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if self.cooldown_until.take().is_some() {
                    info!("[{}] circuit cooldown elapsed, allowing probe attempt", self.name);
                    self.failures.clear();
                    self.half_open = true;
                }
                true
            }
        }
    }

    /// Instant at which an open breaker will admit a probe
    pub fn open_until(&self) -> Option<Instant> {
        self.cooldown_until.filter(|until| Instant::now() < *until)
    }

    pub fn cooldown_remaining(&self) -> Option<Duration> {
        self.open_until()
            .map(|until| until.saturating_duration_since(Instant::now()))
    }

    /// Record a successful attempt
    pub fn record_success(&mut self) {
        if self.half_open {
            info!("[{}] probe succeeded, circuit closed", self.name);
        }
        self.half_open = false;
        self.failures.clear();
    }

    /// Record a failed attempt. Returns true if this failure opened the breaker.
    pub fn record_failure(&mut self, reason: &str) -> bool {
        let now = Instant::now();

        if self.half_open {
            warn!("[{}] probe failed ({}), reopening circuit", self.name, reason);
            self.half_open = false;
            self.trip(now);
            return true;
        }

        self.failures.push_back(now);
        self.prune(now);

        let count = self.failures.len();
        debug!(
            "[{}] failure recorded ({}/{} in window): {}",
            self.name, count, self.config.failure_threshold, reason
        );

        if self.cooldown_until.is_none() && count >= self.config.failure_threshold as usize {
            warn!(
                "[{}] circuit opened after {} failures within {:?}: {}",
                self.name, count, self.config.window, reason
            );
            self.trip(now);
            return true;
        }
        false
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            state: self.state(),
            failures_in_window: self.failures.len(),
            total_trips: self.total_trips,
            cooldown_remaining: self.cooldown_remaining(),
        }
    }

    fn trip(&mut self, now: Instant) {
        self.cooldown_until = Some(now + self.config.cooldown);
        self.total_trips += 1;
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.failures.front() {
            if now.saturating_duration_since(*oldest) > self.config.window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                window: Duration::from_secs(60),
                cooldown: Duration::from_secs(30),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_at_threshold() {
        let mut cb = breaker(3);
        assert!(!cb.record_failure("e1"));
        assert!(!cb.record_failure("e2"));
        assert_eq!(cb.state(), CircuitState::Closed);

        assert!(cb.record_failure("e3"));
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.should_allow());
        assert!(!cb.should_allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_failures_leave_window() {
        let mut cb = breaker(3);
        cb.record_failure("e1");
        cb.record_failure("e2");

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!cb.record_failure("e3"));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().failures_in_window, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_then_probe() {
        let mut cb = breaker(2);
        cb.record_failure("e1");
        cb.record_failure("e2");
        assert!(cb.cooldown_remaining().is_some());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.should_allow());

        // Failed probe reopens immediately
        assert!(cb.record_failure("probe"));
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(cb.should_allow());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().total_trips, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_clears_window() {
        let mut cb = breaker(3);
        cb.record_failure("e1");
        cb.record_failure("e2");
        cb.record_success();
        cb.record_failure("e3");
        cb.record_failure("e4");
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
