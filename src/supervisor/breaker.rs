//! Per-analyzer circuit breaker.
//!
//! Each analyzer (and each security module) gets an independent breaker.
//! The open duration backs off exponentially per open cycle so a
//! persistently failing analyzer is probed less and less often.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation; calls pass through
    Closed,
    /// Failing; calls are rejected until the open duration elapses
    Open,
    /// Probing recovery with a limited number of calls
    HalfOpen,
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Base open duration; doubled each open cycle
    pub open_base: Duration,
    /// Cap on the open duration backoff
    pub open_cap: Duration,
    /// Probes admitted while half-open
    pub half_open_max_calls: u32,
    /// Consecutive successes required to close from half-open
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            open_base: Duration::from_secs(30),
            open_cap: Duration::from_secs(240),
            half_open_max_calls: 1,
            success_threshold: 1,
        }
    }
}

#[derive(Debug)]
struct BreakerData {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    half_open_calls: u32,
    opened_at: Option<Instant>,
    open_cycles: u32,
    total_rejected: u64,
    total_failures: u64,
    total_successes: u64,
}

impl Default for BreakerData {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            half_open_calls: 0,
            opened_at: None,
            open_cycles: 0,
            total_rejected: 0,
            total_failures: 0,
            total_successes: 0,
        }
    }
}

/// Circuit breaker with exponential open backoff.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    data: RwLock<BreakerData>,
}

impl CircuitBreaker {
    /// Create a breaker for a named analyzer or module.
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            data: RwLock::new(BreakerData::default()),
        }
    }

    /// Open duration for the current backoff cycle.
    fn open_duration(&self, open_cycles: u32) -> Duration {
        let doublings = open_cycles.saturating_sub(1).min(16);
        let duration = self.config.open_base * 2u32.saturating_pow(doublings);
        duration.min(self.config.open_cap)
    }

    /// Whether a call may proceed, applying automatic state transitions.
    ///
    /// Rejected calls are counted; an Open breaker transitions to
    /// HalfOpen once its backoff period has elapsed.
    pub fn can_proceed(&self) -> bool {
        let mut data = self.data.write();
        match data.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed_backoff = data
                    .opened_at
                    .map(|t| t.elapsed() >= self.open_duration(data.open_cycles))
                    .unwrap_or(true);
                if elapsed_backoff {
                    debug!(breaker = %self.name, "circuit transitioning to half-open");
                    data.state = CircuitState::HalfOpen;
                    data.half_open_calls = 1;
                    data.consecutive_successes = 0;
                    true
                } else {
                    data.total_rejected += 1;
                    false
                }
            }
            CircuitState::HalfOpen => {
                if data.half_open_calls < self.config.half_open_max_calls {
                    data.half_open_calls += 1;
                    true
                } else {
                    data.total_rejected += 1;
                    false
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut data = self.data.write();
        data.total_successes += 1;
        data.consecutive_failures = 0;
        match data.state {
            CircuitState::Closed => {}
            CircuitState::HalfOpen => {
                data.consecutive_successes += 1;
                if data.consecutive_successes >= self.config.success_threshold {
                    debug!(breaker = %self.name, "circuit closing after successful probes");
                    data.state = CircuitState::Closed;
                    data.half_open_calls = 0;
                    data.opened_at = None;
                    data.open_cycles = 0;
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed or timed-out call.
    pub fn record_failure(&self) {
        let mut data = self.data.write();
        data.total_failures += 1;
        data.consecutive_successes = 0;
        match data.state {
            CircuitState::Closed => {
                data.consecutive_failures += 1;
                if data.consecutive_failures >= self.config.failure_threshold {
                    Self::open(&self.name, &mut data);
                }
            }
            CircuitState::HalfOpen => {
                // A failed probe escalates the backoff
                Self::open(&self.name, &mut data);
            }
            CircuitState::Open => {
                data.consecutive_failures += 1;
            }
        }
    }

    fn open(name: &str, data: &mut BreakerData) {
        data.state = CircuitState::Open;
        data.opened_at = Some(Instant::now());
        data.open_cycles += 1;
        data.half_open_calls = 0;
        debug!(breaker = %name, cycle = data.open_cycles, "circuit opened");
    }

    /// Current state without side effects.
    pub fn state(&self) -> CircuitState {
        self.data.read().state
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> BreakerStats {
        let data = self.data.read();
        BreakerStats {
            name: self.name.clone(),
            state: data.state,
            consecutive_failures: data.consecutive_failures,
            open_cycles: data.open_cycles,
            total_successes: data.total_successes,
            total_failures: data.total_failures,
            total_rejected: data.total_rejected,
        }
    }
}

/// Read-only statistics for one breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub open_cycles: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejected: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("vision", BreakerConfig::default())
    }

    #[test]
    fn test_opens_after_threshold() {
        let cb = breaker();
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let cb = breaker();
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_open_rejects() {
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure();
        }
        assert!(!cb.can_proceed());
        assert_eq!(cb.stats().total_rejected, 1);
    }

    #[test]
    fn test_half_open_after_backoff() {
        let config = BreakerConfig {
            open_base: Duration::from_millis(0),
            ..Default::default()
        };
        let cb = CircuitBreaker::new("vision", config);
        for _ in 0..3 {
            cb.record_failure();
        }
        // Zero backoff: the next call is admitted as a probe
        assert!(cb.can_proceed());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        // Only one probe is admitted
        assert!(!cb.can_proceed());
    }

    #[test]
    fn test_probe_success_closes() {
        let config = BreakerConfig {
            open_base: Duration::from_millis(0),
            ..Default::default()
        };
        let cb = CircuitBreaker::new("vision", config);
        for _ in 0..3 {
            cb.record_failure();
        }
        assert!(cb.can_proceed());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().open_cycles, 0);
    }

    #[test]
    fn test_probe_failure_escalates_backoff() {
        let config = BreakerConfig {
            open_base: Duration::from_millis(0),
            ..Default::default()
        };
        let cb = CircuitBreaker::new("vision", config);
        for _ in 0..3 {
            cb.record_failure();
        }
        assert_eq!(cb.stats().open_cycles, 1);
        assert!(cb.can_proceed());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.stats().open_cycles, 2);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let cb = breaker();
        assert_eq!(cb.open_duration(1), Duration::from_secs(30));
        assert_eq!(cb.open_duration(2), Duration::from_secs(60));
        assert_eq!(cb.open_duration(3), Duration::from_secs(120));
        assert_eq!(cb.open_duration(4), Duration::from_secs(240));
        // Capped thereafter
        assert_eq!(cb.open_duration(10), Duration::from_secs(240));
    }
}
