// ABOUTME: Per-connection circuit breaker counting consecutive failures
//
// Owned by a pool slot and mutated only under the pool lock, so the breaker
// itself is a plain state machine with `&mut self` transitions.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;

// === Circuit Breaker State Machine ===

/// Circuit state for one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, the connection may be selected
    Closed,

    /// Selection blocked until the cooldown expires
    Open {
        /// When a half-open probe becomes allowed
        until: Instant,
    },

    /// One trial reconnect/probe is in flight
    HalfOpen,
}

/// Circuit breaker for one pooled connection.
///
/// State transitions:
/// - Closed -> Open: after `failure_threshold` consecutive failures
/// - Open -> `HalfOpen`: when the cooldown has elapsed and a probe starts
/// - `HalfOpen` -> Closed: probe succeeded
/// - `HalfOpen` -> Open: probe failed
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    #[must_use]
    pub const fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            failure_threshold,
            cooldown,
        }
    }

    #[must_use]
    pub const fn from_config(config: &CircuitBreakerConfig) -> Self {
        Self::new(config.failure_threshold, config.cooldown)
    }

    #[must_use]
    pub const fn state(&self) -> CircuitState {
        self.state
    }

    #[must_use]
    pub const fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    #[must_use]
    pub const fn last_failure(&self) -> Option<Instant> {
        self.last_failure
    }

    /// Whether the connection may be handed to callers.
    #[must_use]
    pub const fn allows_selection(&self) -> bool {
        matches!(self.state, CircuitState::Closed)
    }

    /// Move Open -> `HalfOpen` if the cooldown has elapsed at `now`.
    ///
    /// Returns true when the caller should run the trial probe.
    pub fn try_half_open(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Open { until } if now >= until => {
                self.state = CircuitState::HalfOpen;
                true
            }
            _ => false,
        }
    }

    /// Reset the failure count and close the circuit.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.state = CircuitState::Closed;
    }

    /// Count a failure at `now`. Returns true if this failure opened the circuit.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure = Some(now);
        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open {
                    until: now + self.cooldown,
                };
                true
            }
            CircuitState::Closed if self.consecutive_failures >= self.failure_threshold => {
                self.state = CircuitState::Open {
                    until: now + self.cooldown,
                };
                true
            }
            _ => false,
        }
    }
}
