// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-role circuit breaker for session acquisition.
//!
//! State machine: Closed → Open → HalfOpen → Closed
//! - Failures inside `failure_window` reaching `failure_threshold` open it.
//! - After `recovery_timeout` the next acquire attempt half-opens it.
//! - `success_threshold` successes while half-open close it; a failure
//!   while half-open reopens it.
//!
//! Not thread-safe on its own; the pool owns one breaker per role.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub recovery_timeout: Duration,
    pub failure_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
            failure_window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        })
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitStats {
    pub state: CircuitState,
    /// Failures still inside the window.
    pub failures: usize,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failures: VecDeque<Instant>,
    successes: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            successes: 0,
            opened_at: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn stats(&self) -> CircuitStats {
        CircuitStats {
            state: self.state,
            failures: self.failures.len(),
        }
    }

    /// Whether a caller may proceed.
    ///
    /// An open breaker whose recovery timeout has passed moves to half-open
    /// and admits the caller.
    pub fn try_acquire(&mut self) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let recovered = self
                    .opened_at
                    .is_some_and(|t| t.elapsed() >= self.config.recovery_timeout);
                if recovered {
                    self.transition_to(CircuitState::HalfOpen);
                }
                recovered
            }
        }
    }

    /// Record a failure. Returns the new state if it changed.
    pub fn record_failure(&mut self) -> Option<CircuitState> {
        let now = Instant::now();
        self.failures.push_back(now);
        self.successes = 0;
        self.prune(now);

        match self.state {
            CircuitState::HalfOpen => {
                self.transition_to(CircuitState::Open);
                Some(CircuitState::Open)
            }
            CircuitState::Closed
                if self.failures.len() as u32 >= self.config.failure_threshold =>
            {
                self.transition_to(CircuitState::Open);
                Some(CircuitState::Open)
            }
            _ => None,
        }
    }

    /// Record a success. Returns the new state if it changed.
    pub fn record_success(&mut self) -> Option<CircuitState> {
        if self.state != CircuitState::HalfOpen {
            return None;
        }
        self.successes += 1;
        if self.successes >= self.config.success_threshold {
            self.transition_to(CircuitState::Closed);
            return Some(CircuitState::Closed);
        }
        None
    }

    /// Force the breaker closed and forget its history.
    pub fn reset(&mut self) {
        self.transition_to(CircuitState::Closed);
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.failures.front() {
            if now.duration_since(oldest) > self.config.failure_window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn transition_to(&mut self, state: CircuitState) {
        self.state = state;
        self.successes = 0;
        match state {
            CircuitState::Open => self.opened_at = Some(Instant::now()),
            CircuitState::HalfOpen => {}
            CircuitState::Closed => {
                self.failures.clear();
                self.opened_at = None;
            }
        }
    }
}
