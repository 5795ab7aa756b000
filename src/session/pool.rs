// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Bounded pool of reusable agent sessions.
//!
//! ```text
//!            initialize()                    acquire() miss
//!                 │                                │
//!                 ▼                                ▼
//!   ┌──────────────────────┐   release()   ┌──────────────────────┐
//!   │ warm (≤ warm size)   │◀── promote ───│ cold (≤ max cold)    │
//!   └──────────┬───────────┘               └──────────────────────┘
//!              │ acquire() hit
//!              ▼
//!   ┌──────────────────────┐
//!   │ leased (warm hits)   │── release() ──▶ warm, or cold if warm is full
//!   └──────────────────────┘
//! ```
//!
//! A session lives in exactly one of the three collections. Leased sessions
//! do not count against the cold ceiling.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitStats};
use crate::error::PoolError;
use crate::events::EventBus;
#[cfg(feature = "telemetry")]
use crate::telemetry::GLOBAL_METRICS;
use crate::types::roles;

/// Sessions with this many failed releases are terminated.
pub const MAX_SESSION_FAILURES: u32 = 3;

/// Pool sizing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionPoolConfig {
    pub warm_pool_size: usize,
    pub max_cold_sessions: usize,
    /// Idle time after which a cold session may be evicted.
    pub session_timeout: Duration,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for SessionPoolConfig {
    fn default() -> Self {
        Self {
            warm_pool_size: 4,
            max_cold_sessions: 10,
            session_timeout: Duration::from_secs(30 * 60),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Initializing,
    Active,
    Terminating,
}

/// A reusable execution slot.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub agent_role: Option<String>,
    pub worktree_path: Option<PathBuf>,
    pub status: SessionStatus,
    pub failure_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    #[serde(skip)]
    last_active: Instant,
}

impl Session {
    fn new(role: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            id: format!("session-{}", Uuid::new_v4()),
            agent_role: role.map(str::to_string),
            worktree_path: None,
            status: SessionStatus::Initializing,
            failure_count: 0,
            created_at: now,
            last_active_at: now,
            last_active: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.last_active_at = Utc::now();
        self.last_active = Instant::now();
    }

    fn bind(&mut self, role: &str, worktree_path: PathBuf) {
        self.agent_role = Some(role.to_string());
        self.worktree_path = Some(worktree_path);
        self.status = SessionStatus::Active;
        self.touch();
    }

    /// Time since the session was last acquired or released.
    pub fn idle_for(&self) -> Duration {
        self.last_active.elapsed()
    }
}

/// Where an acquired session came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionSource {
    Warm,
    Cold,
}

/// Notifications emitted by the pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    Initialized { warm_pool_size: usize },
    Acquired { session_id: String, role: String, source: SessionSource },
    Released { session_id: String, failed: bool },
    Terminated { session_id: String },
    Exhausted { role: String },
    CircuitChanged { role: String, state: CircuitState },
}

/// Pool occupancy.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStats {
    pub warm: usize,
    pub cold: usize,
    pub leased: usize,
    pub active: usize,
    pub idle: usize,
    /// `warm_pool_size + max_cold_sessions`.
    pub max_capacity: usize,
    pub by_role: BTreeMap<String, usize>,
    pub circuits: BTreeMap<String, CircuitStats>,
}

#[derive(Clone, Copy, PartialEq)]
enum Location {
    Warm,
    Cold,
    Leased,
}

/// Warm/cold session pool with per-role circuit breakers.
///
/// Not internally synchronized. Callers that share a pool across tasks wrap
/// it in a mutex. Timestamps use the tokio clock.
pub struct SessionPool {
    config: SessionPoolConfig,
    /// Kept in creation order so warm hits are deterministic.
    warm: Vec<Session>,
    cold: HashMap<String, Session>,
    leased: HashMap<String, Session>,
    circuits: HashMap<String, CircuitBreaker>,
    events: EventBus<PoolEvent>,
}

impl SessionPool {
    pub fn new(config: SessionPoolConfig) -> Self {
        Self {
            config,
            warm: Vec::new(),
            cold: HashMap::new(),
            leased: HashMap::new(),
            circuits: HashMap::new(),
            events: EventBus::new(),
        }
    }

    pub fn config(&self) -> &SessionPoolConfig {
        &self.config
    }

    /// Register an observer for pool events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Pre-create idle warm sessions, round-robin across the warm roles.
    pub fn initialize(&mut self) {
        let mut roles = roles::WARM_POOL_ROLES.iter().cycle();
        while self.warm.len() < self.config.warm_pool_size {
            let mut session = Session::new(roles.next().copied());
            session.status = SessionStatus::Idle;
            self.warm.push(session);
        }

        info!(warm_pool_size = self.warm.len(), "Session pool initialized");
        self.events.emit(PoolEvent::Initialized {
            warm_pool_size: self.warm.len(),
        });
    }

    /// Hand out a session for `role`.
    ///
    /// Prefers an idle warm session that is unbound or bound to `role`.
    /// Otherwise creates a cold session, evicting idle timed-out cold
    /// sessions first when the cold pool is full.
    pub fn acquire(
        &mut self,
        role: &str,
        worktree_path: impl Into<PathBuf>,
    ) -> Result<Session, PoolError> {
        if !self.circuit(role).try_acquire() {
            let state = self.circuit(role).state();
            debug!(role, %state, "Acquire rejected by circuit breaker");
            return Err(PoolError::CircuitOpen {
                role: role.to_string(),
            });
        }
        let worktree_path = worktree_path.into();

        let warm_hit = self.warm.iter().position(|s| {
            s.status == SessionStatus::Idle && s.agent_role.as_deref().map_or(true, |r| r == role)
        });
        if let Some(index) = warm_hit {
            let mut session = self.warm.remove(index);
            session.bind(role, worktree_path);
            self.leased.insert(session.id.clone(), session.clone());
            self.record_success(role);

            debug!(session_id = %session.id, role, "Acquired warm session");
            #[cfg(feature = "telemetry")]
            GLOBAL_METRICS.record_pool_acquire(true);
            self.events.emit(PoolEvent::Acquired {
                session_id: session.id.clone(),
                role: role.to_string(),
                source: SessionSource::Warm,
            });
            return Ok(session);
        }

        if self.cold.len() >= self.config.max_cold_sessions {
            self.evict_timed_out();
            if self.cold.len() >= self.config.max_cold_sessions {
                warn!(role, capacity = self.config.max_cold_sessions, "Session pool exhausted");
                #[cfg(feature = "telemetry")]
                GLOBAL_METRICS.record_pool_exhausted();
                self.record_failure(role);
                self.events.emit(PoolEvent::Exhausted {
                    role: role.to_string(),
                });
                return Err(PoolError::Exhausted {
                    capacity: self.config.max_cold_sessions,
                });
            }
        }

        let mut session = Session::new(Some(role));
        session.bind(role, worktree_path);
        self.cold.insert(session.id.clone(), session.clone());
        self.record_success(role);

        debug!(session_id = %session.id, role, "Created cold session");
        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_pool_acquire(false);
        self.events.emit(PoolEvent::Acquired {
            session_id: session.id.clone(),
            role: role.to_string(),
            source: SessionSource::Cold,
        });
        Ok(session)
    }

    /// Return a session to the pool after successful use.
    pub fn release(&mut self, session_id: &str) {
        self.release_inner(session_id, false);
    }

    /// Return a session after a failed job.
    ///
    /// Counts against the session and its role's circuit. A session that
    /// reaches [`MAX_SESSION_FAILURES`] is terminated instead.
    pub fn release_failed(&mut self, session_id: &str) {
        self.release_inner(session_id, true);
    }

    fn release_inner(&mut self, session_id: &str, failed: bool) {
        let Some((location, mut session)) = self.take(session_id) else {
            return;
        };

        if let Some(role) = session.agent_role.clone() {
            if failed {
                self.record_failure(&role);
            } else {
                self.record_success(&role);
            }
        }
        if failed {
            session.failure_count += 1;
        }

        if session.failure_count >= MAX_SESSION_FAILURES {
            info!(session_id, failures = session.failure_count, "Recycling failing session");
            self.finish_termination(session);
            return;
        }

        session.status = SessionStatus::Idle;
        session.touch();

        if self.warm.len() < self.config.warm_pool_size {
            self.warm.push(session);
        } else if location == Location::Leased && self.cold.len() >= self.config.max_cold_sessions {
            // No room anywhere for a former warm session.
            self.finish_termination(session);
            return;
        } else {
            self.cold.insert(session.id.clone(), session);
        }

        debug!(session_id, failed, "Session released");
        self.events.emit(PoolEvent::Released {
            session_id: session_id.to_string(),
            failed,
        });
    }

    /// Remove a session from the pool. Unknown ids are ignored.
    pub fn terminate(&mut self, session_id: &str) -> bool {
        match self.take(session_id) {
            Some((_, session)) => {
                self.finish_termination(session);
                true
            }
            None => false,
        }
    }

    /// Snapshot of a session.
    pub fn get_session(&self, session_id: &str) -> Option<Session> {
        self.iter().find(|s| s.id == session_id).cloned()
    }

    /// Sessions currently bound to `role`.
    pub fn get_sessions_by_role(&self, role: &str) -> Vec<Session> {
        self.iter()
            .filter(|s| s.agent_role.as_deref() == Some(role))
            .cloned()
            .collect()
    }

    /// Current state of a role's circuit.
    pub fn circuit_state(&self, role: &str) -> CircuitState {
        self.circuits
            .get(role)
            .map(CircuitBreaker::state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Force a role's circuit closed.
    pub fn reset_circuit_breaker(&mut self, role: &str) {
        if let Some(circuit) = self.circuits.get_mut(role) {
            circuit.reset();
            info!(role, "Circuit breaker reset");
            self.events.emit(PoolEvent::CircuitChanged {
                role: role.to_string(),
                state: CircuitState::Closed,
            });
        }
    }

    pub fn get_stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            warm: self.warm.len(),
            cold: self.cold.len(),
            leased: self.leased.len(),
            max_capacity: self.config.warm_pool_size + self.config.max_cold_sessions,
            ..PoolStats::default()
        };

        for session in self.iter() {
            match session.status {
                SessionStatus::Active => stats.active += 1,
                SessionStatus::Idle => stats.idle += 1,
                _ => {}
            }
            if let Some(role) = &session.agent_role {
                *stats.by_role.entry(role.clone()).or_insert(0) += 1;
            }
        }
        stats.circuits = self
            .circuits
            .iter()
            .map(|(role, circuit)| (role.clone(), circuit.stats()))
            .collect();
        stats
    }

    /// Terminate every session.
    pub fn shutdown(&mut self) {
        let ids: Vec<String> = self.iter().map(|s| s.id.clone()).collect();
        for id in ids {
            self.terminate(&id);
        }
        info!("Session pool shut down");
    }

    fn iter(&self) -> impl Iterator<Item = &Session> {
        self.warm
            .iter()
            .chain(self.cold.values())
            .chain(self.leased.values())
    }

    fn take(&mut self, session_id: &str) -> Option<(Location, Session)> {
        if let Some(index) = self.warm.iter().position(|s| s.id == session_id) {
            return Some((Location::Warm, self.warm.remove(index)));
        }
        if let Some(session) = self.cold.remove(session_id) {
            return Some((Location::Cold, session));
        }
        self.leased
            .remove(session_id)
            .map(|session| (Location::Leased, session))
    }

    fn finish_termination(&mut self, mut session: Session) {
        session.status = SessionStatus::Terminating;
        debug!(session_id = %session.id, "Session terminated");
        self.events.emit(PoolEvent::Terminated {
            session_id: session.id,
        });
    }

    fn evict_timed_out(&mut self) {
        let timeout = self.config.session_timeout;
        let expired: Vec<String> = self
            .cold
            .values()
            .filter(|s| s.status == SessionStatus::Idle && s.idle_for() > timeout)
            .map(|s| s.id.clone())
            .collect();

        for id in expired {
            if let Some(session) = self.cold.remove(&id) {
                info!(session_id = %id, "Evicting idle cold session");
                self.finish_termination(session);
            }
        }
    }

    fn circuit(&mut self, role: &str) -> &mut CircuitBreaker {
        let config = &self.config.circuit_breaker;
        self.circuits
            .entry(role.to_string())
            .or_insert_with(|| CircuitBreaker::new(config.clone()))
    }

    fn record_failure(&mut self, role: &str) {
        if let Some(state) = self.circuit(role).record_failure() {
            warn!(role, %state, "Circuit breaker opened");
            self.events.emit(PoolEvent::CircuitChanged {
                role: role.to_string(),
                state,
            });
        }
    }

    fn record_success(&mut self, role: &str) {
        if let Some(state) = self.circuit(role).record_success() {
            info!(role, %state, "Circuit breaker closed");
            self.events.emit(PoolEvent::CircuitChanged {
                role: role.to_string(),
                state,
            });
        }
    }
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("config", &self.config)
            .field("stats", &self.get_stats())
            .finish()
    }
}
