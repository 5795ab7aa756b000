// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Execution sessions for agent jobs.
//!
//! - **Pool**: warm and cold sessions under a capacity ceiling
//! - **Circuit**: per-role breaker that stops hammering a failing role

pub mod circuit;
pub mod pool;

pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitStats};
pub use pool::{
    PoolEvent, PoolStats, Session, SessionPool, SessionPoolConfig, SessionSource, SessionStatus,
    MAX_SESSION_FAILURES,
};
