// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration type definitions.
//!
//! [`WorkspaceConfig`] is the file shape: every field optional, durations in
//! milliseconds. [`OrchestratorConfig`] is the resolved shape handed to the
//! components.

use std::collections::HashMap;
use std::time::Duration;

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::scheduler::{RetryConfig, SchedulerConfig, TimeoutConfig};
use crate::session::{CircuitBreakerConfig, SessionPoolConfig};

/// Workspace configuration for semo-office.
/// Can be defined in .semo-office.json or .semo-office/config.json in the project root.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<SchedulerSection>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySection>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutSection>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolSection>,
}

/// Scheduler settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_parallel_jobs: Option<usize>,

    /// Poll interval in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub polling_interval: Option<u64>,

    /// Per-role concurrency caps, merged key-wise
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_by_role: Option<HashMap<String, usize>>,
}

/// Retry settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    /// Milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_delay: Option<u64>,

    /// Milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_delay: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_multiplier: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter_factor: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_retry_limits: Option<HashMap<String, u32>>,

    /// Extra patterns, appended to the built-in list
    #[serde(skip_serializing_if = "Option::is_none")]
    pub non_retryable_patterns: Option<Vec<String>>,
}

/// Timeout settings. All values in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_timeout: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_timeouts: Option<HashMap<String, u64>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub grace_period: Option<u64>,
}

/// Session pool settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warm_pool_size: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cold_sessions: Option<usize>,

    /// Cold session idle eviction threshold in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_timeout: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerSection>,
}

/// Circuit breaker settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_threshold: Option<u32>,

    /// Milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_timeout: Option<u64>,

    /// Milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_window: Option<u64>,
}

/// Fully resolved configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OrchestratorConfig {
    pub scheduler: SchedulerConfig,
    pub retry: RetryConfig,
    pub timeout: TimeoutConfig,
    pub pool: SessionPoolConfig,
}

fn ms(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

impl OrchestratorConfig {
    /// Reject values the components cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.max_parallel_jobs == 0 {
            return Err(ConfigError::invalid("scheduler.maxParallelJobs", "must be at least 1"));
        }
        if self.scheduler.polling_interval.is_zero() {
            return Err(ConfigError::invalid("scheduler.pollingInterval", "must be positive"));
        }
        if let Some((role, _)) = self
            .scheduler
            .max_concurrent_by_role
            .iter()
            .find(|(_, limit)| **limit == 0)
        {
            return Err(ConfigError::invalid(
                format!("scheduler.maxConcurrentByRole.{role}"),
                "must be at least 1",
            ));
        }

        let retry = &self.retry;
        if retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid("retry.backoffMultiplier", "must be >= 1"));
        }
        if !(0.0..=1.0).contains(&retry.jitter_factor) {
            return Err(ConfigError::invalid("retry.jitterFactor", "must be between 0 and 1"));
        }
        if retry.max_delay < retry.base_delay {
            return Err(ConfigError::invalid("retry.maxDelay", "must not be below baseDelay"));
        }
        for pattern in &retry.non_retryable_patterns {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| ConfigError::InvalidPattern {
                    pattern: pattern.clone(),
                    message: e.to_string(),
                })?;
        }

        if self.timeout.default_timeout.is_zero() {
            return Err(ConfigError::invalid("timeout.defaultTimeout", "must be positive"));
        }
        if self.pool.warm_pool_size + self.pool.max_cold_sessions == 0 {
            return Err(ConfigError::invalid("pool", "warm and cold capacity are both zero"));
        }

        Ok(())
    }

    /// File-shaped view with every field filled in.
    pub fn to_workspace(&self) -> WorkspaceConfig {
        let retry = &self.retry;
        let breaker = &self.pool.circuit_breaker;

        WorkspaceConfig {
            scheduler: Some(SchedulerSection {
                max_parallel_jobs: Some(self.scheduler.max_parallel_jobs),
                polling_interval: Some(ms(self.scheduler.polling_interval)),
                max_concurrent_by_role: Some(self.scheduler.max_concurrent_by_role.clone()),
            }),
            retry: Some(RetrySection {
                max_retries: Some(retry.max_retries),
                base_delay: Some(ms(retry.base_delay)),
                max_delay: Some(ms(retry.max_delay)),
                backoff_multiplier: Some(retry.backoff_multiplier),
                jitter_factor: Some(retry.jitter_factor),
                role_retry_limits: Some(retry.role_retry_limits.clone()),
                non_retryable_patterns: Some(retry.non_retryable_patterns.clone()),
            }),
            timeout: Some(TimeoutSection {
                default_timeout: Some(ms(self.timeout.default_timeout)),
                role_timeouts: Some(
                    self.timeout
                        .role_timeouts
                        .iter()
                        .map(|(role, d)| (role.clone(), ms(*d)))
                        .collect(),
                ),
                grace_period: Some(ms(self.timeout.grace_period)),
            }),
            pool: Some(PoolSection {
                warm_pool_size: Some(self.pool.warm_pool_size),
                max_cold_sessions: Some(self.pool.max_cold_sessions),
                session_timeout: Some(ms(self.pool.session_timeout)),
                circuit_breaker: Some(CircuitBreakerSection {
                    failure_threshold: Some(breaker.failure_threshold),
                    success_threshold: Some(breaker.success_threshold),
                    recovery_timeout: Some(ms(breaker.recovery_timeout)),
                    failure_window: Some(ms(breaker.failure_window)),
                }),
            }),
        }
    }
}

impl CircuitBreakerSection {
    pub(crate) fn apply(&self, target: &mut CircuitBreakerConfig) {
        if let Some(v) = self.failure_threshold {
            target.failure_threshold = v;
        }
        if let Some(v) = self.success_threshold {
            target.success_threshold = v;
        }
        if let Some(v) = self.recovery_timeout {
            target.recovery_timeout = Duration::from_millis(v);
        }
        if let Some(v) = self.failure_window {
            target.failure_window = Duration::from_millis(v);
        }
    }
}
